use tq_common::ConnectionTimeoutError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[cfg(feature = "rabbitmq")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error(transparent)]
    ConnectionTimeout(#[from] ConnectionTimeoutError),

    /// An entity already exists with different attributes
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Consumer for {0} is shutting down")]
    ShuttingDown(String),
}

impl QueueError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueueError::ConnectionTimeout(_))
    }
}
