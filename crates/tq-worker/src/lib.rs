//! TextQueue worker
//!
//! - `RetryAwareConsumer`: the consume callback. Derives the retry count from the
//!   message's death history, drops messages past the bound, otherwise runs a
//!   `WorkUnit` and publishes its result downstream
//! - `ReverseText`: the unit of work behind `queue_reverse_text`

pub mod consumer;
pub mod work;

pub use consumer::{retry_count, ConsumerOutcome, ConsumerSettings, RetryAwareConsumer};
pub use work::{ReverseText, WorkUnit};

use tq_queue::QueueError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Work failed: {0}")]
    Work(String),

    #[error("Broker error: {0}")]
    Queue(#[from] QueueError),

    #[error("Publish to {0} was not acknowledged by the broker")]
    PublishNotAcknowledged(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
