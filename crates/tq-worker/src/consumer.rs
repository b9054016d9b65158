use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use tq_common::{Envelope, Headers, REQUEST_ID_HEADER};
use tq_config::RabbitConfig;
use tq_queue::{Delivery, MessageBroker, MessageHandler};

use crate::work::WorkUnit;
use crate::{Result, WorkerError};

const MESSAGES_TOTAL: &str = "tq_worker_messages_total";

/// Completed retry cycles: deaths in the waiting-retry queue.
///
/// The departure hop through the waiting-depart queue is not a retry, so a
/// fresh message counts 0 whatever its delay was.
pub fn retry_count(envelope: &Envelope, retry_queue: &str) -> u64 {
    envelope.death_count_in(retry_queue)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Work is attempted while the retry count is at most this
    pub max_retry_count: u64,
    pub retry_queue: String,
    /// Where results are published
    pub downstream_queue: String,
}

impl From<&RabbitConfig> for ConsumerSettings {
    fn from(config: &RabbitConfig) -> Self {
        Self {
            max_retry_count: config.max_retry_count,
            retry_queue: config.queue_waiting_retry.clone(),
            downstream_queue: config.websocket_queue.clone(),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from(&RabbitConfig::default())
    }
}

/// How a delivery was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerOutcome {
    /// Work succeeded, result published, message acked
    Processed { request_id: Option<String> },
    /// Work or downstream publish failed, message rejected into the retry cycle
    Rejected {
        request_id: Option<String>,
        reason: String,
    },
    /// Retry bound exceeded, message acked without attempting work
    Dropped {
        request_id: Option<String>,
        count_retry: u64,
    },
}

impl ConsumerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ConsumerOutcome::Processed { .. } => "processed",
            ConsumerOutcome::Rejected { .. } => "rejected",
            ConsumerOutcome::Dropped { .. } => "dropped",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            ConsumerOutcome::Processed { request_id }
            | ConsumerOutcome::Rejected { request_id, .. }
            | ConsumerOutcome::Dropped { request_id, .. } => request_id.as_deref(),
        }
    }
}

pub struct RetryAwareConsumer {
    broker: Arc<dyn MessageBroker>,
    work: Arc<dyn WorkUnit>,
    settings: ConsumerSettings,
}

impl RetryAwareConsumer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        work: Arc<dyn WorkUnit>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            broker,
            work,
            settings,
        }
    }

    /// Settle one delivery: exactly one of ack or reject
    pub async fn process(&self, delivery: Delivery) -> ConsumerOutcome {
        let request_id = delivery.envelope().request_id().map(str::to_string);
        let count_retry = retry_count(delivery.envelope(), &self.settings.retry_queue);
        let id = request_id.as_deref().unwrap_or("-");

        let outcome = if count_retry > self.settings.max_retry_count {
            info!(
                request_id = %id,
                count_retry,
                max_retry_count = self.settings.max_retry_count,
                "Dropped message because retry count exceeded the maximum"
            );
            if let Err(e) = delivery.ack().await {
                warn!(request_id = %id, error = %e, "Failed to ack dropped message");
            }
            ConsumerOutcome::Dropped {
                request_id,
                count_retry,
            }
        } else {
            let result = self.run(delivery.envelope()).await;
            match result {
                Ok(()) => {
                    if let Err(e) = delivery.ack().await {
                        warn!(request_id = %id, error = %e, "Failed to ack processed message");
                    }
                    debug!(request_id = %id, count_retry, work = self.work.name(), "Message processed");
                    ConsumerOutcome::Processed { request_id }
                }
                Err(e) => {
                    warn!(request_id = %id, count_retry, error = %e, "Processing failed, rejecting");
                    if let Err(reject_err) = delivery.reject().await {
                        warn!(request_id = %id, error = %reject_err, "Failed to reject message");
                    }
                    ConsumerOutcome::Rejected {
                        request_id,
                        reason: e.to_string(),
                    }
                }
            }
        };

        metrics::counter!(MESSAGES_TOTAL, "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn run(&self, envelope: &Envelope) -> Result<()> {
        let result = self.work.run(&envelope.body).await?;

        let mut headers = Headers::new();
        if let Some(request_id) = envelope.request_id() {
            headers.insert(REQUEST_ID_HEADER.to_string(), request_id.to_string());
        }

        let downstream = &self.settings.downstream_queue;
        if !self
            .broker
            .publish(&result, downstream, headers, Duration::ZERO)
            .await?
        {
            return Err(WorkerError::PublishNotAcknowledged(downstream.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for RetryAwareConsumer {
    async fn handle(&self, delivery: Delivery) {
        self.process(delivery).await;
    }
}
