use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use tq_common::{Envelope, Headers};

use crate::{BrokerSettings, QueueError, Result};

/// Settles a delivered message with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message from its queue
    async fn ack(&self) -> Result<()>;

    /// Reject without requeue; the queue's dead-letter exchange receives it
    async fn reject(&self) -> Result<()>;
}

/// A consumed message together with the means to settle it.
///
/// Settling consumes the delivery, so a message is acked or rejected at most once.
pub struct Delivery {
    envelope: Envelope,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(envelope: Envelope, acker: impl Acknowledger + 'static) -> Self {
        Self {
            envelope,
            acker: Box::new(acker),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(self) -> Result<()> {
        self.acker.reject().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Callback invoked for every consumed message. The handler owns settling it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    fn identifier(&self) -> &str;

    /// Publish `body` for delivery to the alive queue `queue_name` after `delay`.
    ///
    /// Ensures the alive queue exists first. Returns whether the broker
    /// positively acknowledged the publish.
    async fn publish(
        &self,
        body: &[u8],
        queue_name: &str,
        headers: Headers,
        delay: Duration,
    ) -> Result<bool>;

    /// Consume `queue_name` until the kill signal arrives, running `handler`
    /// concurrently for every other message.
    async fn consume(&self, queue_name: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Declare the retry topology. Safe to call any number of times.
    async fn idempotent_startup(&self) -> Result<()>;
}

/// Per-consumer dispatch: kill-signal detection and bounded concurrent callbacks
pub(crate) struct Dispatcher {
    queue_name: String,
    kill_signal: Vec<u8>,
    handler: Arc<dyn MessageHandler>,
    in_flight: Arc<Semaphore>,
}

impl Dispatcher {
    pub(crate) fn new(
        queue_name: &str,
        settings: &BrokerSettings,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            kill_signal: settings.kill_signal.clone(),
            handler,
            in_flight: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
        }
    }

    pub(crate) fn is_kill_signal(&self, envelope: &Envelope) -> bool {
        envelope.body == self.kill_signal
    }

    /// Spawn the handler for `delivery`, waiting for a free slot first.
    /// The consume loop does not wait for the handler to finish.
    pub(crate) async fn dispatch(&self, delivery: Delivery) -> Result<()> {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::ShuttingDown(self.queue_name.clone()))?;

        debug!(
            queue = %self.queue_name,
            available = self.in_flight.available_permits(),
            "Dispatching message"
        );

        let handler = self.handler.clone();
        tokio::spawn(async move {
            handler.handle(delivery).await;
            drop(permit);
        });
        Ok(())
    }
}
