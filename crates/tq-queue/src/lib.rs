//! TextQueue message broker
//!
//! - `TopologyManager`: declares the exchange/queue graph that turns dead-lettering
//!   into delayed, bounded retry
//! - `MessageBroker`: publish with a per-message delay, consume with a callback
//! - `RabbitMessageBroker`: AMQP implementation, every operation wrapped in `Backoff`
//! - `InMemoryBroker`: in-process implementation with the same dead-letter semantics

pub mod broker;
pub mod error;
pub mod memory;
pub mod topology;

#[cfg(feature = "rabbitmq")]
pub mod rabbit;

use std::time::Duration;

use tq_common::BackoffConfig;
use tq_config::AppConfig;

pub use broker::{Acknowledger, Delivery, MessageBroker, MessageHandler};
pub use error::QueueError;
pub use memory::InMemoryBroker;
pub use topology::{ExchangeKind, QueueArguments, TopologyChannel, TopologyConfig, TopologyManager};

#[cfg(feature = "rabbitmq")]
pub use rabbit::RabbitMessageBroker;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Settings shared by every broker implementation
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub topology: TopologyConfig,
    /// A consumed message with exactly this body stops the consumer and deletes its queue
    pub kill_signal: Vec<u8>,
    /// Upper bound on concurrently running callbacks per consumer
    pub max_in_flight: usize,
    pub backoff: BackoffConfig,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl BrokerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            topology: TopologyConfig::from(&config.rabbit),
            kill_signal: config.rabbit.kill_signal_bytes(),
            max_in_flight: config.rabbit.max_in_flight,
            backoff: config.backoff_config(),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.topology.retry_delay = retry_delay;
        self
    }

    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.backoff.max_timeout = max_timeout;
        self
    }
}
