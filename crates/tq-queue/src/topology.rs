//! Retry topology
//!
//! ```text
//! incoming (fanout) ──> waiting_depart   dlx: sorter
//! retry    (fanout) ──> waiting_retry    dlx: sorter, ttl: retry delay
//! sorter   (direct) ──> <alive queue>    dlx: retry, routing key: queue name
//! ```
//!
//! A message published with a delay waits in `waiting_depart` until its
//! per-message TTL expires, then is dead-lettered to the sorter, which routes it
//! by its original routing key to the alive queue of that name. A rejected
//! message goes to the retry exchange, waits out the queue TTL of
//! `waiting_retry` and comes back to the sorter.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use tq_config::RabbitConfig;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Fanout,
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Direct => f.write_str("direct"),
        }
    }
}

/// Queue declaration arguments used by the topology
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-message-ttl`
    pub message_ttl: Option<Duration>,
}

/// Declaration primitives. Exchanges and queues are always durable and
/// re-declaring with identical attributes is a no-op.
#[async_trait]
pub trait TopologyChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;
}

/// Names and retry delay of the retry topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    pub exchange_incoming: String,
    pub exchange_sorter: String,
    pub exchange_retry: String,
    pub queue_waiting_depart: String,
    pub queue_waiting_retry: String,
    /// TTL of `queue_waiting_retry`
    pub retry_delay: Duration,
}

impl From<&RabbitConfig> for TopologyConfig {
    fn from(config: &RabbitConfig) -> Self {
        Self {
            exchange_incoming: config.exchange_incoming.clone(),
            exchange_sorter: config.exchange_sorter.clone(),
            exchange_retry: config.exchange_retry.clone(),
            queue_waiting_depart: config.queue_waiting_depart.clone(),
            queue_waiting_retry: config.queue_waiting_retry.clone(),
            retry_delay: config.retry_delay(),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self::from(&RabbitConfig::default())
    }
}

pub struct TopologyManager {
    config: TopologyConfig,
}

impl TopologyManager {
    pub fn new(config: TopologyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn waiting_depart_arguments(&self) -> QueueArguments {
        QueueArguments {
            dead_letter_exchange: Some(self.config.exchange_sorter.clone()),
            message_ttl: None,
        }
    }

    pub fn waiting_retry_arguments(&self) -> QueueArguments {
        QueueArguments {
            dead_letter_exchange: Some(self.config.exchange_sorter.clone()),
            message_ttl: Some(self.config.retry_delay),
        }
    }

    pub fn alive_queue_arguments(&self) -> QueueArguments {
        QueueArguments {
            dead_letter_exchange: Some(self.config.exchange_retry.clone()),
            message_ttl: None,
        }
    }

    /// Declare the three exchanges and both waiting queues
    pub async fn declare_topology(&self, channel: &dyn TopologyChannel) -> Result<()> {
        let c = &self.config;

        channel.declare_exchange(&c.exchange_incoming, ExchangeKind::Fanout).await?;
        channel.declare_exchange(&c.exchange_sorter, ExchangeKind::Direct).await?;
        channel.declare_exchange(&c.exchange_retry, ExchangeKind::Fanout).await?;

        channel
            .declare_queue(&c.queue_waiting_depart, &self.waiting_depart_arguments())
            .await?;
        channel
            .bind_queue(&c.queue_waiting_depart, &c.exchange_incoming, "")
            .await?;

        channel
            .declare_queue(&c.queue_waiting_retry, &self.waiting_retry_arguments())
            .await?;
        channel
            .bind_queue(&c.queue_waiting_retry, &c.exchange_retry, "")
            .await?;

        info!(
            incoming = %c.exchange_incoming,
            sorter = %c.exchange_sorter,
            retry = %c.exchange_retry,
            retry_delay_ms = c.retry_delay.as_millis() as u64,
            "Retry topology declared"
        );
        Ok(())
    }

    /// Declare an alive queue and bind it to the sorter under its own name
    pub async fn ensure_alive_queue(&self, channel: &dyn TopologyChannel, name: &str) -> Result<()> {
        channel.declare_queue(name, &self.alive_queue_arguments()).await?;
        channel
            .bind_queue(name, &self.config.exchange_sorter, name)
            .await?;
        debug!(queue = %name, "Alive queue ready");
        Ok(())
    }

    pub async fn delete_alive_queue(&self, channel: &dyn TopologyChannel, name: &str) -> Result<()> {
        channel.delete_queue(name).await?;
        info!(queue = %name, "Alive queue deleted");
        Ok(())
    }
}
