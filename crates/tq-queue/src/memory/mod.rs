//! In-process broker
//!
//! Implements the same exchange/queue graph as the AMQP broker: fanout and
//! direct exchanges, per-message and per-queue TTL, dead-lettering with an
//! `x-death`-style history, and requeue of deliveries left unsettled when a
//! consumer goes away. Used by `tq-dev` and by tests.
//!
//! Must be created inside a Tokio runtime: a background task expires TTLs.

mod delay;
mod graph;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use tq_common::{DeathReason, Envelope, Headers};

use crate::broker::{Acknowledger, Delivery, Dispatcher, MessageBroker, MessageHandler};
use crate::topology::{ExchangeKind, QueueArguments, TopologyChannel, TopologyManager};
use crate::{BrokerSettings, Result};

use self::delay::DelayQueue;
use self::graph::{Expiry, Graph, Routed};

struct Shared {
    graph: Mutex<Graph>,
    delays: DelayQueue,
}

impl Shared {
    fn settle(&self, update: impl FnOnce(&mut Graph, Instant, &mut Vec<Expiry>)) {
        let mut expiries = Vec::new();
        update(&mut self.graph.lock(), Instant::now(), &mut expiries);
        self.delays.schedule(expiries);
    }

    fn expire_due(&self) -> bool {
        let due = self.delays.pop_due(Instant::now());
        if due.is_empty() {
            return false;
        }
        self.settle(|graph, now, expiries| {
            for expiry in due {
                graph.expire(expiry, now, expiries);
            }
        });
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.delays.notifier().notify_one();
    }
}

async fn drive_expiries(shared: Weak<Shared>, notify: Arc<Notify>) {
    loop {
        let deadline = {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.expire_due() {
                continue;
            }
            shared.delays.next_deadline()
        };

        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = notify.notified() => {}
                }
            }
            None => notify.notified().await,
        }
    }
}

#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
    topology: Arc<TopologyManager>,
    settings: BrokerSettings,
}

impl InMemoryBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        let delays = DelayQueue::new();
        let notify = delays.notifier();
        let shared = Arc::new(Shared {
            graph: Mutex::new(Graph::default()),
            delays,
        });

        tokio::spawn(drive_expiries(Arc::downgrade(&shared), notify));

        Self {
            shared,
            topology: Arc::new(TopologyManager::new(settings.topology.clone())),
            settings,
        }
    }

    fn channel(&self) -> MemoryChannel<'_> {
        MemoryChannel(&self.shared)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.shared.graph.lock().exchange_kind(name)
    }

    pub fn queue_arguments(&self, name: &str) -> Option<QueueArguments> {
        self.shared.graph.lock().queue_arguments(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.queue_arguments(name).is_some()
    }

    /// Messages parked in `name` waiting for a consumer
    pub fn ready_messages(&self, name: &str) -> Vec<Envelope> {
        self.shared.graph.lock().ready_messages(name)
    }

    /// Messages waiting for a TTL to expire, across all queues
    pub fn delayed_count(&self) -> usize {
        self.shared.delays.len()
    }

    /// (exchanges, queues, bindings)
    pub fn topology_counts(&self) -> (usize, usize, usize) {
        let graph = self.shared.graph.lock();
        (graph.exchange_count(), graph.queue_count(), graph.binding_count())
    }

    fn attach(&self, queue_name: &str) -> Result<ConsumerGuard> {
        let (id, receiver) = self.shared.graph.lock().attach_consumer(queue_name)?;
        Ok(ConsumerGuard {
            shared: self.shared.clone(),
            queue: queue_name.to_string(),
            id,
            receiver,
        })
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    fn identifier(&self) -> &str {
        "memory"
    }

    async fn publish(
        &self,
        body: &[u8],
        queue_name: &str,
        headers: Headers,
        delay: Duration,
    ) -> Result<bool> {
        let channel = self.channel();
        let incoming = &self.topology.config().exchange_incoming;
        channel.declare_exchange(incoming, ExchangeKind::Fanout).await?;
        self.topology.ensure_alive_queue(&channel, queue_name).await?;

        let envelope = Envelope::new(body, queue_name)
            .with_headers(headers)
            .with_expiration(delay);
        self.shared
            .settle(|graph, now, expiries| graph.publish(incoming, envelope, now, expiries));

        debug!(queue = %queue_name, delay_ms = delay.as_millis() as u64, "Published");
        Ok(true)
    }

    async fn consume(&self, queue_name: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let channel = self.channel();
        self.topology.ensure_alive_queue(&channel, queue_name).await?;

        let mut consumer = self.attach(queue_name)?;
        let dispatcher = Dispatcher::new(queue_name, &self.settings, handler);
        info!(queue = %queue_name, "Consuming");

        while let Some(routed) = consumer.receiver.recv().await {
            if dispatcher.is_kill_signal(&routed.envelope) {
                info!(queue = %queue_name, "Kill signal received");
                self.topology.delete_alive_queue(&channel, queue_name).await?;
                return Ok(());
            }

            let acker = MemoryAcker {
                shared: self.shared.clone(),
                queue: queue_name.to_string(),
                routed: Mutex::new(Some(routed.clone())),
            };
            dispatcher.dispatch(Delivery::new(routed.envelope, acker)).await?;
        }

        debug!(queue = %queue_name, "Queue deleted, consumer stopped");
        Ok(())
    }

    async fn idempotent_startup(&self) -> Result<()> {
        self.topology.declare_topology(&self.channel()).await
    }
}

struct MemoryChannel<'a>(&'a Shared);

#[async_trait]
impl TopologyChannel for MemoryChannel<'_> {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.0.graph.lock().declare_exchange(name, kind)
    }

    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> Result<()> {
        self.0.graph.lock().declare_queue(name, arguments)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.0.graph.lock().bind_queue(queue, exchange, routing_key)
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.0.graph.lock().delete_queue(name);
        Ok(())
    }
}

/// Settles against the graph. Dropped unsettled, the message is requeued.
struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    routed: Mutex<Option<Routed>>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.routed.lock().take();
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        if let Some(routed) = self.routed.lock().take() {
            self.shared.settle(|graph, now, expiries| {
                graph.dead_letter(&self.queue, routed, DeathReason::Rejected, now, expiries)
            });
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(routed) = self.routed.get_mut().take() {
            let queue = &self.queue;
            self.shared
                .settle(|graph, now, expiries| graph.enqueue(queue, routed, now, expiries));
        }
    }
}

/// A consumer registration. Dropping it returns undelivered messages to the queue.
struct ConsumerGuard {
    shared: Arc<Shared>,
    queue: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<Routed>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.receiver.close();
        let mut pending = Vec::new();
        while let Ok(routed) = self.receiver.try_recv() {
            pending.push(routed);
        }

        let queue = &self.queue;
        let id = self.id;
        self.shared.settle(|graph, now, expiries| {
            graph.detach_consumer(queue, id);
            for routed in pending {
                graph.enqueue(queue, routed, now, expiries);
            }
        });
    }
}
