//! Exchange/queue graph with broker-style routing and dead-lettering

use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use tq_common::{DeathReason, Envelope};

use crate::topology::{ExchangeKind, QueueArguments};
use crate::{QueueError, Result};

/// A message inside a queue, with the exchange that routed it there
#[derive(Debug, Clone)]
pub(crate) struct Routed {
    pub exchange: String,
    pub envelope: Envelope,
}

/// A message that dies in `queue` at `at` unless it is consumed first
#[derive(Debug)]
pub(crate) struct Expiry {
    pub at: Instant,
    pub queue: String,
    pub routed: Routed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct QueueState {
    arguments: QueueArguments,
    ready: VecDeque<Routed>,
    consumers: Vec<(u64, mpsc::UnboundedSender<Routed>)>,
    next_consumer: usize,
}

#[derive(Default)]
pub(crate) struct Graph {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    next_consumer_id: u64,
}

impl Graph {
    pub fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<()> {
        match self.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(QueueError::PreconditionFailed(format!(
                "exchange {} exists as {}, declared as {}",
                name, existing.kind, kind
            ))),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    pub fn declare_queue(&mut self, name: &str, arguments: &QueueArguments) -> Result<()> {
        match self.queues.get(name) {
            Some(existing) if existing.arguments != *arguments => {
                Err(QueueError::PreconditionFailed(format!(
                    "queue {} exists with {:?}, declared with {:?}",
                    name, existing.arguments, arguments
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    name.to_string(),
                    QueueState {
                        arguments: arguments.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        if !self.queues.contains_key(queue) {
            return Err(QueueError::NotFound(format!("queue {}", queue)));
        }
        let Some(state) = self.exchanges.get_mut(exchange) else {
            return Err(QueueError::NotFound(format!("exchange {}", exchange)));
        };

        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    /// Remove a queue, its bindings and its messages. Its consumers see their
    /// channel close.
    pub fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|b| b.queue != name);
            }
        }
    }

    /// Route through `exchange`. Unroutable messages are discarded.
    pub fn publish(&mut self, exchange: &str, envelope: Envelope, now: Instant, expiries: &mut Vec<Expiry>) {
        let targets: Vec<String> = match self.exchanges.get(exchange) {
            Some(state) => state
                .bindings
                .iter()
                .filter(|b| state.kind == ExchangeKind::Fanout || b.routing_key == envelope.routing_key)
                .map(|b| b.queue.clone())
                .collect(),
            None => Vec::new(),
        };

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %envelope.routing_key, "Unroutable message discarded");
            return;
        }

        for queue in targets {
            let routed = Routed {
                exchange: exchange.to_string(),
                envelope: envelope.clone(),
            };
            self.enqueue(&queue, routed, now, expiries);
        }
    }

    /// Hand to a consumer, or park until a consumer attaches or the TTL expires
    pub fn enqueue(&mut self, queue_name: &str, routed: Routed, now: Instant, expiries: &mut Vec<Expiry>) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        let mut routed = routed;
        while !queue.consumers.is_empty() {
            let index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);
            match queue.consumers[index].1.send(routed) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    queue.consumers.remove(index);
                    routed = returned;
                }
            }
        }

        let ttl = match (routed.envelope.expiration, queue.arguments.message_ttl) {
            (Some(per_message), Some(per_queue)) => Some(per_message.min(per_queue)),
            (per_message, per_queue) => per_message.or(per_queue),
        };

        match ttl {
            Some(ttl) => expiries.push(Expiry {
                at: now + ttl,
                queue: queue_name.to_string(),
                routed,
            }),
            None => queue.ready.push_back(routed),
        }
    }

    /// Send a message that died in `queue_name` to that queue's dead-letter exchange
    pub fn dead_letter(
        &mut self,
        queue_name: &str,
        routed: Routed,
        reason: DeathReason,
        now: Instant,
        expiries: &mut Vec<Expiry>,
    ) {
        let Some(queue) = self.queues.get(queue_name) else {
            return;
        };
        let Some(dead_letter_exchange) = queue.arguments.dead_letter_exchange.clone() else {
            debug!(queue = %queue_name, reason = %reason, "Message discarded, no dead-letter exchange");
            return;
        };

        let Routed { exchange, mut envelope } = routed;
        envelope.record_death(queue_name, &exchange, reason);
        self.publish(&dead_letter_exchange, envelope, now, expiries);
    }

    pub fn expire(&mut self, expiry: Expiry, now: Instant, expiries: &mut Vec<Expiry>) {
        self.dead_letter(&expiry.queue, expiry.routed, DeathReason::Expired, now, expiries);
    }

    pub fn attach_consumer(&mut self, queue_name: &str) -> Result<(u64, mpsc::UnboundedReceiver<Routed>)> {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Err(QueueError::NotFound(format!("queue {}", queue_name)));
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        while let Some(routed) = queue.ready.pop_front() {
            if let Err(mpsc::error::SendError(routed)) = sender.send(routed) {
                queue.ready.push_front(routed);
                break;
            }
        }

        self.next_consumer_id += 1;
        let id = self.next_consumer_id;
        queue.consumers.push((id, sender));
        Ok((id, receiver))
    }

    pub fn detach_consumer(&mut self, queue_name: &str, id: u64) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.consumers.retain(|(consumer, _)| *consumer != id);
        }
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.exchanges.get(name).map(|e| e.kind)
    }

    pub fn queue_arguments(&self, name: &str) -> Option<QueueArguments> {
        self.queues.get(name).map(|q| q.arguments.clone())
    }

    pub fn ready_messages(&self, name: &str) -> Vec<Envelope> {
        self.queues
            .get(name)
            .map(|q| q.ready.iter().map(|r| r.envelope.clone()).collect())
            .unwrap_or_default()
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.exchanges.values().map(|e| e.bindings.len()).sum()
    }
}
