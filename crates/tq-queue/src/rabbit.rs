//! AMQP broker on lapin
//!
//! Every operation opens its own connection and closes it when done, and is
//! wrapped in `Backoff`: a failure anywhere in the operation (connect,
//! declare, publish, consume) retries the whole operation until the time budget
//! is spent.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{acker::Acker, BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use tq_common::{Backoff, DeathReason, DeathRecord, Envelope, Headers, DEATH_HEADER};

use crate::broker::{Acknowledger, Delivery, Dispatcher, MessageBroker, MessageHandler};
use crate::topology::{ExchangeKind, QueueArguments, TopologyChannel, TopologyManager};
use crate::{BrokerSettings, Result};

const PERSISTENT: u8 = 2;
const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const MESSAGE_TTL_ARG: &str = "x-message-ttl";

pub struct RabbitMessageBroker {
    uri: String,
    settings: BrokerSettings,
    topology: TopologyManager,
    backoff: Backoff,
}

impl RabbitMessageBroker {
    pub fn new(uri: impl Into<String>, settings: BrokerSettings) -> Self {
        Self {
            uri: uri.into(),
            topology: TopologyManager::new(settings.topology.clone()),
            backoff: Backoff::new(settings.backoff.clone()),
            settings,
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        Ok(connection)
    }

    async fn try_idempotent_startup(&self) -> Result<()> {
        let connection = self.connect().await?;
        let result: Result<()> = async {
            let channel = connection.create_channel().await?;
            self.topology.declare_topology(&AmqpChannel(&channel)).await
        }
        .await;
        close_quietly(connection).await;
        result
    }

    async fn try_publish(
        &self,
        body: &[u8],
        queue_name: &str,
        headers: &Headers,
        delay: Duration,
    ) -> Result<bool> {
        let connection = self.connect().await?;
        let result: Result<bool> = async {
            let channel = connection.create_channel().await?;
            channel.confirm_select(ConfirmSelectOptions::default()).await?;

            let amqp = AmqpChannel(&channel);
            let incoming = &self.topology.config().exchange_incoming;
            amqp.declare_exchange(incoming, ExchangeKind::Fanout).await?;
            self.topology.ensure_alive_queue(&amqp, queue_name).await?;

            let properties = BasicProperties::default()
                .with_delivery_mode(PERSISTENT)
                .with_expiration(ShortString::from(delay.as_millis().to_string()))
                .with_headers(headers_to_table(headers));

            let confirmation = channel
                .basic_publish(
                    incoming,
                    queue_name,
                    BasicPublishOptions::default(),
                    body,
                    properties,
                )
                .await?
                .await?;

            Ok(confirmation.is_ack())
        }
        .await;
        close_quietly(connection).await;
        result
    }

    async fn try_consume(&self, queue_name: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let connection = self.connect().await?;
        let result = self.consume_on(&connection, queue_name, handler).await;
        close_quietly(connection).await;
        result
    }

    async fn consume_on(
        &self,
        connection: &Connection,
        queue_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let channel = connection.create_channel().await?;
        let amqp = AmqpChannel(&channel);
        self.topology.ensure_alive_queue(&amqp, queue_name).await?;

        let consumer_tag = format!("tq-{}-{}", queue_name, uuid::Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let dispatcher = Dispatcher::new(queue_name, &self.settings, handler);
        info!(queue = %queue_name, consumer_tag = %consumer_tag, "Consuming");

        while let Some(delivery) = consumer.next().await {
            let lapin::message::Delivery {
                data,
                routing_key,
                properties,
                acker,
                ..
            } = delivery?;

            let envelope = envelope_from_amqp(data, routing_key.as_str(), &properties);

            if dispatcher.is_kill_signal(&envelope) {
                info!(queue = %queue_name, "Kill signal received");
                self.topology.delete_alive_queue(&amqp, queue_name).await?;
                return Ok(());
            }

            dispatcher
                .dispatch(Delivery::new(envelope, AmqpAcker(acker)))
                .await?;
        }

        warn!(queue = %queue_name, "Consumer stream ended");
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for RabbitMessageBroker {
    fn identifier(&self) -> &str {
        "rabbitmq"
    }

    async fn publish(
        &self,
        body: &[u8],
        queue_name: &str,
        headers: Headers,
        delay: Duration,
    ) -> Result<bool> {
        let acked = self
            .backoff
            .retry("message_brokers.publish", || {
                self.try_publish(body, queue_name, &headers, delay)
            })
            .await?;

        debug!(queue = %queue_name, delay_ms = delay.as_millis() as u64, acked, "Published");
        Ok(acked)
    }

    async fn consume(&self, queue_name: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.backoff
            .retry("message_brokers.consume", || {
                self.try_consume(queue_name, handler.clone())
            })
            .await?;
        Ok(())
    }

    async fn idempotent_startup(&self) -> Result<()> {
        self.backoff
            .retry("message_brokers.idempotent_startup", || self.try_idempotent_startup())
            .await?;
        Ok(())
    }
}

async fn close_quietly(connection: Connection) {
    if let Err(e) = connection.close(200, "OK").await {
        debug!(error = %e, "Failed to close AMQP connection");
    }
}

struct AmqpChannel<'a>(&'a Channel);

#[async_trait]
impl TopologyChannel for AmqpChannel<'_> {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };
        self.0
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> Result<()> {
        self.0
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments_table(arguments),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.0
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.0
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }
}

fn queue_arguments_table(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(LongString::from(exchange.as_str())),
        );
    }
    if let Some(ttl) = arguments.message_ttl {
        table.insert(
            MESSAGE_TTL_ARG.into(),
            AMQPValue::LongLongInt(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)),
        );
    }
    table
}

fn headers_to_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(LongString::from(value.as_str())),
        );
    }
    table
}

fn envelope_from_amqp(data: Vec<u8>, routing_key: &str, properties: &BasicProperties) -> Envelope {
    let mut envelope = Envelope::new(data, routing_key);

    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            if key.as_str() == DEATH_HEADER {
                envelope.deaths = parse_deaths(value);
            } else if let Some(text) = value_to_string(value) {
                envelope.headers.insert(key.as_str().to_string(), text);
            }
        }
    }

    envelope
}

/// Decode the broker's `x-death` array, most recent death first
fn parse_deaths(value: &AMQPValue) -> Vec<DeathRecord> {
    let AMQPValue::FieldArray(entries) = value else {
        return Vec::new();
    };

    entries
        .as_slice()
        .iter()
        .filter_map(|entry| {
            let AMQPValue::FieldTable(record) = entry else {
                return None;
            };
            let text = |name: &str| field(record, name).and_then(value_to_string).unwrap_or_default();

            let routing_keys = match field(record, "routing-keys") {
                Some(AMQPValue::FieldArray(keys)) => {
                    keys.as_slice().iter().filter_map(value_to_string).collect()
                }
                _ => Vec::new(),
            };

            Some(DeathRecord {
                queue: text("queue"),
                exchange: text("exchange"),
                reason: DeathReason::parse(&text("reason")),
                count: field(record, "count").and_then(value_to_u64).unwrap_or(0),
                routing_keys,
            })
        })
        .collect()
}

fn field<'a>(table: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)
}

fn value_to_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::ByteArray(b) => Some(String::from_utf8_lossy(b.as_slice()).into_owned()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        other => value_to_u64(other).map(|n| n.to_string()),
    }
}

fn value_to_u64(value: &AMQPValue) -> Option<u64> {
    match *value {
        AMQPValue::ShortShortUInt(n) => Some(u64::from(n)),
        AMQPValue::ShortUInt(n) => Some(u64::from(n)),
        AMQPValue::LongUInt(n) => Some(u64::from(n)),
        AMQPValue::Timestamp(n) => Some(n),
        AMQPValue::ShortShortInt(n) => u64::try_from(n).ok(),
        AMQPValue::ShortInt(n) => u64::try_from(n).ok(),
        AMQPValue::LongInt(n) => u64::try_from(n).ok(),
        AMQPValue::LongLongInt(n) => u64::try_from(n).ok(),
        _ => None,
    }
}
