use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use tq_common::{DeathReason, Envelope, Headers, REQUEST_ID_HEADER};
use tq_queue::{
    BrokerSettings, Delivery, ExchangeKind, InMemoryBroker, MessageBroker, MessageHandler,
    QueueError,
};

const ALIVE: &str = "queue_reverse_text";

#[derive(Clone, Copy)]
enum Settle {
    Ack,
    Reject,
    RejectOnce,
    Leave,
}

struct Forward {
    tx: mpsc::UnboundedSender<Envelope>,
    settle: Settle,
}

#[async_trait]
impl MessageHandler for Forward {
    async fn handle(&self, delivery: Delivery) {
        let envelope = delivery.envelope().clone();
        let first_attempt = envelope.death_count_in(ALIVE) == 0;
        let _ = self.tx.send(envelope);

        match self.settle {
            Settle::Ack => delivery.ack().await.unwrap(),
            Settle::Reject => delivery.reject().await.unwrap(),
            Settle::RejectOnce if first_attempt => delivery.reject().await.unwrap(),
            Settle::RejectOnce => delivery.ack().await.unwrap(),
            Settle::Leave => drop(delivery),
        }
    }
}

fn broker(retry_delay: Duration) -> InMemoryBroker {
    InMemoryBroker::new(BrokerSettings::default().with_retry_delay(retry_delay))
}

fn spawn_consumer(
    broker: &InMemoryBroker,
    settle: Settle,
) -> (mpsc::UnboundedReceiver<Envelope>, tokio::task::JoinHandle<tq_queue::Result<()>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = Arc::new(Forward { tx, settle });
    let consumer = broker.clone();
    let handle = tokio::spawn(async move { consumer.consume(ALIVE, handler).await });
    (rx, handle)
}

fn request_headers(id: &str) -> Headers {
    let mut headers = Headers::new();
    headers.insert(REQUEST_ID_HEADER.to_string(), id.to_string());
    headers
}

#[tokio::test]
async fn test_idempotent_startup() {
    let broker = broker(Duration::from_secs(5));

    broker.idempotent_startup().await.unwrap();
    let first = broker.topology_counts();
    broker.idempotent_startup().await.unwrap();
    broker.idempotent_startup().await.unwrap();

    assert_eq!(first, (3, 2, 2));
    assert_eq!(broker.topology_counts(), first);
    assert_eq!(broker.exchange_kind("exchange_sorter"), Some(ExchangeKind::Direct));
    assert_eq!(broker.exchange_kind("exchange_retry"), Some(ExchangeKind::Fanout));
    assert_eq!(
        broker
            .queue_arguments("queue_waiting_retry")
            .and_then(|a| a.message_ttl),
        Some(Duration::from_secs(5))
    );
}

#[tokio::test]
async fn test_publish_declares_alive_queue_once() {
    let broker = broker(Duration::from_secs(5));
    broker.idempotent_startup().await.unwrap();

    for _ in 0..3 {
        assert!(broker
            .publish(b"vlada", ALIVE, Headers::new(), Duration::ZERO)
            .await
            .unwrap());
    }

    assert_eq!(broker.topology_counts(), (3, 3, 3));
    assert_eq!(
        broker
            .queue_arguments(ALIVE)
            .and_then(|a| a.dead_letter_exchange),
        Some("exchange_retry".to_string())
    );
}

#[tokio::test]
async fn test_conflicting_declaration_fails() {
    let broker = broker(Duration::from_secs(5));
    broker.idempotent_startup().await.unwrap();

    let err = broker
        .publish(b"x", "queue_waiting_retry", Headers::new(), Duration::ZERO)
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::PreconditionFailed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_delayed_publish_arrives_after_delay() {
    let broker = broker(Duration::from_secs(5));
    broker.idempotent_startup().await.unwrap();
    let (mut rx, _consumer) = spawn_consumer(&broker, Settle::Ack);

    let started = Instant::now();
    broker
        .publish(b"vlada", ALIVE, request_headers("12345"), Duration::from_secs(10))
        .await
        .unwrap();

    assert!(timeout(Duration::from_millis(9_900), rx.recv()).await.is_err());

    let envelope = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_millis(10_100));
    assert_eq!(envelope.body, b"vlada");
    assert_eq!(envelope.request_id(), Some("12345"));
    assert_eq!(envelope.deaths.len(), 1);
    assert_eq!(envelope.deaths[0].queue, "queue_waiting_depart");
    assert_eq!(envelope.deaths[0].reason, DeathReason::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_message_returns_after_retry_delay() {
    let broker = broker(Duration::from_secs(5));
    broker.idempotent_startup().await.unwrap();
    let (mut rx, _consumer) = spawn_consumer(&broker, Settle::RejectOnce);

    broker
        .publish(b"vlada", ALIVE, Headers::new(), Duration::ZERO)
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.death_count_in("queue_waiting_retry"), 0);
    let rejected_at = Instant::now();

    let second = timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
    assert!(rejected_at.elapsed() >= Duration::from_secs(5));
    assert!(rejected_at.elapsed() < Duration::from_millis(5_100));
    assert_eq!(second.death_count_in(ALIVE), 1);
    assert_eq!(second.death_count_in("queue_waiting_retry"), 1);
    assert_eq!(second.deaths[0].queue, "queue_waiting_retry");

    assert!(timeout(Duration::from_secs(30), rx.recv()).await.is_err());
    assert_eq!(broker.delayed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_death_counts_grow_on_every_cycle() {
    let broker = broker(Duration::from_secs(1));
    broker.idempotent_startup().await.unwrap();
    let (mut rx, _consumer) = spawn_consumer(&broker, Settle::Reject);

    broker
        .publish(b"vlada", ALIVE, Headers::new(), Duration::ZERO)
        .await
        .unwrap();

    for expected in 0..4u64 {
        let envelope = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(envelope.death_count_in("queue_waiting_retry"), expected);
    }
}

#[tokio::test]
async fn test_kill_signal_stops_consumer_and_deletes_queue() {
    let broker = broker(Duration::from_secs(5));
    broker.idempotent_startup().await.unwrap();
    let (mut rx, consumer) = spawn_consumer(&broker, Settle::Ack);

    broker
        .publish(b"vlada", ALIVE, Headers::new(), Duration::ZERO)
        .await
        .unwrap();
    timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();

    broker
        .publish(b"kill", ALIVE, Headers::new(), Duration::ZERO)
        .await
        .unwrap();

    timeout(Duration::from_secs(1), consumer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!broker.queue_exists(ALIVE));
}

#[tokio::test]
async fn test_unsettled_delivery_is_requeued() {
    let broker = broker(Duration::from_secs(5));
    broker.idempotent_startup().await.unwrap();
    broker
        .publish(b"vlada", ALIVE, Headers::new(), Duration::ZERO)
        .await
        .unwrap();

    let (mut rx, consumer) = spawn_consumer(&broker, Settle::Leave);
    let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    consumer.abort();

    assert_eq!(first.body, second.body);
    assert_eq!(first.deaths, second.deaths);
}

#[tokio::test]
async fn test_messages_wait_for_a_consumer() {
    let broker = broker(Duration::from_secs(5));
    broker.idempotent_startup().await.unwrap();

    broker
        .publish(b"one", ALIVE, Headers::new(), Duration::ZERO)
        .await
        .unwrap();
    broker
        .publish(b"two", ALIVE, Headers::new(), Duration::ZERO)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let parked: Vec<Vec<u8>> = broker
        .ready_messages(ALIVE)
        .into_iter()
        .map(|e| e.body)
        .collect();
    assert_eq!(parked, vec![b"one".to_vec(), b"two".to_vec()]);

    let (mut rx, _consumer) = spawn_consumer(&broker, Settle::Ack);
    assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap().body, b"one");
    assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap().body, b"two");
}
