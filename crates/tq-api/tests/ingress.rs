use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use async_trait::async_trait;
use tq_common::{BackoffConfig, ConnectionTimeoutError, Headers};
use tq_api::{create_ingress_router, create_relay_router, IngressState, RelayState};
use tq_limiter::{InMemoryCounterStore, RateLimiter};
use tq_queue::{BrokerSettings, InMemoryBroker, MessageBroker, MessageHandler};

const ALIVE: &str = "queue_reverse_text";

fn token(user_id: &str) -> String {
    let claims = json!({
        "sub": {
            "iat": "2023-01-01T00:00:00",
            "ttl": 3600,
            "user_id": user_id,
            "access_token_id": "a1",
            "refresh_token_id": "r1"
        }
    });
    format!("Bearer e30.{}.sig", URL_SAFE_NO_PAD.encode(claims.to_string()))
}

async fn app(rate_limit: u64) -> (Router, Arc<InMemoryBroker>) {
    let broker = Arc::new(InMemoryBroker::new(BrokerSettings::default()));
    broker.idempotent_startup().await.unwrap();

    let limiter = RateLimiter::new(
        Arc::new(InMemoryCounterStore::new()),
        rate_limit,
        BackoffConfig::with_max_timeout(Duration::from_secs(1)),
    );
    let router = create_ingress_router(IngressState {
        broker: broker.clone(),
        limiter: Arc::new(limiter),
        queue: ALIVE.to_string(),
        kill_signal: b"kill".to_vec(),
    });
    (router, broker)
}

/// Broker whose backoff budget is always spent
struct UnreachableBroker;

#[async_trait]
impl MessageBroker for UnreachableBroker {
    fn identifier(&self) -> &str {
        "unreachable"
    }

    async fn publish(&self, _: &[u8], _: &str, _: Headers, _: Duration) -> tq_queue::Result<bool> {
        Err(ConnectionTimeoutError::new("message_brokers.publish", "connection refused").into())
    }

    async fn consume(&self, _: &str, _: Arc<dyn MessageHandler>) -> tq_queue::Result<()> {
        Err(ConnectionTimeoutError::new("message_brokers.consume", "connection refused").into())
    }

    async fn idempotent_startup(&self) -> tq_queue::Result<()> {
        Ok(())
    }
}

fn submit(text: &str, user_id: Option<&str>, request_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/queue_reverse_text?text={}", text));
    if let Some(user_id) = user_id {
        builder = builder.header("Authorization", token(user_id));
    }
    if let Some(request_id) = request_id {
        builder = builder.header("X-Request-Id", request_id);
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_text_is_queued_with_request_id() {
    let (router, broker) = app(20).await;

    let response = router
        .oneshot(submit("vlada", Some("42"), Some("12345")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({ "SUCCESS": true }));

    let queued = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let ready = broker.ready_messages(ALIVE);
            if !ready.is_empty() {
                return ready;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(queued[0].body, b"vlada");
    assert_eq!(queued[0].request_id(), Some("12345"));
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let (router, _broker) = app(20).await;

    let response = router.oneshot(submit("vlada", None, Some("1"))).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_missing_request_id_is_bad_request() {
    let (router, broker) = app(20).await;

    let response = router.oneshot(submit("vlada", Some("42"), None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(!broker.queue_exists(ALIVE));
}

#[tokio::test]
async fn test_broker_timeout_is_service_unavailable() {
    let limiter = RateLimiter::new(
        Arc::new(InMemoryCounterStore::new()),
        20,
        BackoffConfig::with_max_timeout(Duration::from_secs(1)),
    );
    let router = create_ingress_router(IngressState {
        broker: Arc::new(UnreachableBroker),
        limiter: Arc::new(limiter),
        queue: ALIVE.to_string(),
        kill_signal: b"kill".to_vec(),
    });

    let response = router.oneshot(submit("vlada", Some("42"), Some("1"))).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"], "SERVICE_UNAVAILABLE");
    assert_eq!(
        body["message"],
        "message_brokers.publish | Connection timeout connection refused"
    );
}

#[tokio::test]
async fn test_kill_signal_text_is_refused() {
    let (router, broker) = app(20).await;

    for text in ["kill", "llik"] {
        let response = router
            .clone()
            .oneshot(submit(text, Some("42"), Some("1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
    assert!(!broker.queue_exists(ALIVE));

    let response = router.oneshot(submit("skill", Some("42"), Some("1"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_per_user() {
    let (router, _broker) = app(2).await;

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(submit("vlada", Some("42"), Some("1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let limited = router
        .clone()
        .oneshot(submit("vlada", Some("42"), Some("1")))
        .await
        .unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        json_body(limited).await,
        json!({ "error": "TOO_MANY_REQUESTS", "message": "Too Many Requests" })
    );

    let other_user = router
        .oneshot(submit("vlada", Some("43"), Some("1")))
        .await
        .unwrap();
    assert_eq!(other_user.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_is_not_rate_limited() {
    let (router, _broker) = app(0).await;

    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "UP");
}

#[tokio::test]
async fn test_relay_health() {
    let broker = Arc::new(InMemoryBroker::new(BrokerSettings::default()));
    let router = create_relay_router(RelayState {
        broker,
        queue: "queue_websocket".to_string(),
    });

    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
