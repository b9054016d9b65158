//! Shared types for the text queue services
//!
//! - `Envelope`: a message body with its headers and broker-populated death history
//! - `Backoff`: exponential backoff bounded by a total time budget
//! - `ConnectionTimeoutError`: what a backoff-wrapped operation fails with

pub mod backoff;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub use backoff::{Backoff, BackoffConfig, BackoffSchedule};

/// Caller-supplied request identifier header
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Broker-populated death history header
pub const DEATH_HEADER: &str = "x-death";

/// String headers carried by a message
pub type Headers = BTreeMap<String, String>;

// ============================================================================
// Message Types
// ============================================================================

/// Why the broker dead-lettered a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeathReason {
    /// Consumer rejected the message without requeue
    Rejected,
    /// Per-message or per-queue TTL elapsed
    Expired,
    /// Anything else the broker reports (maxlen, delivery_limit, ...)
    Other(String),
}

impl DeathReason {
    pub fn as_str(&self) -> &str {
        match self {
            DeathReason::Rejected => "rejected",
            DeathReason::Expired => "expired",
            DeathReason::Other(reason) => reason,
        }
    }

    pub fn parse(reason: &str) -> Self {
        match reason {
            "rejected" => DeathReason::Rejected,
            "expired" => DeathReason::Expired,
            other => DeathReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the death history: how many times the message died in `queue` for `reason`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub queue: String,
    pub exchange: String,
    pub reason: DeathReason,
    pub count: u64,
    pub routing_keys: Vec<String>,
}

/// A message as seen by publishers and consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub headers: Headers,
    /// Most recent death first
    pub deaths: Vec<DeathRecord>,
    /// Per-message TTL; removed when the message is dead-lettered
    pub expiration: Option<Duration>,
}

impl Envelope {
    pub fn new(body: impl Into<Vec<u8>>, routing_key: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            routing_key: routing_key.into(),
            headers: Headers::new(),
            deaths: Vec::new(),
            expiration: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// The `X-Request-Id` header, if the publisher set one
    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(REQUEST_ID_HEADER).map(String::as_str)
    }

    /// How many times this message died in `queue`, for any reason
    pub fn death_count_in(&self, queue: &str) -> u64 {
        self.deaths
            .iter()
            .filter(|d| d.queue == queue)
            .map(|d| d.count)
            .sum()
    }

    /// Record a death the way the broker does it: one record per (queue, reason),
    /// incremented and moved to the front on every repeat.
    pub fn record_death(&mut self, queue: &str, exchange: &str, reason: DeathReason) {
        let existing = self
            .deaths
            .iter()
            .position(|d| d.queue == queue && d.reason == reason);

        let record = match existing {
            Some(index) => {
                let mut record = self.deaths.remove(index);
                record.count += 1;
                record
            }
            None => DeathRecord {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                reason,
                count: 1,
                routing_keys: vec![self.routing_key.clone()],
            },
        };

        self.deaths.insert(0, record);
        self.expiration = None;
    }

    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Raised once a backoff-wrapped operation has exhausted its time budget
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{source_name} | {message} {error}")]
pub struct ConnectionTimeoutError {
    /// Name of the wrapped operation
    pub source_name: String,
    pub message: String,
    /// Description of the last underlying failure
    pub error: String,
}

impl ConnectionTimeoutError {
    pub fn new(source_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            message: "Connection timeout".to_string(),
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_header() {
        let envelope = Envelope::new("vlada", "queue").with_header(REQUEST_ID_HEADER, "12345");
        assert_eq!(envelope.request_id(), Some("12345"));
        assert_eq!(Envelope::new("vlada", "queue").request_id(), None);
    }

    #[test]
    fn test_record_death_moves_latest_to_front() {
        let mut envelope = Envelope::new("x", "alive").with_expiration(Duration::from_secs(1));

        envelope.record_death("depart", "incoming", DeathReason::Expired);
        assert_eq!(envelope.expiration, None);

        envelope.record_death("alive", "sorter", DeathReason::Rejected);
        envelope.record_death("retry", "retry-exchange", DeathReason::Expired);
        envelope.record_death("alive", "sorter", DeathReason::Rejected);

        assert_eq!(envelope.deaths.len(), 3);
        assert_eq!(envelope.deaths[0].queue, "alive");
        assert_eq!(envelope.deaths[0].count, 2);
        assert_eq!(envelope.deaths[1].queue, "retry");
        assert_eq!(envelope.deaths[2].queue, "depart");
        assert_eq!(envelope.death_count_in("retry"), 1);
        assert_eq!(envelope.death_count_in("missing"), 0);
    }

    #[test]
    fn test_timeout_error_display() {
        let err = ConnectionTimeoutError::new("message_brokers.publish", "connection refused");
        assert_eq!(
            err.to_string(),
            "message_brokers.publish | Connection timeout connection refused"
        );
    }

    #[test]
    fn test_death_reason_roundtrip() {
        assert_eq!(DeathReason::parse("expired"), DeathReason::Expired);
        assert_eq!(DeathReason::parse("rejected").as_str(), "rejected");
        assert_eq!(DeathReason::parse("maxlen"), DeathReason::Other("maxlen".to_string()));
    }
}
