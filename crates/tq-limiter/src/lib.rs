//! Request rate limiting
//!
//! One counter per (endpoint, identity, minute-of-hour). Every check increments
//! the counter and refreshes its expiry in a single atomic step; a request is
//! refused once the counter exceeds the limit.

pub mod store;

use chrono::{Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use tq_common::{Backoff, BackoffConfig, ConnectionTimeoutError};

pub use store::{CounterStore, InMemoryCounterStore};

#[cfg(feature = "redis")]
pub use store::RedisCounterStore;

/// Counter lifetime, refreshed on every increment
pub const WINDOW_TTL: Duration = Duration::from_secs(59);

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("Rate limit exceeded for {key}: {count} > {limit}")]
    RateLimitExceeded { key: String, count: u64, limit: u64 },

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    ConnectionTimeout(#[from] ConnectionTimeoutError),
}

pub type Result<T> = std::result::Result<T, LimiterError>;

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limit: u64,
    backoff: Backoff,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limit: u64, backoff: BackoffConfig) -> Self {
        Self {
            store,
            limit,
            backoff: Backoff::new(backoff),
        }
    }

    pub fn key(endpoint: &str, identity: &str, minute: u32) -> String {
        format!("{}:{}:{}", endpoint, identity, minute)
    }

    /// Count a request against the current minute's window.
    ///
    /// Returns the request count in the window, or `RateLimitExceeded`.
    pub async fn check(&self, endpoint: &str, identity: &str) -> Result<u64> {
        self.check_at(endpoint, identity, Utc::now().minute()).await
    }

    pub async fn check_at(&self, endpoint: &str, identity: &str, minute: u32) -> Result<u64> {
        let key = Self::key(endpoint, identity, minute);

        let count = self
            .backoff
            .retry("rate_limiter.incr", || self.store.incr_with_expiry(&key, WINDOW_TTL))
            .await?;

        if count > self.limit {
            warn!(key = %key, count, limit = self.limit, "Rate limit exceeded");
            return Err(LimiterError::RateLimitExceeded {
                key,
                count,
                limit: self.limit,
            });
        }

        debug!(key = %key, count, "Request counted");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limiter(limit: u64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            limit,
            BackoffConfig::with_max_timeout(Duration::from_secs(1)),
        )
    }

    #[test]
    fn test_key_format() {
        assert_eq!(
            RateLimiter::key("/queue_reverse_text", "42", 7),
            "/queue_reverse_text:42:7"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_limit_and_expiry() {
        let limiter = limiter(3);

        for expected in 1..=3 {
            assert_eq!(limiter.check_at("/e", "u", 5).await.unwrap(), expected);
        }

        let err = limiter.check_at("/e", "u", 5).await.unwrap_err();
        assert!(matches!(err, LimiterError::RateLimitExceeded { count: 4, limit: 3, .. }));

        // other identities, endpoints and minutes have their own counters
        assert_eq!(limiter.check_at("/e", "other", 5).await.unwrap(), 1);
        assert_eq!(limiter.check_at("/other", "u", 5).await.unwrap(), 1);
        assert_eq!(limiter.check_at("/e", "u", 6).await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.check_at("/e", "u", 5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_checks_admit_exactly_limit() {
        let limiter = Arc::new(limiter(20));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check_at("/e", "u", 0).await.is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 20);
    }

    struct FlakyStore {
        failures: AtomicU32,
        inner: InMemoryCounterStore,
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(ConnectionTimeoutError::new("redis", "connection refused").into());
            }
            self.inner.incr_with_expiry(key, ttl).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failures_are_retried_then_surface_as_timeout() {
        let flaky = RateLimiter::new(
            Arc::new(FlakyStore {
                failures: AtomicU32::new(2),
                inner: InMemoryCounterStore::new(),
            }),
            5,
            BackoffConfig::with_max_timeout(Duration::from_secs(1)),
        );
        assert_eq!(flaky.check_at("/e", "u", 0).await.unwrap(), 1);

        let down = RateLimiter::new(
            Arc::new(FlakyStore {
                failures: AtomicU32::new(u32::MAX),
                inner: InMemoryCounterStore::new(),
            }),
            5,
            BackoffConfig::with_max_timeout(Duration::from_secs(1)),
        );
        let err = down.check_at("/e", "u", 0).await.unwrap_err();
        assert!(matches!(err, LimiterError::ConnectionTimeout(ref e) if e.source_name == "rate_limiter.incr"));
    }
}
