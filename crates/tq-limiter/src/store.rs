use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::Result;

/// Shared counters with expiry
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and set its expiry to `ttl` from now, atomically.
    /// Returns the incremented value.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64>;
}

/// Process-local counters, for single-instance deployments and tests
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        counters.retain(|_, (_, expires_at)| *expires_at > now);

        let entry = counters.entry(key.to_string()).or_insert((0, now));
        entry.0 += 1;
        entry.1 = now + ttl;
        Ok(entry.0)
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisCounterStore;

#[cfg(feature = "redis")]
mod redis_store {
    use super::*;
    use redis::aio::ConnectionManager;
    use tokio::sync::OnceCell;
    use tracing::info;

    /// Counters in Redis: `MULTI; INCR key; EXPIRE key ttl; EXEC`
    pub struct RedisCounterStore {
        client: redis::Client,
        connection: OnceCell<ConnectionManager>,
    }

    impl RedisCounterStore {
        /// Validate the URL; the connection is opened on first use
        pub fn open(url: &str) -> Result<Self> {
            Ok(Self {
                client: redis::Client::open(url)?,
                connection: OnceCell::new(),
            })
        }

        async fn connection(&self) -> Result<ConnectionManager> {
            let connection = self
                .connection
                .get_or_try_init(|| async {
                    let manager = ConnectionManager::new(self.client.clone()).await?;
                    info!("Connected to Redis");
                    Ok::<_, redis::RedisError>(manager)
                })
                .await?;
            Ok(connection.clone())
        }
    }

    #[async_trait]
    impl CounterStore for RedisCounterStore {
        async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
            let mut connection = self.connection().await?;
            let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

            let (count,): (u64,) = redis::pipe()
                .atomic()
                .incr(key, 1)
                .expire(key, ttl_secs)
                .ignore()
                .query_async(&mut connection)
                .await?;
            Ok(count)
        }
    }
}
