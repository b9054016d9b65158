//! Exponential backoff bounded by a cumulative time budget
//!
//! There is no retry count: an operation keeps being retried until the sleeps
//! add up to `max_timeout`, then the last failure is surfaced as a
//! `ConnectionTimeoutError`. Every error is considered retryable.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::ConnectionTimeoutError;

/// Floor for the first sleep, so a zero start delay still spends the budget
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Total sleep budget before giving up
    pub max_timeout: Duration,
    /// First sleep
    pub start_delay: Duration,
    /// Multiplier applied to the sleep after each failure
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_timeout: Duration::from_secs(30),
            start_delay: Duration::from_millis(100),
            factor: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn with_max_timeout(max_timeout: Duration) -> Self {
        Self {
            max_timeout,
            ..Default::default()
        }
    }
}

/// Sleep schedule of a single retrying call
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    elapsed: Duration,
    next_sleep: Duration,
    max_timeout: Duration,
    factor: f64,
}

impl BackoffSchedule {
    pub fn new(config: &BackoffConfig) -> Self {
        let factor = if config.factor.is_finite() && config.factor >= 1.0 {
            config.factor
        } else {
            1.0
        };

        Self {
            elapsed: Duration::ZERO,
            next_sleep: config.start_delay.max(MIN_SLEEP),
            max_timeout: config.max_timeout,
            factor,
        }
    }

    /// The sleep before the next attempt, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.elapsed >= self.max_timeout {
            return None;
        }

        let sleep = self.next_sleep;
        self.elapsed += sleep;

        let grown = Duration::try_from_secs_f64(sleep.as_secs_f64() * self.factor)
            .unwrap_or(Duration::MAX);
        self.next_sleep = grown.min(self.max_timeout.saturating_sub(self.elapsed));

        Some(sleep)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Retries fallible async operations with exponential backoff
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds or the time budget is exhausted.
    ///
    /// `source_name` identifies the operation in logs and in the timeout error.
    /// The schedule starts fresh on every call.
    pub async fn retry<T, E, F, Fut>(
        &self,
        source_name: &str,
        mut operation: F,
    ) -> Result<T, ConnectionTimeoutError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut schedule = BackoffSchedule::new(&self.config);

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => match schedule.next_delay() {
                    Some(delay) => {
                        warn!(
                            operation = source_name,
                            sleep_ms = delay.as_millis() as u64,
                            error = %e,
                            "Operation failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(ConnectionTimeoutError::new(source_name, e.to_string()));
                    }
                },
            }
        }
    }
}
