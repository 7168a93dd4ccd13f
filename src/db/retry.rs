//! Retry decisions for the executor.
//!
//! A [`RetryPolicy`] answers two questions after a failed attempt: may the
//! executor try again, and how long should it wait first. Only transient
//! failures (connection-category or timeout) are ever retried.

use crate::error::DbError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryOptions {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Jitter factor in `0.0..=1.0`
    pub jitter: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_ms: 50,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryOptions::default())
    }
}

impl From<&RetryOptions> for RetryPolicy {
    fn from(options: &RetryOptions) -> Self {
        Self {
            max_retries: options.max_retries,
            initial_delay: Duration::from_millis(options.retry_backoff_ms),
            max_delay: Duration::from_millis(options.max_backoff_ms.max(options.retry_backoff_ms)),
            multiplier: options.backoff_multiplier.max(1.0),
            jitter: options.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Same delay before every retry.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed with `error`.
    pub fn should_retry(&self, attempt: u32, error: &DbError) -> bool {
        error.is_retryable() && attempt <= self.max_retries
    }

    /// Delay before retry number `attempt` (1-based); zero for attempt 0.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.min(30) as i32 - 1;
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);

        // deterministic spread in [-jitter, +jitter] of the capped delay
        let spread = if self.jitter > 0.0 {
            let fraction = (f64::from(attempt) * 0.618_033_988_749_895) % 1.0;
            capped * self.jitter * (fraction - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((capped + spread).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DriverError, translate};

    #[test]
    fn test_only_transient_errors_retry() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        let conn = translate("SELECT 1", DriverError::new("reset").with_state("08S01"));
        let dup = translate("INSERT", DriverError::new("dup").with_state("23505"));
        let timeout = translate("SELECT 1", DriverError::timed_out("slow"));

        assert!(policy.should_retry(1, &conn));
        assert!(policy.should_retry(2, &timeout));
        assert!(!policy.should_retry(3, &conn));
        assert!(!policy.should_retry(1, &dup));
        assert!(!policy.should_retry(1, &DbError::timeout("borrow", 10)));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::from(&RetryOptions {
            max_retries: 5,
            retry_backoff_ms: 100,
            max_backoff_ms: 300,
            backoff_multiplier: 2.0,
            jitter: 0.0,
        });
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(10), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for attempt in 1..10 {
            let delay = policy.backoff(attempt).as_millis() as f64;
            let base = (50.0 * 2f64.powi(attempt as i32 - 1)).min(2000.0);
            assert!(delay >= base * 0.9 - 1.0 && delay <= base * 1.1 + 1.0);
        }
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        let conn = translate("SELECT 1", DriverError::new("reset").with_state("08006"));
        assert!(!policy.should_retry(1, &conn));
    }
}
