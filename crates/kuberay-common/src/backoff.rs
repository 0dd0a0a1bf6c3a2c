//! Requeue backoff with exponential growth and jitter.
//!
//! The controllers count consecutive reconcile failures per object key. Each
//! failure doubles the requeue delay up to a cap, with 0.5x-1.5x jitter so
//! objects that failed together don't come back together. A successful
//! reconcile resets the key.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

use crate::{Error, Result};

/// Backoff tuning
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Un-jittered delay for the n-th consecutive failure (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Per-key consecutive failure tracking
#[derive(Debug, Default)]
pub struct RequeueBackoff {
    config: BackoffConfig,
    failures: DashMap<String, u32>,
}

impl RequeueBackoff {
    /// Create a tracker with the given tuning
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return the jittered delay before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let attempt = {
            let mut entry = self.failures.entry(key.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        let delay = self.config.delay_for_attempt(attempt);

        // Add jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * jitter)
    }

    /// Forget failures for `key`
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|v| *v).unwrap_or(0)
    }
}

/// Run `fut` with a deadline, mapping expiry to a retryable [`Error::Timeout`]
pub async fn with_deadline<T, F>(deadline: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, deadline.as_secs())),
    }
}
