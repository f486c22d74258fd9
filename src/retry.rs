//! Retry with exponential backoff for transient failures.
//!
//! Workers never advance their checkpoint past an entry that failed to
//! apply; they wait and try again. Waits are interruptible by the worker's
//! shutdown signal so `stop()` is never delayed by a long backoff.

use std::time::Duration;
use tokio::sync::watch;

use crate::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    /// Set to `usize::MAX` for infinite retries (daemon mode).
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Infinite retry for a long-running replicator.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        500ms
    /// 2        1s
    /// 3        2s
    /// ...
    /// 7+       30s (cap, retried forever)
    /// ```
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }

    /// Fast retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

/// Attempt counter over a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay before the next attempt, `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.config.delay_for_attempt(self.attempt))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Sleeps for `delay` unless shutdown is signalled first.
///
/// # Errors
///
/// Returns [`Error::Shutdown`] if the signal fires (or is already set).
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
    if *shutdown.borrow() {
        return Err(Error::Shutdown);
    }
    tokio::select! {
        biased;
        changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
                return Err(Error::Shutdown);
            }
            Ok(())
        }
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
