//! Backoff between drain cycles.
//!
//! The engine never busy-retries inside one drain. A failed action is
//! rescheduled and becomes eligible again once its backoff delay has passed.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use offsync_common::types::duration_ms;

/// Maps a failed-attempt count to the delay before the next attempt.
pub trait BackoffStrategy: Send + Sync {
    /// Delay after `attempt` failed attempts (`attempt >= 1`).
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
}

impl<F> BackoffStrategy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// Retry immediately on the next drain.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffStrategy for NoBackoff {
    fn delay_for_attempt(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay after the first failure.
    #[serde(with = "duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffStrategy for RetryConfig {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}
