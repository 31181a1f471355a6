//! Retry policy for the HTTP transport.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::ChatClientError;

/// Retry decision result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after a delay.
    RetryAfter(Duration),
    /// Do not retry.
    DoNotRetry,
}

/// Retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Never retry.
    Never,
    /// Retry only for idempotent operations.
    IdempotentOnly,
    /// Retry regardless of idempotency.
    Always,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Base delay for exponential backoff.
    #[serde(default = "default_base_delay", with = "duration_ms")]
    pub base_delay: Duration,
    /// Maximum delay between retries.
    #[serde(default = "default_max_delay", with = "duration_ms")]
    pub max_delay: Duration,
    /// Maximum jitter to add to delays.
    #[serde(default = "default_max_jitter", with = "duration_ms")]
    pub max_jitter: Duration,
    /// Retry strategy.
    #[serde(default = "default_strategy")]
    pub strategy: RetryStrategy,
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_jitter() -> Duration {
    Duration::from_millis(150)
}

fn default_strategy() -> RetryStrategy {
    RetryStrategy::IdempotentOnly
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            max_jitter: default_max_jitter(),
            strategy: default_strategy(),
        }
    }
}

impl RetryPolicy {
    /// Decide whether to retry based on the error and attempt count.
    ///
    /// A server-supplied Retry-After delay overrides the computed backoff.
    #[must_use]
    pub fn decide(
        &self,
        error: &ChatClientError,
        attempt: usize,
        idempotent: bool,
    ) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::DoNotRetry;
        }
        if !error.is_retryable() {
            return RetryDecision::DoNotRetry;
        }

        match self.strategy {
            RetryStrategy::Never => RetryDecision::DoNotRetry,
            RetryStrategy::IdempotentOnly if !idempotent => RetryDecision::DoNotRetry,
            _ => {
                if let Some(delay) = error.retry_after() {
                    return RetryDecision::RetryAfter(delay);
                }

                let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
                let exp = 2_u64
                    .saturating_pow(u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
                let mut delay_ms = base_ms.saturating_mul(exp);
                let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
                if delay_ms > max_ms {
                    delay_ms = max_ms;
                }
                let jitter_ms = if self.max_jitter.as_millis() > 0 {
                    let mut rng = rand::thread_rng();
                    let jitter_max = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
                    rng.gen_range(0..=jitter_max)
                } else {
                    0
                };
                RetryDecision::RetryAfter(Duration::from_millis(delay_ms + jitter_ms))
            }
        }
    }
}
