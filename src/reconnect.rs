//! Reconnection policy for the streaming transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

use crate::config::duration_ms;
use crate::error::ChatClientError;

/// Reconnection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts. `None` reconnects forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
    /// Initial delay before the first reconnection.
    #[serde(default = "default_initial_delay", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between reconnections.
    #[serde(default = "default_max_delay", with = "duration_ms")]
    pub max_delay: Duration,
    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    /// Whether to add jitter.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> Option<u32> {
    Some(10)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl ReconnectConfig {
    /// Calculate the delay for a given attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter {
            // 0.5x to 1.5x
            capped * (0.5 + rand::random::<f64>())
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }
}

/// Tracks reconnection attempts for a live connection.
#[derive(Debug)]
pub struct ReconnectHandler {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectHandler {
    /// Create a new reconnection handler.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Check if another reconnection is allowed.
    #[must_use]
    pub fn can_reconnect(&self) -> bool {
        match self.config.max_attempts {
            Some(max) => self.attempts < max,
            None => true,
        }
    }

    /// Wait out the backoff delay before the next reconnection attempt.
    ///
    /// # Errors
    /// Returns `ReconnectLimitExceeded` once the attempt limit is reached.
    pub async fn wait_for_reconnect(&mut self) -> Result<(), ChatClientError> {
        if !self.can_reconnect() {
            return Err(ChatClientError::ReconnectLimitExceeded {
                attempts: self.attempts,
            });
        }

        let delay = self.config.delay_for_attempt(self.attempts);
        debug!(
            attempt = self.attempts,
            delay_ms = delay.as_millis(),
            "waiting before reconnection"
        );

        sleep(delay).await;
        self.attempts += 1;

        Ok(())
    }
}
