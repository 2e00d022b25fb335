use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::tus::TusError;

/// Backoff curve between attempts, all values in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Same delay every time
    Fixed {
        delay_ms: u64,
    },
    /// `initial * multiplier^attempt`, capped
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
    },
    /// `initial + increment * attempt`, capped
    Linear {
        initial_ms: u64,
        increment_ms: u64,
        max_delay_ms: u64,
    },
}

impl RetryStrategy {
    /// Delay before retry number `attempt` (zero based).
    pub fn get_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            RetryStrategy::Exponential { initial_ms, multiplier, max_delay_ms } => {
                let delay = *initial_ms as f64 * multiplier.powf(attempt as f64);
                let delay = if delay.is_finite() {
                    delay.min(*max_delay_ms as f64)
                } else {
                    *max_delay_ms as f64
                };
                Duration::from_millis(delay as u64)
            }
            RetryStrategy::Linear { initial_ms, increment_ms, max_delay_ms } => {
                let delay = initial_ms.saturating_add(increment_ms.saturating_mul(attempt as u64));
                Duration::from_millis(delay.min(*max_delay_ms))
            }
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential {
            initial_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

/// Bounded retry for transient failures of a single protocol step.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Retries allowed per step after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub strategy: RetryStrategy,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            strategy: RetryStrategy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            strategy: RetryStrategy::Fixed { delay_ms: 0 },
        }
    }

    /// Returns the delay to wait before the next attempt, or `None` once the
    /// error is permanent or `attempts` retries were already spent.
    pub fn next_delay(&self, error: &TusError, attempts: u32) -> Option<Duration> {
        if !error.is_retryable() || attempts >= self.max_retries {
            return None;
        }
        Some(self.strategy.get_delay(attempts))
    }
}
