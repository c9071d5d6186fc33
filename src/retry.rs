//! Store write retries

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// No retry
    None,
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// Exponential backoff
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            RetryStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                let delay = (*initial_delay_ms as f64) * multiplier.powi(exponent);
                let delay = delay.min(*max_delay_ms as f64);
                Duration::from_millis(delay as u64)
            }
        }
    }
}

/// How many times a failing batch write is retried, and how far apart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: RetryStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            strategy: RetryStrategy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            strategy: RetryStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier: 2.0,
            },
        }
    }

    /// Delay before retry `attempt`, or `None` once the budget is spent
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries {
            None
        } else {
            Some(self.strategy.delay_for_attempt(attempt))
        }
    }
}
