//! RetryPolicy - 失敗した試行の次を決める
//!
//! # ポリシー
//! - Transient な失敗で `attempt_count < max_attempts` なら Retry（遅延つき再配送）
//! - `attempt_count == max_attempts` なら Fail（exhausted）
//! - Permanent な失敗は回数に関わらず即 Fail

use std::time::Duration;

use rand::Rng;

use crate::config::{BackoffKind, RetryConfig};
use crate::domain::HandlerError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Constant(Duration),
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Backoff {
    /// Delay before re-dispatching attempt `next_attempt` (1-based).
    pub fn delay_for(&self, next_attempt: u32) -> Duration {
        match *self {
            Backoff::Constant(delay) => delay,
            Backoff::Exponential {
                base,
                multiplier,
                max,
            } => {
                let exp = next_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = base.as_secs_f64() * multiplier.powi(exp);
                if secs.is_finite() && secs < max.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    max
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Retry { next_attempt: u32, delay: Duration },
    Fail { reason: String, exhausted: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        let backoff = match c.backoff {
            BackoffKind::Constant => Backoff::Constant(c.delay()),
            BackoffKind::Exponential => Backoff::Exponential {
                base: c.delay(),
                multiplier: c.multiplier,
                max: c.max_delay(),
            },
        };
        Self {
            max_attempts: c.max_attempts,
            backoff,
            jitter: c.jitter,
        }
    }
}

impl RetryPolicy {
    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Constant(delay),
            jitter: false,
        }
    }

    /// Decide what follows a failed attempt `attempt` (the record's
    /// `attempt_count` when it ran).
    pub fn decide(&self, attempt: u32, error: &HandlerError) -> Decision {
        match error {
            HandlerError::Permanent(msg) => Decision::Fail {
                reason: msg.clone(),
                exhausted: false,
            },
            HandlerError::Transient(msg) if attempt >= self.max_attempts => Decision::Fail {
                reason: format!(
                    "Task failed after {} retries. Last error: {msg}",
                    self.max_attempts
                ),
                exhausted: true,
            },
            HandlerError::Transient(_) => {
                let next_attempt = attempt + 1;
                Decision::Retry {
                    next_attempt,
                    delay: self.delay_for(next_attempt),
                }
            }
        }
    }

    fn delay_for(&self, next_attempt: u32) -> Duration {
        let delay = self.backoff.delay_for(next_attempt);
        if self.jitter && !delay.is_zero() {
            // full jitter: [0, delay]
            delay.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
        } else {
            delay
        }
    }
}
