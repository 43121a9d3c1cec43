//! Retry policy configuration for tasks.
//!
//! Supports fixed and exponential backoff with a bounded number of retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_duration;

/// Delay applied before a retry when none is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Longest delay [`RetryPolicy::delay_for`] returns.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Retry policy for a task.
///
/// Defines how a failed attempt is turned into a new attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries, not including the initial attempt (0 = no retries).
    /// `max_attempts = 3` allows up to 4 executions in total.
    pub max_attempts: u32,

    /// Base delay before a retry.
    #[serde(with = "serde_duration")]
    pub delay: Duration,

    /// How the delay grows between retries.
    pub backoff: Backoff,

    /// Upper bound on the computed delay.
    #[serde(with = "serde_duration::option")]
    pub max_delay: Option<Duration>,

    /// Condition for when to retry.
    pub retry_on: RetryCondition,
}

/// Growth of the retry delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    #[default]
    Fixed,

    /// `delay * factor^(retry - 1)`.
    Exponential { factor: f64 },
}

/// Conditions under which a task should be retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    /// Retry on any failure.
    #[default]
    Always,

    /// Retry only on transient failures (timeouts, crashed workers, spawn errors).
    TransientOnly,

    /// Never retry, regardless of max_attempts.
    Never,
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            delay: Duration::ZERO,
            backoff: Backoff::Fixed,
            max_delay: None,
            retry_on: RetryCondition::Never,
        }
    }

    /// Create a policy with fixed delay retries.
    ///
    /// # Arguments
    /// * `max_attempts` - Maximum retry attempts (not including initial try)
    /// * `delay` - Fixed delay between retries
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
            max_delay: None,
            retry_on: RetryCondition::Always,
        }
    }

    /// Create a policy whose delay is multiplied by `factor` after each retry.
    pub fn exponential(max_attempts: u32, base: Duration, factor: f64) -> Self {
        Self {
            max_attempts,
            delay: base,
            backoff: Backoff::Exponential { factor },
            max_delay: None,
            retry_on: RetryCondition::Always,
        }
    }

    /// Builder: set the retry condition.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_on = condition;
        self
    }

    /// Builder: cap the computed delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Check if retries are enabled.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0 && self.retry_on != RetryCondition::Never
    }

    /// Check if another retry is allowed.
    ///
    /// # Arguments
    /// * `retries` - Number of retries already made
    /// * `transient` - Whether the last failure was transient
    pub fn should_retry(&self, retries: u32, transient: bool) -> bool {
        match self.retry_on {
            RetryCondition::Never => false,
            RetryCondition::TransientOnly if !transient => false,
            _ => retries < self.max_attempts,
        }
    }

    /// Delay before retry number `retry` (1-indexed), at most [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { factor } => {
                let exp = retry.saturating_sub(1).min(32) as i32;
                let secs = self.delay.as_secs_f64() * factor.max(1.0).powi(exp);
                Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
            }
        };
        let cap = self.max_delay.map_or(MAX_RETRY_DELAY, |max| max.min(MAX_RETRY_DELAY));
        delay.min(cap)
    }
}

impl Default for RetryPolicy {
    /// Default policy: no retries, 5 second delay once retries are enabled.
    fn default() -> Self {
        Self {
            max_attempts: 0,
            delay: DEFAULT_RETRY_DELAY,
            backoff: Backoff::Fixed,
            max_delay: None,
            retry_on: RetryCondition::Always,
        }
    }
}
