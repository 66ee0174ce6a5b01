//! Per-item retry budget and exponential backoff schedule.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ItemError};

/// Default number of attempts per item (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the second attempt.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default ceiling for any single backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Retry policy applied by workers to each item.
///
/// Only [`ItemError::Transient`] failures consume retry budget; permanent
/// failures resolve the item on the spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again.
    RetryAfter(Duration),
    /// Give up and fail the item.
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts == 0 {
            return Err(CoreError::Validation(
                "Retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(CoreError::Validation(
                "Retry initial backoff must not exceed the max backoff".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay after the `attempt`-th failure (1-based): doubles each time,
    /// capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Decide what follows a failed `attempt` (1-based).
    pub fn decide(&self, attempt: u32, error: &ItemError) -> RetryDecision {
        if !error.is_transient() || attempt >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.backoff_for(attempt))
        }
    }
}
