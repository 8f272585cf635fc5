//! Backoff delays between retry attempts.
//!
//! Attempts are numbered from 0. Every policy is capped at the configured
//! maximum delay.

use std::time::Duration;

use super::config::{BackoffPolicy, RetryConfig};

impl BackoffPolicy {
    /// Delay before the retry that follows `attempt`.
    pub fn delay(&self, attempt: u32, base: Duration, max: Duration) -> Duration {
        let delay = match self {
            BackoffPolicy::Exponential => 2u32
                .checked_pow(attempt)
                .and_then(|factor| base.checked_mul(factor))
                .unwrap_or(max),
            BackoffPolicy::Linear => attempt
                .checked_add(1)
                .and_then(|factor| base.checked_mul(factor))
                .unwrap_or(max),
            BackoffPolicy::Constant => base,
        };
        delay.min(max)
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay after the failed attempt numbered `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff
            .delay(attempt, self.initial_delay(), self.max_delay())
    }
}
