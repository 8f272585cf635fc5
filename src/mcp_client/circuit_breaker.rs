//! Per-tool circuit breaker.
//!
//! Two states only. A breaker opens after `threshold` consecutive failures
//! and stays open until something external (a successful health ping or a
//! reconnect) resets it.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Consecutive failures that open a breaker.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreaker {
    state: CircuitState,
    failures: u32,
    successes: u64,
    last_fail_time: Option<DateTime<Utc>>,
    threshold: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_fail_time: None,
            threshold: threshold.max(1),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn last_fail_time(&self) -> Option<DateTime<Utc>> {
        self.last_fail_time
    }

    /// Whether a call may go through.
    pub fn allows(&self) -> bool {
        self.state == CircuitState::Closed
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.successes += 1;
    }

    /// Count a failure. Returns true when this failure opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.last_fail_time = Some(Utc::now());
        if self.state == CircuitState::Closed && self.failures >= self.threshold {
            self.state = CircuitState::Open;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..4 {
            assert!(!breaker.record_failure());
            assert!(breaker.allows());
        }
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allows());
        assert!(breaker.last_fail_time().is_some());
        // Further failures do not re-report the transition.
        assert!(!breaker.record_failure());
    }

    #[test]
    fn test_success_clears_failure_streak() {
        let mut breaker = CircuitBreaker::new(2);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.allows());
        assert_eq!(breaker.successes(), 1);
    }

    #[test]
    fn test_reset_closes() {
        let mut breaker = CircuitBreaker::new(1);
        breaker.record_failure();
        assert!(!breaker.allows());
        breaker.reset();
        assert!(breaker.allows());
        assert_eq!(breaker.failures(), 0);
    }
}
