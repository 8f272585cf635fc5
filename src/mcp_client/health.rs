//! Per-server call statistics and the health state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::errors::McpError;

/// Error rate at or above which a server is down.
pub const DOWN_ERROR_RATE: f64 = 0.50;
/// Error rate above which a server is degraded.
pub const DEGRADED_ERROR_RATE: f64 = 0.10;
/// More consecutive failures than this marks a server down.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Health of a managed server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Down,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        };
        f.write_str(s)
    }
}

/// Status as a pure function of the two health signals.
pub fn derive_health(error_rate: f64, consecutive_failures: u32) -> HealthStatus {
    if error_rate >= DOWN_ERROR_RATE || consecutive_failures > MAX_CONSECUTIVE_FAILURES {
        HealthStatus::Down
    } else if error_rate > DEGRADED_ERROR_RATE {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Counters for one server, fed by tool calls and health pings.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub total_calls: u64,
    pub success_calls: u64,
    pub failed_calls: u64,
    pub consecutive_failures: u32,
    /// Running mean over successful calls only.
    pub avg_latency_ms: f64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl ServerStats {
    pub fn record_success(&mut self, latency: Duration) {
        self.total_calls += 1;
        self.success_calls += 1;
        self.consecutive_failures = 0;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.success_calls as f64;
        self.last_success = Some(Utc::now());
    }

    pub fn record_failure(&mut self, error: &McpError) {
        self.total_calls += 1;
        self.failed_calls += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.last_failure = Some(Utc::now());
    }

    /// failed / total, 0 before the first call.
    pub fn error_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failed_calls as f64 / self.total_calls as f64
        }
    }

    pub fn health(&self) -> HealthStatus {
        derive_health(self.error_rate(), self.consecutive_failures)
    }
}
