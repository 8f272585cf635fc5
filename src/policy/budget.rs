//! Per-tool resource budgets.
//!
//! Each tool gets a token bucket, a concurrency limiter and an optional daily
//! quota. Limiters are created on first use and live for the process. None of
//! them ever waits: an exhausted budget is an immediate `RateLimited`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Instant;

use crate::mcp_client::errors::McpError;

// ─── Config ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub requests_per_second: f64,
    pub burst_size: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_size: 20,
        }
    }
}

/// Limits applied to one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolBudget {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub daily_quota: Option<u64>,
}

fn default_concurrency_limit() -> usize {
    5
}
fn default_timeout_seconds() -> u64 {
    30
}

impl Default for ToolBudget {
    fn default() -> Self {
        Self {
            tool_name: String::new(),
            rate_limit: RateLimit::default(),
            concurrency_limit: default_concurrency_limit(),
            timeout_seconds: default_timeout_seconds(),
            daily_quota: None,
        }
    }
}

impl ToolBudget {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), McpError> {
        let invalid = |reason: String| McpError::InvalidConfig { reason };
        let label = if self.tool_name.is_empty() {
            "default budget"
        } else {
            self.tool_name.as_str()
        };
        if !(self.rate_limit.requests_per_second > 0.0) {
            return Err(invalid(format!("{label}: requestsPerSecond must be positive")));
        }
        if self.rate_limit.burst_size == 0 {
            return Err(invalid(format!("{label}: burstSize must be at least 1")));
        }
        if self.concurrency_limit == 0 {
            return Err(invalid(format!("{label}: concurrencyLimit must be at least 1")));
        }
        if self.timeout_seconds == 0 {
            return Err(invalid(format!("{label}: timeoutSeconds must be at least 1")));
        }
        Ok(())
    }
}

/// `budgets:` config section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetConfig {
    /// Applied to tools without their own entry.
    #[serde(default)]
    pub default: ToolBudget,
    #[serde(default)]
    pub tools: Vec<ToolBudget>,
}

// ─── Token Bucket ───────────────────────────────────────────────────────────

/// Continuous-refill token bucket. One token per call, capped at the burst.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(rate: &RateLimit, now: Instant) -> Self {
        let capacity = f64::from(rate.burst_size.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: rate.requests_per_second,
            last_refill: now,
        }
    }

    /// Take one token at time `now`, if one is available.
    pub fn try_take_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn try_take(&mut self) -> bool {
        self.try_take_at(Instant::now())
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }
}

// ─── Daily Quota ────────────────────────────────────────────────────────────

/// Calls per UTC day.
#[derive(Debug)]
pub struct DailyQuota {
    limit: u64,
    used: u64,
    day: NaiveDate,
}

impl DailyQuota {
    pub fn new(limit: u64, today: NaiveDate) -> Self {
        Self {
            limit,
            used: 0,
            day: today,
        }
    }

    /// Count one call on `today`; the counter resets when the day changes.
    pub fn try_consume_on(&mut self, today: NaiveDate) -> bool {
        if today != self.day {
            self.day = today;
            self.used = 0;
        }
        if self.used < self.limit {
            self.used += 1;
            true
        } else {
            false
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }
}

// ─── BudgetManager ──────────────────────────────────────────────────────────

struct ToolLimiter {
    bucket: Mutex<TokenBucket>,
    slots: Arc<Semaphore>,
    quota: Option<Mutex<DailyQuota>>,
    budget: ToolBudget,
}

impl ToolLimiter {
    fn new(budget: &ToolBudget) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(&budget.rate_limit, Instant::now())),
            slots: Arc::new(Semaphore::new(budget.concurrency_limit.max(1))),
            quota: budget
                .daily_quota
                .map(|limit| Mutex::new(DailyQuota::new(limit, Utc::now().date_naive()))),
            budget: budget.clone(),
        }
    }
}

/// Admission ticket for one call. Dropping it frees the concurrency slot.
#[derive(Debug)]
pub struct BudgetPermit {
    _slot: OwnedSemaphorePermit,
    timeout: Duration,
}

impl BudgetPermit {
    /// Time the call may run.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Lazily created limiters, one set per tool name.
pub struct BudgetManager {
    config: BudgetConfig,
    limiters: RwLock<HashMap<String, Arc<ToolLimiter>>>,
}

impl BudgetManager {
    pub fn new(config: BudgetConfig) -> Result<Self, McpError> {
        config.default.validate()?;
        for budget in &config.tools {
            budget.validate()?;
        }
        Ok(Self {
            config,
            limiters: RwLock::new(HashMap::new()),
        })
    }

    /// The configured budget for `tool`, or the default one.
    pub fn budget_for(&self, tool: &str) -> ToolBudget {
        self.config
            .tools
            .iter()
            .find(|b| b.tool_name == tool)
            .cloned()
            .unwrap_or_else(|| ToolBudget {
                tool_name: tool.to_string(),
                ..self.config.default.clone()
            })
    }

    /// Admit one call of `tool` under its configured budget.
    pub async fn acquire(&self, tool: &str) -> Result<BudgetPermit, McpError> {
        let budget = self.budget_for(tool);
        self.apply_budget(tool, &budget).await
    }

    /// Admit one call of `tool`. `budget` only takes effect the first time a
    /// tool is seen; afterwards its limiter is reused.
    pub async fn apply_budget(
        &self,
        tool: &str,
        budget: &ToolBudget,
    ) -> Result<BudgetPermit, McpError> {
        let limiter = self.limiter(tool, budget).await;
        let rejected = |reason: &str| McpError::RateLimited {
            tool: tool.to_string(),
            reason: reason.to_string(),
        };

        let slot = limiter
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| rejected("concurrency limit reached"))?;

        if !limiter.bucket.lock().await.try_take() {
            return Err(rejected("rate limit exceeded"));
        }

        if let Some(quota) = &limiter.quota {
            if !quota.lock().await.try_consume_on(Utc::now().date_naive()) {
                return Err(rejected("daily quota exhausted"));
            }
        }

        Ok(BudgetPermit {
            _slot: slot,
            timeout: limiter.budget.timeout(),
        })
    }

    async fn limiter(&self, tool: &str, budget: &ToolBudget) -> Arc<ToolLimiter> {
        if let Some(existing) = self.limiters.read().await.get(tool) {
            return existing.clone();
        }
        let mut limiters = self.limiters.write().await;
        limiters
            .entry(tool.to_string())
            .or_insert_with(|| {
                tracing::debug!(tool, "creating budget limiter");
                Arc::new(ToolLimiter::new(budget))
            })
            .clone()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(rps: f64, burst: u32, concurrency: usize) -> ToolBudget {
        ToolBudget {
            tool_name: "search".into(),
            rate_limit: RateLimit {
                requests_per_second: rps,
                burst_size: burst,
            },
            concurrency_limit: concurrency,
            timeout_seconds: 5,
            daily_quota: None,
        }
    }

    #[test]
    fn test_bucket_admits_burst_then_refills() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(
            &RateLimit {
                requests_per_second: 2.0,
                burst_size: 3,
            },
            start,
        );
        for _ in 0..3 {
            assert!(bucket.try_take_at(start));
        }
        assert!(!bucket.try_take_at(start));

        // Half a second at 2/s refills exactly one token.
        let later = start + Duration::from_millis(500);
        assert!(bucket.try_take_at(later));
        assert!(!bucket.try_take_at(later));

        // A long idle period never overfills.
        let much_later = later + Duration::from_secs(60);
        for _ in 0..3 {
            assert!(bucket.try_take_at(much_later));
        }
        assert!(!bucket.try_take_at(much_later));
    }

    #[test]
    fn test_bucket_sustained_rate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(
            &RateLimit {
                requests_per_second: 10.0,
                burst_size: 1,
            },
            start,
        );
        let mut admitted = 0;
        // 10 seconds of attempts every 10ms.
        for tick in 0..1000u64 {
            if bucket.try_take_at(start + Duration::from_millis(tick * 10)) {
                admitted += 1;
            }
        }
        // 1 burst token plus ~10/s, minus float drift in the refill sum.
        assert!((85..=101).contains(&admitted), "admitted {admitted}");
    }

    #[test]
    fn test_daily_quota_resets_on_new_day() {
        let day1 = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let day2 = day1.succ_opt().unwrap();
        let mut quota = DailyQuota::new(2, day1);
        assert!(quota.try_consume_on(day1));
        assert!(quota.try_consume_on(day1));
        assert!(!quota.try_consume_on(day1));
        assert!(quota.try_consume_on(day2));
        assert_eq!(quota.used(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_limit_rejects_instead_of_queueing() {
        let manager = BudgetManager::new(BudgetConfig::default()).unwrap();
        let b = budget(1000.0, 1000, 2);

        let first = manager.apply_budget("search", &b).await.unwrap();
        let _second = manager.apply_budget("search", &b).await.unwrap();
        let err = manager.apply_budget("search", &b).await.unwrap_err();
        assert!(matches!(err, McpError::RateLimited { .. }));

        drop(first);
        assert!(manager.apply_budget("search", &b).await.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_rejection() {
        let manager = BudgetManager::new(BudgetConfig::default()).unwrap();
        let b = budget(0.001, 2, 10);
        assert!(manager.apply_budget("search", &b).await.is_ok());
        assert!(manager.apply_budget("search", &b).await.is_ok());
        match manager.apply_budget("search", &b).await.unwrap_err() {
            McpError::RateLimited { reason, .. } => assert!(reason.contains("rate")),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_daily_quota_through_manager() {
        let config = BudgetConfig {
            default: ToolBudget::default(),
            tools: vec![ToolBudget {
                daily_quota: Some(1),
                ..budget(1000.0, 1000, 10)
            }],
        };
        let manager = BudgetManager::new(config).unwrap();
        assert!(manager.acquire("search").await.is_ok());
        let err = manager.acquire("search").await.unwrap_err();
        assert!(err.to_string().contains("daily quota"));
        // Other tools fall back to the default budget.
        assert!(manager.acquire("other").await.is_ok());
    }

    #[test]
    fn test_budget_lookup_and_validation() {
        let config = BudgetConfig {
            default: ToolBudget::default(),
            tools: vec![budget(1.0, 1, 1)],
        };
        let manager = BudgetManager::new(config).unwrap();
        assert_eq!(manager.budget_for("search").timeout(), Duration::from_secs(5));
        assert_eq!(manager.budget_for("other").tool_name, "other");
        assert_eq!(manager.budget_for("other").timeout(), Duration::from_secs(30));

        let bad = BudgetConfig {
            default: budget(0.0, 1, 1),
            tools: vec![],
        };
        assert!(BudgetManager::new(bad).is_err());
    }
}
