//! Governed tool invocation.
//!
//! Every call runs the same pipeline: resolve, RBAC, budget, cache, execute,
//! redact, normalize. Each exit path writes exactly one audit entry.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::mcp_client::context::{duration_millis, CallContext};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::registry::{ToolCall, ToolRegistry};
use crate::mcp_client::types::methods;
use crate::policy::audit::{AuditEntry, AuditStatus};
use crate::policy::enforcer::Enforcer;

use super::cache::{cache_key, CacheConfig, ResultCache};
use super::normalizer::{normalize, EvidenceEvent};
use super::redact::{NoopRedactor, Redactor};

/// One tool call on behalf of a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    pub role: String,
}

impl InvocationRequest {
    pub fn new(tool: &str, arguments: Value, role: &str) -> Self {
        Self {
            tool: tool.to_string(),
            arguments,
            role: role.to_string(),
        }
    }
}

/// Result of `Invoker::invoke_batch`.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Successful events, in request order.
    pub events: Vec<EvidenceEvent>,
    /// `PartialFailure` when at least one call failed.
    pub failure: Option<McpError>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct Invoker {
    registry: Arc<ToolRegistry>,
    enforcer: Arc<Enforcer>,
    cache: ResultCache,
    redactor: Arc<dyn Redactor>,
}

/// Audit bookkeeping for one invocation.
struct Trail<'a> {
    enforcer: &'a Enforcer,
    invocation_id: String,
    request: &'a InvocationRequest,
    server: Option<String>,
    started: Instant,
}

impl Trail<'_> {
    fn entry(&self, status: AuditStatus) -> AuditEntry {
        AuditEntry::new(
            &self.invocation_id,
            &self.request.tool,
            &self.request.role,
            &self.request.arguments,
            status,
        )
        .with_server(self.server.as_deref())
        .with_duration(self.started.elapsed())
    }

    /// Record a rejected or failed call and hand back its error.
    async fn fail(&self, status: AuditStatus, error: McpError) -> McpError {
        let entry = self.entry(status).with_error(&error);
        if let Err(audit_err) = self.enforcer.record_invocation(&entry).await {
            tracing::warn!(
                invocation = %self.invocation_id,
                error = %audit_err,
                "failed to audit rejected call"
            );
        }
        error
    }

    /// Record a successful call. A result is never released unaudited.
    async fn succeed(&self, status: AuditStatus) -> Result<(), McpError> {
        self.enforcer.record_invocation(&self.entry(status)).await
    }
}

impl Invoker {
    pub fn new(registry: Arc<ToolRegistry>, enforcer: Arc<Enforcer>, cache: &CacheConfig) -> Self {
        Self {
            registry,
            enforcer,
            cache: ResultCache::new(cache),
            redactor: Arc::new(NoopRedactor),
        }
    }

    pub fn with_redactor(mut self, redactor: Arc<dyn Redactor>) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.enforcer
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Run one request through the full pipeline.
    pub async fn invoke(
        &self,
        ctx: &CallContext,
        request: &InvocationRequest,
    ) -> Result<EvidenceEvent, McpError> {
        let mut trail = Trail {
            enforcer: &self.enforcer,
            invocation_id: Uuid::new_v4().to_string(),
            request,
            server: None,
            started: Instant::now(),
        };

        let Some(tool) = self.registry.get(&request.tool).await else {
            let err = McpError::ToolNotFound {
                name: request.tool.clone(),
            };
            return Err(trail.fail(AuditStatus::Error, err).await);
        };
        trail.server = tool.server_name.clone();

        if let Err(err) = self.enforcer.authorize_tool(&request.role, &request.tool) {
            tracing::info!(role = %request.role, tool = %request.tool, "permission denied");
            return Err(trail.fail(AuditStatus::PermissionDenied, err).await);
        }

        let permit = match self.enforcer.admit(&request.tool).await {
            Ok(permit) => permit,
            Err(err) => {
                tracing::info!(tool = %request.tool, error = %err, "call rejected by budget");
                return Err(trail.fail(AuditStatus::RateLimited, err).await);
            }
        };

        let key = cache_key(&request.tool, methods::TOOLS_CALL, &request.arguments);
        if let Some(hit) = self.cache.get(&key).await {
            tracing::debug!(tool = %request.tool, "cache hit");
            trail.succeed(AuditStatus::SuccessCached).await?;
            return Ok(hit);
        }

        let call = ToolCall::new(&request.tool, request.arguments.clone());
        let call_ctx = ctx.with_timeout(permit.timeout());
        let raw = match self.registry.execute(&call_ctx, &call).await {
            Ok(raw) => raw,
            Err(err @ McpError::ApprovalRequired { .. }) => {
                return Err(trail.fail(AuditStatus::ApprovalRequired, err).await);
            }
            Err(err) => {
                tracing::warn!(
                    tool = %request.tool,
                    invocation = %trail.invocation_id,
                    error = %err,
                    "tool call failed"
                );
                return Err(trail.fail(AuditStatus::Error, err).await);
            }
        };
        drop(permit);

        let raw = self.redact(&request.tool, raw).await;
        let event = normalize(&request.tool, trail.server.as_deref(), raw);
        self.cache.insert(key, event.clone()).await;
        trail.succeed(AuditStatus::Success).await?;

        tracing::debug!(
            tool = %request.tool,
            invocation = %trail.invocation_id,
            elapsed_ms = duration_millis(trail.started.elapsed()),
            "tool call complete"
        );
        Ok(event)
    }

    /// Run requests concurrently. Successes come back in request order; any
    /// failure is summarized as `PartialFailure`.
    pub async fn invoke_batch(&self, ctx: &CallContext, requests: &[InvocationRequest]) -> BatchOutcome {
        let results = join_all(requests.iter().map(|r| self.invoke(ctx, r))).await;
        let total = results.len();

        let mut events = Vec::with_capacity(total);
        let mut failed = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(event) => events.push(event),
                Err(err) => {
                    failed += 1;
                    first_error.get_or_insert_with(|| err.to_string());
                }
            }
        }

        let failure = first_error.map(|first_error| McpError::PartialFailure {
            failed,
            total,
            first_error,
        });
        BatchOutcome { events, failure }
    }

    /// Scrub the serialized result. Falls back to the raw result when the
    /// redactor fails.
    async fn redact(&self, tool: &str, raw: Value) -> Value {
        let text = raw.to_string();
        match self.redactor.redact(&text).await {
            Ok(clean) if clean == text => raw,
            Ok(clean) => serde_json::from_str(&clean).unwrap_or(Value::String(clean)),
            Err(err) => {
                tracing::warn!(tool, error = %err, "redaction failed, keeping unredacted result");
                raw
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::invoker::redact::RedactionError;
    use crate::mcp_client::config::{ManagerConfig, ServerConfig};
    use crate::mcp_client::manager::McpManager;
    use crate::mcp_client::safety::SafetyConfig;
    use crate::mcp_client::test_support::{MockFactory, MockServer};
    use crate::policy::audit::AuditLog;
    use crate::policy::budget::{BudgetConfig, RateLimit, ToolBudget};

    struct Harness {
        invoker: Invoker,
        server: Arc<MockServer>,
        _dir: tempfile::TempDir,
    }

    async fn harness(server: Arc<MockServer>, budgets: BudgetConfig) -> Harness {
        let config = ManagerConfig {
            servers: vec![ServerConfig::stdio("github", "unused", &[])],
            ..ManagerConfig::default()
        };
        let manager = Arc::new(
            McpManager::with_factory(config, Arc::new(MockFactory::default().with("github", server.clone())))
                .unwrap(),
        );
        assert!(manager.initialize(&CallContext::new()).await.is_empty());

        let registry = Arc::new(ToolRegistry::with_manager(manager, &SafetyConfig::default()));
        registry.sync_from_manager().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
        let mut roles = HashMap::new();
        roles.insert("dev".to_string(), vec!["tool:*".to_string()]);
        roles.insert("viewer".to_string(), vec!["tool:search".to_string()]);
        let enforcer = Arc::new(Enforcer::from_config(roles, budgets, audit).unwrap());

        Harness {
            invoker: Invoker::new(registry, enforcer, &CacheConfig::default()),
            server,
            _dir: dir,
        }
    }

    async fn statuses(invoker: &Invoker) -> Vec<AuditStatus> {
        invoker
            .enforcer()
            .audit_log()
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.status)
            .collect()
    }

    #[tokio::test]
    async fn test_successful_call_is_normalized_and_audited() {
        let h = harness(MockServer::shared(&["search"]), BudgetConfig::default()).await;
        let request = InvocationRequest::new("search", json!({"q": "rust"}), "dev");

        let event = h.invoker.invoke(&CallContext::new(), &request).await.unwrap();
        assert_eq!(event.content, "ok");
        assert_eq!(event.server.as_deref(), Some("github"));
        assert_eq!(event.raw["arguments"], json!({"q": "rust"}));

        let entries = h.invoker.enforcer().audit_log().entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AuditStatus::Success);
        assert_eq!(entries[0].server_name.as_deref(), Some("github"));
        assert_eq!(entries[0].role, "dev");
    }

    #[tokio::test]
    async fn test_permission_denied_never_reaches_server() {
        let h = harness(MockServer::shared(&["search", "list_issues"]), BudgetConfig::default()).await;
        let request = InvocationRequest::new("list_issues", json!({}), "viewer");

        let err = h.invoker.invoke(&CallContext::new(), &request).await.unwrap_err();
        assert!(matches!(err, McpError::PermissionDenied { .. }));
        assert_eq!(h.server.tool_calls(), 0);
        assert_eq!(statuses(&h.invoker).await, vec![AuditStatus::PermissionDenied]);
    }

    #[tokio::test]
    async fn test_second_identical_call_is_served_from_cache() {
        let h = harness(MockServer::shared(&["search"]), BudgetConfig::default()).await;
        let request = InvocationRequest::new("search", json!({"q": "rust"}), "dev");

        let first = h.invoker.invoke(&CallContext::new(), &request).await.unwrap();
        let second = h.invoker.invoke(&CallContext::new(), &request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.server.tool_calls(), 1);
        assert_eq!(
            statuses(&h.invoker).await,
            vec![AuditStatus::Success, AuditStatus::SuccessCached]
        );

        let other = InvocationRequest::new("search", json!({"q": "go"}), "dev");
        h.invoker.invoke(&CallContext::new(), &other).await.unwrap();
        assert_eq!(h.server.tool_calls(), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_call_is_audited() {
        let budgets = BudgetConfig {
            tools: vec![ToolBudget {
                tool_name: "search".into(),
                rate_limit: RateLimit {
                    requests_per_second: 0.001,
                    burst_size: 1,
                },
                ..ToolBudget::default()
            }],
            ..BudgetConfig::default()
        };
        let h = harness(MockServer::shared(&["search"]), budgets).await;

        let first = InvocationRequest::new("search", json!({"q": 1}), "dev");
        let second = InvocationRequest::new("search", json!({"q": 2}), "dev");
        h.invoker.invoke(&CallContext::new(), &first).await.unwrap();
        let err = h.invoker.invoke(&CallContext::new(), &second).await.unwrap_err();

        assert!(matches!(err, McpError::RateLimited { .. }));
        assert_eq!(h.server.tool_calls(), 1);
        assert_eq!(
            statuses(&h.invoker).await,
            vec![AuditStatus::Success, AuditStatus::RateLimited]
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_and_server_error_are_audited_as_error() {
        let server = MockServer::shared(&["search"]);
        server.push_outcome(Err(McpError::ServerError {
            code: -32000,
            message: "index offline".into(),
            data: None,
        }));
        let h = harness(server, BudgetConfig::default()).await;

        let missing = InvocationRequest::new("nope", json!({}), "dev");
        let err = h.invoker.invoke(&CallContext::new(), &missing).await.unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound { .. }));

        let failing = InvocationRequest::new("search", json!({}), "dev");
        let err = h.invoker.invoke(&CallContext::new(), &failing).await.unwrap_err();
        assert!(matches!(err, McpError::ServerError { .. }));

        let entries = h.invoker.enforcer().audit_log().entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.status == AuditStatus::Error));
        assert!(entries[1].error.as_deref().unwrap().contains("index offline"));
    }

    #[tokio::test]
    async fn test_risky_call_is_held_for_approval() {
        let h = harness(MockServer::shared(&["delete_branch"]), BudgetConfig::default()).await;
        let request = InvocationRequest::new("delete_branch", json!({"branch": "old"}), "dev");

        let err = h.invoker.invoke(&CallContext::new(), &request).await.unwrap_err();
        assert!(matches!(err, McpError::ApprovalRequired { .. }));
        assert_eq!(h.server.tool_calls(), 0);

        h.invoker
            .invoke(&CallContext::new().approve(), &request)
            .await
            .unwrap();
        assert_eq!(h.server.tool_calls(), 1);
        assert_eq!(
            statuses(&h.invoker).await,
            vec![AuditStatus::ApprovalRequired, AuditStatus::Success]
        );
    }

    struct Masking;

    #[async_trait]
    impl Redactor for Masking {
        async fn redact(&self, text: &str) -> Result<String, RedactionError> {
            Ok(text.replace("hunter2", "[REDACTED]"))
        }
    }

    struct Broken;

    #[async_trait]
    impl Redactor for Broken {
        async fn redact(&self, _text: &str) -> Result<String, RedactionError> {
            Err(RedactionError {
                reason: "model unavailable".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_redactor_scrubs_result() {
        let h = harness(MockServer::shared(&["search"]), BudgetConfig::default()).await;
        let invoker = h.invoker.with_redactor(Arc::new(Masking));
        let request = InvocationRequest::new("search", json!({"password": "hunter2"}), "dev");

        let event = invoker.invoke(&CallContext::new(), &request).await.unwrap();
        assert_eq!(event.raw["arguments"]["password"], "[REDACTED]");
    }

    #[tokio::test]
    async fn test_redaction_failure_keeps_result() {
        let h = harness(MockServer::shared(&["search"]), BudgetConfig::default()).await;
        let invoker = h.invoker.with_redactor(Arc::new(Broken));
        let request = InvocationRequest::new("search", json!({"q": "x"}), "dev");

        let event = invoker.invoke(&CallContext::new(), &request).await.unwrap();
        assert_eq!(event.content, "ok");
        assert_eq!(statuses(&invoker).await, vec![AuditStatus::Success]);
    }

    #[tokio::test]
    async fn test_batch_reports_partial_failure() {
        let h = harness(MockServer::shared(&["search"]), BudgetConfig::default()).await;
        let requests = vec![
            InvocationRequest::new("search", json!({"q": 1}), "dev"),
            InvocationRequest::new("missing", json!({}), "dev"),
            InvocationRequest::new("search", json!({"q": 2}), "dev"),
        ];

        let outcome = h.invoker.invoke_batch(&CallContext::new(), &requests).await;
        assert_eq!(outcome.events.len(), 2);
        assert!(!outcome.is_complete());
        match outcome.failure {
            Some(McpError::PartialFailure { failed, total, first_error }) => {
                assert_eq!((failed, total), (1, 3));
                assert!(first_error.contains("missing"));
            }
            other => panic!("expected PartialFailure, got {other:?}"),
        }
    }
}
