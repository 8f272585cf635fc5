//! Unified tool registry.
//!
//! Holds native (builtin), MCP-discovered and legacy tools side by side. All
//! copies of a name are kept; reads resolve one of them by source precedence:
//! MCP before builtin when `prefer_mcp` is set, builtin before MCP otherwise,
//! and legacy always last.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use super::config::read_config;
use super::context::{BackgroundTask, CallContext};
use super::errors::McpError;
use super::manager::McpManager;
use super::safety::{SafetyConfig, SafetyValidator, ToolCallAnalysis};
use super::types::McpToolDefinition;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Where a tool definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    Builtin,
    Mcp,
    Legacy,
}

impl std::fmt::Display for ToolSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolSource::Builtin => "builtin",
            ToolSource::Mcp => "mcp",
            ToolSource::Legacy => "legacy",
        };
        f.write_str(s)
    }
}

/// Coarse risk class of a tool, fixed at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyTier {
    #[default]
    Safe,
    Interactive,
    ModifiesResource,
}

/// A tool as the rest of the system sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameter_schema: Value,
    pub source: ToolSource,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub safety_tier: SafetyTier,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// One requested invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: &str, arguments: Value) -> Self {
        Self {
            name: name.to_string(),
            arguments,
        }
    }
}

#[derive(Debug, Default)]
struct Catalog {
    builtin: HashMap<String, Tool>,
    mcp: HashMap<String, Tool>,
    legacy: HashMap<String, Tool>,
}

impl Catalog {
    fn map_mut(&mut self, source: ToolSource) -> &mut HashMap<String, Tool> {
        match source {
            ToolSource::Builtin => &mut self.builtin,
            ToolSource::Mcp => &mut self.mcp,
            ToolSource::Legacy => &mut self.legacy,
        }
    }

    /// Maps in resolution order.
    fn ordered(&self, prefer_mcp: bool) -> [&HashMap<String, Tool>; 3] {
        if prefer_mcp {
            [&self.mcp, &self.builtin, &self.legacy]
        } else {
            [&self.builtin, &self.mcp, &self.legacy]
        }
    }
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Catalog of every known tool plus the dispatch path to execute them.
pub struct ToolRegistry {
    catalog: RwLock<Catalog>,
    prefer_mcp: bool,
    validator: SafetyValidator,
    manager: Option<Arc<McpManager>>,
}

impl ToolRegistry {
    pub fn new(prefer_mcp: bool, safety: &SafetyConfig) -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
            prefer_mcp,
            validator: SafetyValidator::new(safety),
            manager: None,
        }
    }

    /// Route MCP tools through `manager`. Precedence follows its config.
    pub fn with_manager(manager: Arc<McpManager>, safety: &SafetyConfig) -> Self {
        Self {
            prefer_mcp: manager.prefer_mcp(),
            manager: Some(manager),
            ..Self::new(true, safety)
        }
    }

    pub fn prefers_mcp(&self) -> bool {
        self.prefer_mcp
    }

    // ─── Registration ────────────────────────────────────────────────────

    /// Add or replace one tool under its source.
    pub async fn register(&self, tool: Tool) -> Result<(), McpError> {
        if tool.name.trim().is_empty() {
            return Err(McpError::InvalidConfig {
                reason: "tool name must not be empty".into(),
            });
        }
        if tool.source == ToolSource::Mcp && tool.server_name.is_none() {
            return Err(McpError::InvalidConfig {
                reason: format!("MCP tool '{}' has no server", tool.name),
            });
        }
        let mut catalog = self.catalog.write().await;
        catalog.map_mut(tool.source).insert(tool.name.clone(), tool);
        Ok(())
    }

    /// Register the tools one server discovered. Returns how many were added.
    pub async fn register_mcp_tools(&self, server: &str, tools: &[McpToolDefinition]) -> usize {
        let mut catalog = self.catalog.write().await;
        for def in tools {
            self.insert_mcp(&mut catalog, server, def);
        }
        tracing::debug!(server, count = tools.len(), "registered MCP tools");
        tools.len()
    }

    /// Drop every MCP tool owned by `server`.
    pub async fn unregister_server(&self, server: &str) -> usize {
        let mut catalog = self.catalog.write().await;
        let before = catalog.mcp.len();
        catalog
            .mcp
            .retain(|_, t| t.server_name.as_deref() != Some(server));
        before - catalog.mcp.len()
    }

    /// Replace the MCP tool set with what the manager currently knows.
    pub async fn sync_from_manager(&self) -> Result<usize, McpError> {
        let manager = self.manager.as_ref().ok_or(McpError::NotImplemented {
            what: "tool sync without an MCP manager".into(),
        })?;
        let discovered = manager.all_tools().await;

        let mut catalog = self.catalog.write().await;
        catalog.mcp.clear();
        for (server, defs) in &discovered {
            for def in defs {
                self.insert_mcp(&mut catalog, server, def);
            }
        }
        let count = catalog.mcp.len();
        tracing::info!(servers = discovered.len(), tools = count, "tool registry synced");
        Ok(count)
    }

    /// Swap the whole legacy set, as the catalog watcher does on reload.
    pub async fn replace_legacy(&self, tools: Vec<Tool>) {
        let mut catalog = self.catalog.write().await;
        catalog.legacy = tools
            .into_iter()
            .map(|mut t| {
                t.source = ToolSource::Legacy;
                (t.name.clone(), t)
            })
            .collect();
    }

    /// Insert one discovered tool. On a name clash across servers the latest
    /// server wins.
    fn insert_mcp(&self, catalog: &mut Catalog, server: &str, def: &McpToolDefinition) {
        let tool = self.mcp_tool(server, def);
        if let Some(previous) = catalog.mcp.insert(tool.name.clone(), tool) {
            if previous.server_name.as_deref() != Some(server) {
                tracing::warn!(
                    tool = %def.name,
                    server,
                    previous_server = ?previous.server_name,
                    "MCP tool name collision, latest server wins"
                );
            }
        }
    }

    fn mcp_tool(&self, server: &str, def: &McpToolDefinition) -> Tool {
        Tool {
            name: def.name.clone(),
            description: def.description.clone(),
            parameter_schema: def.input_schema.clone(),
            source: ToolSource::Mcp,
            server_name: Some(server.to_string()),
            safety_tier: self.tier_for(def),
            enabled: true,
        }
    }

    /// Tier from the server's annotations, else from the tool's name.
    fn tier_for(&self, def: &McpToolDefinition) -> SafetyTier {
        if let Some(ann) = &def.annotations {
            if ann.destructive_hint == Some(true) {
                return SafetyTier::ModifiesResource;
            }
            if ann.read_only_hint == Some(true) {
                return SafetyTier::Safe;
            }
        }
        let analysis = self.validator.analyze_call(&def.name, &Value::Null);
        if analysis.is_interactive {
            SafetyTier::Interactive
        } else if analysis.modifies_resource {
            SafetyTier::ModifiesResource
        } else {
            SafetyTier::Safe
        }
    }

    // ─── Lookup ──────────────────────────────────────────────────────────

    /// The copy of `name` that wins precedence.
    pub async fn get(&self, name: &str) -> Option<Tool> {
        let catalog = self.catalog.read().await;
        let found = catalog
            .ordered(self.prefer_mcp)
            .into_iter()
            .find_map(|m| m.get(name).cloned());
        found
    }

    /// Every stored copy of `name`, winner first.
    pub async fn copies(&self, name: &str) -> Vec<Tool> {
        let catalog = self.catalog.read().await;
        catalog
            .ordered(self.prefer_mcp)
            .into_iter()
            .filter_map(|m| m.get(name).cloned())
            .collect()
    }

    /// One resolved entry per name, sorted by name.
    pub async fn list(&self) -> Vec<Tool> {
        let catalog = self.catalog.read().await;
        let mut resolved: HashMap<&str, &Tool> = HashMap::new();
        for map in catalog.ordered(self.prefer_mcp) {
            for (name, tool) in map {
                resolved.entry(name.as_str()).or_insert(tool);
            }
        }
        let mut tools: Vec<Tool> = resolved.into_values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub async fn len(&self) -> usize {
        self.list().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        let catalog = self.catalog.read().await;
        catalog.builtin.is_empty() && catalog.mcp.is_empty() && catalog.legacy.is_empty()
    }

    /// Switch every copy of `name` on or off.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), McpError> {
        let mut catalog = self.catalog.write().await;
        let mut found = false;
        for source in [ToolSource::Builtin, ToolSource::Mcp, ToolSource::Legacy] {
            if let Some(tool) = catalog.map_mut(source).get_mut(name) {
                tool.enabled = enabled;
                found = true;
            }
        }
        if found {
            tracing::info!(tool = name, enabled, "tool toggled");
            Ok(())
        } else {
            Err(McpError::ToolNotFound {
                name: name.to_string(),
            })
        }
    }

    // ─── Execution ───────────────────────────────────────────────────────

    pub fn analyze(&self, call: &ToolCall) -> ToolCallAnalysis {
        self.validator.analyze_call(&call.name, &call.arguments)
    }

    /// Resolve, vet and dispatch a call.
    pub async fn execute(&self, ctx: &CallContext, call: &ToolCall) -> Result<Value, McpError> {
        let tool = self.get(&call.name).await.ok_or_else(|| McpError::ToolNotFound {
            name: call.name.clone(),
        })?;
        if !tool.enabled {
            return Err(McpError::ToolDisabled { name: tool.name });
        }

        let analysis = self.analyze(call);
        if analysis.requires_approval && !ctx.is_approved() {
            tracing::info!(
                tool = %tool.name,
                risk = %analysis.risk_level,
                rationale = %analysis.rationale,
                "tool call held for approval"
            );
            return Err(McpError::ApprovalRequired {
                tool: tool.name,
                risk_level: analysis.risk_level,
                rationale: analysis.rationale,
            });
        }

        match tool.source {
            ToolSource::Mcp => {
                let manager = self.manager.as_ref().ok_or_else(|| McpError::NotImplemented {
                    what: "MCP dispatch without a manager".into(),
                })?;
                let server = tool.server_name.as_deref().ok_or_else(|| McpError::InvalidConfig {
                    reason: format!("MCP tool '{}' has no server", tool.name),
                })?;
                manager
                    .execute_tool(ctx, server, &tool.name, call.arguments.clone())
                    .await
            }
            source => Err(McpError::NotImplemented {
                what: format!("{source} tool execution"),
            }),
        }
    }
}

// ─── Legacy Catalog ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LegacyCatalogFile {
    #[serde(default)]
    tools: Vec<LegacyToolEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyToolEntry {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "parameterSchema")]
    parameters: Value,
    #[serde(default)]
    safety_tier: SafetyTier,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

/// Read legacy tool definitions from a YAML or JSON file.
pub async fn load_legacy_catalog(path: &Path) -> Result<Vec<Tool>, McpError> {
    let file: LegacyCatalogFile = read_config(path).await?;
    Ok(file
        .tools
        .into_iter()
        .map(|e| Tool {
            name: e.name,
            description: e.description,
            parameter_schema: e.parameters,
            source: ToolSource::Legacy,
            server_name: None,
            safety_tier: e.safety_tier,
            enabled: e.enabled,
        })
        .collect())
}

/// Load `path` into the registry now and again whenever its modification
/// time changes.
pub fn watch_catalog(registry: Arc<ToolRegistry>, path: PathBuf, poll: Duration) -> BackgroundTask {
    BackgroundTask::spawn(move |cancel| async move {
        let mut last_seen: Option<SystemTime> = None;
        loop {
            let modified = tokio::fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .ok();
            if modified.is_some() && modified != last_seen {
                match load_legacy_catalog(&path).await {
                    Ok(tools) => {
                        tracing::info!(path = %path.display(), tools = tools.len(), "legacy catalog loaded");
                        registry.replace_legacy(tools).await;
                        last_seen = modified;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "legacy catalog reload failed");
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mcp_client::config::{ManagerConfig, ServerConfig};
    use crate::mcp_client::test_support::{tool_def, MockFactory, MockServer};
    use crate::mcp_client::types::ToolAnnotations;

    fn native(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: String::new(),
            parameter_schema: json!({}),
            source: ToolSource::Builtin,
            server_name: None,
            safety_tier: SafetyTier::Safe,
            enabled: true,
        }
    }

    async fn registry_with_manager(server: Arc<MockServer>) -> (ToolRegistry, Arc<McpManager>) {
        let config = ManagerConfig {
            servers: vec![ServerConfig::stdio("github", "unused", &[])],
            ..ManagerConfig::default()
        };
        let manager = Arc::new(
            McpManager::with_factory(config, Arc::new(MockFactory::default().with("github", server)))
                .unwrap(),
        );
        assert!(manager.initialize(&CallContext::new()).await.is_empty());
        let registry = ToolRegistry::with_manager(manager.clone(), &SafetyConfig::default());
        registry.sync_from_manager().await.unwrap();
        (registry, manager)
    }

    #[tokio::test]
    async fn test_precedence_follows_prefer_mcp() {
        for (prefer_mcp, expected) in [(true, ToolSource::Mcp), (false, ToolSource::Builtin)] {
            let registry = ToolRegistry::new(prefer_mcp, &SafetyConfig::default());
            registry.register(native("search")).await.unwrap();
            registry
                .register_mcp_tools("github", &[tool_def("search")])
                .await;
            registry
                .replace_legacy(vec![Tool {
                    source: ToolSource::Legacy,
                    ..native("search")
                }])
                .await;

            let listed = registry.list().await;
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].source, expected);
            assert_eq!(registry.copies("search").await.len(), 3);
            assert_eq!(
                registry.copies("search").await.last().unwrap().source,
                ToolSource::Legacy
            );
        }
    }

    #[tokio::test]
    async fn test_legacy_only_tool_resolves() {
        let registry = ToolRegistry::new(true, &SafetyConfig::default());
        registry
            .replace_legacy(vec![Tool {
                source: ToolSource::Builtin,
                ..native("old_tool")
            }])
            .await;
        let tool = registry.get("old_tool").await.unwrap();
        assert_eq!(tool.source, ToolSource::Legacy);
    }

    #[tokio::test]
    async fn test_unregister_server_and_validation() {
        let registry = ToolRegistry::new(true, &SafetyConfig::default());
        registry
            .register_mcp_tools("github", &[tool_def("a"), tool_def("b")])
            .await;
        registry.register_mcp_tools("jira", &[tool_def("c")]).await;
        assert_eq!(registry.unregister_server("github").await, 2);
        assert_eq!(registry.len().await, 1);

        let bad = Tool {
            source: ToolSource::Mcp,
            ..native("orphan")
        };
        assert!(registry.register(bad).await.is_err());
        assert!(registry.register(native(" ")).await.is_err());
    }

    #[tokio::test]
    async fn test_safety_tier_from_annotations_and_name() {
        let registry = ToolRegistry::new(true, &SafetyConfig::default());
        let mut annotated = tool_def("delete_branch");
        annotated.annotations = Some(ToolAnnotations {
            read_only_hint: Some(true),
            destructive_hint: None,
        });
        registry
            .register_mcp_tools("github", &[annotated, tool_def("delete_repo"), tool_def("get_issue")])
            .await;

        assert_eq!(registry.get("delete_branch").await.unwrap().safety_tier, SafetyTier::Safe);
        assert_eq!(
            registry.get("delete_repo").await.unwrap().safety_tier,
            SafetyTier::ModifiesResource
        );
        assert_eq!(registry.get("get_issue").await.unwrap().safety_tier, SafetyTier::Safe);
    }

    #[tokio::test]
    async fn test_execute_dispatches_to_manager() {
        let server = MockServer::shared(&["get_issue", "delete_repo"]);
        let (registry, manager) = registry_with_manager(server.clone()).await;

        let result = registry
            .execute(&CallContext::new(), &ToolCall::new("get_issue", json!({"id": 7})))
            .await
            .unwrap();
        assert_eq!(result["arguments"]["id"], 7);
        assert_eq!(server.tool_calls(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_risky_call_needs_approval() {
        let server = MockServer::shared(&["delete_repo"]);
        let (registry, _manager) = registry_with_manager(server.clone()).await;
        let call = ToolCall::new("delete_repo", json!({"repo": "x"}));

        let err = registry.execute(&CallContext::new(), &call).await.unwrap_err();
        match err {
            McpError::ApprovalRequired { risk_level, .. } => {
                assert_eq!(risk_level, crate::mcp_client::safety::RiskLevel::Medium)
            }
            other => panic!("expected ApprovalRequired, got {other:?}"),
        }
        assert_eq!(server.tool_calls(), 0);

        registry
            .execute(&CallContext::new().approve(), &call)
            .await
            .unwrap();
        assert_eq!(server.tool_calls(), 1);
    }

    #[tokio::test]
    async fn test_execute_errors() {
        let registry = ToolRegistry::new(true, &SafetyConfig::default());
        registry.register(native("echo")).await.unwrap();
        let ctx = CallContext::new();

        let err = registry
            .execute(&ctx, &ToolCall::new("missing", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound { .. }));

        let err = registry
            .execute(&ctx, &ToolCall::new("echo", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotImplemented { .. }));

        registry.set_enabled("echo", false).await.unwrap();
        let err = registry
            .execute(&ctx, &ToolCall::new("echo", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ToolDisabled { .. }));
        assert!(registry.set_enabled("missing", true).await.is_err());
    }

    #[tokio::test]
    async fn test_catalog_watcher_loads_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools.yaml");
        std::fs::write(&path, "tools:\n  - name: legacy_search\n").unwrap();

        let registry = Arc::new(ToolRegistry::new(true, &SafetyConfig::default()));
        let task = watch_catalog(registry.clone(), path.clone(), Duration::from_millis(20));

        let mut loaded = false;
        for _ in 0..100 {
            if registry.get("legacy_search").await.is_some() {
                loaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(loaded, "catalog never loaded");

        // Make sure the new mtime differs on coarse-grained filesystems.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, "tools:\n  - name: legacy_report\n    enabled: false\n").unwrap();

        let mut reloaded = false;
        for _ in 0..200 {
            if let Some(tool) = registry.get("legacy_report").await {
                assert!(!tool.enabled);
                reloaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reloaded, "catalog never reloaded");
        assert!(registry.get("legacy_search").await.is_none());
        task.stop().await;
    }

    #[tokio::test]
    async fn test_sync_collision_latest_server_wins() {
        let config = ManagerConfig {
            servers: vec![
                ServerConfig::stdio("github", "unused", &[]),
                ServerConfig::stdio("jira", "unused", &[]),
            ],
            ..ManagerConfig::default()
        };
        let factory = MockFactory::default()
            .with("github", MockServer::shared(&["search", "list_prs"]))
            .with("jira", MockServer::shared(&["search"]));
        let manager = Arc::new(McpManager::with_factory(config, Arc::new(factory)).unwrap());
        assert!(manager.initialize(&CallContext::new()).await.is_empty());

        let registry = ToolRegistry::with_manager(manager, &SafetyConfig::default());
        assert_eq!(registry.sync_from_manager().await.unwrap(), 2);

        let search = registry.get("search").await.unwrap();
        assert_eq!(search.server_name.as_deref(), Some("jira"));
        assert_eq!(registry.copies("search").await.len(), 1);
        assert_eq!(
            registry.get("list_prs").await.unwrap().server_name.as_deref(),
            Some("github")
        );
    }

    #[tokio::test]
    async fn test_load_legacy_catalog_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools.yaml");
        std::fs::write(
            &path,
            "tools:\n  - name: legacy_report\n    safetyTier: modifies_resource\n",
        )
        .unwrap();

        let tools = load_legacy_catalog(&path).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].source, ToolSource::Legacy);
        assert_eq!(tools[0].safety_tier, SafetyTier::ModifiesResource);

        let err = load_legacy_catalog(&dir.path().join("missing.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidConfig { .. }));
    }
}
