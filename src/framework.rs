//! Top-level wiring: one config file in, a running invoker out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::invoker::{CacheConfig, EvidenceEvent, InvocationRequest, Invoker, Redactor};
use crate::mcp_client::config::{read_config, ManagerConfig};
use crate::mcp_client::context::{BackgroundTask, CallContext};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::manager::McpManager;
use crate::mcp_client::registry::{load_legacy_catalog, watch_catalog, ToolRegistry};
use crate::mcp_client::safety::SafetyConfig;
use crate::mcp_client::transport::{DefaultTransportFactory, TransportFactory};
use crate::policy::audit::{AuditConfig, AuditLog};
use crate::policy::budget::BudgetConfig;
use crate::policy::enforcer::Enforcer;

/// Whole-file configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameworkConfig {
    #[serde(default)]
    pub mcp: ManagerConfig,
    /// Role name to capability patterns.
    #[serde(default)]
    pub roles: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub budgets: BudgetConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub legacy_catalog: Option<LegacyCatalogConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCatalogConfig {
    pub path: PathBuf,
    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: u64,
}

fn default_poll_seconds() -> u64 {
    5
}

/// Manager, registry, enforcer and invoker built from one config.
pub struct Framework {
    config: FrameworkConfig,
    manager: Arc<McpManager>,
    registry: Arc<ToolRegistry>,
    audit: Arc<AuditLog>,
    invoker: Invoker,
    tasks: Mutex<Vec<BackgroundTask>>,
    started: AtomicBool,
}

impl Framework {
    /// Read and build from a YAML or JSON file.
    pub async fn load(path: &Path) -> Result<Self, McpError> {
        let config: FrameworkConfig = read_config(path).await?;
        Self::from_config(config).await
    }

    pub async fn from_config(config: FrameworkConfig) -> Result<Self, McpError> {
        Self::with_factory(config, Arc::new(DefaultTransportFactory)).await
    }

    /// Build everything without connecting. Invalid config fails here.
    pub async fn with_factory(
        config: FrameworkConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, McpError> {
        let manager = Arc::new(McpManager::with_factory(config.mcp.clone(), factory)?);
        let registry = Arc::new(ToolRegistry::with_manager(manager.clone(), &config.safety));

        let audit_path = config
            .audit
            .path
            .clone()
            .unwrap_or_else(|| crate::data_dir().join("audit.jsonl"));
        let audit = Arc::new(AuditLog::open(audit_path).await?);
        let enforcer = Arc::new(Enforcer::from_config(
            config.roles.clone(),
            config.budgets.clone(),
            audit.clone(),
        )?);
        let invoker = Invoker::new(registry.clone(), enforcer, &config.cache);

        Ok(Self {
            config,
            manager,
            registry,
            audit,
            invoker,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Swap the pass-through redactor for a real one. Call before `start`.
    pub fn with_redactor(mut self, redactor: Arc<dyn Redactor>) -> Self {
        self.invoker = self.invoker.with_redactor(redactor);
        self
    }

    /// Connect servers, fill the registry and start the background loops.
    /// Returns the servers that failed to connect; the rest keep working.
    pub async fn start(&self, ctx: &CallContext) -> Result<Vec<(String, McpError)>, McpError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(Vec::new());
        }

        let failures = self.manager.initialize(ctx).await;
        for (server, err) in &failures {
            tracing::warn!(server = %server, error = %err, "MCP server failed to start (non-fatal)");
        }
        let tools = self.registry.sync_from_manager().await?;

        let mut tasks = self.tasks.lock().await;
        if let Some(catalog) = &self.config.legacy_catalog {
            match load_legacy_catalog(&catalog.path).await {
                Ok(legacy) => self.registry.replace_legacy(legacy).await,
                Err(e) => {
                    tracing::warn!(path = %catalog.path.display(), error = %e, "legacy catalog not loaded")
                }
            }
            tasks.push(watch_catalog(
                self.registry.clone(),
                catalog.path.clone(),
                Duration::from_secs(catalog.poll_seconds.max(1)),
            ));
        }

        if let Err(e) = self.audit.rotate().await {
            tracing::warn!(error = %e, "initial audit rotation failed");
        }
        tasks.push(
            self.audit
                .spawn_rotation(Duration::from_secs(self.config.audit.rotation_interval_secs.max(1))),
        );

        self.manager.start_health_checks().await;

        tracing::info!(
            servers = self.manager.server_names().await.len(),
            failed = failures.len(),
            mcp_tools = tools,
            "framework started"
        );
        Ok(failures)
    }

    /// Run one governed tool call.
    pub async fn invoke(
        &self,
        ctx: &CallContext,
        request: &InvocationRequest,
    ) -> Result<EvidenceEvent, McpError> {
        self.invoker.invoke(ctx, request).await
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<McpManager> {
        &self.manager
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    /// Stop background loops and close every server. Idempotent.
    pub async fn shutdown(&self) {
        let tasks: Vec<BackgroundTask> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.stop().await;
        }
        self.manager.shutdown().await;
    }
}
