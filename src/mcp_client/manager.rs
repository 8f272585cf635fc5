//! Multi-server manager.
//!
//! Owns every configured server: connects them at startup, keeps per-server
//! stats and health, runs the periodic health loop, and executes tool calls
//! with retry, backoff and per-tool circuit breakers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, Semaphore};

use super::circuit_breaker::CircuitBreaker;
use super::client::McpClient;
use super::config::{ManagerConfig, ServerConfig};
use super::context::{BackgroundTask, CallContext};
use super::errors::McpError;
use super::health::{HealthStatus, ServerStats, MAX_CONSECUTIVE_FAILURES};
use super::transport::{DefaultTransportFactory, TransportFactory};
use super::types::McpToolDefinition;

// ─── Managed Server ──────────────────────────────────────────────────────────

/// Mutable per-server state, guarded by the server's own lock.
#[derive(Default)]
struct ServerState {
    client: Option<Arc<McpClient>>,
    status: HealthStatus,
    last_health_check: Option<DateTime<Utc>>,
    tools: Vec<McpToolDefinition>,
    stats: ServerStats,
    init_error: Option<String>,
    breakers: HashMap<String, CircuitBreaker>,
}

impl ServerState {
    fn set_status(&mut self, server: &str, status: HealthStatus) {
        if self.status != status {
            tracing::info!(server, from = %self.status, to = %status, "server status changed");
            self.status = status;
        }
    }
}

struct ManagedServer {
    name: String,
    config: ServerConfig,
    state: Mutex<ServerState>,
}

/// Point-in-time view of one server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub tool_count: usize,
    pub stats: ServerStats,
    pub init_error: Option<String>,
}

// ─── McpManager ──────────────────────────────────────────────────────────────

/// Supervisor for all configured MCP servers.
pub struct McpManager {
    config: ManagerConfig,
    factory: Arc<dyn TransportFactory>,
    servers: RwLock<HashMap<String, Arc<ManagedServer>>>,
    call_slots: Arc<Semaphore>,
    health_task: Mutex<Option<BackgroundTask>>,
    shut_down: AtomicBool,
}

impl McpManager {
    /// Manager with the stdio/HTTP transport factory.
    pub fn new(config: ManagerConfig) -> Result<Self, McpError> {
        Self::with_factory(config, Arc::new(DefaultTransportFactory))
    }

    pub fn with_factory(
        config: ManagerConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, McpError> {
        config.validate()?;

        let servers = config
            .servers
            .iter()
            .filter(|s| s.enabled)
            .map(|s| {
                let server = ManagedServer {
                    name: s.name.clone(),
                    config: s.clone(),
                    state: Mutex::new(ServerState::default()),
                };
                (s.name.clone(), Arc::new(server))
            })
            .collect();

        Ok(Self {
            call_slots: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            factory,
            servers: RwLock::new(servers),
            health_task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn prefer_mcp(&self) -> bool {
        self.config.prefer_mcp
    }

    // ─── Startup ─────────────────────────────────────────────────────────

    /// Connect every enabled server concurrently.
    ///
    /// Returns the servers that failed; they are recorded `down` and the rest
    /// of the fleet is unaffected.
    pub async fn initialize(&self, ctx: &CallContext) -> Vec<(String, McpError)> {
        if !self.config.enabled {
            tracing::info!("MCP manager disabled, skipping server startup");
            return Vec::new();
        }

        let servers: Vec<Arc<ManagedServer>> = self.servers.read().await.values().cloned().collect();
        let handles: Vec<_> = servers
            .into_iter()
            .map(|server| {
                let factory = self.factory.clone();
                let ctx = ctx.clone();
                let name = server.name.clone();
                let handle =
                    tokio::spawn(async move { connect_server(&server, factory.as_ref(), &ctx).await });
                (name, handle)
            })
            .collect();

        let mut errors = Vec::new();
        let results = futures::future::join_all(handles.into_iter().map(|(name, handle)| async move {
            (name, handle.await)
        }))
        .await;

        for (name, joined) in results {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push((name, e)),
                Err(join_err) => {
                    let err = McpError::TransportFailed {
                        server: name.clone(),
                        reason: format!("startup task failed: {join_err}"),
                    };
                    if let Some(server) = self.servers.read().await.get(&name) {
                        let mut state = server.state.lock().await;
                        state.init_error = Some(err.to_string());
                        state.set_status(&name, HealthStatus::Down);
                    }
                    errors.push((name, err));
                }
            }
        }

        let total = self.servers.read().await.len();
        tracing::info!(
            started = total - errors.len(),
            failed = errors.len(),
            "MCP servers initialized"
        );
        errors
    }

    /// Close a server's client and run its handshake again.
    pub async fn reconnect_server(&self, ctx: &CallContext, name: &str) -> Result<(), McpError> {
        let server = self.server(name).await?;
        let old = server.state.lock().await.client.take();
        if let Some(client) = old {
            if let Err(e) = client.close().await {
                tracing::debug!(server = name, error = %e, "close before reconnect");
            }
        }
        connect_server(&server, self.factory.as_ref(), ctx).await
    }

    // ─── Health ──────────────────────────────────────────────────────────

    /// Start the periodic health loop. A second call is a no-op.
    pub async fn start_health_checks(self: &Arc<Self>) {
        let mut slot = self.health_task.lock().await;
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let interval = self.config.health_check_interval();
        let manager = Arc::downgrade(self);
        *slot = Some(BackgroundTask::spawn(move |cancel| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager
                            .check_all_health(&CallContext::with_token(cancel.child_token()))
                            .await;
                    }
                }
            }
            tracing::debug!("health check loop stopped");
        }));
        tracing::info!(interval_secs = interval.as_secs(), "health checks started");
    }

    /// Ping every connected server once and re-derive its status.
    pub async fn check_all_health(&self, ctx: &CallContext) {
        let servers: Vec<Arc<ManagedServer>> = self.servers.read().await.values().cloned().collect();
        futures::future::join_all(servers.iter().map(|s| check_server_health(s, ctx))).await;
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Call `tool` on `server_name`, retrying transient failures.
    pub async fn execute_tool(
        &self,
        ctx: &CallContext,
        server_name: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        let server = self.server(server_name).await?;
        let client = {
            let state = server.state.lock().await;
            if state.status == HealthStatus::Down {
                return Err(McpError::ServerDown {
                    name: server_name.to_string(),
                });
            }
            if state.breakers.get(tool).is_some_and(|b| !b.allows()) {
                return Err(McpError::CircuitOpen {
                    server: server_name.to_string(),
                    tool: tool.to_string(),
                });
            }
            state.client.clone().ok_or_else(|| McpError::ServerDown {
                name: server_name.to_string(),
            })?
        };

        let slots = self.call_slots.clone();
        let _slot = ctx
            .run("maxConcurrent", async move {
                slots.acquire_owned().await.map_err(|_| McpError::Cancelled)
            })
            .await?;

        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            let call_ctx = ctx.with_timeout(server.config.call_timeout());
            let started = Instant::now();
            let outcome = client.call_tool(&call_ctx, tool, arguments.clone()).await;

            let err = match outcome {
                Ok(result) => {
                    let mut state = server.state.lock().await;
                    state.stats.record_success(started.elapsed());
                    state.breakers.entry(tool.to_string()).or_default().record_success();
                    return Ok(result);
                }
                Err(e) => e,
            };

            if err.is_caller_error() {
                return Err(err);
            }

            {
                let mut state = server.state.lock().await;
                state.stats.record_failure(&err);
                let opened = state
                    .breakers
                    .entry(tool.to_string())
                    .or_default()
                    .record_failure();
                if opened {
                    tracing::warn!(server = server_name, tool, "circuit breaker opened");
                }
                if !err.is_retryable() {
                    tracing::warn!(server = server_name, tool, error = %err, "permanent tool failure");
                    state.set_status(server_name, HealthStatus::Down);
                    return Err(err);
                }
            }

            tracing::debug!(
                server = server_name,
                tool,
                attempt = attempt + 1,
                max_attempts,
                error = %err,
                "retryable tool failure"
            );
            last_error = Some(err);

            if attempt + 1 < max_attempts {
                ctx.sleep(retry.delay_for(attempt)).await?;
            }
        }

        server
            .state
            .lock()
            .await
            .set_status(server_name, HealthStatus::Degraded);
        Err(last_error.unwrap_or_else(|| McpError::TransportFailed {
            server: server_name.to_string(),
            reason: "no attempts made".into(),
        }))
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub async fn health_snapshot(&self) -> Vec<ServerHealth> {
        let servers: Vec<Arc<ManagedServer>> = self.servers.read().await.values().cloned().collect();
        let mut snapshot = Vec::with_capacity(servers.len());
        for server in servers {
            let state = server.state.lock().await;
            snapshot.push(ServerHealth {
                name: server.name.clone(),
                status: state.status,
                last_health_check: state.last_health_check,
                tool_count: state.tools.len(),
                stats: state.stats.clone(),
                init_error: state.init_error.clone(),
            });
        }
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    pub async fn server_status(&self, name: &str) -> Option<HealthStatus> {
        let server = self.servers.read().await.get(name).cloned()?;
        let status = server.state.lock().await.status;
        Some(status)
    }

    pub async fn server_stats(&self, name: &str) -> Option<ServerStats> {
        let server = self.servers.read().await.get(name).cloned()?;
        let stats = server.state.lock().await.stats.clone();
        Some(stats)
    }

    /// Tools discovered on every server, keyed by server name.
    pub async fn all_tools(&self) -> BTreeMap<String, Vec<McpToolDefinition>> {
        let servers: Vec<Arc<ManagedServer>> = self.servers.read().await.values().cloned().collect();
        let mut tools = BTreeMap::new();
        for server in servers {
            let state = server.state.lock().await;
            if !state.tools.is_empty() {
                tools.insert(server.name.clone(), state.tools.clone());
            }
        }
        tools
    }

    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop the health loop and close every client. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.health_task.lock().await.take() {
            task.stop().await;
        }

        let servers: Vec<Arc<ManagedServer>> = self.servers.read().await.values().cloned().collect();
        for server in servers {
            let client = server.state.lock().await.client.take();
            if let Some(client) = client {
                if let Err(e) = client.close().await {
                    tracing::warn!(server = %server.name, error = %e, "error closing MCP server");
                }
            }
        }
        tracing::info!("MCP manager shut down");
    }

    async fn server(&self, name: &str) -> Result<Arc<ManagedServer>, McpError> {
        self.servers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer {
                name: name.to_string(),
            })
    }
}

// ─── Per-server Operations ───────────────────────────────────────────────────

/// Build a transport, run the handshake and record the outcome.
async fn connect_server(
    server: &ManagedServer,
    factory: &dyn TransportFactory,
    ctx: &CallContext,
) -> Result<(), McpError> {
    let name = server.name.as_str();
    let outcome = async {
        let transport = factory.create(&server.config)?;
        let client = Arc::new(McpClient::new(name, transport));
        client
            .connect(&ctx.with_timeout(server.config.call_timeout()), &server.config)
            .await?;
        Ok::<_, McpError>(client)
    }
    .await;

    let mut state = server.state.lock().await;
    state.last_health_check = Some(Utc::now());
    match outcome {
        Ok(client) => {
            let tools = client.tools().await;
            state.breakers = tools
                .iter()
                .map(|t| (t.name.clone(), CircuitBreaker::default()))
                .collect();
            state.tools = tools;
            state.client = Some(client);
            state.init_error = None;
            state.set_status(name, HealthStatus::Healthy);
            Ok(())
        }
        Err(e) => {
            tracing::warn!(server = name, error = %e, "failed to start MCP server");
            state.client = None;
            state.init_error = Some(e.to_string());
            state.set_status(name, HealthStatus::Down);
            Err(e)
        }
    }
}

async fn check_server_health(server: &ManagedServer, ctx: &CallContext) {
    let name = server.name.as_str();
    let client = {
        let state = server.state.lock().await;
        if state.status == HealthStatus::Down
            && state.stats.consecutive_failures > MAX_CONSECUTIVE_FAILURES
        {
            tracing::debug!(server = name, "skipping health check for down server");
            return;
        }
        match &state.client {
            Some(client) => client.clone(),
            None => return,
        }
    };

    let started = Instant::now();
    let result = client
        .ping(&ctx.with_timeout(server.config.call_timeout()))
        .await;

    let mut state = server.state.lock().await;
    state.last_health_check = Some(Utc::now());
    match result {
        Ok(()) => {
            state.stats.record_success(started.elapsed());
            for breaker in state.breakers.values_mut() {
                breaker.reset();
            }
        }
        Err(e) => {
            tracing::warn!(server = name, error = %e, "health check failed");
            state.stats.record_failure(&e);
        }
    }
    let status = state.stats.health();
    state.set_status(name, status);
}

// ─── Tests ───────────────────────────────────────────────────────────────────
