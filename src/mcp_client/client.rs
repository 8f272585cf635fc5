//! Per-server MCP client.
//!
//! Wraps one transport and drives the handshake:
//! `initialize` → `notifications/initialized` → `tools/list` (all pages).
//! After that the client can call any tool it discovered.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::config::ServerConfig;
use super::context::CallContext;
use super::errors::McpError;
use super::transport::{next_request_id, Transport};
use super::types::{
    methods, ClientInfo, InitializeParams, InitializeResult, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, McpToolDefinition, ServerInfo, LEGACY_PROTOCOL_VERSION, PROTOCOL_VERSION,
};

/// Upper bound on `tools/list` pages followed in one discovery.
const MAX_TOOL_PAGES: usize = 100;

// ─── State ───────────────────────────────────────────────────────────────────

/// Where the client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    Handshaking,
    DiscoveringTools,
    Ready,
    Closed,
}

#[derive(Debug)]
struct ClientInner {
    state: ClientState,
    tools: Vec<McpToolDefinition>,
    server_info: Option<ServerInfo>,
    protocol_version: Option<String>,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Client for a single MCP server.
pub struct McpClient {
    server_name: String,
    transport: Arc<dyn Transport>,
    inner: RwLock<ClientInner>,
}

impl McpClient {
    pub fn new(server_name: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            server_name: server_name.to_string(),
            transport,
            inner: RwLock::new(ClientInner {
                state: ClientState::Uninitialized,
                tools: Vec::new(),
                server_info: None,
                protocol_version: None,
            }),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub async fn state(&self) -> ClientState {
        self.inner.read().await.state
    }

    /// Cached tool definitions from the last discovery.
    pub async fn tools(&self) -> Vec<McpToolDefinition> {
        self.inner.read().await.tools.clone()
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.inner.read().await.server_info.clone()
    }

    /// Protocol version the server answered with, if any.
    pub async fn protocol_version(&self) -> Option<String> {
        self.inner.read().await.protocol_version.clone()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Open the transport, run the handshake and discover tools.
    ///
    /// On failure the transport is closed and the client ends `Closed`.
    pub async fn connect(&self, ctx: &CallContext, config: &ServerConfig) -> Result<(), McpError> {
        {
            let mut inner = self.inner.write().await;
            if inner.state != ClientState::Uninitialized {
                return Err(McpError::HandshakeFailed {
                    name: self.server_name.clone(),
                    reason: format!("client already {:?}", inner.state),
                });
            }
            inner.state = ClientState::Handshaking;
        }

        match self.handshake(ctx, config).await {
            Ok(()) => {
                let mut inner = self.inner.write().await;
                inner.state = ClientState::Ready;
                tracing::info!(
                    server = %self.server_name,
                    tools = inner.tools.len(),
                    "MCP server ready"
                );
                Ok(())
            }
            Err(e) => {
                self.inner.write().await.state = ClientState::Closed;
                if let Err(close_err) = self.transport.close().await {
                    tracing::debug!(server = %self.server_name, error = %close_err, "close after failed handshake");
                }
                tracing::warn!(server = %self.server_name, error = %e, "MCP handshake failed");
                Err(match e {
                    McpError::Cancelled | McpError::Timeout { .. } => e,
                    McpError::HandshakeFailed { .. } => e,
                    other => McpError::HandshakeFailed {
                        name: self.server_name.clone(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    async fn handshake(&self, ctx: &CallContext, config: &ServerConfig) -> Result<(), McpError> {
        self.transport.initialize(ctx, config).await?;

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: ClientInfo::default(),
        };
        let response = self
            .request(ctx, methods::INITIALIZE, Some(serde_json::to_value(params)?))
            .await?;
        let init: InitializeResult = response.unmarshal_result()?;

        if let Some(version) = init.protocol_version.as_deref() {
            check_protocol_version(&self.server_name, PROTOCOL_VERSION, version)?;
        }
        {
            let mut inner = self.inner.write().await;
            inner.server_info = init.server_info.clone();
            inner.protocol_version = init.protocol_version.clone();
        }
        tracing::debug!(
            server = %self.server_name,
            server_info = ?init.server_info,
            "initialize acknowledged"
        );

        // Best-effort; a server that drops the notification still works.
        if let Err(e) = self
            .transport
            .send(ctx, JsonRpcRequest::notification(methods::INITIALIZED, None))
            .await
        {
            tracing::warn!(server = %self.server_name, error = %e, "initialized notification failed");
        }

        self.inner.write().await.state = ClientState::DiscoveringTools;
        let tools = self.list_tools(ctx).await?;
        self.inner.write().await.tools = tools;
        Ok(())
    }

    /// Close the transport. Safe to call more than once.
    pub async fn close(&self) -> Result<(), McpError> {
        {
            let mut inner = self.inner.write().await;
            if inner.state == ClientState::Closed {
                return Ok(());
            }
            inner.state = ClientState::Closed;
        }
        self.transport.close().await
    }

    // ─── Operations ──────────────────────────────────────────────────────

    /// Call a discovered tool and return the raw `result` value.
    pub async fn call_tool(
        &self,
        ctx: &CallContext,
        name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        {
            let inner = self.inner.read().await;
            self.ensure_ready(inner.state)?;
            if !inner.tools.iter().any(|t| t.name == name) {
                return Err(McpError::ToolNotFound {
                    name: name.to_string(),
                });
            }
        }

        let params = json!({ "name": name, "arguments": arguments });
        self.request(ctx, methods::TOOLS_CALL, Some(params))
            .await?
            .into_result()
    }

    /// Liveness probe.
    pub async fn ping(&self, ctx: &CallContext) -> Result<(), McpError> {
        self.ensure_ready(self.state().await)?;
        self.request(ctx, methods::PING, None).await?.into_result()?;
        Ok(())
    }

    /// Re-run `tools/list` and replace the cached definitions.
    pub async fn refresh_tools(&self, ctx: &CallContext) -> Result<Vec<McpToolDefinition>, McpError> {
        self.ensure_ready(self.state().await)?;
        let tools = self.list_tools(ctx).await?;
        self.inner.write().await.tools = tools.clone();
        tracing::info!(server = %self.server_name, tools = tools.len(), "tool list refreshed");
        Ok(tools)
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn ensure_ready(&self, state: ClientState) -> Result<(), McpError> {
        match state {
            ClientState::Ready => Ok(()),
            ClientState::Closed => Err(McpError::ConnectionClosed {
                server: self.server_name.clone(),
            }),
            other => Err(McpError::TransportFailed {
                server: self.server_name.clone(),
                reason: format!("client not ready ({other:?})"),
            }),
        }
    }

    /// Send a request and insist on a response.
    async fn request(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let request = JsonRpcRequest::new(next_request_id(), method, params);
        self.transport
            .send(ctx, request)
            .await?
            .ok_or_else(|| McpError::InvalidMessage {
                reason: format!("no response to '{method}' from '{}'", self.server_name),
            })
    }

    /// Fetch every page of `tools/list`.
    async fn list_tools(&self, ctx: &CallContext) -> Result<Vec<McpToolDefinition>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ListToolsResult = self
                .request(ctx, methods::TOOLS_LIST, params)
                .await?
                .unmarshal_result()?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => return Ok(tools),
            }
        }

        tracing::warn!(
            server = %self.server_name,
            pages = MAX_TOOL_PAGES,
            "tools/list page limit reached, keeping tools fetched so far"
        );
        Ok(tools)
    }
}

// ─── Version negotiation ─────────────────────────────────────────────────────

/// Decide whether a server's protocol version is usable.
///
/// Only a legacy `"1.0"` peer facing a date-versioned one is fatal. Other
/// mismatches are logged and tolerated.
pub fn check_protocol_version(server: &str, ours: &str, theirs: &str) -> Result<(), McpError> {
    if ours == theirs {
        return Ok(());
    }
    let incompatible = (ours == LEGACY_PROTOCOL_VERSION && is_date_version(theirs))
        || (theirs == LEGACY_PROTOCOL_VERSION && is_date_version(ours));
    if incompatible {
        return Err(McpError::HandshakeFailed {
            name: server.to_string(),
            reason: format!("incompatible protocol version: client {ours}, server {theirs}"),
        });
    }
    tracing::warn!(server, client = ours, server_version = theirs, "protocol version mismatch");
    Ok(())
}

/// `YYYY-MM-DD`.
fn is_date_version(v: &str) -> bool {
    let bytes = v.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
