//! JSON-RPC over HTTP transport.
//!
//! Every `send` is one POST carrying the JSON-RPC envelope. A non-2xx status
//! is a transport failure, distinct from a JSON-RPC error inside a 2xx body.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use tokio::sync::Mutex;

use super::config::{expand_map, ServerConfig, TransportKind};
use super::context::{duration_millis, CallContext};
use super::errors::McpError;
use super::transport::{Lifecycle, Transport};
use super::types::{JsonRpcRequest, JsonRpcResponse};

/// Longest response body quoted back in an error message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// An initialized HTTP connection pool plus its endpoint.
struct HttpSession {
    client: reqwest::Client,
    url: String,
    timeout_ms: u64,
}

/// HTTP transport for remote MCP servers.
pub struct HttpTransport {
    server_name: String,
    state: Mutex<Lifecycle<HttpSession>>,
}

impl HttpTransport {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            state: Mutex::new(Lifecycle::New),
        }
    }

    fn build_session(&self, config: &ServerConfig) -> Result<HttpSession, McpError> {
        let url = config.url.clone().ok_or(McpError::InvalidConfig {
            reason: format!("server '{}': http transport requires 'url'", config.name),
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.call_timeout())
            .default_headers(build_headers(&config.name, config)?)
            .build()
            .map_err(|e| McpError::TransportFailed {
                server: self.server_name.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(HttpSession {
            client,
            url,
            timeout_ms: duration_millis(config.call_timeout()),
        })
    }

    /// GET the health endpoint once. Any non-2xx or I/O error fails.
    async fn probe_health(&self, session: &HttpSession, health_url: &str) -> Result<(), McpError> {
        let resp = session
            .client
            .get(health_url)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e, session.timeout_ms))?;

        if !resp.status().is_success() {
            return Err(McpError::TransportFailed {
                server: self.server_name.clone(),
                reason: format!("health check {health_url} returned HTTP {}", resp.status()),
            });
        }
        tracing::debug!(server = %self.server_name, health_url, "health probe passed");
        Ok(())
    }

    fn map_reqwest_error(&self, e: reqwest::Error, timeout_ms: u64) -> McpError {
        if e.is_timeout() {
            McpError::Timeout {
                target: self.server_name.clone(),
                timeout_ms,
            }
        } else {
            McpError::TransportFailed {
                server: self.server_name.clone(),
                reason: e.to_string(),
            }
        }
    }

    async fn post(
        &self,
        session: &HttpSession,
        request: &JsonRpcRequest,
    ) -> Result<Option<JsonRpcResponse>, McpError> {
        let resp = session
            .client
            .post(&session.url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e, session.timeout_ms))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            return Err(McpError::TransportFailed {
                server: self.server_name.clone(),
                reason: format!("HTTP {}: {body}", status.as_u16()),
            });
        }

        if request.is_notification() {
            return Ok(None);
        }

        let body = resp
            .text()
            .await
            .map_err(|e| self.map_reqwest_error(e, session.timeout_ms))?;
        let parsed: JsonRpcResponse =
            serde_json::from_str(&body).map_err(|e| McpError::InvalidMessage {
                reason: format!("server '{}' sent malformed response: {e}", self.server_name),
            })?;
        parsed.validate()?;

        if parsed.id != request.id {
            return Err(McpError::InvalidMessage {
                reason: format!(
                    "server '{}' answered id {:?} to request {:?}",
                    self.server_name, parsed.id, request.id
                ),
            });
        }
        Ok(Some(parsed))
    }
}

/// JSON content headers plus the configured ones, values env-expanded.
fn build_headers(server: &str, config: &ServerConfig) -> Result<HeaderMap, McpError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    for (key, value) in expand_map(&config.headers) {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| McpError::InvalidConfig {
            reason: format!("server '{server}': invalid header name '{key}': {e}"),
        })?;
        let value = HeaderValue::from_str(&value).map_err(|e| McpError::InvalidConfig {
            reason: format!("server '{server}': invalid value for header '{key}': {e}"),
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn initialize(&self, ctx: &CallContext, config: &ServerConfig) -> Result<(), McpError> {
        let mut state = self.state.lock().await;
        state.ensure_new(&self.server_name)?;

        let session = self.build_session(config)?;
        if let Some(health_url) = config.health_url.as_deref() {
            ctx.run(&self.server_name, self.probe_health(&session, health_url))
                .await?;
        }

        tracing::info!(
            server = %self.server_name,
            url = %session.url,
            "HTTP transport initialized"
        );
        *state = Lifecycle::Open(session);
        Ok(())
    }

    async fn send(
        &self,
        ctx: &CallContext,
        request: JsonRpcRequest,
    ) -> Result<Option<JsonRpcResponse>, McpError> {
        request.validate()?;

        let mut state = self.state.lock().await;
        let session = state.session_mut(&self.server_name)?;
        ctx.run(&self.server_name, self.post(session, &request)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        let mut state = self.state.lock().await;
        if matches!(*state, Lifecycle::Open(_)) {
            tracing::info!(server = %self.server_name, "HTTP transport closed");
        }
        *state = Lifecycle::Closed;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
