//! Transport abstraction.
//!
//! A transport owns one underlying connection or process and moves JSON-RPC
//! envelopes across it. Implementations serialize `send` internally, so a
//! request/response pair is atomic per transport instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::config::{ServerConfig, TransportKind};
use super::context::CallContext;
use super::errors::McpError;
use super::http::HttpTransport;
use super::stdio::StdioTransport;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Byte-level channel carrying JSON-RPC messages to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection or spawn the process. Fails if already initialized.
    async fn initialize(&self, ctx: &CallContext, config: &ServerConfig) -> Result<(), McpError>;

    /// Send one message. Requests return the matching response; notifications
    /// are written and return `None` without reading anything.
    async fn send(
        &self,
        ctx: &CallContext,
        request: JsonRpcRequest,
    ) -> Result<Option<JsonRpcResponse>, McpError>;

    /// Release the connection. Calling it again is a no-op.
    async fn close(&self) -> Result<(), McpError>;

    /// Which wire this transport speaks.
    fn kind(&self) -> TransportKind;
}

/// Builds transports for server entries. Tests substitute their own.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>, McpError>;
}

/// Picks stdio or HTTP from `ServerConfig::transport`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>, McpError> {
        config.validate()?;
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Stdio => Arc::new(StdioTransport::new(&config.name)),
            TransportKind::Http => Arc::new(HttpTransport::new(&config.name)),
        };
        Ok(transport)
    }
}

/// Lifecycle of a transport instance.
#[derive(Debug)]
pub(crate) enum Lifecycle<S> {
    New,
    Open(S),
    Closed,
}

impl<S> Lifecycle<S> {
    /// The open session, or the error matching the current phase.
    pub(crate) fn session_mut(&mut self, server: &str) -> Result<&mut S, McpError> {
        match self {
            Lifecycle::Open(session) => Ok(session),
            Lifecycle::New => Err(McpError::TransportFailed {
                server: server.to_string(),
                reason: "transport not initialized".into(),
            }),
            Lifecycle::Closed => Err(McpError::ConnectionClosed {
                server: server.to_string(),
            }),
        }
    }

    /// Guard against initializing twice.
    pub(crate) fn ensure_new(&self, server: &str) -> Result<(), McpError> {
        match self {
            Lifecycle::New => Ok(()),
            Lifecycle::Open(_) => Err(McpError::TransportFailed {
                server: server.to_string(),
                reason: "transport already initialized".into(),
            }),
            Lifecycle::Closed => Err(McpError::ConnectionClosed {
                server: server.to_string(),
            }),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
