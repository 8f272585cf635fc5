//! MCP client: JSON-RPC 2.0 over stdio or HTTP, per-server clients, and the
//! multi-server manager with health tracking, retries and circuit breakers.
//!
//! Layers, leaves first:
//! - `types`: wire codec and MCP payloads
//! - `transport`, `stdio`, `http`: one connection to one server
//! - `client`: handshake and tool discovery over a transport
//! - `manager`: the fleet of named servers
//! - `registry`, `safety`: unified tool lookup and call vetting

pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod health;
pub mod http;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod safety;
pub mod stdio;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{ClientState, McpClient};
pub use config::{BackoffPolicy, ManagerConfig, RetryConfig, ServerConfig, TransportKind};
pub use context::{BackgroundTask, CallContext};
pub use errors::{ErrorKind, McpError};
pub use health::{HealthStatus, ServerStats};
pub use manager::{McpManager, ServerHealth};
pub use registry::{SafetyTier, Tool, ToolCall, ToolRegistry, ToolSource};
pub use safety::{RiskLevel, SafetyConfig, SafetyValidator, ToolCallAnalysis};
pub use transport::{DefaultTransportFactory, Transport, TransportFactory};
pub use types::McpToolDefinition;
