//! MCP client error types.
//!
//! Every failure that reaches a caller is an `McpError`. Callers branch on
//! [`McpError::kind`] rather than matching message text.

use thiserror::Error;

use super::safety::RiskLevel;

/// Fieldless discriminant of [`McpError`], for exhaustive branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ToolNotFound,
    ToolDisabled,
    UnknownServer,
    PermissionDenied,
    RateLimited,
    CircuitOpen,
    TransportFailed,
    Timeout,
    ConnectionClosed,
    HandshakeFailed,
    InvalidConfig,
    InvalidMessage,
    ServerError,
    ServerDown,
    ApprovalRequired,
    Cancelled,
    NotImplemented,
    PartialFailure,
    AuditFailed,
}

/// Errors that can occur during MCP client operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// Tool not found in the registry or in the server's tool cache.
    #[error("unknown tool: '{name}'")]
    ToolNotFound { name: String },

    /// Tool is registered but switched off.
    #[error("tool '{name}' is disabled")]
    ToolDisabled { name: String },

    /// No server with this name is managed.
    #[error("unknown server: '{name}'")]
    UnknownServer { name: String },

    /// Role lacks the capability required for the call.
    #[error("permission denied: role '{role}' lacks capability '{capability}'")]
    PermissionDenied { role: String, capability: String },

    /// Rate, concurrency or quota budget exhausted.
    #[error("rate limited for tool '{tool}': {reason}")]
    RateLimited { tool: String, reason: String },

    /// The tool's circuit breaker is open.
    #[error("circuit open for tool '{tool}' on server '{server}'")]
    CircuitOpen { server: String, tool: String },

    /// I/O or HTTP-level failure talking to a server.
    #[error("transport error for server '{server}': {reason}")]
    TransportFailed { server: String, reason: String },

    /// A call exceeded its deadline.
    #[error("call to '{target}' timed out after {timeout_ms}ms")]
    Timeout { target: String, timeout_ms: u64 },

    /// The transport was closed or the peer hung up.
    #[error("connection to server '{server}' closed")]
    ConnectionClosed { server: String },

    /// The initialization handshake failed.
    #[error("server '{name}' handshake failed: {reason}")]
    HandshakeFailed { name: String, reason: String },

    /// Configuration rejected before anything was attempted.
    #[error("config error: {reason}")]
    InvalidConfig { reason: String },

    /// A JSON-RPC message violated the envelope rules.
    #[error("invalid JSON-RPC message: {reason}")]
    InvalidMessage { reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Server is marked down and calls are refused.
    #[error("server '{name}' is down")]
    ServerDown { name: String },

    /// The call needs an explicit approval before it may run.
    #[error("tool '{tool}' requires approval ({risk_level} risk): {rationale}")]
    ApprovalRequired {
        tool: String,
        risk_level: RiskLevel,
        rationale: String,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Dispatch path exists in the model but not in this client.
    #[error("{what} is not implemented")]
    NotImplemented { what: String },

    /// Some calls of a batch failed.
    #[error("{failed} of {total} calls failed (first error: {first_error})")]
    PartialFailure {
        failed: usize,
        total: usize,
        first_error: String,
    },

    /// Writing or rotating the audit log failed.
    #[error("audit log error: {reason}")]
    AuditFailed { reason: String },
}

impl McpError {
    /// The fieldless kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            McpError::ToolDisabled { .. } => ErrorKind::ToolDisabled,
            McpError::UnknownServer { .. } => ErrorKind::UnknownServer,
            McpError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            McpError::RateLimited { .. } => ErrorKind::RateLimited,
            McpError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            McpError::TransportFailed { .. } => ErrorKind::TransportFailed,
            McpError::Timeout { .. } => ErrorKind::Timeout,
            McpError::ConnectionClosed { .. } => ErrorKind::ConnectionClosed,
            McpError::HandshakeFailed { .. } => ErrorKind::HandshakeFailed,
            McpError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            McpError::InvalidMessage { .. } => ErrorKind::InvalidMessage,
            McpError::ServerError { .. } => ErrorKind::ServerError,
            McpError::ServerDown { .. } => ErrorKind::ServerDown,
            McpError::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            McpError::Cancelled => ErrorKind::Cancelled,
            McpError::NotImplemented { .. } => ErrorKind::NotImplemented,
            McpError::PartialFailure { .. } => ErrorKind::PartialFailure,
            McpError::AuditFailed { .. } => ErrorKind::AuditFailed,
        }
    }

    /// Whether a retry has a chance of succeeding.
    ///
    /// Only timeouts and transient transport failures qualify. A JSON-RPC
    /// error inside a well-formed response is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::TransportFailed)
    }

    /// Errors caused by the caller's request rather than the server's health.
    /// A malformed response is the server's fault and does not qualify.
    pub fn is_caller_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::ToolNotFound | ErrorKind::Cancelled)
    }
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::InvalidMessage {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = McpError::Timeout {
            target: "github".into(),
            timeout_ms: 100,
        };
        let transport = McpError::TransportFailed {
            server: "github".into(),
            reason: "broken pipe".into(),
        };
        let rpc = McpError::ServerError {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        assert!(timeout.is_retryable());
        assert!(transport.is_retryable());
        assert!(!rpc.is_retryable());
        assert!(!McpError::Cancelled.is_retryable());
    }

    #[test]
    fn test_caller_errors_exclude_malformed_responses() {
        assert!(McpError::ToolNotFound { name: "x".into() }.is_caller_error());
        assert!(McpError::Cancelled.is_caller_error());
        let garbled = McpError::InvalidMessage {
            reason: "id mismatch".into(),
        };
        assert!(!garbled.is_caller_error());
        assert!(!garbled.is_retryable());
    }

    #[test]
    fn test_kind_matches_variant() {
        let err = McpError::RateLimited {
            tool: "jira.search".into(),
            reason: "bucket empty".into(),
        };
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(err.to_string().contains("jira.search"));
    }

    #[test]
    fn test_approval_required_message_carries_risk() {
        let err = McpError::ApprovalRequired {
            tool: "shell".into(),
            risk_level: RiskLevel::High,
            rationale: "interactive command 'vim'".into(),
        };
        assert!(err.to_string().contains("high risk"));
    }
}
