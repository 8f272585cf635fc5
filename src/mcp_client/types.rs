//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 envelopes with structural validation, plus the MCP protocol
//! payloads exchanged during the handshake and tool calls.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use super::errors::McpError;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// The only protocol tag this codec accepts.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier. JSON-RPC allows numbers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// JSON-RPC 2.0 request message. A request without an id is a notification.
///
/// Field order is the wire order: `jsonrpc`, `id`, `method`, `params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(
        id: impl Into<RequestId>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.to_string(),
            params,
        }
    }

    /// Create a notification (no id, no reply expected).
    pub fn notification(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }

    /// Whether this message expects no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Check the envelope invariants.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(McpError::InvalidMessage {
                reason: format!("unsupported jsonrpc version '{}'", self.jsonrpc),
            });
        }
        if self.method.trim().is_empty() {
            return Err(McpError::InvalidMessage {
                reason: "method must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<RequestId>,
    /// `Some(Value::Null)` when the peer sent `"result": null`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// Keep an explicit `null` distinguishable from an absent member.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl JsonRpcResponse {
    /// Build a success response. Fails if `result` cannot be serialized.
    pub fn new(id: impl Into<RequestId>, result: impl Serialize) -> Result<Self, McpError> {
        let value = serde_json::to_value(result).map_err(|e| McpError::InvalidMessage {
            reason: format!("failed to serialize result: {e}"),
        })?;
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            result: Some(value),
            error: None,
        })
    }

    /// Build an error response.
    pub fn error(
        id: impl Into<RequestId>,
        code: i32,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data,
            }),
        }
    }

    /// Check the envelope invariants: version tag, exactly one of result/error.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(McpError::InvalidMessage {
                reason: format!("unsupported jsonrpc version '{}'", self.jsonrpc),
            });
        }
        match (&self.result, &self.error) {
            (Some(_), Some(_)) => Err(McpError::InvalidMessage {
                reason: "response carries both result and error".into(),
            }),
            (None, None) => Err(McpError::InvalidMessage {
                reason: "response carries neither result nor error".into(),
            }),
            _ => Ok(()),
        }
    }

    /// Extract the raw result, converting a carried error to `ServerError`.
    pub fn into_result(self) -> Result<serde_json::Value, McpError> {
        if let Some(err) = self.error {
            return Err(err.into());
        }
        self.result.ok_or(McpError::InvalidMessage {
            reason: "response has no result".into(),
        })
    }

    /// Deserialize the result into `T`.
    pub fn unmarshal_result<T: DeserializeOwned>(&self) -> Result<T, McpError> {
        if let Some(err) = &self.error {
            return Err(err.clone().into());
        }
        let result = self.result.as_ref().ok_or(McpError::InvalidMessage {
            reason: "response has no result".into(),
        })?;
        serde_json::from_value(result.clone()).map_err(|e| McpError::InvalidMessage {
            reason: format!("failed to decode result: {e}"),
        })
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<JsonRpcError> for McpError {
    fn from(err: JsonRpcError) -> Self {
        McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Encode a message as one line of newline-delimited JSON.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, McpError> {
    let mut line = serde_json::to_string(message).map_err(|e| McpError::InvalidMessage {
        reason: format!("failed to serialize message: {e}"),
    })?;
    line.push('\n');
    Ok(line)
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Implementation-defined server error.
    pub const SERVER_ERROR: i32 = -32000;
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revision this client speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Pre-dated protocol tag still sent by some old servers.
pub const LEGACY_PROTOCOL_VERSION: &str = "1.0";

/// Method names used on the wire.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PING: &str = "ping";
    pub const SHUTDOWN: &str = "shutdown";
}

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "params_schema")]
    pub input_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

/// Optional behavioural hints a server attaches to a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    #[serde(default)]
    pub read_only_hint: Option<bool>,
    #[serde(default)]
    pub destructive_hint: Option<bool>,
}

/// Client identity sent in `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: serde_json::Value,
    pub client_info: ClientInfo,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// One page of `tools/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
