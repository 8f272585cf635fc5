//! Scripted in-memory MCP server shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::config::{ServerConfig, TransportKind};
use super::context::CallContext;
use super::errors::McpError;
use super::transport::{Transport, TransportFactory};
use super::types::{error_codes, methods, JsonRpcRequest, JsonRpcResponse, McpToolDefinition};

pub(crate) fn tool_def(name: &str) -> McpToolDefinition {
    McpToolDefinition {
        name: name.to_string(),
        description: format!("{name} tool"),
        input_schema: json!({"type": "object"}),
        annotations: None,
    }
}

/// Behaviour and call log of one fake server.
pub(crate) struct MockServer {
    pub tools: Vec<McpToolDefinition>,
    pub protocol_version: String,
    /// Tools per `tools/list` page; 0 returns everything at once.
    pub page_size: usize,
    pub init_error: Option<McpError>,
    pub call_delay: Option<Duration>,
    pub ping_ok: AtomicBool,
    outcomes: Mutex<VecDeque<Result<Value, McpError>>>,
    sent: Mutex<Vec<JsonRpcRequest>>,
    tool_calls: AtomicUsize,
}

impl MockServer {
    pub fn new(tools: &[&str]) -> Self {
        Self {
            tools: tools.iter().map(|t| tool_def(t)).collect(),
            protocol_version: "2024-11-05".into(),
            page_size: 0,
            init_error: None,
            call_delay: None,
            ping_ok: AtomicBool::new(true),
            outcomes: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            tool_calls: AtomicUsize::new(0),
        }
    }

    pub fn shared(tools: &[&str]) -> Arc<Self> {
        Arc::new(Self::new(tools))
    }

    /// Queue the outcome of the next `tools/call`. `ServerError` is answered
    /// as a JSON-RPC error; any other error fails the transport itself.
    pub fn push_outcome(&self, outcome: Result<Value, McpError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn tool_calls(&self) -> usize {
        self.tool_calls.load(Ordering::SeqCst)
    }

    pub fn methods_sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.method.clone())
            .collect()
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    fn list_page(&self, request: &JsonRpcRequest) -> Value {
        let start = request
            .params
            .as_ref()
            .and_then(|p| p["cursor"].as_str())
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let size = if self.page_size == 0 {
            self.tools.len()
        } else {
            self.page_size
        };
        let end = (start + size).min(self.tools.len());
        let page = &self.tools[start.min(end)..end];
        let next = (end < self.tools.len()).then(|| end.to_string());
        json!({"tools": page, "nextCursor": next})
    }

    async fn answer(&self, request: &JsonRpcRequest) -> Result<Value, McpError> {
        match request.method.as_str() {
            methods::INITIALIZE => Ok(json!({
                "protocolVersion": self.protocol_version,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "mock", "version": "0.0.1"}
            })),
            methods::TOOLS_LIST => Ok(self.list_page(request)),
            methods::PING => {
                if self.ping_ok.load(Ordering::SeqCst) {
                    Ok(json!({}))
                } else {
                    Err(McpError::TransportFailed {
                        server: "mock".into(),
                        reason: "ping refused".into(),
                    })
                }
            }
            methods::TOOLS_CALL => {
                self.tool_calls.fetch_add(1, Ordering::SeqCst);
                if let Some(delay) = self.call_delay {
                    tokio::time::sleep(delay).await;
                }
                let scripted = self.outcomes.lock().unwrap().pop_front();
                scripted.unwrap_or_else(|| {
                    let args = request
                        .params
                        .as_ref()
                        .map(|p| p["arguments"].clone())
                        .unwrap_or(Value::Null);
                    Ok(json!({
                        "content": [{"type": "text", "text": "ok"}],
                        "arguments": args
                    }))
                })
            }
            other => Err(McpError::ServerError {
                code: error_codes::METHOD_NOT_FOUND,
                message: format!("unknown method {other}"),
                data: None,
            }),
        }
    }
}

/// Transport backed by a `MockServer`.
pub(crate) struct MockTransport {
    server: Arc<MockServer>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new(server: Arc<MockServer>) -> Self {
        Self {
            server,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn initialize(&self, _ctx: &CallContext, _config: &ServerConfig) -> Result<(), McpError> {
        if let Some(err) = &self.server.init_error {
            return Err(err.clone());
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(McpError::TransportFailed {
                server: "mock".into(),
                reason: "transport already initialized".into(),
            });
        }
        Ok(())
    }

    async fn send(
        &self,
        ctx: &CallContext,
        request: JsonRpcRequest,
    ) -> Result<Option<JsonRpcResponse>, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionClosed {
                server: "mock".into(),
            });
        }
        self.server.sent.lock().unwrap().push(request.clone());
        let Some(id) = request.id.clone() else {
            return Ok(None);
        };

        match ctx.run("mock", self.server.answer(&request)).await {
            Ok(result) => Ok(Some(JsonRpcResponse::new(id, result)?)),
            Err(McpError::ServerError { code, message, data }) => {
                Ok(Some(JsonRpcResponse::error(id, code, &message, data)))
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

/// Factory handing out mock transports by server name.
#[derive(Default)]
pub(crate) struct MockFactory {
    servers: HashMap<String, Arc<MockServer>>,
}

impl MockFactory {
    pub fn with(mut self, name: &str, server: Arc<MockServer>) -> Self {
        self.servers.insert(name.to_string(), server);
        self
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>, McpError> {
        let server = self
            .servers
            .get(&config.name)
            .cloned()
            .ok_or_else(|| McpError::InvalidConfig {
                reason: format!("no mock for server '{}'", config.name),
            })?;
        Ok(Arc::new(MockTransport::new(server)))
    }
}
