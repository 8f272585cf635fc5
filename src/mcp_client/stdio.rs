//! JSON-RPC over stdio transport.
//!
//! Spawns the server as a child process and speaks line-delimited JSON over
//! its stdin/stdout. Stderr is drained in the background and only ever
//! surfaces as log lines.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::config::{expand_map, ServerConfig, TransportKind};
use super::context::CallContext;
use super::errors::McpError;
use super::transport::{Lifecycle, Transport};
use super::types::{encode_line, methods, JsonRpcRequest, JsonRpcResponse};

// ─── Session ─────────────────────────────────────────────────────────────────

/// A running server process with its pipes.
struct StdioSession {
    process: Child,
    writer: Option<ChildStdin>,
    reader: Option<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdioSession {
    async fn write_line(&mut self, server: &str, line: &str) -> Result<(), McpError> {
        let writer = self.writer.as_mut().ok_or(McpError::ConnectionClosed {
            server: server.to_string(),
        })?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| transport_err(server, format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| transport_err(server, format!("failed to flush stdin: {e}")))
    }

    /// Read lines until the response matching `request` arrives.
    async fn read_response(
        &mut self,
        server: &str,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, McpError> {
        let reader = self.reader.as_mut().ok_or(McpError::ConnectionClosed {
            server: server.to_string(),
        })?;
        let mut line_buf = String::new();

        loop {
            line_buf.clear();
            let bytes_read = reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| transport_err(server, format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(McpError::ConnectionClosed {
                    server: server.to_string(),
                });
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == request.id => {
                    resp.validate()?;
                    return Ok(resp);
                }
                // Stale response from a call that timed out earlier.
                Ok(resp) => {
                    tracing::debug!(server, id = ?resp.id, "skipping unmatched response");
                }
                // Server-initiated notifications and stray stdout output.
                Err(_) => {
                    tracing::trace!(server, line = trimmed, "skipping non-response line");
                }
            }
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    state: Mutex<Lifecycle<StdioSession>>,
}

impl StdioTransport {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            state: Mutex::new(Lifecycle::New),
        }
    }

    fn spawn(&self, config: &ServerConfig) -> Result<StdioSession, McpError> {
        let command = config.command.as_deref().ok_or(McpError::InvalidConfig {
            reason: format!("server '{}': stdio transport requires 'command'", config.name),
        })?;

        let mut cmd = Command::new(command);
        cmd.args(&config.args);
        cmd.envs(expand_map(&config.env));

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            transport_err(&self.server_name, format!("failed to spawn '{command}': {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| transport_err(&self.server_name, "failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| transport_err(&self.server_name, "failed to capture stdout"))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            let server = self.server_name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, stderr = %line, "server stderr");
                }
            })
        });

        tracing::info!(
            server = %self.server_name,
            command,
            pid = child.id(),
            "spawned MCP server process"
        );

        Ok(StdioSession {
            process: child,
            writer: Some(stdin),
            reader: Some(BufReader::new(stdout)),
            stderr_task,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn initialize(&self, _ctx: &CallContext, config: &ServerConfig) -> Result<(), McpError> {
        let mut state = self.state.lock().await;
        state.ensure_new(&self.server_name)?;
        *state = Lifecycle::Open(self.spawn(config)?);
        Ok(())
    }

    async fn send(
        &self,
        ctx: &CallContext,
        request: JsonRpcRequest,
    ) -> Result<Option<JsonRpcResponse>, McpError> {
        request.validate()?;
        let line = encode_line(&request)?;

        let mut state = self.state.lock().await;
        let session = state.session_mut(&self.server_name)?;
        let server = self.server_name.as_str();

        ctx.run(server, async {
            session.write_line(server, &line).await?;
            if request.is_notification() {
                return Ok(None);
            }
            session.read_response(server, &request).await.map(Some)
        })
        .await
    }

    async fn close(&self) -> Result<(), McpError> {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, Lifecycle::Closed);
        let Lifecycle::Open(mut session) = previous else {
            return Ok(());
        };

        let mut failures: Vec<String> = Vec::new();

        // Best-effort shutdown notification.
        match encode_line(&JsonRpcRequest::notification(methods::SHUTDOWN, None)) {
            Ok(line) => {
                if let Err(e) = session.write_line(&self.server_name, &line).await {
                    failures.push(format!("shutdown notification: {e}"));
                }
            }
            Err(e) => failures.push(format!("shutdown notification: {e}")),
        }

        // Close all three pipes.
        if let Some(mut writer) = session.writer.take() {
            if let Err(e) = writer.shutdown().await {
                failures.push(format!("close stdin: {e}"));
            }
        }
        session.reader.take();
        if let Some(task) = session.stderr_task.take() {
            task.abort();
        }

        if let Err(e) = session.process.kill().await {
            failures.push(format!("kill process: {e}"));
        }

        tracing::info!(server = %self.server_name, "stdio transport closed");

        if failures.is_empty() {
            Ok(())
        } else {
            tracing::warn!(
                server = %self.server_name,
                errors = ?failures,
                "errors while closing stdio transport"
            );
            Err(transport_err(&self.server_name, failures.join("; ")))
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

fn transport_err(server: &str, reason: impl Into<String>) -> McpError {
    McpError::TransportFailed {
        server: server.to_string(),
        reason: reason.into(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
