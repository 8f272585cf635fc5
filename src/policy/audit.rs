//! Append-only audit log.
//!
//! One JSON object per line. Entries are never edited; the only rewrite is
//! rotation, which drops entries older than the retention window and swaps the
//! file in with a rename.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::mcp_client::context::{duration_millis, BackgroundTask};
use crate::mcp_client::errors::McpError;

/// Entries older than this are dropped on rotation.
pub const RETENTION_DAYS: i64 = 7;

// ─── Types ──────────────────────────────────────────────────────────────────

/// Outcome recorded for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    SuccessCached,
    Error,
    PermissionDenied,
    RateLimited,
    ApprovalRequired,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::SuccessCached => "success_cached",
            AuditStatus::Error => "error",
            AuditStatus::PermissionDenied => "permission_denied",
            AuditStatus::RateLimited => "rate_limited",
            AuditStatus::ApprovalRequired => "approval_required",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AuditStatus::Success),
            "success_cached" => Some(AuditStatus::SuccessCached),
            "error" => Some(AuditStatus::Error),
            "permission_denied" => Some(AuditStatus::PermissionDenied),
            "rate_limited" => Some(AuditStatus::RateLimited),
            "approval_required" => Some(AuditStatus::ApprovalRequired),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the audit log. Arguments are only ever stored as a hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub invocation_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub role: String,
    pub args_hash: String,
    pub status: AuditStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn new(
        invocation_id: &str,
        tool_name: &str,
        role: &str,
        arguments: &serde_json::Value,
        status: AuditStatus,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            invocation_id: invocation_id.to_string(),
            tool_name: tool_name.to_string(),
            server_name: None,
            role: role.to_string(),
            args_hash: hash_arguments(arguments),
            status,
            duration_ms: 0,
            error: None,
        }
    }

    pub fn with_server(mut self, server: Option<&str>) -> Self {
        self.server_name = server.map(str::to_string);
        self
    }

    pub fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = duration_millis(elapsed);
        self
    }

    pub fn with_error(mut self, error: &McpError) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Hex SHA-256 of the canonical JSON form of `arguments`.
pub fn hash_arguments(arguments: &serde_json::Value) -> String {
    let canonical = arguments.to_string();
    let hash = Sha256::digest(canonical.as_bytes());
    format!("{hash:x}")
}

/// `audit:` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    /// Log file. Defaults to `audit.jsonl` in the data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,
}

fn default_rotation_interval() -> u64 {
    3600
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            rotation_interval_secs: default_rotation_interval(),
        }
    }
}

// ─── AuditLog ───────────────────────────────────────────────────────────────

/// JSONL audit file with serialized writers.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Use `path`, creating its parent directory.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, McpError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| audit_err(&path, "create directory for", e))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and push it to disk before returning.
    pub async fn record(&self, entry: &AuditEntry) -> Result<(), McpError> {
        let mut line = serde_json::to_string(entry).map_err(|e| McpError::AuditFailed {
            reason: format!("failed to serialize entry: {e}"),
        })?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| audit_err(&self.path, "open", e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| audit_err(&self.path, "write", e))?;
        file.flush()
            .await
            .map_err(|e| audit_err(&self.path, "flush", e))?;
        file.sync_data()
            .await
            .map_err(|e| audit_err(&self.path, "sync", e))?;

        tracing::debug!(
            tool = %entry.tool_name,
            status = %entry.status,
            invocation_id = %entry.invocation_id,
            "audit entry recorded"
        );
        Ok(())
    }

    /// Every readable entry, oldest first. Malformed lines are skipped.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>, McpError> {
        let _guard = self.write_lock.lock().await;
        Ok(self
            .read_lines()
            .await?
            .iter()
            .filter_map(|line| parse_line(line))
            .collect())
    }

    /// Drop entries older than the retention window.
    pub async fn rotate(&self) -> Result<usize, McpError> {
        self.rotate_at(Utc::now()).await
    }

    /// Rotation relative to `now`. Returns how many entries were dropped.
    pub async fn rotate_at(&self, now: DateTime<Utc>) -> Result<usize, McpError> {
        let cutoff = now - chrono::Duration::days(RETENTION_DAYS);
        let _guard = self.write_lock.lock().await;

        let lines = self.read_lines().await?;
        let total = lines.len();
        let kept: Vec<&String> = lines
            .iter()
            .filter(|line| parse_line(line).is_some_and(|e| e.timestamp >= cutoff))
            .collect();
        let dropped = total - kept.len();
        if dropped == 0 {
            return Ok(0);
        }

        let mut body = String::new();
        for line in kept {
            body.push_str(line);
            body.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| audit_err(&tmp, "create", e))?;
        file.write_all(body.as_bytes())
            .await
            .map_err(|e| audit_err(&tmp, "write", e))?;
        file.sync_all()
            .await
            .map_err(|e| audit_err(&tmp, "sync", e))?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| audit_err(&self.path, "replace", e))?;

        tracing::info!(path = %self.path.display(), dropped, "audit log rotated");
        Ok(dropped)
    }

    /// Rotate every `every` until stopped.
    pub fn spawn_rotation(self: &Arc<Self>, every: Duration) -> BackgroundTask {
        let log = self.clone();
        BackgroundTask::spawn(move |cancel| async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {
                        if let Err(e) = log.rotate().await {
                            tracing::warn!(error = %e, "audit rotation failed");
                        }
                    }
                }
            }
        })
    }

    async fn read_lines(&self) -> Result<Vec<String>, McpError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(audit_err(&self.path, "read", e)),
        }
    }
}

fn parse_line(line: &str) -> Option<AuditEntry> {
    match serde_json::from_str(line) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed audit line");
            None
        }
    }
}

fn audit_err(path: &Path, action: &str, e: std::io::Error) -> McpError {
    McpError::AuditFailed {
        reason: format!("failed to {action} {}: {e}", path.display()),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
