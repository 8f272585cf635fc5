//! Server and manager configuration.
//!
//! Loaded from one YAML (or JSON) file. String values may reference host
//! environment variables as `${VAR}` or `${VAR:-default}`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::McpError;

// ─── Limits ──────────────────────────────────────────────────────────────────

/// Accepted per-server timeout range, in seconds.
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 600;

/// Accepted range for the manager-wide concurrency ceiling.
pub const MIN_CONCURRENT: usize = 1;
pub const MAX_CONCURRENT: usize = 100;

/// Health checks never run more often than this.
pub const MIN_HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which wire a server is reached over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Http => write!(f, "http"),
        }
    }
}

/// One MCP server entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub name: String,
    /// Executable for stdio servers.
    #[serde(default)]
    pub command: Option<String>,
    /// Endpoint for HTTP servers.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the child process (values are expanded).
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub transport: TransportKind,
    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    /// Requests per second advertised for this server's tools.
    #[serde(default)]
    pub rate_limit: Option<f64>,
    /// HTTP headers attached to every request (values are expanded).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Optional URL probed once while the HTTP transport initializes.
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ServerConfig {
    /// Minimal stdio entry.
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: Some(command.to_string()),
            url: None,
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            transport: TransportKind::Stdio,
            timeout: default_timeout_secs(),
            rate_limit: None,
            headers: HashMap::new(),
            health_url: None,
            enabled: true,
        }
    }

    /// Minimal HTTP entry.
    pub fn http(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            command: None,
            url: Some(url.to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            transport: TransportKind::Http,
            timeout: default_timeout_secs(),
            rate_limit: None,
            headers: HashMap::new(),
            health_url: None,
            enabled: true,
        }
    }

    /// The per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Reject entries that could never connect.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.name.trim().is_empty() {
            return Err(invalid("server name must not be empty"));
        }
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&self.timeout) {
            return Err(invalid(format!(
                "server '{}': timeout {}s outside {MIN_TIMEOUT_SECS}..={MAX_TIMEOUT_SECS}",
                self.name, self.timeout
            )));
        }
        match self.transport {
            TransportKind::Stdio if is_blank(&self.command) => Err(invalid(format!(
                "server '{}': stdio transport requires 'command'",
                self.name
            ))),
            TransportKind::Http if is_blank(&self.url) => Err(invalid(format!(
                "server '{}': http transport requires 'url'",
                self.name
            ))),
            _ => Ok(()),
        }?;
        if let Some(rate) = self.rate_limit {
            if rate <= 0.0 {
                return Err(invalid(format!(
                    "server '{}': rateLimit must be positive",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    #[default]
    Exponential,
    Linear,
    Constant,
}

/// Retry behaviour of `Manager::execute_tool`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffPolicy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Top-level manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// MCP-discovered tools shadow native ones on name collisions.
    #[serde(default = "default_true", alias = "preferMCP")]
    pub prefer_mcp: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefer_mcp: true,
            max_concurrent: default_max_concurrent(),
            health_check_interval_seconds: default_health_interval(),
            retry: RetryConfig::default(),
            servers: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Validate the manager settings and every server entry.
    pub fn validate(&self) -> Result<(), McpError> {
        if !(MIN_CONCURRENT..=MAX_CONCURRENT).contains(&self.max_concurrent) {
            return Err(invalid(format!(
                "maxConcurrent {} outside {MIN_CONCURRENT}..={MAX_CONCURRENT}",
                self.max_concurrent
            )));
        }
        if self.health_check_interval_seconds < MIN_HEALTH_CHECK_INTERVAL_SECS {
            return Err(invalid(format!(
                "healthCheckIntervalSeconds {} below minimum {MIN_HEALTH_CHECK_INTERVAL_SECS}",
                self.health_check_interval_seconds
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.maxAttempts must be at least 1"));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(invalid("retry.maxDelayMs must not be below retry.initialDelayMs"));
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(invalid(format!("duplicate server name '{}'", server.name)));
            }
        }
        Ok(())
    }

    /// Health-check interval with the minimum applied.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(
            self.health_check_interval_seconds
                .max(MIN_HEALTH_CHECK_INTERVAL_SECS),
        )
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_concurrent() -> usize {
    10
}
fn default_health_interval() -> u64 {
    MIN_HEALTH_CHECK_INTERVAL_SECS
}

fn invalid(reason: impl Into<String>) -> McpError {
    McpError::InvalidConfig {
        reason: reason.into(),
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Read a config file, expand `${VAR}` references and deserialize it.
///
/// YAML is a superset of JSON, so both formats are accepted.
pub async fn read_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, McpError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| McpError::InvalidConfig {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
    parse_config(&raw)
}

/// Deserialize config text after env-var interpolation.
pub fn parse_config<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, McpError> {
    let interpolated = interpolate_env_vars(raw);
    serde_yaml::from_str(&interpolated).map_err(|e| McpError::InvalidConfig {
        reason: format!("failed to parse config: {e}"),
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
///
/// Unset variables without a default expand to the empty string.
pub fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand every value of a string map.
pub fn expand_map(values: &HashMap<String, String>) -> HashMap<String, String> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), interpolate_env_vars(v)))
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
