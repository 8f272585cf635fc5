//! Client-side orchestration of tools served by MCP servers.
//!
//! [`framework::Framework`] is the entry point: it reads one config file,
//! connects every server, and exposes an [`invoker::Invoker`] that gates each
//! call behind RBAC, budgets, approval and an audit trail.

pub mod framework;
pub mod invoker;
pub mod mcp_client;
pub mod policy;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub use framework::{Framework, FrameworkConfig};
pub use mcp_client::McpError;

/// Log files kept besides the current one.
const LOG_FILES_KEPT: u32 = 3;

/// Platform data directory for the orchestrator.
///
/// - Linux: `$XDG_DATA_HOME/mcp-orchestrator/` (fallback `~/.local/share/...`)
/// - macOS: `~/Library/Application Support/mcp-orchestrator/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-orchestrator\`
///
/// Falls back to `~/.mcp-orchestrator/`, then the working directory.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-orchestrator");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-orchestrator")
}

/// Install the global tracing subscriber, writing to `orchestrator.log` in
/// `log_dir`.
///
/// Previous logs are shifted (`orchestrator.log` → `.1` → `.2` → `.3`) first.
/// `RUST_LOG` overrides the default filter. With `json` set, each line is a
/// JSON object instead of the plain format.
pub fn init_tracing(log_dir: &Path, json: bool) -> io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("orchestrator.log");
    rotate_log_file(&log_path, LOG_FILES_KEPT);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let writer = FlushingWriter::new(log_file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_orchestrator=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| io::Error::other(format!("tracing already initialized: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "mcp-orchestrator logging started"
    );
    Ok(log_path)
}

/// Shift `base` → `base.1` → … → `base.{keep}`; the oldest is deleted.
/// Gaps in the chain are skipped.
fn rotate_log_file(base: &Path, keep: u32) {
    let numbered = |i: u32| PathBuf::from(format!("{}.{i}", base.display()));

    let _ = std::fs::remove_file(numbered(keep));
    for i in (1..keep).rev() {
        let _ = std::fs::rename(numbered(i), numbered(i + 1));
    }
    if base.exists() {
        let _ = std::fs::rename(base, numbered(1));
    }
}

/// File writer that flushes after every write so lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, std::fs::File>> {
        self.file
            .lock()
            .map_err(|e| io::Error::other(format!("log writer lock poisoned: {e}")))
    }
}

impl io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.lock()?;
        let n = file.write(buf)?;
        file.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
