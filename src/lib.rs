//! Client side of the Model Context Protocol over stdio.
//!
//! Launches an MCP tool server as a child process, performs the handshake,
//! discovers its tools and invokes them concurrently. See [`mcp_client`].

pub mod mcp_client;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub use mcp_client::{
    McpError, McpServersConfig, McpSession, McpToolDefinition, ServerConfig, SessionRegistry,
    SessionState, ToolCallResult,
};

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "mcp-client.log";

/// Rotated generations kept next to the live log.
const LOG_GENERATIONS: u32 = 3;

/// Return the platform-standard data directory for agent-assert.
///
/// - macOS: `~/Library/Application Support/agent-assert/`
/// - Windows: `{FOLDERID_RoamingAppData}\agent-assert\`
/// - Linux: `$XDG_DATA_HOME/agent-assert/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.agent-assert/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("agent-assert");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent-assert")
}

/// Install a tracing subscriber that writes to `mcp-client.log`.
///
/// 1. Rotates existing logs (`mcp-client.log` → `.1` → `.2` → `.3`).
/// 2. Opens a fresh log with a line-flushing writer.
/// 3. Filters with `RUST_LOG`, defaulting to `agent_assert_mcp=info,warn`.
///
/// `log_dir` defaults to [`data_dir`]. Returns the log file path.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<PathBuf, McpError> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir.map(Path::to_path_buf).unwrap_or_else(data_dir);
    std::fs::create_dir_all(&log_dir).map_err(|e| McpError::ConfigError {
        reason: format!("failed to create log directory {}: {e}", log_dir.display()),
    })?;

    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, LOG_GENERATIONS);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| McpError::ConfigError {
            reason: format!("failed to open {}: {e}", log_path.display()),
        })?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agent_assert_mcp=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| McpError::ConfigError {
            reason: format!("tracing subscriber already installed: {e}"),
        })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "MCP client logging started"
    );
    Ok(log_path)
}

/// Rotate log files: `x.log` → `x.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// log lines survive a crash of the host process.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
