//! Line-delimited stdio transport.
//!
//! Owns one MCP server child process:
//! - Writing newline-terminated frames to stdin (serialized across callers)
//! - Reading newline-terminated frames from stdout
//! - Draining stderr for diagnostics (never parsed as protocol data)
//! - Terminating the process: close stdin, SIGTERM, grace period, kill

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, MutexGuard};

use super::errors::McpError;

/// How many stderr lines are kept for error reports.
const STDERR_TAIL_LINES: usize = 40;

/// What a launched process looks like.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub env: Option<&'a HashMap<String, String>>,
    pub cwd: Option<&'a Path>,
}

/// Result of one `read_line` call.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One line with its terminator stripped.
    Line(Vec<u8>),
    /// stdout is closed. Returned again on every later call.
    EndOfStream,
}

struct LineReader {
    stdout: BufReader<ChildStdout>,
    at_eof: bool,
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional newline-delimited transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    pid: Option<u32>,
    writer: Mutex<Option<ChildStdin>>,
    reader: Mutex<LineReader>,
    process: Mutex<Child>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
}

impl StdioTransport {
    /// Spawn the server with piped stdio.
    pub fn start(server_name: &str, spec: &LaunchSpec<'_>) -> Result<Self, McpError> {
        let mut cmd = Command::new(spec.command);
        cmd.args(spec.args);

        if let Some(env) = spec.env {
            for (key, value) in env {
                cmd.env(key, value);
            }
        }
        if let Some(dir) = spec.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::LaunchError {
            name: server_name.to_string(),
            reason: format!("{}: {e}", spec.command),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::LaunchError {
            name: server_name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::LaunchError {
            name: server_name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = Arc::new(StdMutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(server_name.to_string(), stderr, stderr_tail.clone());
        }

        let pid = child.id();
        tracing::info!(
            server = server_name,
            command = spec.command,
            pid = ?pid,
            "spawned MCP server"
        );

        Ok(Self {
            server_name: server_name.to_string(),
            pid,
            writer: Mutex::new(Some(stdin)),
            reader: Mutex::new(LineReader {
                stdout: BufReader::new(stdout),
                at_eof: false,
            }),
            process: Mutex::new(child),
            stderr_tail,
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// OS process id, if the process was running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write one frame, appending the newline if the caller did not.
    ///
    /// Holding the writer lock across the write and the flush keeps frames
    /// from concurrent callers whole on the wire. If the future is dropped
    /// after part of the frame went out, stdin is closed: the stream cannot
    /// be resynchronised after a torn line.
    pub async fn write_line(&self, frame: &[u8]) -> Result<(), McpError> {
        let mut frame = Cow::Borrowed(frame);
        if frame.last() != Some(&b'\n') {
            frame.to_mut().push(b'\n');
        }

        let mut slot = self.writer.lock().await;
        let mut pending = PartialFrame {
            slot: &mut slot,
            server_name: &self.server_name,
            written: 0,
            len: frame.len(),
        };

        while pending.written < pending.len {
            let writer = pending.slot.as_mut().ok_or_else(|| McpError::TransportError {
                server: self.server_name.clone(),
                reason: "stdin already closed".into(),
            })?;
            let n = writer
                .write(&frame[pending.written..])
                .await
                .map_err(|e| self.io_error("failed to write to stdin", e))?;
            if n == 0 {
                return Err(self.io_error(
                    "failed to write to stdin",
                    std::io::ErrorKind::WriteZero.into(),
                ));
            }
            pending.written += n;
        }

        if let Some(writer) = pending.slot.as_mut() {
            writer
                .flush()
                .await
                .map_err(|e| self.io_error("failed to flush stdin", e))?;
        }
        Ok(())
    }

    /// Suspend until a full line, end of stream, or an I/O error.
    ///
    /// A final unterminated line before EOF is still returned as a line.
    pub async fn read_line(&self) -> Result<ReadOutcome, McpError> {
        let mut reader = self.reader.lock().await;
        if reader.at_eof {
            return Ok(ReadOutcome::EndOfStream);
        }

        let mut buf = Vec::new();
        let n = reader
            .stdout
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| self.io_error("failed to read from stdout", e))?;

        if n == 0 {
            reader.at_eof = true;
            return Ok(ReadOutcome::EndOfStream);
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        Ok(ReadOutcome::Line(buf))
    }

    /// Close stdin. Well-behaved servers exit when their input ends.
    pub async fn close_stdin(&self) {
        if self.writer.lock().await.take().is_some() {
            tracing::debug!(server = %self.server_name, "closed server stdin");
        }
    }

    /// Close stdin unless a writer currently holds it.
    ///
    /// A writer blocked on a full pipe is released by the process exiting.
    fn try_close_stdin(&self) {
        match self.writer.try_lock() {
            Ok(mut slot) => {
                if slot.take().is_some() {
                    tracing::debug!(server = %self.server_name, "closed server stdin");
                }
            }
            Err(_) => {
                tracing::debug!(server = %self.server_name, "stdin busy, terminating without closing it");
            }
        }
    }

    /// Best-effort graceful shutdown.
    ///
    /// Closes stdin, asks the process to terminate, waits up to `grace` and
    /// then kills it. Safe to call more than once.
    pub async fn terminate(&self, grace: Duration) -> Option<ExitStatus> {
        self.try_close_stdin();

        let mut child = self.process.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }

        send_terminate(&child);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.server_name, %status, "server exited");
                Some(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.server_name, error = %e, "failed to wait for server");
                let _ = child.kill().await;
                None
            }
            Err(_) => {
                tracing::warn!(
                    server = %self.server_name,
                    grace_ms = grace.as_millis() as u64,
                    "server ignored termination, killing"
                );
                // kill() also reaps the process.
                let _ = child.kill().await;
                child.try_wait().ok().flatten()
            }
        }
    }

    /// Synchronous last-resort kill, for use from `Drop`.
    pub fn start_kill(&self) {
        if let Ok(mut child) = self.process.try_lock() {
            let _ = child.start_kill();
        }
    }

    /// Whether the child is still running.
    pub async fn is_alive(&self) -> bool {
        matches!(self.process.lock().await.try_wait(), Ok(None))
    }

    /// The most recent stderr lines, oldest first.
    pub fn stderr_tail(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    fn io_error(&self, what: &str, e: std::io::Error) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("{what}: {e}"),
        }
    }
}

/// The in-flight part of a `write_line` call.
struct PartialFrame<'a, 'b> {
    slot: &'a mut MutexGuard<'b, Option<ChildStdin>>,
    server_name: &'a str,
    written: usize,
    len: usize,
}

impl Drop for PartialFrame<'_, '_> {
    fn drop(&mut self) {
        if self.written > 0 && self.written < self.len && self.slot.take().is_some() {
            tracing::warn!(
                server = %self.server_name,
                written = self.written,
                len = self.len,
                "frame write interrupted, closed server stdin"
            );
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we own and have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

/// Keep reading stderr so the server never blocks on a full pipe.
fn spawn_stderr_drain(
    server_name: String,
    stderr: ChildStderr,
    tail: Arc<StdMutex<VecDeque<String>>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(
                        target: "agent_assert_mcp::stderr",
                        server = %server_name,
                        "{line}"
                    );
                    let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server_name, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    });
}

// ─── Tests ───────────────────────────────────────────────────────────────────
