//! MCP session: one server process and its tool catalog.
//!
//! Composes the transport, correlator and reader loop and drives them
//! through the session lifecycle:
//!
//! ```text
//! Unstarted → Starting → Initializing → Ready → ShuttingDown → Stopped
//!                 └───────────┴───────────┴──→ Failed
//! ```
//!
//! `Starting` spawns the process and the reader loop, `Initializing` runs
//! `initialize` / `notifications/initialized` and the first discovery.
//! Any failure on the way to `Ready` tears everything down before `start`
//! returns. Once `Ready`, any number of callers may `invoke_tool`
//! concurrently through a shared `&McpSession` (typically an `Arc`).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::codec;
use super::config::ServerConfig;
use super::correlator::Correlator;
use super::discovery::{self, MAX_DISCOVERY_PAGES, TOOLS_LIST};
use super::errors::McpError;
use super::reader::{ExitHook, ExitReason, ReaderLoop};
use super::transport::{LaunchSpec, StdioTransport};
use super::types::{
    InitializeResult, McpToolDefinition, ServerMessage, SessionState, ToolCallResult, ToolCatalog,
};

// ─── Constants ───────────────────────────────────────────────────────────────

const INITIALIZE: &str = "initialize";
const INITIALIZED: &str = "notifications/initialized";
const TOOLS_CALL: &str = "tools/call";

/// How long teardown waits for the reader loop after terminating the process.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live pieces of a started session.
struct Connection {
    transport: Arc<StdioTransport>,
    correlator: Arc<Correlator>,
}

/// Removes a request from the correlator if its caller stops waiting.
///
/// Covers both our own timeouts and callers that drop the future.
struct InFlight<'a> {
    correlator: &'a Correlator,
    id: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // No-op when the request already completed.
        self.correlator.cancel(self.id);
    }
}

// ─── McpSession ──────────────────────────────────────────────────────────────

/// A client session with one MCP server over stdio.
pub struct McpSession {
    name: String,
    config: ServerConfig,
    state: Arc<Mutex<SessionState>>,
    /// Why the connection went away, once it has.
    lost_reason: Arc<Mutex<Option<String>>>,
    live: Mutex<Option<Arc<Connection>>>,
    reader: tokio::sync::Mutex<Option<ReaderLoop>>,
    /// Serializes start, shutdown and re-discovery.
    lifecycle: tokio::sync::Mutex<()>,
    catalog: RwLock<Arc<ToolCatalog>>,
    discovery_method: Mutex<Option<String>>,
    server_info: Mutex<Option<InitializeResult>>,
    notifications: Mutex<Option<mpsc::Receiver<ServerMessage>>>,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl McpSession {
    /// Create an unstarted session.
    pub fn new(name: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(Mutex::new(SessionState::Unstarted)),
            lost_reason: Arc::new(Mutex::new(None)),
            live: Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            catalog: RwLock::new(Arc::new(ToolCatalog::new())),
            discovery_method: Mutex::new(None),
            server_info: Mutex::new(None),
            notifications: Mutex::new(None),
        }
    }

    /// Create and start a session in one step.
    pub async fn connect(name: impl Into<String>, config: ServerConfig) -> Result<Self, McpError> {
        let session = Self::new(name, config);
        session.start().await?;
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// The server's `initialize` result, once the handshake has completed.
    pub fn server_info(&self) -> Option<InitializeResult> {
        lock(&self.server_info).clone()
    }

    /// OS pid of the server process while the session is live.
    pub fn server_pid(&self) -> Option<u32> {
        self.connection().and_then(|c| c.transport.pid())
    }

    /// The current tool catalog. Never observed half-updated.
    pub fn tools(&self) -> Arc<ToolCatalog> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_tool(&self, name: &str) -> Option<McpToolDefinition> {
        self.tools().get(name).cloned()
    }

    /// Discovery method locked in during start.
    pub fn discovery_method(&self) -> Option<String> {
        lock(&self.discovery_method).clone()
    }

    /// Unsolicited server messages. Available once per start.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<ServerMessage>> {
        lock(&self.notifications).take()
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        lock(&self.live).clone()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        let previous = *state;
        tracing::debug!(server = %self.name, from = %previous, to = %next, "session state");
        *state = next;
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Launch the server, run the handshake and discover tools.
    ///
    /// On failure the process and reader loop are gone before this returns
    /// and the session is `Failed`.
    pub async fn start(&self) -> Result<(), McpError> {
        let _guard = self.lifecycle.lock().await;
        {
            let mut state = lock(&self.state);
            if *state != SessionState::Unstarted {
                return Err(McpError::InvalidState {
                    name: self.name.clone(),
                    state: state.to_string(),
                    expected: SessionState::Unstarted.to_string(),
                });
            }
            *state = SessionState::Starting;
        }

        match self.start_inner().await.and_then(|()| self.mark_ready()) {
            Ok(()) => {
                tracing::info!(
                    server = %self.name,
                    tools = self.tools().len(),
                    "MCP session ready"
                );
                Ok(())
            }
            Err(e) => {
                let conn = self.connection();
                self.teardown("initialization failed").await;
                self.set_state(SessionState::Failed);

                let stderr = conn.map(|c| c.transport.stderr_tail()).unwrap_or_default();
                let err = match e {
                    e @ McpError::LaunchError { .. } => e,
                    McpError::InitFailed { name, reason } => McpError::InitFailed {
                        name,
                        reason: format!("{reason}{}", format_stderr_suffix(&stderr)),
                    },
                    other => McpError::InitFailed {
                        name: self.name.clone(),
                        reason: format!("{other}{}", format_stderr_suffix(&stderr)),
                    },
                };
                tracing::warn!(server = %self.name, error = %err, "MCP session failed to start");
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), McpError> {
        let spec = LaunchSpec {
            command: &self.config.command,
            args: &self.config.args,
            env: Some(&self.config.env),
            cwd: self.config.cwd.as_deref(),
        };
        let transport = Arc::new(StdioTransport::start(&self.name, &spec)?);
        let correlator = Arc::new(Correlator::new());

        let (tx, rx) = mpsc::channel(self.config.notification_buffer.max(1));
        *lock(&self.notifications) = Some(rx);

        let reader = ReaderLoop::spawn(
            transport.clone(),
            correlator.clone(),
            Some(tx),
            Some(self.exit_hook()),
        );
        *self.reader.lock().await = Some(reader);

        let conn = Arc::new(Connection {
            transport,
            correlator,
        });
        *lock(&self.live) = Some(conn.clone());

        self.set_state(SessionState::Initializing);

        match tokio::time::timeout(self.config.init_timeout(), self.initialize(&conn)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::InitFailed {
                name: self.name.clone(),
                reason: format!(
                    "initialization timed out after {}ms",
                    self.config.init_timeout_ms
                ),
            }),
        }
    }

    /// `Initializing → Ready`, unless the connection died in the meantime.
    fn mark_ready(&self) -> Result<(), McpError> {
        let mut state = lock(&self.state);
        if *state != SessionState::Initializing {
            let reason = lock(&self.lost_reason)
                .clone()
                .unwrap_or_else(|| format!("session is {}", *state));
            return Err(McpError::ConnectionLost { reason });
        }
        *state = SessionState::Ready;
        Ok(())
    }

    /// Marks the session failed when the stream dies under a live session.
    fn exit_hook(&self) -> ExitHook {
        let state = self.state.clone();
        let lost_reason = self.lost_reason.clone();
        let name = self.name.clone();
        Box::new(move |reason: &ExitReason| {
            lock(&lost_reason).get_or_insert_with(|| reason.describe());
            let mut state = lock(&state);
            if matches!(
                *state,
                SessionState::Starting | SessionState::Initializing | SessionState::Ready
            ) {
                if *reason != ExitReason::Stopped {
                    tracing::warn!(server = %name, reason = %reason.describe(), "MCP server connection lost");
                }
                *state = SessionState::Failed;
            }
        })
    }

    /// `initialize` → `notifications/initialized` → first discovery.
    async fn initialize(&self, conn: &Connection) -> Result<(), McpError> {
        let params = json!({
            "protocolVersion": self.config.protocol_version,
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": self.config.client_info.name,
                "version": self.config.client_info.version,
            },
        });
        let result = self.request(conn, INITIALIZE, Some(params), None).await?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: self.name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        if let Some(version) = init.protocol_version.as_deref() {
            if version != self.config.protocol_version {
                tracing::warn!(
                    server = %self.name,
                    requested = %self.config.protocol_version,
                    negotiated = version,
                    "server negotiated a different protocol version"
                );
            }
        }
        *lock(&self.server_info) = Some(init);

        conn.transport
            .write_line(&codec::encode_notification(INITIALIZED, None))
            .await?;

        let catalog = self.select_discovery(conn).await?;
        self.install_catalog(catalog);
        Ok(())
    }

    /// Try each configured discovery method once; lock in the first that works.
    async fn select_discovery(&self, conn: &Connection) -> Result<ToolCatalog, McpError> {
        let candidates = self.config.discovery.candidates();
        let mut last_err = None;

        for method in candidates {
            match self.fetch_catalog(conn, method, None).await {
                Ok(catalog) => {
                    *lock(&self.discovery_method) = Some(method.to_string());
                    return Ok(catalog);
                }
                // Only a protocol-level refusal means "try the next method".
                Err(e @ McpError::ProtocolError { .. }) => {
                    tracing::debug!(server = %self.name, method, error = %e, "discovery method rejected");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| McpError::InitFailed {
            name: self.name.clone(),
            reason: "no discovery method configured".into(),
        }))
    }

    /// Run one discovery method to completion, following pagination.
    async fn fetch_catalog(
        &self,
        conn: &Connection,
        method: &str,
        timeout: Option<Duration>,
    ) -> Result<ToolCatalog, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for page_no in 0..MAX_DISCOVERY_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.request(conn, method, params, timeout).await?;
            let page = discovery::parse_tool_page(result)?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if page_no + 1 < MAX_DISCOVERY_PAGES => cursor = Some(next),
                Some(_) => {
                    tracing::warn!(
                        server = %self.name,
                        pages = MAX_DISCOVERY_PAGES,
                        "discovery page limit reached, catalog may be incomplete"
                    );
                    break;
                }
                None => break,
            }
        }

        Ok(discovery::build_catalog(&self.name, tools))
    }

    fn install_catalog(&self, catalog: ToolCatalog) -> Arc<ToolCatalog> {
        let catalog = Arc::new(catalog);
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = catalog.clone();
        catalog
    }

    /// Tear the session down: fail pending calls, terminate the server,
    /// join the reader loop. Idempotent.
    pub async fn shutdown(&self) {
        // Wake anything blocked in start() so the lifecycle lock frees up.
        if let Some(conn) = self.connection() {
            conn.correlator.fail_all("session shut down");
        }

        let _guard = self.lifecycle.lock().await;
        {
            let mut state = lock(&self.state);
            match *state {
                SessionState::Stopped => return,
                SessionState::Unstarted => {
                    *state = SessionState::Stopped;
                    return;
                }
                _ => *state = SessionState::ShuttingDown,
            }
        }

        self.teardown("session shut down").await;
        self.set_state(SessionState::Stopped);
        tracing::info!(server = %self.name, "MCP session stopped");
    }

    async fn teardown(&self, reason: &str) {
        let conn = lock(&self.live).take();
        let reader = self.reader.lock().await.take();
        lock(&self.lost_reason).get_or_insert_with(|| reason.to_string());

        if let Some(conn) = &conn {
            let failed = conn.correlator.fail_all(reason);
            if failed > 0 {
                tracing::info!(server = %self.name, failed, "failed outstanding requests");
            }
        }
        if let Some(reader) = &reader {
            reader.stop();
        }
        if let Some(conn) = &conn {
            conn.transport.terminate(self.config.shutdown_grace()).await;
        }
        if let Some(reader) = reader {
            reader.join(READER_JOIN_TIMEOUT).await;
        }
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send one request and wait for its response.
    async fn request(
        &self,
        conn: &Connection,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, McpError> {
        let call = conn.correlator.register()?;
        let guard = InFlight {
            correlator: &conn.correlator,
            id: call.id(),
        };

        let id = guard.id;
        let exchange = async {
            let frame = codec::encode_request(id, method, params.as_ref());
            if let Err(e) = conn.transport.write_line(&frame).await {
                // A broken pipe usually means the server is gone.
                return Err(match conn.correlator.closed_reason() {
                    Some(reason) => McpError::ConnectionLost { reason },
                    None => e,
                });
            }
            tracing::debug!(server = %self.name, id, method, "sent request");
            call.wait().await
        };

        // The deadline covers the write too: a server that stops reading
        // can block it indefinitely.
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(server = %self.name, id, method, "request timed out");
                    Err(McpError::Timeout {
                        method: method.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => exchange.await,
        };
        drop(guard);
        outcome
    }

    /// The live connection, if tool traffic is currently allowed.
    fn ready_connection(&self) -> Result<Arc<Connection>, McpError> {
        let state = self.state();
        match state {
            SessionState::Ready => self
                .connection()
                .ok_or_else(|| McpError::connection_lost("session has no connection")),
            SessionState::Failed | SessionState::ShuttingDown | SessionState::Stopped => {
                let reason = lock(&self.lost_reason)
                    .clone()
                    .unwrap_or_else(|| format!("session is {state}"));
                Err(McpError::ConnectionLost { reason })
            }
            SessionState::Unstarted | SessionState::Starting | SessionState::Initializing => {
                Err(McpError::InvalidState {
                    name: self.name.clone(),
                    state: state.to_string(),
                    expected: SessionState::Ready.to_string(),
                })
            }
        }
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// Re-run discovery and replace the catalog wholesale.
    ///
    /// On failure the previous catalog is left untouched.
    pub async fn discover_capabilities(&self) -> Result<Arc<ToolCatalog>, McpError> {
        let _guard = self.lifecycle.lock().await;
        let conn = self.ready_connection()?;
        let method = self
            .discovery_method()
            .unwrap_or_else(|| TOOLS_LIST.to_string());

        let catalog = self
            .fetch_catalog(&conn, &method, self.config.call_timeout())
            .await?;
        tracing::info!(server = %self.name, method = %method, tools = catalog.len(), "tools rediscovered");
        Ok(self.install_catalog(catalog))
    }

    /// Call a tool with the configured per-call timeout.
    pub async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        self.invoke(name, arguments, self.config.call_timeout()).await
    }

    /// Call a tool with an explicit deadline.
    ///
    /// On expiry the local waiter is dropped; the server may still finish
    /// the call and its late response is discarded.
    pub async fn invoke_tool_with_timeout(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolCallResult, McpError> {
        self.invoke(name, arguments, Some(timeout)).await
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<ToolCallResult, McpError> {
        let conn = self.ready_connection()?;

        let catalog = self.tools();
        let tool = catalog.get(name).ok_or_else(|| McpError::UnknownTool {
            name: name.to_string(),
        })?;
        let arguments = validate_arguments(tool, arguments)?;

        let start = Instant::now();
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.request(&conn, TOOLS_CALL, Some(params), timeout).await?;
        let elapsed = start.elapsed().as_millis() as u64;

        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        tracing::debug!(server = %self.name, tool = name, elapsed_ms = elapsed, is_error, "tool call finished");

        Ok(ToolCallResult {
            tool_name: name.to_string(),
            result,
            is_error,
            execution_time_ms: elapsed,
        })
    }
}

impl Drop for McpSession {
    fn drop(&mut self) {
        let live = self
            .live
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = live {
            conn.correlator.fail_all("session dropped");
            conn.transport.start_kill();
        }
        if let Some(reader) = self.reader.get_mut().take() {
            reader.stop();
        }
    }
}

/// Check `arguments` against the tool's `required` list.
///
/// `null` is treated as an empty argument object; anything else must be an
/// object. Full JSON Schema validation is left to the server.
fn validate_arguments(tool: &McpToolDefinition, arguments: Value) -> Result<Value, McpError> {
    let arguments = match arguments {
        Value::Null => Value::Object(Default::default()),
        obj @ Value::Object(_) => obj,
        other => {
            return Err(McpError::InvalidArguments {
                tool: tool.name.clone(),
                reason: format!("arguments must be an object, got {other}"),
            })
        }
    };

    for field in tool.required_params() {
        if arguments.get(field).is_none() {
            return Err(McpError::InvalidArguments {
                tool: tool.name.clone(),
                reason: format!("missing required field: '{field}'"),
            });
        }
    }
    Ok(arguments)
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
