//! Session registry: named MCP sessions owned by the caller.
//!
//! Provides:
//! - Concurrent start-up of every configured server (partial startup is fine)
//! - Tool lookup by qualified name (`server__tool`)
//! - Routing of qualified tool calls to the owning session
//! - A text capability summary and a serialisable inspection report

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;

use super::config::McpServersConfig;
use super::errors::McpError;
use super::session::McpSession;
use super::types::{McpToolDefinition, SessionState, ToolCallResult};

/// Separator between server and tool in a qualified tool name.
pub const QUALIFIED_SEPARATOR: &str = "__";

/// `server__tool`.
pub fn qualify(server: &str, tool: &str) -> String {
    format!("{server}{QUALIFIED_SEPARATOR}{tool}")
}

/// Split `server__tool` at the first separator.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once(QUALIFIED_SEPARATOR)
        .filter(|(server, tool)| !server.is_empty() && !tool.is_empty())
}

/// A server name must survive the round trip through `server__tool`.
pub fn check_server_name(name: &str) -> Result<(), McpError> {
    if name.is_empty() || name.contains(QUALIFIED_SEPARATOR) {
        return Err(McpError::ConfigError {
            reason: format!(
                "server name '{name}' must be non-empty and must not contain '{QUALIFIED_SEPARATOR}'"
            ),
        });
    }
    Ok(())
}

// ─── SessionRegistry ─────────────────────────────────────────────────────────

/// Named sessions, one per MCP server.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Arc<McpSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every configured server concurrently.
    ///
    /// Servers that fail to start are returned alongside the registry rather
    /// than aborting the others.
    pub async fn start_all(config: &McpServersConfig) -> (Self, Vec<(String, McpError)>) {
        let mut errors = Vec::new();
        let mut starts = Vec::new();
        for (name, server) in &config.servers {
            if let Err(e) = check_server_name(name) {
                errors.push((name.clone(), e));
                continue;
            }
            let session = McpSession::new(name.clone(), server.clone());
            starts.push(async move {
                let result = session.start().await;
                (session, result)
            });
        }

        let mut registry = Self::new();
        for (session, result) in join_all(starts).await {
            match result {
                Ok(()) => {
                    registry
                        .sessions
                        .insert(session.name().to_string(), Arc::new(session));
                }
                Err(e) => errors.push((session.name().to_string(), e)),
            }
        }

        tracing::info!(
            started = registry.len(),
            failed = errors.len(),
            "MCP servers started"
        );
        (registry, errors)
    }

    /// Add a session under its own name, returning any session it replaced.
    ///
    /// Names containing the qualified-name separator are refused.
    pub fn insert(&mut self, session: McpSession) -> Result<Option<Arc<McpSession>>, McpError> {
        check_server_name(session.name())?;
        Ok(self
            .sessions
            .insert(session.name().to_string(), Arc::new(session)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<McpSession>> {
        self.sessions.get(name).cloned()
    }

    /// Detach a session. The caller decides whether to shut it down.
    pub fn remove(&mut self, name: &str) -> Option<Arc<McpSession>> {
        self.sessions.remove(name)
    }

    /// All server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Every tool of every session, keyed `server__tool`.
    pub fn all_tools(&self) -> BTreeMap<String, McpToolDefinition> {
        self.sessions
            .iter()
            .flat_map(|(server, session)| {
                session
                    .tools()
                    .values()
                    .map(|def| (qualify(server, &def.name), def.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Route a `server__tool` call to its session.
    pub async fn invoke(
        &self,
        qualified_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let (server, tool) = split_qualified(qualified_name).ok_or_else(|| McpError::UnknownTool {
            name: qualified_name.to_string(),
        })?;
        let session = self.get(server).ok_or_else(|| McpError::UnknownTool {
            name: qualified_name.to_string(),
        })?;
        session.invoke_tool(tool, arguments).await
    }

    /// Re-run discovery on every ready session.
    pub async fn rediscover_all(&self) -> Vec<(String, McpError)> {
        let runs = self
            .sessions
            .iter()
            .filter(|(_, session)| session.state() == SessionState::Ready)
            .map(|(name, session)| async move {
                (name.clone(), session.discover_capabilities().await)
            });

        join_all(runs)
            .await
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect()
    }

    /// Shut every session down and empty the registry.
    pub async fn shutdown_all(&mut self) {
        join_all(self.sessions.values().map(|session| session.shutdown())).await;
        self.sessions.clear();
    }

    // ─── Reporting ───────────────────────────────────────────────────────

    /// One line per server: state and tool names.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No MCP servers registered.".to_string();
        }

        let report = self.inspect();
        let mut summary = format!(
            "MCP capabilities: {} tools across {} servers ({} ready).",
            report.total_tools, report.total_servers, report.ready_servers
        );
        for server in &report.servers {
            let tools = if server.tools.is_empty() {
                "(no tools)".to_string()
            } else {
                server
                    .tools
                    .iter()
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            summary.push_str(&format!("\n{} [{}]: {tools}", server.name, server.state));
        }
        summary
    }

    /// Snapshot of every session for reports and debugging.
    pub fn inspect(&self) -> InspectionReport {
        let mut servers: Vec<ServerReport> = self
            .sessions
            .iter()
            .map(|(name, session)| ServerReport::from_session(name, session))
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));

        InspectionReport {
            total_servers: servers.len(),
            ready_servers: servers.iter().filter(|s| s.state == "ready").count(),
            total_tools: servers.iter().map(|s| s.tool_count).sum(),
            servers,
        }
    }
}

// ─── Inspection ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct InspectionReport {
    pub total_servers: usize,
    pub ready_servers: usize,
    pub total_tools: usize,
    pub servers: Vec<ServerReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub name: String,
    pub state: String,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub protocol_version: Option<String>,
    pub discovery_method: Option<String>,
    pub tool_count: usize,
    pub tools: Vec<ToolReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolReport {
    pub name: String,
    pub description: String,
    pub required_params: Vec<String>,
}

impl ServerReport {
    fn from_session(name: &str, session: &McpSession) -> Self {
        let info = session.server_info();
        let catalog = session.tools();
        let mut tools: Vec<ToolReport> = catalog
            .values()
            .map(|def| ToolReport {
                name: def.name.clone(),
                description: def.description.clone(),
                required_params: def.required_params().into_iter().map(String::from).collect(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            name: name.to_string(),
            state: session.state().to_string(),
            server_name: info
                .as_ref()
                .and_then(|i| i.server_info.as_ref())
                .and_then(|s| s.name.clone()),
            server_version: info
                .as_ref()
                .and_then(|i| i.server_info.as_ref())
                .and_then(|s| s.version.clone()),
            protocol_version: info.and_then(|i| i.protocol_version),
            discovery_method: session.discovery_method(),
            tool_count: tools.len(),
            tools,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
