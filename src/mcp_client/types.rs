//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures and the session
//! state enum.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC protocol version tag carried by every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 error object.
///
/// Servers are only required to send `message`; `code` defaults to 0 when
/// absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP protocol revision sent in the `initialize` request.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// A tool advertised by the server during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `{}` when the server omits it or sends `null`.
    #[serde(
        default = "empty_schema",
        deserialize_with = "schema_or_empty",
        rename = "inputSchema",
        alias = "input_schema"
    )]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn schema_or_empty<'de, D>(deserializer: D) -> Result<serde_json::Value, D::Error>
where
    D: Deserializer<'de>,
{
    let schema = serde_json::Value::deserialize(deserializer)?;
    Ok(if schema.is_null() { empty_schema() } else { schema })
}

impl McpToolDefinition {
    /// Names listed in the schema's top-level `required` array.
    pub fn required_params(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Session catalog: tool name → definition.
///
/// Always handed out behind an `Arc` and replaced wholesale on re-discovery.
pub type ToolCatalog = HashMap<String, McpToolDefinition>;

/// Identity the client announces in `initialize`.
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

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Result of a tool call execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    /// The raw `result` member of the server's response.
    pub result: serde_json::Value,
    /// MCP `isError` flag: the tool ran but reported a failure.
    pub is_error: bool,
    pub execution_time_ms: u64,
}

/// A message the server sent on its own initiative (no pending request).
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    Request {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
}

// ─── Session State ───────────────────────────────────────────────────────────

/// Lifecycle of a session. See `McpSession` for the transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Starting,
    Initializing,
    Ready,
    ShuttingDown,
    Stopped,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unstarted => "unstarted",
            SessionState::Starting => "starting",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::ShuttingDown => "shutting down",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

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
}

// ─── Tests ───────────────────────────────────────────────────────────────────
