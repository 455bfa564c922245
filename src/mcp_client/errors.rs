//! MCP Client error types.
//!
//! Every fallible operation in the client returns `McpError`. Variants carry
//! enough context (server name, raw line, JSON-RPC code) to build a useful
//! log entry at the point where the error is finally handled.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process could not be started.
    #[error("failed to launch server '{name}': {reason}")]
    LaunchError {
        name: String,
        reason: String,
    },

    /// The initialize handshake or the first discovery failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// I/O error while writing to or reading from the server pipes.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// A line from the server could not be decoded as a JSON-RPC message.
    #[error("malformed message: {reason}")]
    DecodeError {
        raw: String,
        reason: String,
    },

    /// The server answered a request with a JSON-RPC `error` object.
    #[error("server error [{code}]: {message}")]
    ProtocolError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not present in the session catalog.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// Tool call arguments are missing fields the input schema requires.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// The server went away while requests were outstanding, or was already
    /// gone when a request was attempted.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        reason: String,
    },

    /// A request did not complete within its deadline.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// Operation not allowed in the session's current state.
    #[error("session '{name}' is {state}, expected {expected}")]
    InvalidState {
        name: String,
        state: String,
        expected: String,
    },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Whether this error means the underlying connection is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, McpError::ConnectionLost { .. })
    }

    /// Whether a caller could reasonably retry the same call on a fresh session.
    ///
    /// Protocol errors, unknown tools and bad arguments fail the same way
    /// every time and are never retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            McpError::ConnectionLost { .. }
                | McpError::Timeout { .. }
                | McpError::TransportError { .. }
        )
    }

    pub(crate) fn connection_lost(reason: impl Into<String>) -> Self {
        McpError::ConnectionLost {
            reason: reason.into(),
        }
    }
}
