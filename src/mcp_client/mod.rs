//! MCP client: JSON-RPC 2.0 over a child process's stdio.
//!
//! This module handles:
//! - Spawning an MCP server and owning its stdin/stdout/stderr
//! - Newline-delimited JSON-RPC framing
//! - Correlating concurrent requests with out-of-order responses
//! - The initialize handshake and tool discovery
//! - Tool calls, timeouts and teardown
//!
//! `McpSession` is the entry point for a single server; `SessionRegistry`
//! manages several under qualified `server__tool` names.

pub mod codec;
pub mod config;
pub mod correlator;
pub mod discovery;
pub mod errors;
pub mod reader;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(all(test, unix))]
mod test_support;

// Re-exports for convenience
pub use config::{load_servers_config, McpServersConfig, ServerConfig};
pub use discovery::DiscoveryStrategy;
pub use errors::McpError;
pub use registry::{InspectionReport, SessionRegistry};
pub use session::McpSession;
pub use types::{
    ClientInfo, McpToolDefinition, ServerMessage, SessionState, ToolCallResult, ToolCatalog,
};
