//! Tool discovery strategy and response parsing.
//!
//! The strategy is chosen once in config. `FirstOf` tries its candidate
//! methods in order during session start only; whichever answers first is
//! locked in, and later re-discovery uses that method alone so real errors
//! are never hidden behind "try the next one".

use serde::Deserialize;
use serde_json::Value;

use super::errors::McpError;
use super::types::{McpToolDefinition, ToolCatalog};

/// Standard MCP discovery method.
pub const TOOLS_LIST: &str = "tools/list";

/// Upper bound on `nextCursor` pages followed in one discovery.
pub const MAX_DISCOVERY_PAGES: usize = 64;

/// Which request lists the server's tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    /// `tools/list`.
    #[default]
    Standard,
    /// One fixed method name.
    Method { method: String },
    /// Candidates tried in order at start-up.
    FirstOf { methods: Vec<String> },
}

impl DiscoveryStrategy {
    /// Methods to try at start-up, in order.
    pub fn candidates(&self) -> Vec<&str> {
        match self {
            DiscoveryStrategy::Standard => vec![TOOLS_LIST],
            DiscoveryStrategy::Method { method } => vec![method.as_str()],
            DiscoveryStrategy::FirstOf { methods } => methods.iter().map(String::as_str).collect(),
        }
    }
}

/// One page of a discovery response.
#[derive(Debug, Default)]
pub struct ToolPage {
    pub tools: Vec<McpToolDefinition>,
    pub next_cursor: Option<String>,
}

/// Parse a discovery result: `{"tools": [...], "nextCursor"?: ..}` or a bare
/// array of tools.
pub fn parse_tool_page(result: Value) -> Result<ToolPage, McpError> {
    let (tools, next_cursor) = match result {
        Value::Array(items) => (items, None),
        Value::Object(mut obj) => {
            let next_cursor = obj
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(String::from);
            match obj.remove("tools") {
                Some(Value::Array(items)) => (items, next_cursor),
                Some(other) => return Err(malformed(format!("'tools' is not an array: {other}"))),
                None => return Err(malformed("result has no 'tools' member".to_string())),
            }
        }
        other => return Err(malformed(format!("unexpected discovery result: {other}"))),
    };

    let tools = tools
        .into_iter()
        .map(|item| {
            serde_json::from_value::<McpToolDefinition>(item)
                .map_err(|e| malformed(format!("bad tool definition: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ToolPage { tools, next_cursor })
}

/// Fold discovered tools into a fresh catalog. Later duplicates win.
pub fn build_catalog(server_name: &str, tools: Vec<McpToolDefinition>) -> ToolCatalog {
    let mut catalog = ToolCatalog::with_capacity(tools.len());
    for tool in tools {
        if let Some(previous) = catalog.insert(tool.name.clone(), tool) {
            tracing::warn!(
                server = server_name,
                tool = %previous.name,
                "server advertised the same tool twice, keeping the last definition"
            );
        }
    }
    catalog
}

fn malformed(message: String) -> McpError {
    McpError::ProtocolError {
        code: super::types::error_codes::INVALID_REQUEST,
        message,
        data: None,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
