//! Server configuration loading.
//!
//! A config file maps server names to launch settings. JSON and YAML are both
//! accepted (chosen by file extension); `${VAR}` and `${VAR:-default}` are
//! expanded from the environment before parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::discovery::DiscoveryStrategy;
use super::errors::McpError;
use super::registry::check_server_name;
use super::types::{ClientInfo, DEFAULT_PROTOCOL_VERSION};

// ─── Defaults ────────────────────────────────────────────────────────────────

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}
fn default_init_timeout_ms() -> u64 {
    30_000
}
fn default_call_timeout_ms() -> Option<u64> {
    Some(30_000)
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_notification_buffer() -> usize {
    64
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// How to launch and talk to one MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the server process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub client_info: ClientInfo,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default)]
    pub discovery: DiscoveryStrategy,
    /// Deadline for the initialize handshake plus first discovery.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Per-call deadline for `tools/call`. `null` waits until teardown.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: Option<u64>,
    /// How long the server gets to exit after SIGTERM before it is killed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Capacity of the unsolicited-message channel.
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

impl ServerConfig {
    /// Config for an executable plus arguments, everything else default.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
            client_info: ClientInfo::default(),
            protocol_version: default_protocol_version(),
            discovery: DiscoveryStrategy::default(),
            init_timeout_ms: default_init_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            notification_buffer: default_notification_buffer(),
        }
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Top-level MCP servers configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    pub servers: HashMap<String, ServerConfig>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load a servers config from a `.json`, `.yaml` or `.yml` file.
pub fn load_servers_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let config = parse_servers_config(&raw, is_yaml)?;

    tracing::info!(
        path = %path.display(),
        server_count = config.servers.len(),
        "loaded MCP servers config"
    );
    Ok(config)
}

/// Parse config text after environment interpolation.
pub fn parse_servers_config(raw: &str, yaml: bool) -> Result<McpServersConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);

    let config: McpServersConfig = if yaml {
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse YAML config: {e}"),
        })?
    } else {
        serde_json::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse JSON config: {e}"),
        })?
    };

    for (name, server) in &config.servers {
        check_server_name(name)?;
        if server.command.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("server '{name}' has an empty command"),
            });
        }
        if let DiscoveryStrategy::FirstOf { methods } = &server.discovery {
            if methods.is_empty() {
                return Err(McpError::ConfigError {
                    reason: format!("server '{name}' has an empty discovery method list"),
                });
            }
        }
    }

    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
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

/// Resolve `VAR` or `VAR:-default`. Unset variables without a default
/// become the empty string.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => match std::env::var(name) {
            Ok(v) if !v.is_empty() => v,
            _ => default.to_string(),
        },
        None => std::env::var(expr).unwrap_or_default(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_minimal_json() {
        let json = r#"{"servers": {"chrome": {"command": "npx", "args": ["chrome-devtools-mcp@latest"]}}}"#;
        let config = parse_servers_config(json, false).unwrap();
        let chrome = &config.servers["chrome"];

        assert_eq!(chrome.command, "npx");
        assert_eq!(chrome.args, vec!["chrome-devtools-mcp@latest"]);
        assert_eq!(chrome.protocol_version, "2024-11-05");
        assert_eq!(chrome.discovery, DiscoveryStrategy::Standard);
        assert_eq!(chrome.init_timeout(), Duration::from_secs(30));
        assert_eq!(chrome.call_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(chrome.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(chrome.client_info, ClientInfo::default());
    }

    #[test]
    fn test_null_call_timeout_disables_deadline() {
        let json = r#"{"servers": {"s": {"command": "srv", "call_timeout_ms": null}}}"#;
        let config = parse_servers_config(json, false).unwrap();
        assert_eq!(config.servers["s"].call_timeout(), None);
    }

    #[test]
    fn test_yaml_with_first_of_discovery() {
        let yaml = r#"
servers:
  legacy:
    command: legacy-server
    discovery:
      kind: first_of
      methods: ["tools/list", "list_tools"]
    client_info:
      name: agent-assert
      version: "1.0.0"
"#;
        let config = parse_servers_config(yaml, true).unwrap();
        let legacy = &config.servers["legacy"];
        assert_eq!(
            legacy.discovery,
            DiscoveryStrategy::FirstOf {
                methods: vec!["tools/list".into(), "list_tools".into()]
            }
        );
        assert_eq!(legacy.client_info.name, "agent-assert");
    }

    #[test]
    fn test_rejects_empty_command_and_empty_method_list() {
        let empty_cmd = r#"{"servers": {"s": {"command": "  "}}}"#;
        assert!(matches!(
            parse_servers_config(empty_cmd, false),
            Err(McpError::ConfigError { .. })
        ));

        let empty_methods =
            r#"{"servers": {"s": {"command": "x", "discovery": {"kind": "first_of", "methods": []}}}}"#;
        assert!(matches!(
            parse_servers_config(empty_methods, false),
            Err(McpError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_rejects_server_name_with_separator() {
        let json = r#"{"servers": {"chrome__beta": {"command": "npx"}}}"#;
        match parse_servers_config(json, false) {
            Err(McpError::ConfigError { reason }) => assert!(reason.contains("chrome__beta")),
            other => panic!("expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn test_env_interpolation() {
        std::env::set_var("AGENT_ASSERT_MCP_TEST_CMD", "node");
        let json = r#"{"servers": {"s": {
            "command": "${AGENT_ASSERT_MCP_TEST_CMD}",
            "args": ["${AGENT_ASSERT_MCP_TEST_UNSET:-dist/index.js}"]
        }}}"#;
        let config = parse_servers_config(json, false).unwrap();
        assert_eq!(config.servers["s"].command, "node");
        assert_eq!(config.servers["s"].args, vec!["dist/index.js"]);
    }

    #[test]
    fn test_load_from_file_by_extension() {
        let tmp = TempDir::new().unwrap();
        let json_path = tmp.path().join("servers.json");
        std::fs::write(&json_path, r#"{"servers": {"a": {"command": "a-server"}}}"#).unwrap();
        let yml_path = tmp.path().join("servers.yml");
        std::fs::write(&yml_path, "servers:\n  b:\n    command: b-server\n").unwrap();

        assert!(load_servers_config(&json_path).unwrap().servers.contains_key("a"));
        assert!(load_servers_config(&yml_path).unwrap().servers.contains_key("b"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_servers_config(Path::new("/nonexistent/servers.json")).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_server_config_new() {
        let cfg = ServerConfig::new("sh", vec!["server.sh".into()]);
        assert_eq!(cfg.command, "sh");
        assert_eq!(cfg.notification_buffer, 64);
        assert!(cfg.env.is_empty());
    }
}
