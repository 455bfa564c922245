//! Scripted stand-in MCP server for process-level tests.
//!
//! Writes a POSIX `sh` script into a temp dir. The script logs every line it
//! receives, pulls out `$id` and `$tag` (from `arguments.tag`) and dispatches
//! on the method with one overridable shell snippet per method. Helpers
//! available to snippets: `reply <json>` and `call_result <id> <tag>`.

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use super::config::ServerConfig;

/// `tools/list` reply advertising a single `ping` tool.
pub(crate) const PING_TOOLS: &str = r#"reply "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"tools\":[{\"name\":\"ping\",\"description\":\"\",\"inputSchema\":{}}]}}""#;

const INITIALIZE_OK: &str = r#"reply "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{\"tools\":{}},\"serverInfo\":{\"name\":\"fake\",\"version\":\"0.1\"}}}""#;

const SCRIPT: &str = r##"log="$1"
reply() { printf '%s\n' "$1"; }
call_result() { reply "{\"jsonrpc\":\"2.0\",\"id\":$1,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"pong $2\"}]}}"; }
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$log"
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  tag=$(printf '%s\n' "$line" | sed -n 's/.*"tag":"\([^"]*\)".*/\1/p')
  case "$line" in
    @EXTRA@
    *'"method":"initialize"'*) @INITIALIZE@ ;;
    *'"method":"notifications/initialized"'*) @INITIALIZED@ ;;
    *'"method":"tools/list"'*) @TOOLS_LIST@ ;;
    *'"method":"tools/call"'*) @TOOLS_CALL@ ;;
    *) if [ -n "$id" ]; then reply "{\"jsonrpc\":\"2.0\",\"id\":$id,\"error\":{\"code\":-32601,\"message\":\"Method not found\"}}"; fi ;;
  esac
done
"##;

pub(crate) struct FakeServerBuilder {
    initialize: String,
    initialized: String,
    tools_list: String,
    tools_call: String,
    extra: String,
}

impl FakeServerBuilder {
    pub fn initialize(mut self, snippet: &str) -> Self {
        self.initialize = snippet.to_string();
        self
    }

    pub fn initialized(mut self, snippet: &str) -> Self {
        self.initialized = snippet.to_string();
        self
    }

    pub fn tools_list(mut self, snippet: &str) -> Self {
        self.tools_list = snippet.to_string();
        self
    }

    pub fn tools_call(mut self, snippet: &str) -> Self {
        self.tools_call = snippet.to_string();
        self
    }

    /// A complete `pattern) commands ;;` arm, matched before the built-ins.
    pub fn extra_case(mut self, arm: &str) -> Self {
        self.extra.push_str(arm);
        self.extra.push('\n');
        self
    }

    pub fn write(self) -> FakeServer {
        let dir = TempDir::new().unwrap();
        let script = SCRIPT
            .replace("@EXTRA@", &self.extra)
            .replace("@INITIALIZE@", &self.initialize)
            .replace("@INITIALIZED@", &self.initialized)
            .replace("@TOOLS_LIST@", &self.tools_list)
            .replace("@TOOLS_CALL@", &self.tools_call);

        let script_path = dir.path().join("server.sh");
        std::fs::write(&script_path, script).unwrap();
        let log_path = dir.path().join("received.log");
        std::fs::write(&log_path, "").unwrap();

        FakeServer {
            _dir: dir,
            script_path,
            log_path,
        }
    }
}

pub(crate) struct FakeServer {
    _dir: TempDir,
    script_path: PathBuf,
    log_path: PathBuf,
}

impl FakeServer {
    pub fn builder() -> FakeServerBuilder {
        FakeServerBuilder {
            initialize: INITIALIZE_OK.to_string(),
            initialized: ":".to_string(),
            tools_list: PING_TOOLS.to_string(),
            tools_call: r#"call_result "$id" "$tag""#.to_string(),
            extra: String::new(),
        }
    }

    /// Launch config for this script with short test timeouts.
    pub fn config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(
            "sh",
            vec![
                self.script_path.display().to_string(),
                self.log_path.display().to_string(),
            ],
        );
        config.init_timeout_ms = 10_000;
        config.call_timeout_ms = Some(10_000);
        config.shutdown_grace_ms = 1_000;
        config
    }

    /// Every line the server has read so far.
    pub fn received(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log_path)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    /// Poll the receive log until a line containing `needle` shows up.
    pub async fn wait_for_line(&self, needle: &str) {
        for _ in 0..250 {
            if self.received().iter().any(|l| l.contains(needle)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("server never received a line containing {needle:?}");
    }
}
