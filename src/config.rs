//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SANDBOXD_LISTEN`, `SANDBOXD_SANDBOX_ID`,
//!    `SANDBOXD_WORKSPACE`
//! 2. **Config file** — path via `--config <path>`, or `sandboxd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8787"
//! max_connections = 256
//! proxy_base_host = "preview.example.com"
//!
//! [shell]
//! shell = "/bin/bash"
//! workspace_dir = "/workspace"
//! command_timeout_ms = 30000
//! stream_poll_interval_ms = 100
//! temp_file_max_age_secs = 60
//!
//! [process]
//! kill_grace_ms = 5000
//! sweep_interval_secs = 1800
//! completed_max_age_secs = 1800
//!
//! [code]
//! python_worker = ["python3", "/opt/sandboxd/workers/interpreter.py"]
//! javascript_worker = ["node", "/opt/sandboxd/workers/interpreter.js"]
//! execution_timeout_ms = 60000
//!
//! [terminal]
//! replay_buffer_bytes = 65536
//! idle_grace_secs = 60
//! default_rows = 24
//! default_cols = 80
//!
//! [bucket]
//! fuse_helper = "s3fs"
//!
//! [logging]
//! level = "info"
//!
//! # Well-known helper services started by POST /api/init
//! [[helpers]]
//! name = "inspector"
//! command = "node /opt/sandboxd/inspector.js"
//! port = 9229
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub code: CodeConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub bucket: BucketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Well-known helper services started by `POST /api/init`.
    #[serde(default)]
    pub helpers: Vec<HelperConfig>,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8787`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent TCP connections (default 256).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Sandbox identity of this container. Override with `SANDBOXD_SANDBOX_ID`.
    /// `None` accepts whatever the orchestrator sends in `X-Sandbox-Id`.
    #[serde(default)]
    pub sandbox_id: Option<String>,
    /// Base host for subdomain-form preview URLs
    /// (`{port}-{sandboxId}.<proxy_base_host>`). `None` disables host matching.
    #[serde(default)]
    pub proxy_base_host: Option<String>,
}

/// Shell and session-execution settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary driving sessions (default `/bin/bash`).
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Preferred default working directory (default `/workspace`). Falls back
    /// to `$HOME`, then `/`, when absent at session creation.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    /// Default command timeout in milliseconds (default 30 000).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Poll cadence for streaming capture files in milliseconds (default 100).
    #[serde(default = "default_stream_poll_interval_ms")]
    pub stream_poll_interval_ms: u64,
    /// Age after which orphaned command temp files are swept (default 60 s).
    #[serde(default = "default_temp_file_max_age_secs")]
    pub temp_file_max_age_secs: u64,
}

/// Background-process lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Grace period between SIGTERM and SIGKILL in milliseconds (default 5 000).
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Interval between cleanup sweeps in seconds (default 1 800).
    #[serde(default = "default_process_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Age after which terminal records are dropped (default 1 800 s).
    #[serde(default = "default_completed_max_age_secs")]
    pub completed_max_age_secs: u64,
    /// Cadence for `waitForPort` TCP probes in milliseconds (default 250).
    #[serde(default = "default_port_poll_interval_ms")]
    pub port_poll_interval_ms: u64,
}

/// Code-interpreter worker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CodeConfig {
    /// Launch vector for the Python worker (argv).
    #[serde(default = "default_python_worker")]
    pub python_worker: Vec<String>,
    /// Launch vector for the JavaScript worker (argv).
    #[serde(default = "default_javascript_worker")]
    pub javascript_worker: Vec<String>,
    /// Per-execution timeout in milliseconds (default 60 000).
    #[serde(default = "default_code_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
}

/// Exposed-port registry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    /// Age after which inactive port records are reclaimed (default 3 600 s).
    #[serde(default = "default_inactive_max_age_secs")]
    pub inactive_max_age_secs: u64,
    /// Sweep cadence in seconds (default 300).
    #[serde(default = "default_ports_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// PTY terminal settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// Bytes of recent output replayed to reconnecting peers (default 64 KiB).
    #[serde(default = "default_replay_buffer_bytes")]
    pub replay_buffer_bytes: usize,
    /// Seconds a terminal survives after its last peer disconnects (default 60).
    #[serde(default = "default_idle_grace_secs")]
    pub idle_grace_secs: u64,
    /// Default terminal rows (default 24).
    #[serde(default = "default_terminal_rows")]
    pub default_rows: u16,
    /// Default terminal columns (default 80).
    #[serde(default = "default_terminal_cols")]
    pub default_cols: u16,
}

/// Bucket mounting settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    /// FUSE helper binary used for S3-compatible mounts (default `s3fs`).
    #[serde(default = "default_fuse_helper")]
    pub fuse_helper: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A well-known in-container helper service started by `POST /api/init`.
#[derive(Debug, Clone, Deserialize)]
pub struct HelperConfig {
    /// Name used by `GET /ws/{name}` to address the helper.
    pub name: String,
    /// Shell command line that starts the helper.
    pub command: String,
    /// Local port the helper listens on (also the WS bridge target).
    pub port: u16,
}

fn default_listen() -> String {
    "0.0.0.0:8787".to_string()
}
fn default_max_connections() -> usize {
    256
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_workspace_dir() -> String {
    "/workspace".to_string()
}
fn default_command_timeout_ms() -> u64 {
    30_000
}
fn default_stream_poll_interval_ms() -> u64 {
    100
}
fn default_temp_file_max_age_secs() -> u64 {
    60
}
fn default_kill_grace_ms() -> u64 {
    5000
}
fn default_process_sweep_interval_secs() -> u64 {
    1800
}
fn default_completed_max_age_secs() -> u64 {
    1800
}
fn default_port_poll_interval_ms() -> u64 {
    250
}
fn default_python_worker() -> Vec<String> {
    vec![
        "python3".to_string(),
        "/opt/sandboxd/workers/interpreter.py".to_string(),
    ]
}
fn default_javascript_worker() -> Vec<String> {
    vec![
        "node".to_string(),
        "/opt/sandboxd/workers/interpreter.js".to_string(),
    ]
}
fn default_code_execution_timeout_ms() -> u64 {
    60_000
}
fn default_inactive_max_age_secs() -> u64 {
    3600
}
fn default_ports_sweep_interval_secs() -> u64 {
    300
}
fn default_replay_buffer_bytes() -> usize {
    64 * 1024
}
fn default_idle_grace_secs() -> u64 {
    60
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_fuse_helper() -> String {
    "s3fs".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            sandbox_id: None,
            proxy_base_host: None,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            workspace_dir: default_workspace_dir(),
            command_timeout_ms: default_command_timeout_ms(),
            stream_poll_interval_ms: default_stream_poll_interval_ms(),
            temp_file_max_age_secs: default_temp_file_max_age_secs(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            kill_grace_ms: default_kill_grace_ms(),
            sweep_interval_secs: default_process_sweep_interval_secs(),
            completed_max_age_secs: default_completed_max_age_secs(),
            port_poll_interval_ms: default_port_poll_interval_ms(),
        }
    }
}

impl Default for CodeConfig {
    fn default() -> Self {
        Self {
            python_worker: default_python_worker(),
            javascript_worker: default_javascript_worker(),
            execution_timeout_ms: default_code_execution_timeout_ms(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            inactive_max_age_secs: default_inactive_max_age_secs(),
            sweep_interval_secs: default_ports_sweep_interval_secs(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            replay_buffer_bytes: default_replay_buffer_bytes(),
            idle_grace_secs: default_idle_grace_secs(),
            default_rows: default_terminal_rows(),
            default_cols: default_terminal_cols(),
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            fuse_helper: default_fuse_helper(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            shell: ShellConfig::default(),
            process: ProcessConfig::default(),
            code: CodeConfig::default(),
            ports: PortsConfig::default(),
            terminal: TerminalConfig::default(),
            bucket: BucketConfig::default(),
            logging: LoggingConfig::default(),
            helpers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `sandboxd.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("sandboxd.toml").exists() {
            let content =
                std::fs::read_to_string("sandboxd.toml").expect("Failed to read sandboxd.toml");
            toml::from_str(&content).expect("Failed to parse sandboxd.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("SANDBOXD_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(id) = std::env::var("SANDBOXD_SANDBOX_ID") {
            config.server.sandbox_id = Some(id);
        }
        if let Ok(dir) = std::env::var("SANDBOXD_WORKSPACE") {
            config.shell.workspace_dir = dir;
        }

        config
    }

    /// The port this server listens on — reserved from exposure.
    pub fn control_port(&self) -> u16 {
        self.server
            .listen
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8787)
    }

    /// Validate cross-field constraints. Returns human-readable problems.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.shell.command_timeout_ms == 0 {
            errors.push("shell.command_timeout_ms must be > 0".to_string());
        }
        if self.shell.stream_poll_interval_ms == 0 {
            errors.push("shell.stream_poll_interval_ms must be > 0".to_string());
        }
        if self.terminal.replay_buffer_bytes == 0 {
            errors.push("terminal.replay_buffer_bytes must be > 0".to_string());
        }
        for helper in &self.helpers {
            if helper.name.is_empty() || helper.command.is_empty() {
                errors.push(format!(
                    "helper entries need both name and command (got name={:?})",
                    helper.name
                ));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:8787");
        assert_eq!(config.shell.shell, "/bin/bash");
        assert_eq!(config.shell.command_timeout_ms, 30_000);
        assert_eq!(config.terminal.replay_buffer_bytes, 64 * 1024);
        assert_eq!(config.control_port(), 8787);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"

            [shell]
            command_timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.control_port(), 9000);
        assert_eq!(config.shell.command_timeout_ms, 5000);
        // Untouched sections keep compiled defaults
        assert_eq!(config.shell.shell, "/bin/bash");
        assert_eq!(config.process.kill_grace_ms, 5000);
        assert_eq!(config.terminal.default_rows, 24);
    }

    #[test]
    fn helpers_parse() {
        let config: Config = toml::from_str(
            r#"
            [[helpers]]
            name = "inspector"
            command = "node inspector.js"
            port = 9229
            "#,
        )
        .unwrap();
        assert_eq!(config.helpers.len(), 1);
        assert_eq!(config.helpers[0].name, "inspector");
        assert_eq!(config.helpers[0].port, 9229);
    }

    #[test]
    fn validate_flags_zero_timeout() {
        let mut config = Config::default();
        config.shell.command_timeout_ms = 0;
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("command_timeout_ms"));
    }
}
