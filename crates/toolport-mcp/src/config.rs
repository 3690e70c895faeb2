//! Server records and runtime settings.

use crate::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toolport_core::{ToolportError, ToolportResult};

/// How frames reach the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Newline-delimited JSON-RPC over the child's stdin/stdout.
    #[default]
    Stdio,
    /// The same frames over a TCP connection to `endpoint`.
    Tcp,
}

/// Persisted configuration for a single MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server name; also the tool namespace.
    pub name: String,
    /// Program to spawn. Optional for TCP servers that run elsewhere.
    #[serde(default)]
    pub command: String,
    /// Arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// How frames are carried.
    #[serde(default)]
    pub transport: TransportKind,
    /// `host:port` for the TCP transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Working directory for the spawned process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Globally enabled: eligible to run at all.
    #[serde(default)]
    pub enabled: bool,
    /// Extra environment variables for the spawned process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ServerConfig {
    /// A stdio server config, globally disabled.
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            transport: TransportKind::Stdio,
            endpoint: None,
            cwd: None,
            enabled: false,
            env: BTreeMap::new(),
        }
    }

    /// A TCP server config. An empty command means the process is managed elsewhere.
    pub fn tcp(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Tcp,
            endpoint: Some(endpoint.into()),
            ..Self::new(name, "", &[])
        }
    }

    /// Add one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Check naming and transport rules.
    pub fn validate(&self) -> ToolportResult<()> {
        validate_server_name(&self.name)?;
        match self.transport {
            TransportKind::Stdio => {
                if self.command.trim().is_empty() {
                    return Err(ToolportError::Config(format!(
                        "server '{}': stdio transport requires a command",
                        self.name
                    )));
                }
            }
            TransportKind::Tcp => {
                let endpoint = self.endpoint.as_deref().unwrap_or_default();
                if endpoint.rsplit_once(':').map_or(true, |(host, port)| {
                    host.is_empty() || port.parse::<u16>().is_err()
                }) {
                    return Err(ToolportError::Config(format!(
                        "server '{}': tcp transport requires an endpoint of the form host:port",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether both configs launch the same program. The enabled flag is
    /// scope state, not identity.
    pub fn same_launch(&self, other: &Self) -> bool {
        self.command == other.command
            && self.args == other.args
            && self.env == other.env
            && self.transport == other.transport
            && self.endpoint == other.endpoint
            && self.cwd == other.cwd
    }
}

/// Server names are namespace prefixes (`<server>.<tool>`), so no dots.
pub fn validate_server_name(name: &str) -> ToolportResult<()> {
    validate_identifier("server", name)
}

/// Agent names become file names under `agents/`.
pub fn validate_agent_name(name: &str) -> ToolportResult<()> {
    validate_identifier("agent", name)
}

fn validate_identifier(what: &str, name: &str) -> ToolportResult<()> {
    if name.is_empty() {
        return Err(ToolportError::Config(format!("{what} name must not be empty")));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(ToolportError::Config(format!(
            "{what} name '{name}' contains invalid character '{bad}' (allowed: A-Z a-z 0-9 - _)"
        )));
    }
    Ok(())
}

/// Runtime settings for the whole subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpSettings {
    /// Directory holding `servers.toml` and `agents/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Health probe interval (default: 30s).
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,
    /// Consecutive failed probes that mark a server as errored (default: 3).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Bound on spawn, handshake and tool discovery together.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Default timeout for one tool call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    /// Grace period between closing stdin and force-killing.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    /// Restart schedule after a failure.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/mcp")
}
fn default_health_interval() -> u64 {
    30_000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_handshake_timeout() -> u64 {
    30_000
}
fn default_call_timeout() -> u64 {
    60_000
}
fn default_stop_timeout() -> u64 {
    5_000
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            health_check_interval_ms: default_health_interval(),
            failure_threshold: default_failure_threshold(),
            handshake_timeout_ms: default_handshake_timeout(),
            call_timeout_ms: default_call_timeout(),
            stop_timeout_ms: default_stop_timeout(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl McpSettings {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml_str(s: &str) -> ToolportResult<Self> {
        let settings: Self = toml::from_str(s)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from a TOML file.
    pub async fn load(path: &Path) -> ToolportResult<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ToolportError::Config(format!(
                "failed to read settings file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject settings the runtime cannot honour, such as a zero health
    /// check interval or failure threshold.
    pub fn validate(&self) -> ToolportResult<()> {
        if self.failure_threshold == 0 {
            return Err(ToolportError::Config(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.health_check_interval_ms == 0 {
            return Err(ToolportError::Config(
                "health_check_interval_ms must be positive".into(),
            ));
        }
        self.backoff.validate()
    }

    /// Health probe interval.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Spawn, handshake and discovery timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Default tool call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Grace period before a stop force-kills.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
