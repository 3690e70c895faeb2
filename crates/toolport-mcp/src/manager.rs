//! Management facade: the single entry point for external callers.

use crate::adapter::{ToolAdapter, ToolDefinition};
use crate::client::McpClient;
use crate::config::{validate_agent_name, McpSettings, ServerConfig, TransportKind};
use crate::instance::{ServerInstance, ServerStatus, StatusEvent};
use crate::registry::{ConfigChange, ServerRegistry};
use crate::scope::ScopeStore;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use toolport_core::{ToolCall, ToolResult, ToolportError, ToolportResult};
use tracing::{info, warn};

/// Status line for one configured server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    /// Server name.
    pub name: String,
    /// Launch command.
    pub command: String,
    /// Launch arguments.
    pub args: Vec<String>,
    /// Transport kind.
    pub transport: TransportKind,
    /// Current status; Stopped when no instance exists.
    pub status: ServerStatus,
    /// Cached tools, stale or not.
    pub tool_count: usize,
    /// Whether the cached tools predate the current failure.
    pub tools_stale: bool,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// When the last health probe finished.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Failed probes since the last success.
    pub consecutive_failures: u32,
    /// Automatic restarts in the current failure episode.
    pub restart_attempts: u32,
    /// Restarts are exhausted; only a manual retry helps.
    pub restart_exhausted: bool,
    /// OS process id, when a process is owned.
    pub pid: Option<u32>,
    /// Whether the server may run at all.
    pub globally_enabled: bool,
    /// Agents whose scope lists this server.
    pub agents: Vec<String>,
}

/// Result of an enable operation. Enabling an unhealthy server still
/// succeeds; the warning says why it is not running.
#[derive(Debug, Clone, Serialize)]
pub struct EnableOutcome {
    /// Whether the stored scope changed.
    pub changed: bool,
    /// Status after the start attempt.
    pub status: ServerStatus,
    /// Why the server is not running, when it is not.
    pub warning: Option<String>,
}

/// Result of a connection test.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    /// Server name.
    pub server: String,
    /// Whether the handshake and tool listing succeeded.
    pub success: bool,
    /// Wall-clock time of the test.
    pub latency_ms: u64,
    /// Tools discovered.
    pub tool_count: usize,
    /// Failure description.
    pub error: Option<String>,
}

/// Outcome of one entry of a bulk import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportEntry {
    /// Server name from the entry.
    pub name: String,
    /// Whether the entry was stored.
    pub success: bool,
    /// Why the entry was rejected.
    pub error: Option<String>,
    /// The entry was stored but its server is not running.
    pub warning: Option<String>,
}

/// Per-entry results of a bulk import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    /// One entry per config, in input order.
    pub entries: Vec<ImportEntry>,
}

impl ImportReport {
    /// Entries that were stored.
    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|e| e.success).count()
    }

    /// Entries that were rejected.
    pub fn failed(&self) -> usize {
        self.entries.len() - self.succeeded()
    }
}

/// Coordinates the registry, scope store and tool adapter.
pub struct McpManager {
    registry: Arc<ServerRegistry>,
    adapter: Arc<ToolAdapter>,
    settings: Arc<McpSettings>,
}

impl McpManager {
    /// Load persisted state from `settings.data_dir` and start every
    /// globally enabled server. Servers that fail to start are left in
    /// Error under supervision; they do not fail the open.
    pub async fn open(settings: McpSettings) -> ToolportResult<Self> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let store = Arc::new(ScopeStore::load(settings.data_dir.clone()).await?);
        let registry = Arc::new(ServerRegistry::new(store, settings.clone()));
        let manager = Self {
            adapter: Arc::new(ToolAdapter::new(registry.clone())),
            registry,
            settings,
        };
        manager.replay().await;
        Ok(manager)
    }

    async fn replay(&self) {
        let names: Vec<String> = self.registry.store().record().global.into_iter().collect();
        if names.is_empty() {
            return;
        }
        let results = join_all(names.iter().map(|name| async move {
            let _serial = self.registry.lock_server(name).await;
            self.ensure_started(name).await
        }))
        .await;
        let running = results
            .iter()
            .filter(|r| matches!(r, Ok((ServerStatus::Running, _))))
            .count();
        info!(enabled = names.len(), running = running, "replayed enabled MCP servers");
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Settings in effect.
    pub fn settings(&self) -> &McpSettings {
        &self.settings
    }

    /// The adapter, for handing to the orchestration layer as a
    /// [`crate::adapter::ToolProvider`].
    pub fn tool_provider(&self) -> Arc<ToolAdapter> {
        self.adapter.clone()
    }

    /// Status transitions of every server.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.registry.subscribe()
    }

    // --- Reporting ---

    /// Every configured server with its status.
    pub fn list_servers(&self) -> Vec<ServerReport> {
        self.registry
            .list()
            .into_iter()
            .map(|(config, instance)| self.report(config, instance.as_deref()))
            .collect()
    }

    /// Status of one server.
    pub fn server_report(&self, name: &str) -> ToolportResult<ServerReport> {
        let config = self.require(name)?;
        let instance = self.registry.instance(name);
        Ok(self.report(config, instance.as_deref()))
    }

    fn report(&self, config: ServerConfig, instance: Option<&ServerInstance>) -> ServerReport {
        let snapshot = instance.map(|i| i.snapshot()).unwrap_or_default();
        ServerReport {
            agents: self.registry.store().agents_referencing(&config.name),
            globally_enabled: config.enabled,
            name: config.name,
            command: config.command,
            args: config.args,
            transport: config.transport,
            status: snapshot.status,
            tool_count: snapshot.tools.len(),
            tools_stale: snapshot.tools_stale,
            last_error: snapshot.last_error.clone(),
            last_health_check: snapshot.last_health_check,
            consecutive_failures: snapshot.consecutive_failures,
            restart_attempts: snapshot.restart_attempts,
            restart_exhausted: snapshot.restart_exhausted,
            pid: snapshot.pid,
        }
    }

    // --- Config ---

    /// Add a server, or update one whose launch settings differ when
    /// `replace` is set. A replaced server that is running is restarted with
    /// the new settings.
    pub async fn add_server(
        &self,
        config: ServerConfig,
        replace: bool,
    ) -> ToolportResult<ConfigChange> {
        let name = config.name.clone();
        let enabled = config.enabled;
        let _serial = self.registry.lock_server(&name).await;
        let change = self.registry.add_or_update_config(config, replace).await?;
        match change {
            ConfigChange::Created if enabled => {
                self.ensure_started(&name).await?;
            }
            ConfigChange::Replaced => {
                if let Some(instance) = self.registry.instance(&name) {
                    if instance.status() != ServerStatus::Stopped {
                        info!(server = %name, "restarting MCP server with new launch settings");
                        instance.stop().await?;
                        self.ensure_started(&name).await?;
                    }
                }
            }
            _ => {}
        }
        Ok(change)
    }

    /// Stop and delete a server. Rejected while any agent references it.
    pub async fn remove_server(&self, name: &str) -> ToolportResult<()> {
        let _serial = self.registry.lock_server(name).await;
        self.registry.remove(name).await
    }

    /// Validate and apply each config independently. Valid entries are kept
    /// even when others fail.
    pub async fn import_configs(&self, configs: Vec<ServerConfig>) -> ImportReport {
        let mut report = ImportReport::default();
        for config in configs {
            let name = config.name.clone();
            let entry = match self.add_server(config, false).await {
                Ok(_) => {
                    let warning = self
                        .registry
                        .instance(&name)
                        .and_then(|i| i.snapshot().last_error.clone());
                    ImportEntry {
                        name,
                        success: true,
                        error: None,
                        warning,
                    }
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "MCP server import entry rejected");
                    ImportEntry {
                        name,
                        success: false,
                        error: Some(e.to_string()),
                        warning: None,
                    }
                }
            };
            report.entries.push(entry);
        }
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "MCP server import finished"
        );
        report
    }

    // --- Enablement ---

    /// Mark the server eligible to run and start it.
    pub async fn enable_global(&self, name: &str) -> ToolportResult<EnableOutcome> {
        let _serial = self.registry.lock_server(name).await;
        self.require(name)?;
        let changed = self.registry.store().enable_global(name).await?;
        let (status, warning) = self.ensure_started(name).await?;
        Ok(EnableOutcome {
            changed,
            status,
            warning,
        })
    }

    /// Stop the server and mark it ineligible to run. Rejected while any
    /// agent references it.
    pub async fn disable_global(&self, name: &str) -> ToolportResult<bool> {
        let _serial = self.registry.lock_server(name).await;
        self.require(name)?;
        let changed = self.registry.store().disable_global(name).await?;
        if let Some(instance) = self.registry.instance(name) {
            instance.stop().await?;
        }
        Ok(changed)
    }

    /// Add the server to the agent's scope and make sure it runs. A server
    /// that is not yet globally enabled becomes so.
    pub async fn enable_for_agent(&self, agent: &str, server: &str) -> ToolportResult<EnableOutcome> {
        validate_agent_name(agent)?;
        let _serial = self.registry.lock_server(server).await;
        self.require(server)?;
        let changed = self
            .registry
            .store()
            .enable_for_agent_and_global(agent, server)
            .await?;
        let (status, warning) = self.ensure_started(server).await?;
        Ok(EnableOutcome {
            changed,
            status,
            warning,
        })
    }

    /// Drop the server from the agent's scope. The instance keeps running
    /// for everyone else.
    pub async fn disable_for_agent(&self, agent: &str, server: &str) -> ToolportResult<bool> {
        let _serial = self.registry.lock_server(server).await;
        self.registry.store().disable_for_agent(agent, server).await
    }

    /// Start the instance if it is stopped and report how it ended up.
    async fn ensure_started(&self, name: &str) -> ToolportResult<(ServerStatus, Option<String>)> {
        let instance = self.registry.instance_or_create(name)?;
        let warning = match instance.start().await {
            Ok(()) => match instance.status() {
                ServerStatus::Running => None,
                status => Some(format!("server '{name}' is {status}")),
            },
            Err(e) => Some(format!("server '{name}' is enabled but not healthy: {e}")),
        };
        if let Some(warning) = &warning {
            warn!(server = %name, warning = %warning, "MCP server enabled while unhealthy");
        }
        Ok((instance.status(), warning))
    }

    // --- Operations ---

    /// Fetch capabilities afresh and time it. Enablement and the running
    /// instance's status are left alone; a server that is not running is
    /// probed over a temporary connection.
    pub async fn test_connection(&self, name: &str) -> ToolportResult<ConnectionReport> {
        let config = self.require(name)?;
        let timeout = self.settings.handshake_timeout();
        let started = Instant::now();

        let outcome = match self.registry.instance(name) {
            Some(instance) if instance.status() == ServerStatus::Running => {
                instance.refresh_tools(timeout).await.map(|tools| tools.len())
            }
            _ => probe(&config, timeout, self.settings.stop_timeout()).await,
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        let report = match outcome {
            Ok(tool_count) => ConnectionReport {
                server: name.to_string(),
                success: true,
                latency_ms,
                tool_count,
                error: None,
            },
            Err(e) => ConnectionReport {
                server: name.to_string(),
                success: false,
                latency_ms,
                tool_count: 0,
                error: Some(e.to_string()),
            },
        };
        info!(
            server = %name,
            success = report.success,
            latency_ms = report.latency_ms,
            tools = report.tool_count,
            "MCP connection test finished"
        );
        Ok(report)
    }

    /// Reset backoff and start now. Only globally enabled servers may run.
    pub async fn retry_now(&self, name: &str) -> ToolportResult<ServerStatus> {
        let _serial = self.registry.lock_server(name).await;
        self.require(name)?;
        if !self.registry.store().is_globally_enabled(name) {
            return Err(ToolportError::Config(format!(
                "server '{name}' is not enabled; enable it before retrying"
            )));
        }
        let instance = self.registry.instance_or_create(name)?;
        if let Err(e) = instance.retry_now().await {
            warn!(server = %name, error = %e, "manual MCP server retry failed");
        }
        Ok(instance.status())
    }

    // --- Tools ---

    /// Cached tools of one server, namespaced.
    pub fn list_tools_for_server(&self, name: &str) -> ToolportResult<Vec<ToolDefinition>> {
        self.adapter.definitions_for_server(name)
    }

    /// Tools visible to `agent`, namespaced.
    pub fn list_tools_for_agent(&self, agent: &str) -> ToolportResult<Vec<ToolDefinition>> {
        validate_agent_name(agent)?;
        Ok(self.adapter.definitions_for_agent(agent))
    }

    /// Call a namespaced tool for `agent` with the default call timeout.
    pub async fn call_tool(&self, agent: &str, call: ToolCall) -> ToolportResult<ToolResult> {
        self.call_tool_within(agent, call, self.settings.call_timeout())
            .await
    }

    /// Call a namespaced tool with a caller-supplied deadline. Giving up
    /// leaves the server running.
    pub async fn call_tool_within(
        &self,
        agent: &str,
        call: ToolCall,
        timeout: Duration,
    ) -> ToolportResult<ToolResult> {
        validate_agent_name(agent)?;
        self.adapter.call_for_agent(agent, &call, timeout).await
    }

    /// Stop every instance.
    pub async fn shutdown(&self) {
        let instances = self.registry.instances();
        let results = join_all(instances.iter().map(|i| i.stop())).await;
        for (instance, result) in instances.iter().zip(results) {
            if let Err(e) = result {
                warn!(server = %instance.name(), error = %e, "error stopping MCP server on shutdown");
            }
        }
        info!(servers = instances.len(), "MCP manager shut down");
    }

    fn require(&self, name: &str) -> ToolportResult<ServerConfig> {
        self.registry
            .get(name)
            .ok_or_else(|| ToolportError::Config(format!("unknown MCP server '{name}'")))
    }
}

/// Connect, handshake and list tools over a throwaway connection.
async fn probe(config: &ServerConfig, timeout: Duration, stop_timeout: Duration) -> ToolportResult<usize> {
    let deadline = Instant::now() + timeout;
    let transport = Transport::start(config, timeout).await?;
    let client = McpClient::new(transport);
    let result = async {
        client
            .initialize(deadline.saturating_duration_since(Instant::now()))
            .await?;
        client
            .list_tools(deadline.saturating_duration_since(Instant::now()))
            .await
    }
    .await;
    let _ = client.shutdown(stop_timeout).await;
    result.map(|tools| tools.len())
}

// --- Import documents ---

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImportDocument {
    List(Vec<ServerConfig>),
    Table {
        #[serde(default)]
        servers: Vec<ServerConfig>,
        #[serde(default, rename = "mcpServers")]
        mcp_servers: BTreeMap<String, ImportedServer>,
    },
}

/// One entry of an `mcpServers` map.
#[derive(Debug, Deserialize)]
struct ImportedServer {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    transport: TransportKind,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    enabled: bool,
}

/// Parse a bulk import document: a JSON array of configs, a JSON/TOML table
/// with a `servers` list, or the common `{"mcpServers": {name: {...}}}` map.
/// Entries are validated later, one by one, by [`McpManager::import_configs`].
pub fn parse_import_document(text: &str) -> ToolportResult<Vec<ServerConfig>> {
    let document: ImportDocument = match serde_json::from_str(text) {
        Ok(document) => document,
        Err(json_err) => toml::from_str(text).map_err(|toml_err| {
            ToolportError::Config(format!(
                "import document is neither valid JSON ({json_err}) nor valid TOML ({toml_err})"
            ))
        })?,
    };

    Ok(match document {
        ImportDocument::List(configs) => configs,
        ImportDocument::Table {
            mut servers,
            mcp_servers,
        } => {
            servers.extend(mcp_servers.into_iter().map(|(name, s)| ServerConfig {
                name,
                command: s.command,
                args: s.args,
                transport: s.transport,
                endpoint: s.endpoint,
                cwd: s.cwd,
                enabled: s.enabled,
                env: s.env,
            }));
            servers
        }
    })
}
