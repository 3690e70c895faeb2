//! Durable server configs and enablement scopes.
//!
//! Layout under the data directory:
//!
//! ```text
//! servers.toml          every known server, with its global `enabled` flag
//! agents/<agent>.toml   enabled_servers = ["files", ...]
//! ```
//!
//! Every write goes to a temp file in the same directory and is renamed over
//! the target, so a crash never leaves a half-written file behind.

use crate::config::{validate_agent_name, ServerConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use toolport_core::{ToolportError, ToolportResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SERVERS_FILE: &str = "servers.toml";
const AGENTS_DIR: &str = "agents";
const FILE_HEADER: &str = "# Managed by toolport. Manual edits are read on the next start.\n\n";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServersFile {
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentFile {
    #[serde(default)]
    enabled_servers: BTreeSet<String>,
}

/// Which servers are enabled, globally and per agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScopeRecord {
    /// Globally enabled servers.
    pub global: BTreeSet<String>,
    /// Enabled servers per agent.
    pub agents: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Default)]
struct ScopeState {
    servers: BTreeMap<String, ServerConfig>,
    agents: BTreeMap<String, BTreeSet<String>>,
}

/// What a mutation touched on disk.
enum Touched {
    Nothing,
    Servers,
    Agent(String),
    /// Both files; `servers.toml` is written first.
    ServersAndAgent(String),
}

/// File-backed store for server configs and scopes.
///
/// Reads are served from memory. Mutations are serialized, written to disk,
/// and only then published to readers, so memory never runs ahead of disk.
pub struct ScopeStore {
    dir: PathBuf,
    state: RwLock<ScopeState>,
    writes: AsyncMutex<()>,
}

impl ScopeStore {
    /// Open (or create) the store under `dir`.
    pub async fn load(dir: impl Into<PathBuf>) -> ToolportResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(dir.join(AGENTS_DIR)).await?;

        let mut state = ScopeState::default();
        let servers_path = dir.join(SERVERS_FILE);
        if tokio::fs::try_exists(&servers_path).await? {
            let text = tokio::fs::read_to_string(&servers_path).await?;
            let file: ServersFile = toml::from_str(&text).map_err(|e| {
                ToolportError::Config(format!("invalid {}: {e}", servers_path.display()))
            })?;
            for config in file.servers {
                config.validate()?;
                let name = config.name.clone();
                if state.servers.insert(name.clone(), config).is_some() {
                    return Err(ToolportError::Config(format!(
                        "{} lists server '{name}' more than once",
                        servers_path.display()
                    )));
                }
            }
        }

        let mut entries = tokio::fs::read_dir(dir.join(AGENTS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(agent) = file_name.to_str().and_then(|n| n.strip_suffix(".toml")) else {
                continue;
            };
            if let Err(e) = validate_agent_name(agent) {
                warn!(file = %entry.path().display(), error = %e, "skipping agent scope file");
                continue;
            }
            let text = tokio::fs::read_to_string(entry.path()).await?;
            let file: AgentFile = toml::from_str(&text).map_err(|e| {
                ToolportError::Config(format!("invalid {}: {e}", entry.path().display()))
            })?;
            let mut enabled = BTreeSet::new();
            for server in file.enabled_servers {
                if state.servers.contains_key(&server) {
                    enabled.insert(server);
                } else {
                    warn!(agent = agent, server = %server, "agent scope references unknown server, dropping");
                }
            }
            state.agents.insert(agent.to_string(), enabled);
        }

        info!(
            dir = %dir.display(),
            servers = state.servers.len(),
            agents = state.agents.len(),
            "loaded MCP scope store"
        );
        Ok(Self {
            dir,
            state: RwLock::new(state),
            writes: AsyncMutex::new(()),
        })
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every stored config, by name.
    pub fn servers(&self) -> Vec<ServerConfig> {
        self.state.read().servers.values().cloned().collect()
    }

    /// Stored config for `name`.
    pub fn server(&self, name: &str) -> Option<ServerConfig> {
        self.state.read().servers.get(name).cloned()
    }

    /// Whether a config named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.state.read().servers.contains_key(name)
    }

    /// Whether the server may run at all.
    pub fn is_globally_enabled(&self, name: &str) -> bool {
        self.state
            .read()
            .servers
            .get(name)
            .is_some_and(|c| c.enabled)
    }

    /// Servers enabled for `agent`. Unknown agents have none.
    pub fn agent_servers(&self, agent: &str) -> BTreeSet<String> {
        self.state
            .read()
            .agents
            .get(agent)
            .cloned()
            .unwrap_or_default()
    }

    /// Agents whose scope lists `server`, sorted.
    pub fn agents_referencing(&self, server: &str) -> Vec<String> {
        self.state
            .read()
            .agents
            .iter()
            .filter(|(_, servers)| servers.contains(server))
            .map(|(agent, _)| agent.clone())
            .collect()
    }

    /// Global and per-agent enablement at this moment.
    pub fn record(&self) -> ScopeRecord {
        let state = self.state.read();
        ScopeRecord {
            global: state
                .servers
                .values()
                .filter(|c| c.enabled)
                .map(|c| c.name.clone())
                .collect(),
            agents: state.agents.clone(),
        }
    }

    /// Insert or replace a server config as given.
    pub async fn upsert_server(&self, config: ServerConfig) -> ToolportResult<()> {
        config.validate()?;
        self.mutate(|state| {
            if state.servers.get(&config.name) == Some(&config) {
                return Ok(Touched::Nothing);
            }
            state.servers.insert(config.name.clone(), config);
            Ok(Touched::Servers)
        })
        .await
        .map(|_| ())
    }

    /// Delete a server config. Rejected while any agent references it.
    /// Returns whether the server existed.
    pub async fn remove_server(&self, name: &str) -> ToolportResult<bool> {
        self.mutate(|state| {
            reject_if_referenced(state, name)?;
            Ok(match state.servers.remove(name) {
                Some(_) => Touched::Servers,
                None => Touched::Nothing,
            })
        })
        .await
    }

    /// Returns whether the flag changed.
    pub async fn enable_global(&self, name: &str) -> ToolportResult<bool> {
        self.set_global(name, true).await
    }

    /// Rejected with `StillInUse` while any agent references the server.
    pub async fn disable_global(&self, name: &str) -> ToolportResult<bool> {
        self.set_global(name, false).await
    }

    async fn set_global(&self, name: &str, enabled: bool) -> ToolportResult<bool> {
        self.mutate(|state| {
            if !enabled {
                reject_if_referenced(state, name)?;
            }
            let config = state
                .servers
                .get_mut(name)
                .ok_or_else(|| unknown_server(name))?;
            if config.enabled == enabled {
                return Ok(Touched::Nothing);
            }
            config.enabled = enabled;
            Ok(Touched::Servers)
        })
        .await
    }

    /// Add `server` to the agent's scope. Idempotent; returns whether it changed.
    pub async fn enable_for_agent(&self, agent: &str, server: &str) -> ToolportResult<bool> {
        validate_agent_name(agent)?;
        self.mutate(|state| {
            if !state.servers.contains_key(server) {
                return Err(unknown_server(server));
            }
            let servers = state.agents.entry(agent.to_string()).or_default();
            Ok(if servers.insert(server.to_string()) {
                Touched::Agent(agent.to_string())
            } else {
                Touched::Nothing
            })
        })
        .await
    }

    /// Add `server` to the agent's scope and enable it globally, as one
    /// mutation. The global flag is persisted first, so a crash in between
    /// never leaves an agent referencing a disabled server. Returns whether
    /// anything changed.
    pub async fn enable_for_agent_and_global(
        &self,
        agent: &str,
        server: &str,
    ) -> ToolportResult<bool> {
        validate_agent_name(agent)?;
        self.mutate(|state| {
            let config = state
                .servers
                .get_mut(server)
                .ok_or_else(|| unknown_server(server))?;
            let global_changed = !config.enabled;
            config.enabled = true;
            let agent_changed = state
                .agents
                .entry(agent.to_string())
                .or_default()
                .insert(server.to_string());
            Ok(match (global_changed, agent_changed) {
                (true, true) => Touched::ServersAndAgent(agent.to_string()),
                (true, false) => Touched::Servers,
                (false, true) => Touched::Agent(agent.to_string()),
                (false, false) => Touched::Nothing,
            })
        })
        .await
    }

    /// Drop `server` from the agent's scope. Idempotent; returns whether it changed.
    pub async fn disable_for_agent(&self, agent: &str, server: &str) -> ToolportResult<bool> {
        validate_agent_name(agent)?;
        self.mutate(|state| {
            let removed = state
                .agents
                .get_mut(agent)
                .is_some_and(|servers| servers.remove(server));
            Ok(if removed {
                Touched::Agent(agent.to_string())
            } else {
                Touched::Nothing
            })
        })
        .await
    }

    /// Apply `f` to a copy of the state, persist what it touched, then publish.
    async fn mutate<F>(&self, f: F) -> ToolportResult<bool>
    where
        F: FnOnce(&mut ScopeState) -> ToolportResult<Touched>,
    {
        let _write = self.writes.lock().await;
        let mut next = self.state.read().clone();
        let touched = f(&mut next)?;

        match &touched {
            Touched::Nothing => return Ok(false),
            Touched::Servers => self.persist_servers(&next).await?,
            Touched::Agent(agent) => self.persist_agent(&next, agent).await?,
            Touched::ServersAndAgent(agent) => {
                self.persist_servers(&next).await?;
                self.persist_agent(&next, agent).await?;
            }
        }

        *self.state.write() = next;
        Ok(true)
    }

    async fn persist_servers(&self, state: &ScopeState) -> ToolportResult<()> {
        let file = ServersFile {
            servers: state.servers.values().cloned().collect(),
        };
        let text = format!("{FILE_HEADER}{}", toml::to_string_pretty(&file)?);
        write_atomic(&self.dir.join(SERVERS_FILE), &text).await
    }

    async fn persist_agent(&self, state: &ScopeState, agent: &str) -> ToolportResult<()> {
        let file = AgentFile {
            enabled_servers: state.agents.get(agent).cloned().unwrap_or_default(),
        };
        let text = format!("{FILE_HEADER}{}", toml::to_string_pretty(&file)?);
        let path = self.dir.join(AGENTS_DIR).join(format!("{agent}.toml"));
        write_atomic(&path, &text).await
    }
}

fn unknown_server(name: &str) -> ToolportError {
    ToolportError::Config(format!("unknown MCP server '{name}'"))
}

fn reject_if_referenced(state: &ScopeState, server: &str) -> ToolportResult<()> {
    let agents: Vec<String> = state
        .agents
        .iter()
        .filter(|(_, servers)| servers.contains(server))
        .map(|(agent, _)| agent.clone())
        .collect();
    if agents.is_empty() {
        Ok(())
    } else {
        Err(ToolportError::StillInUse {
            server: server.to_string(),
            agents,
        })
    }
}

/// Write `contents` to a sibling temp file, fsync, and rename it over `path`.
async fn write_atomic(path: &Path, contents: &str) -> ToolportResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ToolportError::Config(format!("no parent directory for {}", path.display())))?;
    tokio::fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("scope");
    let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = async {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    debug!(path = %path.display(), "persisted scope file");
    Ok(())
}
