//! Name-keyed registry of server configs and their runtime instances.

use crate::config::{McpSettings, ServerConfig};
use crate::instance::{ServerInstance, StatusEvent};
use crate::scope::ScopeStore;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use toolport_core::{ToolportError, ToolportResult};
use tracing::info;

/// Result of [`ServerRegistry::add_or_update_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    /// No server had this name.
    Created,
    /// The launch settings changed; a running instance needs a restart.
    Replaced,
    /// An identical config was already stored.
    Unchanged,
}

/// Owns the configured servers and their runtime instances.
///
/// Configs live in the [`ScopeStore`]; instances are created lazily and
/// exist only while their config does.
pub struct ServerRegistry {
    store: Arc<ScopeStore>,
    settings: Arc<McpSettings>,
    instances: RwLock<HashMap<String, Arc<ServerInstance>>>,
    events: broadcast::Sender<StatusEvent>,
    mutations: AsyncMutex<()>,
    server_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ServerRegistry {
    /// Empty registry over `store`; instances are created on demand.
    pub fn new(store: Arc<ScopeStore>, settings: Arc<McpSettings>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            settings,
            instances: RwLock::new(HashMap::new()),
            events,
            mutations: AsyncMutex::new(()),
            server_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The backing config and scope store.
    pub fn store(&self) -> &Arc<ScopeStore> {
        &self.store
    }

    /// Settings shared by every instance.
    pub fn settings(&self) -> &Arc<McpSettings> {
        &self.settings
    }

    /// Status transitions of every instance.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Serialize management operations on one server. Held across the scope
    /// write and the start or stop that follows it.
    pub async fn lock_server(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .server_locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Upsert a config by name. A name collision with different launch
    /// settings is rejected unless `replace` is set. The `enabled` flag of an
    /// existing server is kept: enablement changes go through the scope
    /// operations.
    pub async fn add_or_update_config(
        &self,
        mut config: ServerConfig,
        replace: bool,
    ) -> ToolportResult<ConfigChange> {
        config.validate()?;
        let _guard = self.mutations.lock().await;

        let change = match self.store.server(&config.name) {
            None => ConfigChange::Created,
            Some(existing) => {
                config.enabled = existing.enabled;
                if existing.same_launch(&config) {
                    ConfigChange::Unchanged
                } else if replace {
                    ConfigChange::Replaced
                } else {
                    return Err(ToolportError::Config(format!(
                        "server '{}' already exists with a different launch command \
                         (existing: {} {}); pass replace to overwrite it",
                        config.name,
                        existing.command,
                        existing.args.join(" ")
                    )));
                }
            }
        };

        if change != ConfigChange::Unchanged {
            self.store.upsert_server(config.clone()).await?;
            if let Some(instance) = self.instance(&config.name) {
                instance.set_config(config.clone());
            }
            info!(server = %config.name, change = ?change, "MCP server config saved");
        }
        Ok(change)
    }

    /// Delete the config, then stop the instance for good. Rejected while any
    /// agent scope references the server; the check and the delete are one
    /// store mutation, so nothing is torn down for a rejected request.
    pub async fn remove(&self, name: &str) -> ToolportResult<()> {
        let _guard = self.mutations.lock().await;
        if !self.store.remove_server(name).await? {
            return Err(ToolportError::Config(format!("unknown MCP server '{name}'")));
        }

        let instance = self.instances.write().remove(name);
        if let Some(instance) = instance {
            instance.retire().await?;
        }
        info!(server = %name, "MCP server removed");
        Ok(())
    }

    /// Stored config for `name`.
    pub fn get(&self, name: &str) -> Option<ServerConfig> {
        self.store.server(name)
    }

    /// Every config, paired with its instance if one has been created.
    pub fn list(&self) -> Vec<(ServerConfig, Option<Arc<ServerInstance>>)> {
        let instances = self.instances.read();
        self.store
            .servers()
            .into_iter()
            .map(|config| {
                let instance = instances.get(&config.name).cloned();
                (config, instance)
            })
            .collect()
    }

    /// The instance for `name`, if one has been created.
    pub fn instance(&self, name: &str) -> Option<Arc<ServerInstance>> {
        self.instances.read().get(name).cloned()
    }

    /// Every created instance.
    pub fn instances(&self) -> Vec<Arc<ServerInstance>> {
        self.instances.read().values().cloned().collect()
    }

    /// The instance for `name`, created on first use. The config is looked up
    /// under the instance map lock, so an instance never outlives a removal.
    pub fn instance_or_create(&self, name: &str) -> ToolportResult<Arc<ServerInstance>> {
        let mut instances = self.instances.write();
        if let Some(instance) = instances.get(name) {
            return Ok(instance.clone());
        }
        let config = self
            .store
            .server(name)
            .ok_or_else(|| ToolportError::Config(format!("unknown MCP server '{name}'")))?;
        let instance = ServerInstance::new(config, self.settings.clone(), self.events.clone());
        instances.insert(name.to_string(), instance.clone());
        Ok(instance)
    }
}
