//! One configured MCP server at runtime.
//!
//! A [`ServerInstance`] couples a client/transport pair with the status state
//! machine, the capability cache, and a supervisor task. The supervisor is the
//! single background driver per instance: it probes health, notices crashes,
//! and schedules restarts with backoff. Every status change happens under the
//! instance's lifecycle lock, so start, stop, retry and the supervisor never
//! interleave for the same server.

use crate::client::McpClient;
use crate::config::{McpSettings, ServerConfig};
use crate::protocol::{McpToolDef, McpToolResult, METHOD_NOT_FOUND, NOTIFICATION_TOOLS_CHANGED};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use toolport_core::{ToolportError, ToolportResult};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Not running; the initial state.
    Stopped,
    /// Spawning, handshaking and fetching tools.
    Starting,
    /// Handshake done and tools fetched.
    Running,
    /// Failed; a restart may be scheduled.
    Error,
    /// Waiting out the backoff before the next start.
    Restarting,
}

impl ServerStatus {
    /// Allowed transitions. Explicit stop/remove may end any state.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ServerStatus::*;
        if self == next {
            return false;
        }
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Error)
                | (Error, Restarting)
                | (Error, Starting)
                | (Restarting, Starting)
                | (_, Stopped)
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
            Self::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

/// Published on every status transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    /// Server the transition belongs to.
    pub server: String,
    /// Previous status.
    pub from: ServerStatus,
    /// New status.
    pub to: ServerStatus,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Failure that caused the transition, if any.
    pub error: Option<String>,
}

/// Consistent point-in-time view of an instance. Replaced whole on every
/// change, never edited in place.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    /// Current lifecycle state.
    pub status: ServerStatus,
    /// Most recent failure, kept until the next successful start.
    pub last_error: Option<String>,
    /// Last fetched tool list. Kept across failures.
    pub tools: Vec<McpToolDef>,
    /// The tool list is from a connection that is no longer running.
    pub tools_stale: bool,
    /// At least one tool-list fetch has completed.
    pub tools_fetched: bool,
    /// When the cached tool list was fetched.
    pub tools_fetched_at: Option<DateTime<Utc>>,
    /// When the last health probe finished.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Failed probes since the last success.
    pub consecutive_failures: u32,
    /// Automatic restarts in the current failure episode.
    pub restart_attempts: u32,
    /// Automatic restarts gave up; only a manual retry restarts the server.
    pub restart_exhausted: bool,
    /// OS process id while a process is owned.
    pub pid: Option<u32>,
    /// When the server last reached Running.
    pub running_since: Option<DateTime<Utc>>,
}

impl Default for InstanceSnapshot {
    fn default() -> Self {
        Self {
            status: ServerStatus::Stopped,
            last_error: None,
            tools: Vec::new(),
            tools_stale: false,
            tools_fetched: false,
            tools_fetched_at: None,
            last_health_check: None,
            consecutive_failures: 0,
            restart_attempts: 0,
            restart_exhausted: false,
            pid: None,
            running_since: None,
        }
    }
}

enum Supervise {
    Monitor(Arc<McpClient>),
    Recover,
}

/// Runtime state for one configured server.
pub struct ServerInstance {
    name: String,
    config: RwLock<ServerConfig>,
    settings: Arc<McpSettings>,
    state: RwLock<Arc<InstanceSnapshot>>,
    client: RwLock<Option<Arc<McpClient>>>,
    lifecycle: AsyncRwLock<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by stop/retry to abandon an in-progress start.
    cancel: watch::Sender<u64>,
    events: broadcast::Sender<StatusEvent>,
    /// Set once the config is deleted; the instance never starts again.
    retired: AtomicBool,
}

impl ServerInstance {
    /// A stopped instance for `config`. Transitions are published on `events`.
    pub fn new(
        config: ServerConfig,
        settings: Arc<McpSettings>,
        events: broadcast::Sender<StatusEvent>,
    ) -> Arc<Self> {
        let (cancel, _) = watch::channel(0);
        Arc::new(Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            settings,
            state: RwLock::new(Arc::new(InstanceSnapshot::default())),
            client: RwLock::new(None),
            lifecycle: AsyncRwLock::new(()),
            supervisor: Mutex::new(None),
            cancel,
            events,
            retired: AtomicBool::new(false),
        })
    }

    /// Server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current launch config.
    pub fn config(&self) -> ServerConfig {
        self.config.read().clone()
    }

    /// Replace the launch config. Takes effect on the next start.
    pub fn set_config(&self, config: ServerConfig) {
        *self.config.write() = config;
    }

    /// The current state, published as a whole.
    pub fn snapshot(&self) -> Arc<InstanceSnapshot> {
        self.state.read().clone()
    }

    /// Current status.
    pub fn status(&self) -> ServerStatus {
        self.state.read().status
    }

    /// Start the server if it is stopped. Other states are left to the
    /// supervisor or to [`ServerInstance::retry_now`].
    pub async fn start(self: &Arc<Self>) -> ToolportResult<()> {
        let _guard = self.lifecycle.write().await;
        self.ensure_not_retired()?;
        match self.status() {
            ServerStatus::Stopped => {}
            ServerStatus::Running | ServerStatus::Starting | ServerStatus::Restarting => {
                return Ok(())
            }
            ServerStatus::Error => {
                let message = self
                    .snapshot()
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "server is in error state".to_string());
                return Err(ToolportError::Transport(message));
            }
        }
        self.launch_and_supervise().await
    }

    /// Reset backoff state and start immediately, from any non-running state.
    pub async fn retry_now(self: &Arc<Self>) -> ToolportResult<()> {
        self.cancel.send_modify(|g| *g += 1);
        self.cancel_supervisor();
        let _guard = self.lifecycle.write().await;
        self.cancel_supervisor();
        self.ensure_not_retired()?;

        if self.status() == ServerStatus::Running {
            let alive = self
                .client
                .read()
                .as_ref()
                .is_some_and(|c| c.closed_signal().borrow().is_none());
            if alive {
                return Ok(());
            }
            let lost = self.client.write().take();
            if let Some(client) = lost {
                let _ = client.shutdown(Duration::ZERO).await;
            }
            self.enter(ServerStatus::Error, Some("connection lost".to_string()));
        }

        self.update(|s| {
            s.restart_attempts = 0;
            s.restart_exhausted = false;
            s.consecutive_failures = 0;
        });
        info!(server = %self.name, "manual retry requested");
        self.launch_and_supervise().await
    }

    /// Stop the server: abandon any start in progress, cancel the
    /// supervisor, and reap the process.
    pub async fn stop(&self) -> ToolportResult<()> {
        self.cancel.send_modify(|g| *g += 1);
        self.cancel_supervisor();
        let _guard = self.lifecycle.write().await;
        self.cancel_supervisor();

        let client = self.client.write().take();
        if let Some(client) = client {
            if let Err(e) = client.shutdown(self.settings.stop_timeout()).await {
                warn!(server = %self.name, error = %e, "error while stopping MCP server");
            }
        }
        if self.status() != ServerStatus::Stopped {
            self.enter(ServerStatus::Stopped, None);
            info!(server = %self.name, "MCP server stopped");
        }
        Ok(())
    }

    /// Stop for good: used when the server's config is deleted. Later
    /// start and retry requests are rejected.
    pub async fn retire(&self) -> ToolportResult<()> {
        self.retired.store(true, Ordering::SeqCst);
        self.stop().await
    }

    /// Whether [`ServerInstance::retire`] has been called.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn ensure_not_retired(&self) -> ToolportResult<()> {
        if self.is_retired() {
            return Err(ToolportError::Config(format!(
                "MCP server '{}' has been removed",
                self.name
            )));
        }
        Ok(())
    }

    /// Call a tool on the running server.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> ToolportResult<McpToolResult> {
        let client = self.running_client()?;
        client.call_tool(tool, arguments, timeout).await
    }

    /// Fetch the tool list again from the running server and cache it.
    pub async fn refresh_tools(&self, timeout: Duration) -> ToolportResult<Vec<McpToolDef>> {
        let client = self.running_client()?;
        let tools = client.list_tools(timeout).await?;
        self.store_tools(&tools);
        Ok(tools)
    }

    fn running_client(&self) -> ToolportResult<Arc<McpClient>> {
        let status = self.status();
        let client = self.client.read().clone();
        match client {
            Some(client) if status == ServerStatus::Running => Ok(client),
            _ => Err(ToolportError::Transport(format!(
                "server '{}' is not running (status: {status})",
                self.name
            ))),
        }
    }

    fn store_tools(&self, tools: &[McpToolDef]) {
        let mut guard = self.state.write();
        if guard.status != ServerStatus::Running {
            return;
        }
        let mut next = (**guard).clone();
        next.tools = tools.to_vec();
        next.tools_stale = false;
        next.tools_fetched_at = Some(Utc::now());
        *guard = Arc::new(next);
    }

    // --- State machine ---

    fn update(&self, f: impl FnOnce(&mut InstanceSnapshot)) {
        let mut guard = self.state.write();
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Move to any state but Running. Returns false for a disallowed move.
    fn enter(&self, to: ServerStatus, error: Option<String>) -> bool {
        debug_assert!(to != ServerStatus::Running);
        self.apply(to, error, None)
    }

    /// The only way into Running: requires the fetched tool list.
    fn mark_running(&self, tools: Vec<McpToolDef>, pid: Option<u32>) -> bool {
        self.apply(ServerStatus::Running, None, Some((tools, pid)))
    }

    fn apply(
        &self,
        to: ServerStatus,
        error: Option<String>,
        running: Option<(Vec<McpToolDef>, Option<u32>)>,
    ) -> bool {
        let from = {
            let mut guard = self.state.write();
            let from = guard.status;
            if !from.can_transition_to(to) || (to == ServerStatus::Running && running.is_none()) {
                warn!(server = %self.name, from = %from, to = %to, "rejected invalid status transition");
                return false;
            }

            let mut next = (**guard).clone();
            next.status = to;
            match to {
                ServerStatus::Running => {
                    if let Some((tools, pid)) = running {
                        next.tools = tools;
                        next.pid = pid;
                    }
                    next.tools_fetched = true;
                    next.tools_stale = false;
                    next.tools_fetched_at = Some(Utc::now());
                    next.last_error = None;
                    next.consecutive_failures = 0;
                    next.restart_attempts = 0;
                    next.restart_exhausted = false;
                    next.running_since = Some(Utc::now());
                }
                ServerStatus::Error => {
                    next.last_error = error.clone();
                    next.tools_stale = next.tools_fetched;
                    next.pid = None;
                    next.running_since = None;
                }
                ServerStatus::Stopped => {
                    next.tools_stale = next.tools_fetched;
                    next.pid = None;
                    next.running_since = None;
                    next.consecutive_failures = 0;
                }
                ServerStatus::Starting | ServerStatus::Restarting => {}
            }
            *guard = Arc::new(next);
            from
        };

        match &error {
            Some(e) => warn!(server = %self.name, from = %from, to = %to, error = %e, "MCP server status changed"),
            None => info!(server = %self.name, from = %from, to = %to, "MCP server status changed"),
        }
        let _ = self.events.send(StatusEvent {
            server: self.name.clone(),
            from,
            to,
            at: Utc::now(),
            error,
        });
        true
    }

    // --- Starting ---

    /// Launch and hand the outcome to a fresh supervisor. Caller holds the
    /// lifecycle write lock.
    async fn launch_and_supervise(self: &Arc<Self>) -> ToolportResult<()> {
        let generation = *self.cancel.borrow();
        match self.launch().await {
            Ok(client) => {
                self.spawn_supervisor(Supervise::Monitor(client));
                Ok(())
            }
            Err(e) => {
                if *self.cancel.borrow() != generation {
                    debug!(server = %self.name, "start abandoned by a stop request");
                } else if matches!(e, ToolportError::Spawn(_) | ToolportError::Config(_)) {
                    warn!(
                        server = %self.name,
                        error = %e,
                        "not restarting automatically: the launch configuration is unusable"
                    );
                } else {
                    self.spawn_supervisor(Supervise::Recover);
                }
                Err(e)
            }
        }
    }

    /// Starting → Running or Starting → Error. Caller holds the lifecycle
    /// write lock. A cancelled start leaves the status at Starting for the
    /// canceller to resolve.
    async fn launch(&self) -> ToolportResult<Arc<McpClient>> {
        let mut cancel = self.cancel.subscribe();
        let generation = *cancel.borrow_and_update();

        self.enter(ServerStatus::Starting, None);
        match self.connect(&mut cancel, generation).await {
            Ok((client, tools)) => {
                let count = tools.len();
                *self.client.write() = Some(client.clone());
                self.mark_running(tools, client.pid());
                info!(server = %self.name, tools = count, "MCP server running");
                Ok(client)
            }
            Err(e) => {
                if *cancel.borrow() == generation {
                    self.enter(ServerStatus::Error, Some(e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// Spawn, handshake, and fetch the tool list within the handshake timeout.
    async fn connect(
        &self,
        cancel: &mut watch::Receiver<u64>,
        generation: u64,
    ) -> ToolportResult<(Arc<McpClient>, Vec<McpToolDef>)> {
        let config = self.config();
        let handshake_timeout = self.settings.handshake_timeout();
        let deadline = Instant::now() + handshake_timeout;
        let cancelled = || ToolportError::Handshake(format!("start of '{}' was cancelled", self.name));

        let transport = tokio::select! {
            t = Transport::start(&config, handshake_timeout) => t?,
            _ = cancel.wait_for(|g| *g != generation) => return Err(cancelled()),
        };
        let client = Arc::new(McpClient::new(transport));

        let handshake = async {
            client
                .initialize(deadline.saturating_duration_since(Instant::now()))
                .await?;
            client
                .list_tools(deadline.saturating_duration_since(Instant::now()))
                .await
                .map_err(|e| {
                    ToolportError::Handshake(format!(
                        "server '{}': tool discovery failed: {e}",
                        self.name
                    ))
                })
        };

        let (outcome, grace) = tokio::select! {
            r = handshake => (r, self.settings.stop_timeout()),
            _ = cancel.wait_for(|g| *g != generation) => (Err(cancelled()), Duration::ZERO),
        };

        match outcome {
            Ok(tools) => Ok((client, tools)),
            Err(e) => {
                let _ = client.shutdown(grace).await;
                Err(e)
            }
        }
    }

    // --- Supervision ---

    fn spawn_supervisor(self: &Arc<Self>, mode: Supervise) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.supervise(mode).await });
        if let Some(previous) = self.supervisor.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_supervisor(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }

    async fn supervise(self: Arc<Self>, mut mode: Supervise) {
        loop {
            mode = match mode {
                Supervise::Monitor(client) => self.monitor(client).await,
                Supervise::Recover => match self.recover().await {
                    Some(client) => Supervise::Monitor(client),
                    None => return,
                },
            };
        }
    }

    /// Watch a running connection until it fails, then move to Error.
    async fn monitor(&self, client: Arc<McpClient>) -> Supervise {
        let interval = self.settings.health_check_interval();
        let probe_timeout = interval.min(self.settings.call_timeout());
        let threshold = self.settings.failure_threshold;

        let mut closed = client.closed_signal();
        let mut notes = client.subscribe_notifications();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let exit_reason = closed.borrow_and_update().clone();
            if let Some(reason) = exit_reason {
                self.fail_running(&client, format!("server exited: {reason}"))
                    .await;
                return Supervise::Recover;
            }

            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        self.fail_running(&client, "transport dropped".to_string()).await;
                        return Supervise::Recover;
                    }
                }
                _ = ticker.tick() => {
                    let failures = self.health_check(&client, probe_timeout).await;
                    if failures >= threshold {
                        let reason = format!("{failures} consecutive health checks failed");
                        self.fail_running(&client, reason).await;
                        return Supervise::Recover;
                    }
                }
                note = notes.recv() => {
                    if let Ok(note) = note {
                        if note.method == NOTIFICATION_TOOLS_CHANGED {
                            self.refresh_after_change(&client).await;
                        }
                    }
                }
            }
        }
    }

    /// Probe once; returns the consecutive failure count afterwards.
    async fn health_check(&self, client: &McpClient, timeout: Duration) -> u32 {
        let outcome = match client.ping(timeout).await {
            Ok(()) => Ok(()),
            // The server answered, it just does not implement ping.
            Err(ToolportError::Protocol {
                code: Some(METHOD_NOT_FOUND),
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        };

        let mut failures = 0;
        self.update(|s| {
            s.last_health_check = Some(Utc::now());
            s.consecutive_failures = match &outcome {
                Ok(()) => 0,
                Err(_) => s.consecutive_failures + 1,
            };
            failures = s.consecutive_failures;
        });
        if let Err(e) = outcome {
            warn!(server = %self.name, failures = failures, error = %e, "MCP health check failed");
        }
        failures
    }

    async fn refresh_after_change(&self, client: &McpClient) {
        match client.list_tools(self.settings.call_timeout()).await {
            Ok(tools) => {
                info!(server = %self.name, tools = tools.len(), "MCP tool list changed");
                self.store_tools(&tools);
            }
            Err(e) => warn!(server = %self.name, error = %e, "failed to refresh tool list"),
        }
    }

    /// Running → Error. The connection is torn down first so in-flight calls
    /// fail fast instead of waiting out their timeouts.
    async fn fail_running(&self, client: &McpClient, reason: String) {
        let _ = client.shutdown(Duration::ZERO).await;
        let _guard = self.lifecycle.write().await;
        if self.status() != ServerStatus::Running {
            return;
        }
        self.client.write().take();
        self.enter(ServerStatus::Error, Some(reason));
    }

    /// Error → Restarting → Starting, with backoff, until running or out of
    /// attempts.
    async fn recover(&self) -> Option<Arc<McpClient>> {
        let policy = &self.settings.backoff;
        loop {
            let attempt = {
                let _guard = self.lifecycle.write().await;
                let snapshot = self.snapshot();
                if snapshot.status != ServerStatus::Error {
                    return None;
                }
                if !policy.allows(snapshot.restart_attempts) {
                    let attempts = snapshot.restart_attempts;
                    let cause = snapshot.last_error.clone().unwrap_or_default();
                    self.update(|s| {
                        s.restart_exhausted = true;
                        s.last_error = Some(format!(
                            "{cause} (gave up after {attempts} restart attempts, manual retry required)"
                        ));
                    });
                    error!(server = %self.name, attempts = attempts, "MCP server restart attempts exhausted");
                    return None;
                }
                let attempt = snapshot.restart_attempts + 1;
                self.update(|s| s.restart_attempts = attempt);
                self.enter(ServerStatus::Restarting, None);
                attempt
            };

            let delay = policy.delay(attempt);
            warn!(
                server = %self.name,
                attempt = attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "restarting MCP server after backoff"
            );
            tokio::time::sleep(delay).await;

            let _guard = self.lifecycle.write().await;
            if self.status() != ServerStatus::Restarting {
                return None;
            }
            if let Ok(client) = self.launch().await {
                return Some(client);
            }
        }
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}
