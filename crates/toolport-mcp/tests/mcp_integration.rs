#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the toolport-mcp crate.
//!
//! Real subprocesses come from the `toolport-mock-server` binary built with
//! this package; TCP cases use an in-process fake server.

use futures_util::future::join_all;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Instant;
use toolport_core::{ToolCall, ToolportError};
use toolport_mcp::protocol::{IncomingMessage, JsonRpcResponse};
use toolport_mcp::{
    BackoffPolicy, ConfigChange, McpClient, McpManager, McpSettings, ServerConfig, ServerStatus,
    StatusEvent, Transport,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const MOCK: &str = env!("CARGO_BIN_EXE_toolport-mock-server");

fn mock(name: &str, extra: &[&str]) -> ServerConfig {
    let mut args = vec!["--name", name];
    args.extend_from_slice(extra);
    ServerConfig::new(name, MOCK, &args)
}

fn fast_settings(dir: &Path) -> McpSettings {
    McpSettings {
        health_check_interval_ms: 100,
        failure_threshold: 3,
        handshake_timeout_ms: 5_000,
        call_timeout_ms: 5_000,
        stop_timeout_ms: 500,
        backoff: BackoffPolicy {
            base_ms: 20,
            max_ms: 200,
            max_attempts: 3,
            jitter: 0.0,
        },
        ..McpSettings::with_data_dir(dir)
    }
}

async fn open(dir: &Path) -> McpManager {
    McpManager::open(fast_settings(dir)).await.unwrap()
}

/// Poll until `check` holds or `within` elapses.
async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Collect events for `server` until one satisfies `stop` or `within` elapses.
async fn events_until(
    rx: &mut broadcast::Receiver<StatusEvent>,
    server: &str,
    within: Duration,
    stop: impl Fn(&StatusEvent) -> bool,
) -> Vec<(ServerStatus, ServerStatus)> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(within, async {
        while let Ok(event) = rx.recv().await {
            if event.server != server {
                continue;
            }
            seen.push((event.from, event.to));
            if stop(&event) {
                break;
            }
        }
    })
    .await;
    seen
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The state follows the parenthesised command; 'Z' is an unreaped zombie.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state != "Z")
}

#[cfg(target_os = "linux")]
fn processes_with_marker(marker: &str) -> usize {
    std::fs::read_dir("/proc")
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().chars().all(|c| c.is_ascii_digit()))
        .filter(|e| {
            std::fs::read(e.path().join("cmdline"))
                .map(|raw| String::from_utf8_lossy(&raw).contains(marker))
                .unwrap_or(false)
        })
        .count()
}

// ---------------------------------------------------------------------------
// 1. Agent scoping (create, enable, expose, hide)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_scope_controls_tool_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;

    manager
        .add_server(mock("files", &["--root", "/tmp"]), false)
        .await
        .unwrap();
    let outcome = manager.enable_global("files").await.unwrap();
    assert_eq!(outcome.status, ServerStatus::Running);
    assert!(outcome.warning.is_none());

    manager.enable_for_agent("research", "files").await.unwrap();
    let tools = manager.list_tools_for_agent("research").unwrap();
    assert!(!tools.is_empty());
    assert!(tools.iter().all(|t| t.name.starts_with("files.")));
    assert!(tools.iter().any(|t| t.name == "files.echo"));

    // Another agent sees nothing.
    assert!(manager.list_tools_for_agent("ops").unwrap().is_empty());

    manager.disable_for_agent("research", "files").await.unwrap();
    assert!(manager.list_tools_for_agent("research").unwrap().is_empty());
    assert_eq!(
        manager.server_report("files").unwrap().status,
        ServerStatus::Running
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn agent_enable_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager.add_server(mock("files", &[]), false).await.unwrap();

    assert!(manager.enable_for_agent("research", "files").await.unwrap().changed);
    assert!(!manager.enable_for_agent("research", "files").await.unwrap().changed);
    let record = manager.registry().store().record();
    assert_eq!(record.agents["research"].len(), 1);

    assert!(manager.disable_for_agent("research", "files").await.unwrap());
    assert!(!manager.disable_for_agent("research", "files").await.unwrap());
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. Tool calls through the adapter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tool_calls_are_routed_and_flattened() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager.add_server(mock("files", &[]), false).await.unwrap();
    manager.enable_for_agent("research", "files").await.unwrap();

    let result = manager
        .call_tool(
            "research",
            ToolCall::new("c1", "files.echo", json!({"text": "hello"})),
        )
        .await
        .unwrap();
    assert_eq!(result.call_id, "c1");
    assert_eq!(result.content, "hello");
    assert!(!result.is_error);

    let result = manager
        .call_tool("research", ToolCall::new("c2", "files.fail", json!({})))
        .await
        .unwrap();
    assert!(result.is_error);
    assert_eq!(result.content, "intentional failure");

    let err = manager
        .call_tool("research", ToolCall::new("c3", "files.missing", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolportError::ToolFailure(_)));

    let err = manager
        .call_tool("ops", ToolCall::new("c4", "files.echo", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolportError::ToolFailure(_)));

    manager.shutdown().await;
}

#[tokio::test]
async fn concurrent_calls_resolve_independently() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager.add_server(mock("files", &[]), false).await.unwrap();
    manager.enable_for_agent("research", "files").await.unwrap();

    let calls = (0..20).map(|i| {
        manager.call_tool(
            "research",
            ToolCall::new(format!("c{i}"), "files.add", json!({"a": i, "b": 100})),
        )
    });
    let results = join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        let result = result.unwrap();
        assert_eq!(result.call_id, format!("c{i}"));
        assert_eq!(result.content, (i + 100).to_string());
    }
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 3. Crash recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crashed_server_restarts_with_same_tools() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager.add_server(mock("files", &[]), false).await.unwrap();
    manager.enable_for_agent("research", "files").await.unwrap();

    let before = manager.list_tools_for_server("files").unwrap();
    let first_pid = manager.server_report("files").unwrap().pid;
    let mut events = manager.subscribe();

    let err = manager
        .call_tool("research", ToolCall::new("c1", "files.crash", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolportError::ToolFailure(_)));

    let path = events_until(&mut events, "files", Duration::from_secs(10), |e| {
        e.to == ServerStatus::Running
    })
    .await;
    assert_eq!(
        path,
        vec![
            (ServerStatus::Running, ServerStatus::Error),
            (ServerStatus::Error, ServerStatus::Restarting),
            (ServerStatus::Restarting, ServerStatus::Starting),
            (ServerStatus::Starting, ServerStatus::Running),
        ]
    );

    let report = manager.server_report("files").unwrap();
    assert_eq!(report.status, ServerStatus::Running);
    assert_eq!(report.restart_attempts, 0);
    assert!(!report.tools_stale);
    assert_ne!(report.pid, first_pid);
    assert_eq!(manager.list_tools_for_server("files").unwrap(), before);

    manager.shutdown().await;
}

#[tokio::test]
async fn tools_stay_visible_as_stale_during_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = fast_settings(dir.path());
    settings.backoff.max_attempts = 0;
    let manager = McpManager::open(settings).await.unwrap();
    manager.add_server(mock("files", &[]), false).await.unwrap();
    manager.enable_for_agent("research", "files").await.unwrap();
    let count = manager.list_tools_for_agent("research").unwrap().len();

    let _ = manager
        .call_tool("research", ToolCall::new("c1", "files.crash", json!({})))
        .await;

    let registry = manager.registry().clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            registry
                .instance("files")
                .is_some_and(|i| i.snapshot().restart_exhausted)
        })
        .await
    );

    let report = manager.server_report("files").unwrap();
    assert_eq!(report.status, ServerStatus::Error);
    assert!(report.tools_stale);
    assert_eq!(report.tool_count, count);
    assert_eq!(manager.list_tools_for_agent("research").unwrap().len(), count);

    manager.shutdown().await;
}

#[tokio::test]
async fn restart_attempts_are_capped_until_manual_retry() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager
        .add_server(ServerConfig::new("flaky", "sh", &["-c", "exit 1"]), false)
        .await
        .unwrap();

    let outcome = manager.enable_global("flaky").await.unwrap();
    assert_ne!(outcome.status, ServerStatus::Running);
    assert!(outcome.warning.is_some());

    let registry = manager.registry().clone();
    assert!(
        eventually(Duration::from_secs(10), || {
            registry
                .instance("flaky")
                .is_some_and(|i| i.snapshot().restart_exhausted)
        })
        .await
    );
    let report = manager.server_report("flaky").unwrap();
    assert_eq!(report.status, ServerStatus::Error);
    assert_eq!(report.restart_attempts, 3);
    assert!(report.last_error.unwrap().contains("manual retry"));

    // Exhausted servers stay put on their own.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.server_report("flaky").unwrap().restart_attempts, 3);

    let status = manager.retry_now("flaky").await.unwrap();
    assert_ne!(status, ServerStatus::Running);
    assert!(!manager.server_report("flaky").unwrap().restart_exhausted);

    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 4. Health checks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_health_checks_trigger_exactly_one_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = fast_settings(dir.path());
    settings.backoff.max_attempts = 0;
    let manager = McpManager::open(settings).await.unwrap();
    manager
        .add_server(mock("quiet", &["--ping", "silent"]), false)
        .await
        .unwrap();

    let mut events = manager.subscribe();
    assert_eq!(
        manager.enable_global("quiet").await.unwrap().status,
        ServerStatus::Running
    );

    let path = events_until(&mut events, "quiet", Duration::from_secs(5), |e| {
        e.to == ServerStatus::Error
    })
    .await;
    assert_eq!(path.last(), Some(&(ServerStatus::Running, ServerStatus::Error)));

    // Nothing further arrives: no second error, no restart.
    let later = events_until(&mut events, "quiet", Duration::from_millis(600), |_| false).await;
    assert!(later.is_empty(), "unexpected events: {later:?}");

    let report = manager.server_report("quiet").unwrap();
    assert_eq!(report.consecutive_failures, 3);
    assert!(report.last_health_check.is_some());
    assert!(report.last_error.unwrap().contains("health check"));

    manager.shutdown().await;
}

#[tokio::test]
async fn healthy_server_resets_failure_count() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager.add_server(mock("files", &[]), false).await.unwrap();
    manager.enable_global("files").await.unwrap();

    let registry = manager.registry().clone();
    assert!(
        eventually(Duration::from_secs(3), || {
            registry
                .instance("files")
                .is_some_and(|i| i.snapshot().last_health_check.is_some())
        })
        .await
    );
    let report = manager.server_report("files").unwrap();
    assert_eq!(report.status, ServerStatus::Running);
    assert_eq!(report.consecutive_failures, 0);
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 5. Stop and remove
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
#[tokio::test]
async fn stop_reaps_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager.add_server(mock("files", &[]), false).await.unwrap();
    manager.enable_global("files").await.unwrap();

    let pid = manager.server_report("files").unwrap().pid.unwrap();
    assert!(process_alive(pid));

    manager.disable_global("files").await.unwrap();
    assert_eq!(
        manager.server_report("files").unwrap().status,
        ServerStatus::Stopped
    );
    assert!(!process_alive(pid));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn stop_during_startup_leaves_no_process() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    let marker = format!("slow-{}", uuid_like());
    manager
        .add_server(mock(&marker, &["--startup-delay-ms", "10000"]), false)
        .await
        .unwrap();
    manager
        .registry()
        .store()
        .enable_global(&marker)
        .await
        .unwrap();

    let instance = manager.registry().instance_or_create(&marker).unwrap();
    let starting = instance.clone();
    let start = tokio::spawn(async move { starting.start().await });

    assert!(
        eventually(Duration::from_secs(3), || {
            instance.status() == ServerStatus::Starting && processes_with_marker(&marker) > 0
        })
        .await
    );

    instance.stop().await.unwrap();
    assert_eq!(instance.status(), ServerStatus::Stopped);
    assert!(start.await.unwrap().is_err());
    assert_eq!(processes_with_marker(&marker), 0);
}

#[cfg(target_os = "linux")]
fn uuid_like() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    )
}

#[tokio::test]
async fn remove_is_rejected_while_an_agent_uses_the_server() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager.add_server(mock("files", &[]), false).await.unwrap();
    manager.enable_for_agent("research", "files").await.unwrap();

    let err = manager.remove_server("files").await.unwrap_err();
    assert!(matches!(err, ToolportError::StillInUse { .. }));
    let err = manager.disable_global("files").await.unwrap_err();
    assert!(err.is_rejection());
    assert_eq!(
        manager.server_report("files").unwrap().status,
        ServerStatus::Running
    );

    manager.disable_for_agent("research", "files").await.unwrap();
    manager.remove_server("files").await.unwrap();
    assert!(manager.list_servers().is_empty());
    assert!(manager.registry().instance("files").is_none());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn concurrent_remove_and_enable_leave_no_orphan() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    let marker = format!("race-{}", uuid_like());
    manager.add_server(mock(&marker, &[]), false).await.unwrap();

    let (removed, enabled) = tokio::join!(
        manager.remove_server(&marker),
        manager.enable_global(&marker)
    );
    removed.unwrap();
    if let Err(e) = enabled {
        assert!(matches!(e, ToolportError::Config(_)), "got {e:?}");
    }

    assert!(manager.registry().get(&marker).is_none());
    assert!(manager.registry().instance(&marker).is_none());
    assert!(eventually(Duration::from_secs(3), || processes_with_marker(&marker) == 0).await);
    assert!(manager.enable_global(&marker).await.is_err());
}

#[tokio::test]
async fn agent_enable_racing_global_disable_keeps_agent_served() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager.add_server(mock("files", &[]), false).await.unwrap();
    manager.enable_global("files").await.unwrap();

    let (disabled, enabled) = tokio::join!(
        manager.disable_global("files"),
        manager.enable_for_agent("research", "files")
    );
    enabled.unwrap();
    if let Err(e) = disabled {
        assert!(matches!(e, ToolportError::StillInUse { .. }), "got {e:?}");
    }

    // Whichever ran first, the agent ends up with a running, enabled server.
    let report = manager.server_report("files").unwrap();
    assert!(report.globally_enabled);
    assert_eq!(report.agents, vec!["research".to_string()]);
    assert_eq!(report.status, ServerStatus::Running);
    assert!(!manager.list_tools_for_agent("research").unwrap().is_empty());
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 6. Bulk import
// ---------------------------------------------------------------------------

#[tokio::test]
async fn import_keeps_valid_entries() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;

    let report = manager
        .import_configs(vec![
            mock("files", &["--root", "/tmp"]),
            mock("git", &[]),
            ServerConfig::new("files", "some-other-fs", &[]),
        ])
        .await;
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert!(!report.entries[2].success);
    assert!(report.entries[2].error.is_some());

    let servers = manager.list_servers();
    assert_eq!(servers.len(), 2);
    assert_eq!(manager.registry().get("files").unwrap().command, MOCK);

    // Durable across a reopen.
    drop(manager);
    let manager = open(dir.path()).await;
    assert_eq!(manager.list_servers().len(), 2);
}

#[tokio::test]
async fn import_identical_duplicate_is_success() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    let report = manager
        .import_configs(vec![mock("files", &[]), mock("files", &[])])
        .await;
    assert_eq!(report.succeeded(), 2);
    assert_eq!(manager.list_servers().len(), 1);
}

#[tokio::test]
async fn import_rejects_invalid_names() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    let report = manager
        .import_configs(vec![mock("files", &[]), ServerConfig::new("bad.name", "x", &[])])
        .await;
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.entries[1].name, "bad.name");
}

// ---------------------------------------------------------------------------
// 7. Connection test, replace, persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connection_test_does_not_change_enablement() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager.add_server(mock("files", &[]), false).await.unwrap();

    let report = manager.test_connection("files").await.unwrap();
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.tool_count, 6);
    let server = manager.server_report("files").unwrap();
    assert!(!server.globally_enabled);
    assert_eq!(server.status, ServerStatus::Stopped);

    manager.enable_global("files").await.unwrap();
    let report = manager.test_connection("files").await.unwrap();
    assert!(report.success);
    assert_eq!(
        manager.server_report("files").unwrap().status,
        ServerStatus::Running
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn replacing_launch_settings_restarts_running_server() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager.add_server(mock("files", &[]), false).await.unwrap();
    manager.enable_global("files").await.unwrap();
    let old_pid = manager.server_report("files").unwrap().pid;

    let updated = mock("files", &["--root", "/srv"]);
    assert!(manager.add_server(updated.clone(), false).await.is_err());
    assert_eq!(
        manager.add_server(updated, true).await.unwrap(),
        ConfigChange::Replaced
    );

    let report = manager.server_report("files").unwrap();
    assert_eq!(report.status, ServerStatus::Running);
    assert_ne!(report.pid, old_pid);
    assert!(report.args.contains(&"/srv".to_string()));
    assert!(report.globally_enabled);
    manager.shutdown().await;
}

#[tokio::test]
async fn enabled_servers_are_replayed_on_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let manager = open(dir.path()).await;
        manager.add_server(mock("files", &[]), false).await.unwrap();
        manager.add_server(mock("idle", &[]), false).await.unwrap();
        manager.enable_for_agent("research", "files").await.unwrap();
        manager.shutdown().await;
    }

    let manager = open(dir.path()).await;
    assert_eq!(
        manager.server_report("files").unwrap().status,
        ServerStatus::Running
    );
    assert_eq!(
        manager.server_report("idle").unwrap().status,
        ServerStatus::Stopped
    );
    assert!(!manager.list_tools_for_agent("research").unwrap().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn tool_list_change_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager.add_server(mock("files", &[]), false).await.unwrap();
    manager.enable_for_agent("research", "files").await.unwrap();
    assert_eq!(manager.list_tools_for_server("files").unwrap().len(), 6);

    let grown = manager
        .call_tool("research", ToolCall::new("c1", "files.grow", json!({})))
        .await
        .unwrap();
    assert_eq!(grown.content, "extra_6");

    let registry = manager.registry().clone();
    assert!(
        eventually(Duration::from_secs(3), || {
            registry
                .instance("files")
                .is_some_and(|i| i.snapshot().tools.len() == 7)
        })
        .await
    );
    assert!(manager
        .list_tools_for_agent("research")
        .unwrap()
        .iter()
        .any(|t| t.name == "files.extra_6"));
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 8. Client against a real subprocess
// ---------------------------------------------------------------------------

async fn connect(config: &ServerConfig) -> McpClient {
    let transport = Transport::start(config, Duration::from_secs(5)).await.unwrap();
    let client = McpClient::new(transport);
    client.initialize(Duration::from_secs(5)).await.unwrap();
    client
}

#[tokio::test]
async fn call_timeout_does_not_break_the_client() {
    let client = connect(&mock("slow", &[])).await;

    let started = Instant::now();
    let err = client
        .call_tool("hang", json!({"delay_ms": 300}), Duration::from_millis(50))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, ToolportError::Timeout { .. }), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(290), "took {elapsed:?}");

    // Let the late reply arrive and be discarded.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.pending_calls(), 0);

    let result = client
        .call_tool("echo", json!({"text": "still fine"}), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result.text(), "still fine");
    client.shutdown(Duration::from_millis(500)).await.unwrap();
}

#[tokio::test]
async fn paginated_tool_list_is_collected() {
    let client = connect(&mock("paged", &["--page-size", "2"])).await;
    let tools = client.list_tools(Duration::from_secs(2)).await.unwrap();
    let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["echo", "add", "fail", "crash", "hang", "grow"]);
    client.shutdown(Duration::from_millis(500)).await.unwrap();
}

// ---------------------------------------------------------------------------
// 9. TCP transport
// ---------------------------------------------------------------------------

/// Minimal MCP server on a TCP listener: one tool, answers ping. `noise` is
/// written ahead of every reply.
async fn serve_tcp(listener: TcpListener, noise: &'static [u8]) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(IncomingMessage::Request(req)) = IncomingMessage::parse(&line) else {
                    continue;
                };
                let result: Value = match req.method.as_str() {
                    "initialize" => json!({"protocolVersion": "2024-11-05", "capabilities": {}}),
                    "tools/list" => json!({"tools": [{"name": "lookup", "description": "Look up"}]}),
                    "tools/call" => json!({"content": [{"type": "text", "text": "found"}]}),
                    _ => json!({}),
                };
                let reply = JsonRpcResponse::success(req.id, result);
                let mut frame = serde_json::to_string(&reply).unwrap();
                frame.push('\n');
                if write.write_all(noise).await.is_err() {
                    break;
                }
                if write.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[tokio::test]
async fn tcp_server_is_managed_like_stdio() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_tcp(listener, b""));

    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager
        .add_server(ServerConfig::tcp("remote", addr.to_string()), false)
        .await
        .unwrap();
    manager.enable_for_agent("research", "remote").await.unwrap();

    let tools = manager.list_tools_for_agent("research").unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "remote.lookup");

    let result = manager
        .call_tool("research", ToolCall::new("c1", "remote.lookup", json!({})))
        .await
        .unwrap();
    assert_eq!(result.content, "found");
    assert_eq!(manager.server_report("remote").unwrap().pid, None);
    manager.shutdown().await;
}

#[tokio::test]
async fn undecodable_frames_do_not_deafen_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_tcp(listener, b"\xff\xfe garbage\n"));

    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager
        .add_server(ServerConfig::tcp("noisy", addr.to_string()), false)
        .await
        .unwrap();
    let outcome = manager.enable_for_agent("research", "noisy").await.unwrap();
    assert_eq!(outcome.status, ServerStatus::Running);

    for i in 0..3 {
        let call = ToolCall::new(format!("c{i}"), "noisy.lookup", json!({}));
        let result = manager
            .call_tool_within("research", call, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(result.content, "found");
    }

    // Several health intervals pass without the server being marked failed.
    tokio::time::sleep(Duration::from_millis(450)).await;
    let report = manager.server_report("noisy").unwrap();
    assert_eq!(report.status, ServerStatus::Running);
    assert_eq!(report.consecutive_failures, 0);
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// 10. Tool provider seam
// ---------------------------------------------------------------------------

#[tokio::test]
async fn adapter_serves_as_tool_provider() {
    use toolport_mcp::ToolProvider;

    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path()).await;
    manager.add_server(mock("files", &[]), false).await.unwrap();
    manager.enable_for_agent("research", "files").await.unwrap();

    let provider: Arc<dyn ToolProvider> = manager.tool_provider();
    let defs = provider.definitions("research").await.unwrap();
    assert!(defs.iter().any(|d| d.name == "files.add"));

    let result = provider
        .call("research", ToolCall::new("c1", "files.add", json!({"a": 2, "b": 3})))
        .await
        .unwrap();
    assert_eq!(result.content, "5");
    manager.shutdown().await;
}
