//! MCP client: correlates JSON-RPC 2.0 requests and responses over one
//! [`Transport`].
//!
//! A background reader task drains incoming frames: responses resolve the
//! pending call with the same id, server requests are answered, and
//! notifications are broadcast to subscribers. Responses nobody waits for any
//! more (the call timed out or was cancelled) are discarded.

use crate::protocol::*;
use crate::transport::Transport;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use toolport_core::{ToolportError, ToolportResult};
use tracing::{debug, info, warn};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Upper bound on `tools/list` pages followed via `nextCursor`.
const MAX_TOOL_PAGES: usize = 100;

/// Removes a pending entry when the waiting call ends for any reason,
/// including cancellation of the caller's future.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// MCP client that communicates with one MCP server.
pub struct McpClient {
    server_name: String,
    transport: Arc<Transport>,
    pending: PendingMap,
    next_id: AtomicU64,
    initialized: AtomicBool,
    notifications: broadcast::Sender<JsonRpcNotification>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl McpClient {
    /// Take ownership of a started transport and begin draining it.
    pub fn new(transport: Transport) -> Self {
        let server_name = transport.server().to_string();
        let transport = Arc::new(transport);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (notifications, _) = broadcast::channel(64);

        let reader = tokio::spawn(read_loop(
            server_name.clone(),
            transport.clone(),
            pending.clone(),
            notifications.clone(),
        ));

        Self {
            server_name,
            transport,
            pending,
            next_id: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
            notifications,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Name of the server behind this client.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// OS process id of the server, when the client owns its process.
    pub fn pid(&self) -> Option<u32> {
        self.transport.pid()
    }

    /// Whether the initialize handshake has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// See [`Transport::closed_signal`].
    pub fn closed_signal(&self) -> watch::Receiver<Option<String>> {
        self.transport.closed_signal()
    }

    /// Notifications sent by the server after subscription.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send a request and wait up to `timeout` for its response. Only
    /// `initialize` may be sent before the handshake has completed.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> ToolportResult<Value> {
        if method != METHOD_INITIALIZE && !self.is_initialized() {
            return Err(ToolportError::Protocol {
                code: None,
                message: format!(
                    "'{method}' issued to '{}' before the initialize handshake completed",
                    self.server_name
                ),
            });
        }
        self.request(method, params, timeout).await
    }

    /// [`McpClient::call`] with an absolute deadline instead of a timeout.
    pub async fn call_with_deadline(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> ToolportResult<Value> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.call(method, params, remaining).await
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> ToolportResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // The reader clears the table after the close flag is raised, so an
        // entry inserted after that point would never be answered.
        if self.transport.is_closed() {
            return Err(ToolportError::Transport(format!(
                "server '{}' connection is closed",
                self.server_name
            )));
        }

        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        // The deadline covers the write too: a peer that stops reading must
        // not hold the caller past its timeout.
        let exchange = async {
            self.transport.send(&frame).await?;
            rx.await.map_err(|_| {
                ToolportError::Transport(format!(
                    "server '{}' closed the connection before answering '{method}'",
                    self.server_name
                ))
            })
        };
        let resp = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(
                    server = %self.server_name,
                    method = %method,
                    id = id,
                    "MCP request timed out, a late response will be discarded"
                );
                return Err(ToolportError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                });
            }
        };

        if let Some(err) = resp.error {
            return Err(ToolportError::Protocol {
                code: Some(err.code),
                message: err.message,
            });
        }
        resp.result.ok_or_else(|| ToolportError::Protocol {
            code: None,
            message: format!("'{method}' response carries no result"),
        })
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> ToolportResult<()> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.transport.send(&frame).await
    }

    /// Perform the MCP initialize handshake. Every failure, including a
    /// timeout, is reported as a handshake error.
    pub async fn initialize(&self, timeout: Duration) -> ToolportResult<InitializeResult> {
        let deadline = Instant::now() + timeout;
        let value = self
            .request(METHOD_INITIALIZE, Some(initialize_params()), timeout)
            .await
            .map_err(|e| {
                ToolportError::Handshake(format!("server '{}': {e}", self.server_name))
            })?;
        let result: InitializeResult = serde_json::from_value(value).map_err(|e| {
            ToolportError::Handshake(format!(
                "server '{}': malformed initialize result: {e}",
                self.server_name
            ))
        })?;

        self.initialized.store(true, Ordering::SeqCst);
        match tokio::time::timeout_at(deadline, self.notify(METHOD_INITIALIZED, None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(ToolportError::Handshake(format!(
                    "server '{}': {e}",
                    self.server_name
                )))
            }
            Err(_) => {
                return Err(ToolportError::Handshake(format!(
                    "server '{}': timed out sending '{METHOD_INITIALIZED}'",
                    self.server_name
                )))
            }
        }

        info!(
            server = %self.server_name,
            version = %result.protocol_version,
            peer = ?result.server_info.as_ref().map(|s| s.name.as_str()),
            "MCP server initialized"
        );
        Ok(result)
    }

    /// List available tools, following pagination cursors.
    pub async fn list_tools(&self, timeout: Duration) -> ToolportResult<Vec<McpToolDef>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let result = self.call(METHOD_TOOLS_LIST, params, timeout).await?;

            let page: Vec<McpToolDef> = serde_json::from_value(
                result.get("tools").cloned().unwrap_or_else(|| serde_json::json!([])),
            )
            .map_err(|e| ToolportError::Protocol {
                code: None,
                message: format!("failed to parse tools from '{}': {e}", self.server_name),
            })?;
            tools.extend(page);

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                return Ok(tools);
            }
        }

        warn!(server = %self.server_name, "tools/list pagination limit reached");
        Ok(tools)
    }

    /// Call a tool on the MCP server.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> ToolportResult<McpToolResult> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let result = self.call(METHOD_TOOLS_CALL, Some(params), timeout).await?;
        serde_json::from_value(result).map_err(|e| ToolportError::Protocol {
            code: None,
            message: format!("failed to parse tool result: {e}"),
        })
    }

    /// Lightweight liveness probe.
    pub async fn ping(&self, timeout: Duration) -> ToolportResult<()> {
        self.call(METHOD_PING, None, timeout).await.map(|_| ())
    }

    /// Stop the transport (closing stdin, then killing after `timeout`) and
    /// the reader task.
    pub async fn shutdown(&self, timeout: Duration) -> ToolportResult<()> {
        let result = self.transport.stop(timeout).await;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.lock().clear();
        result
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        // The reader holds the transport; releasing it lets the transport
        // kill its process.
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn read_loop(
    server: String,
    transport: Arc<Transport>,
    pending: PendingMap,
    notifications: broadcast::Sender<JsonRpcNotification>,
) {
    loop {
        let frame = match transport.receive().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(server = %server, "MCP server output closed");
                break;
            }
            Err(e) => {
                warn!(server = %server, error = %e, "error reading MCP server output");
                break;
            }
        };

        match IncomingMessage::parse(&frame) {
            Ok(IncomingMessage::Response(resp)) => {
                let waiter = resp.id.as_u64().and_then(|id| pending.lock().remove(&id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => debug!(
                        server = %server,
                        id = %resp.id,
                        "discarding response with no pending call"
                    ),
                }
            }
            Ok(IncomingMessage::Request(req)) => {
                let reply = if req.method == METHOD_PING {
                    JsonRpcResponse::success(req.id, serde_json::json!({}))
                } else {
                    debug!(server = %server, method = %req.method, "unsupported server request");
                    JsonRpcResponse::failure(
                        req.id,
                        METHOD_NOT_FOUND,
                        format!("method '{}' is not supported by this client", req.method),
                    )
                };
                match serde_json::to_string(&reply) {
                    Ok(frame) => {
                        if let Err(e) = transport.send(&frame).await {
                            debug!(server = %server, error = %e, "failed to answer server request");
                        }
                    }
                    Err(e) => warn!(server = %server, error = %e, "failed to encode reply"),
                }
            }
            Ok(IncomingMessage::Notification(note)) => {
                debug!(server = %server, method = %note.method, "MCP notification");
                let _ = notifications.send(note);
            }
            Err(reason) => {
                warn!(server = %server, reason = %reason, line = %frame, "ignoring non-JSON-RPC line");
            }
        }
    }

    // Dropping the senders wakes every waiting call with a transport error.
    pending.lock().clear();
}
