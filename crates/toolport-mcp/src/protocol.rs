//! MCP (Model Context Protocol) JSON-RPC 2.0 message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Handshake method.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Notification sent once the handshake result has been accepted.
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
/// Tool discovery method.
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// Tool invocation method.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
/// Liveness probe, usable in both directions.
pub const METHOD_PING: &str = "ping";
/// Server notification that its tool list changed.
pub const NOTIFICATION_TOOLS_CHANGED: &str = "notifications/tools/list_changed";

/// JSON-RPC "method not found" error code.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Correlation id, unique per client.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// A request with the given id.
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Notification parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// A notification; it carries no id.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response, both as received from a server and as sent back
/// when answering a server-initiated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request being answered.
    pub id: Value,
    /// Present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// A successful reply.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// An error reply.
    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Error description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A request the server sends to us.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    /// Id to echo in the reply.
    pub id: Value,
    /// Method name.
    pub method: String,
    /// Request parameters.
    pub params: Option<Value>,
}

/// Any frame read from a server, classified by shape.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Reply to one of our requests.
    Response(JsonRpcResponse),
    /// Request initiated by the server; it expects a reply.
    Request(ServerRequest),
    /// Fire-and-forget message from the server.
    Notification(JsonRpcNotification),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl IncomingMessage {
    /// Parse and classify one frame. Returns a description of the problem for
    /// frames that are not JSON-RPC 2.0 messages.
    pub fn parse(frame: &str) -> Result<Self, String> {
        let raw: RawMessage =
            serde_json::from_str(frame).map_err(|e| format!("invalid JSON: {e}"))?;

        if raw.jsonrpc.as_deref() != Some("2.0") {
            return Err("missing or unsupported \"jsonrpc\" version".to_string());
        }

        // `"id": null` counts as absent
        let id = raw.id.filter(|id| !id.is_null());

        match (id, raw.method) {
            (Some(id), Some(method)) => Ok(Self::Request(ServerRequest {
                id,
                method,
                params: raw.params,
            })),
            (None, Some(method)) => Ok(Self::Notification(JsonRpcNotification {
                jsonrpc: "2.0".to_string(),
                method,
                params: raw.params,
            })),
            (Some(id), None) => {
                if raw.result.is_none() && raw.error.is_none() {
                    return Err("response carries neither result nor error".to_string());
                }
                Ok(Self::Response(JsonRpcResponse {
                    jsonrpc: "2.0".to_string(),
                    id,
                    result: raw.result,
                    error: raw.error,
                }))
            }
            (None, None) => Err("message has neither id nor method".to_string()),
        }
    }
}

/// MCP tool definition from the `tools/list` response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpToolDef {
    /// Tool name, unique within one server.
    pub name: String,
    /// Tool description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the arguments.
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// MCP tool call result from the `tools/call` response.
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolResult {
    /// Result content blocks.
    #[serde(default)]
    pub content: Vec<McpContent>,
    /// The tool ran and reported a failure.
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl McpToolResult {
    /// Flatten all content blocks into one string. Non-text blocks are
    /// represented by a placeholder naming their type.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|c| {
                if c.content_type == "text" {
                    c.text.clone()
                } else {
                    format!("[{} content]", c.content_type)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// MCP content block.
#[derive(Debug, Clone, Deserialize)]
pub struct McpContent {
    /// Block type, e.g. `text` or `image`.
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text of a `text` block.
    #[serde(default)]
    pub text: String,
}

/// MCP server capabilities from the `initialize` response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerCapabilities {
    /// Present when the server offers tools.
    #[serde(default)]
    pub tools: Option<Value>,
    /// Present when the server offers resources.
    #[serde(default)]
    pub resources: Option<Value>,
    /// Present when the server offers prompts.
    #[serde(default)]
    pub prompts: Option<Value>,
}

/// MCP initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    /// Protocol revision the server speaks.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// What the server offers.
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    /// Server name and version, when reported.
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server identity from the `initialize` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    #[serde(default)]
    pub version: String,
}

/// Parameters of our `initialize` request.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "toolport",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}
