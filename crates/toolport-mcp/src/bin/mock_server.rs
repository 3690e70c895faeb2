//! Scriptable MCP server speaking newline-delimited JSON-RPC on stdio.
//!
//! Tools: `echo`, `add`, `fail` (tool-level error), `crash` (exits without
//! replying), `hang` (replies after `delay_ms`), `grow` (adds a tool and
//! announces the change). Logs go to stderr.

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;
use toolport_mcp::protocol::{
    IncomingMessage, JsonRpcNotification, JsonRpcResponse, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_NOT_FOUND, METHOD_PING, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
    NOTIFICATION_TOOLS_CHANGED, PROTOCOL_VERSION,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PingMode {
    /// Answer with an empty result.
    Ok,
    /// Never answer.
    Silent,
    /// Answer with an internal error.
    Error,
}

#[derive(Parser, Debug)]
#[command(name = "toolport-mock-server", about = "Scriptable MCP server for tests")]
struct Args {
    /// Name reported in serverInfo.
    #[arg(long, default_value = "mock")]
    name: String,

    /// Accepted for command-line compatibility with file-system servers.
    #[arg(long)]
    root: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "ok")]
    ping: PingMode,

    /// Sleep before reading any input.
    #[arg(long, default_value_t = 0)]
    startup_delay_ms: u64,

    /// Split tools/list results into pages of this size.
    #[arg(long)]
    page_size: Option<usize>,
}

type Out = Arc<Mutex<Stdout>>;

async fn write_frame(out: &Out, frame: &impl serde::Serialize) {
    let Ok(mut line) = serde_json::to_string(frame) else {
        return;
    };
    line.push('\n');
    let mut stdout = out.lock().await;
    if stdout.write_all(line.as_bytes()).await.is_ok() {
        let _ = stdout.flush().await;
    }
}

fn tool(name: &str, description: &str, properties: Value) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {"type": "object", "properties": properties},
    })
}

fn base_tools() -> Vec<Value> {
    vec![
        tool("echo", "Echo the text back", json!({"text": {"type": "string"}})),
        tool(
            "add",
            "Add two integers",
            json!({"a": {"type": "integer"}, "b": {"type": "integer"}}),
        ),
        tool("fail", "Always reports a tool error", json!({})),
        tool("crash", "Exit the process without replying", json!({})),
        tool(
            "hang",
            "Reply after a delay",
            json!({"delay_ms": {"type": "integer"}}),
        ),
        tool("grow", "Add a tool and announce the change", json!({})),
    ]
}

fn text_result(text: impl Into<String>, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text.into()}],
        "isError": is_error,
    })
}

struct Server {
    args: Args,
    out: Out,
    tools: Vec<Value>,
}

impl Server {
    fn list_tools(&self, params: Option<&Value>) -> Value {
        let start = params
            .and_then(|p| p.get("cursor"))
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
            .min(self.tools.len());
        let Some(size) = self.args.page_size.filter(|s| *s > 0) else {
            return json!({"tools": self.tools});
        };
        let end = (start + size).min(self.tools.len());
        let mut result = json!({"tools": self.tools[start..end]});
        if end < self.tools.len() {
            result["nextCursor"] = json!(end.to_string());
        }
        result
    }

    async fn call_tool(&mut self, id: Value, params: Option<Value>) {
        let params = params.unwrap_or(Value::Null);
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        debug!(tool = name, "tools/call");

        let result = match name {
            "echo" => text_result(
                arguments.get("text").and_then(Value::as_str).unwrap_or_default(),
                false,
            ),
            "add" => {
                let a = arguments.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = arguments.get("b").and_then(Value::as_i64).unwrap_or(0);
                text_result((a + b).to_string(), false)
            }
            "fail" => text_result("intentional failure", true),
            "crash" => {
                warn!("crash requested, exiting");
                std::process::exit(3);
            }
            "hang" => {
                let delay = arguments
                    .get("delay_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(10_000);
                let out = self.out.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let reply = JsonRpcResponse::success(id, text_result("woke up", false));
                    write_frame(&out, &reply).await;
                });
                return;
            }
            "grow" => {
                let extra = format!("extra_{}", self.tools.len());
                self.tools
                    .push(tool(&extra, "Added at runtime", json!({})));
                let note = JsonRpcNotification::new(NOTIFICATION_TOOLS_CHANGED, None);
                write_frame(&self.out, &note).await;
                text_result(extra, false)
            }
            other => {
                let reply = JsonRpcResponse::failure(id, -32602, format!("unknown tool '{other}'"));
                write_frame(&self.out, &reply).await;
                return;
            }
        };
        write_frame(&self.out, &JsonRpcResponse::success(id, result)).await;
    }

    async fn handle(&mut self, id: Value, method: &str, params: Option<Value>) {
        let reply = match method {
            METHOD_INITIALIZE => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {"listChanged": true}},
                    "serverInfo": {"name": self.args.name, "version": env!("CARGO_PKG_VERSION")},
                }),
            ),
            METHOD_TOOLS_LIST => JsonRpcResponse::success(id, self.list_tools(params.as_ref())),
            METHOD_TOOLS_CALL => {
                self.call_tool(id, params).await;
                return;
            }
            METHOD_PING => match self.args.ping {
                PingMode::Ok => JsonRpcResponse::success(id, json!({})),
                PingMode::Silent => return,
                PingMode::Error => JsonRpcResponse::failure(id, -32603, "unhealthy"),
            },
            other => JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("method '{other}' not found")),
        };
        write_frame(&self.out, &reply).await;
    }
}

#[tokio::main]
async fn main() {
    toolport_core::telemetry::init_tracing("info", false);
    let args = Args::parse();
    info!(name = %args.name, root = ?args.root, ping = ?args.ping, "mock MCP server starting");

    if args.startup_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    let mut server = Server {
        args,
        out: Arc::new(Mutex::new(tokio::io::stdout())),
        tools: base_tools(),
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match IncomingMessage::parse(&line) {
            Ok(IncomingMessage::Request(req)) => server.handle(req.id, &req.method, req.params).await,
            Ok(IncomingMessage::Notification(note)) => {
                if note.method == METHOD_INITIALIZED {
                    info!("client initialized");
                }
            }
            Ok(IncomingMessage::Response(_)) => {}
            Err(e) => warn!(error = %e, "unparseable frame"),
        }
    }
    info!("stdin closed, exiting");
}
