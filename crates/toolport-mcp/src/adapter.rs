//! Discovered MCP tools in the shape the orchestration layer consumes.

use crate::instance::{ServerInstance, ServerStatus};
use crate::protocol::McpToolDef;
use crate::registry::ServerRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use toolport_core::{ToolCall, ToolResult, ToolportError, ToolportResult};
use tracing::{debug, warn};

/// Separator between server and tool in a namespaced tool name.
pub const NAMESPACE_SEPARATOR: char = '.';

/// A callable tool as presented to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// `<server>.<tool>`
    pub name: String,
    /// Human-readable summary shown to the model.
    pub description: String,
    /// JSON Schema for the arguments.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Map one discovered tool, namespacing its name with `server`.
    pub fn from_mcp(server: &str, tool: &McpToolDef) -> Self {
        Self {
            name: namespaced(server, &tool.name),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        }
    }

    /// OpenAI-style function tool object.
    pub fn to_function_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Seam between tool sources and the orchestration layer.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Tools visible to `agent`.
    async fn definitions(&self, agent: &str) -> ToolportResult<Vec<ToolDefinition>>;

    /// Invoke a tool on behalf of `agent`.
    async fn call(&self, agent: &str, call: ToolCall) -> ToolportResult<ToolResult>;
}

/// `<server>.<tool>`.
pub fn namespaced(server: &str, tool: &str) -> String {
    format!("{server}{NAMESPACE_SEPARATOR}{tool}")
}

/// Split `<server>.<tool>` at the first separator. Tool names may contain dots.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    match name.split_once(NAMESPACE_SEPARATOR) {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => Some((server, tool)),
        _ => None,
    }
}

/// Maps registry contents to tool definitions and routes calls back.
pub struct ToolAdapter {
    registry: Arc<ServerRegistry>,
}

impl ToolAdapter {
    /// Adapter over every server in `registry`.
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self { registry }
    }

    /// Cached tools of one server, whatever its state.
    pub fn definitions_for_server(&self, server: &str) -> ToolportResult<Vec<ToolDefinition>> {
        if !self.registry.store().contains(server) {
            return Err(ToolportError::Config(format!("unknown MCP server '{server}'")));
        }
        Ok(self
            .registry
            .instance(server)
            .map(|instance| {
                instance
                    .snapshot()
                    .tools
                    .iter()
                    .map(|t| ToolDefinition::from_mcp(server, t))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Tools from servers enabled for `agent` that are globally enabled and
    /// either running or holding a stale cache from a failed connection.
    pub fn definitions_for_agent(&self, agent: &str) -> Vec<ToolDefinition> {
        let store = self.registry.store();
        let mut definitions = Vec::new();
        for server in store.agent_servers(agent) {
            if !store.is_globally_enabled(&server) {
                continue;
            }
            let Some(instance) = self.registry.instance(&server) else {
                continue;
            };
            let snapshot = instance.snapshot();
            if !exposes_tools(snapshot.status) {
                continue;
            }
            definitions.extend(
                snapshot
                    .tools
                    .iter()
                    .map(|t| ToolDefinition::from_mcp(&server, t)),
            );
        }
        definitions
    }

    /// Resolve the namespaced name for `agent` and forward the call.
    ///
    /// Protocol, timeout and transport failures become `ToolFailure`; a tool
    /// that reports `isError` yields an error [`ToolResult`].
    pub async fn call_for_agent(
        &self,
        agent: &str,
        call: &ToolCall,
        timeout: Duration,
    ) -> ToolportResult<ToolResult> {
        let (server, tool) = split_namespaced(&call.name).ok_or_else(|| {
            ToolportError::ToolFailure(format!(
                "'{}' is not a namespaced tool name (expected <server>.<tool>)",
                call.name
            ))
        })?;

        let store = self.registry.store();
        if !store.agent_servers(agent).contains(server) {
            return Err(ToolportError::ToolFailure(format!(
                "server '{server}' is not enabled for agent '{agent}'"
            )));
        }
        let instance = self.registry.instance(server).ok_or_else(|| {
            ToolportError::ToolFailure(format!("server '{server}' has not been started"))
        })?;

        self.forward(&instance, tool, call, timeout).await
    }

    async fn forward(
        &self,
        instance: &ServerInstance,
        tool: &str,
        call: &ToolCall,
        timeout: Duration,
    ) -> ToolportResult<ToolResult> {
        debug!(server = %instance.name(), tool = tool, call_id = %call.id, "calling MCP tool");
        match instance.call_tool(tool, call.arguments.clone(), timeout).await {
            Ok(result) => {
                let text = result.text();
                if result.is_error {
                    Ok(ToolResult::error(&call.id, text))
                } else {
                    Ok(ToolResult::success(&call.id, text))
                }
            }
            Err(e) => {
                warn!(server = %instance.name(), tool = tool, error = %e, "MCP tool call failed");
                Err(ToolportError::ToolFailure(format!(
                    "{}{NAMESPACE_SEPARATOR}{tool}: {e}",
                    instance.name()
                )))
            }
        }
    }
}

fn exposes_tools(status: ServerStatus) -> bool {
    !matches!(status, ServerStatus::Stopped)
}

#[async_trait]
impl ToolProvider for ToolAdapter {
    async fn definitions(&self, agent: &str) -> ToolportResult<Vec<ToolDefinition>> {
        Ok(self.definitions_for_agent(agent))
    }

    async fn call(&self, agent: &str, call: ToolCall) -> ToolportResult<ToolResult> {
        let timeout = self.registry.settings().call_timeout();
        self.call_for_agent(agent, &call, timeout).await
    }
}
