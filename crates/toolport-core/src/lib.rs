//! Core types and error definitions for Toolport.
//!
//! This crate provides the foundational types shared across Toolport crates:
//! the error taxonomy, the tool call abstractions handed to the orchestration
//! layer, and the tracing bootstrap.
//!
//! # Main types
//!
//! - [`ToolportError`]: Unified error enum for every Toolport subsystem.
//! - [`ToolportResult`]: Convenience alias for `Result<T, ToolportError>`.
//! - [`ToolCall`]: An orchestration-layer request to invoke a tool.
//! - [`ToolResult`]: The result returned after executing a tool call.

/// Tracing subscriber setup.
pub mod telemetry;

use serde::{Deserialize, Serialize};
use std::time::Duration;

// --- Error types ---

/// Top-level error type for Toolport.
///
/// Spawn, handshake and transport failures are absorbed by the owning server
/// instance and drive it to `Error`. Protocol and timeout failures are returned
/// to the immediate caller of a call. Config and still-in-use failures are
/// rejected requests.
#[derive(Debug, thiserror::Error)]
pub enum ToolportError {
    /// The server executable is missing or could not be started.
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// The `initialize` negotiation failed or timed out.
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// The underlying stream failed, usually because the server exited.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A malformed frame, or an error object returned by the server.
    #[error("Protocol error{}: {message}", code.map(|c| format!(" {c}")).unwrap_or_default())]
    Protocol {
        /// JSON-RPC error code, when the server supplied one.
        code: Option<i64>,
        /// Human-readable message.
        message: String,
    },

    /// A call exceeded its deadline.
    #[error("Timeout error: '{method}' got no response within {}ms", after.as_millis())]
    Timeout {
        /// The JSON-RPC method that timed out.
        method: String,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// Invalid, duplicate, or unknown-reference configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A disable or remove was blocked by agents that still reference the server.
    #[error("Still in use: server '{server}' is enabled for agent(s) {}", agents.join(", "))]
    StillInUse {
        /// The server that could not be disabled or removed.
        server: String,
        /// Agents whose scope still lists the server.
        agents: Vec<String>,
    },

    /// A tool invocation failed below the tool level (routing, protocol, timeout).
    #[error("Tool failure: {0}")]
    ToolFailure(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML parse error in a persisted or imported file.
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// A TOML serialization error while persisting state.
    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolportError {
    /// Stable identifier of the error kind, for the management layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn",
            Self::Handshake(_) => "handshake",
            Self::Transport(_) => "transport",
            Self::Protocol { .. } => "protocol",
            Self::Timeout { .. } => "timeout",
            Self::Config(_) => "config",
            Self::StillInUse { .. } => "still_in_use",
            Self::ToolFailure(_) => "tool_failure",
            Self::Json(_) => "json",
            Self::TomlDe(_) | Self::TomlSer(_) => "toml",
            Self::Io(_) => "io",
        }
    }

    /// Whether the error describes a rejected request rather than a runtime fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Config(_) | Self::StillInUse { .. })
    }
}

/// A convenience `Result` alias using [`ToolportError`].
pub type ToolportResult<T> = Result<T, ToolportError>;

// --- Tool types ---

/// A request from the orchestration layer to invoke a specific tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the caller for this tool call.
    pub id: String,
    /// Namespaced tool name (`<server>.<tool>`).
    pub name: String,
    /// JSON arguments to pass to the tool.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Creates a tool call.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// The result returned after executing a [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The ID of the [`ToolCall`] this result corresponds to.
    pub call_id: String,
    /// The textual output produced by the tool.
    pub content: String,
    /// Whether the tool reported an error.
    pub is_error: bool,
}

impl ToolResult {
    /// Creates a successful tool result.
    pub fn success(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Creates an error tool result.
    pub fn error(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result_success() {
        let result = ToolResult::success("call_1", "output");
        assert!(!result.is_error);
        assert_eq!(result.content, "output");
    }

    #[test]
    fn test_tool_result_error() {
        let result = ToolResult::error("call_1", "failed");
        assert!(result.is_error);
    }

    #[test]
    fn test_protocol_error_display_with_code() {
        let err = ToolportError::Protocol {
            code: Some(-32601),
            message: "Method not found".into(),
        };
        assert_eq!(err.to_string(), "Protocol error -32601: Method not found");
    }

    #[test]
    fn test_protocol_error_display_without_code() {
        let err = ToolportError::Protocol {
            code: None,
            message: "bad frame".into(),
        };
        assert_eq!(err.to_string(), "Protocol error: bad frame");
    }

    #[test]
    fn test_timeout_display() {
        let err = ToolportError::Timeout {
            method: "tools/call".into(),
            after: Duration::from_millis(50),
        };
        assert!(err.to_string().contains("50ms"));
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_still_in_use_lists_agents() {
        let err = ToolportError::StillInUse {
            server: "files".into(),
            agents: vec!["research".into(), "ops".into()],
        };
        assert!(err.to_string().contains("research, ops"));
        assert!(err.is_rejection());
    }

    #[test]
    fn test_runtime_errors_are_not_rejections() {
        assert!(!ToolportError::Spawn("x".into()).is_rejection());
        assert!(!ToolportError::Transport("x".into()).is_rejection());
        assert!(ToolportError::Config("x".into()).is_rejection());
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ToolportError = io.into();
        assert_eq!(err.kind(), "io");
    }
}
