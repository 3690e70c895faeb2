//! MCP server lifecycle, enablement scopes, and tool adaptation.
//!
//! [`McpManager`] is the entry point: it owns a [`ServerRegistry`] of
//! configured servers, persists scopes through a [`ScopeStore`], and exposes
//! discovered tools to agents via a [`ToolAdapter`].

pub mod adapter;
pub mod backoff;
pub mod client;
pub mod config;
pub mod instance;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod scope;
pub mod transport;

pub use adapter::{ToolAdapter, ToolDefinition, ToolProvider};
pub use backoff::BackoffPolicy;
pub use client::McpClient;
pub use config::{McpSettings, ServerConfig, TransportKind};
pub use instance::{InstanceSnapshot, ServerInstance, ServerStatus, StatusEvent};
pub use manager::{
    parse_import_document, ConnectionReport, EnableOutcome, ImportEntry, ImportReport,
    McpManager, ServerReport,
};
pub use registry::{ConfigChange, ServerRegistry};
pub use scope::{ScopeRecord, ScopeStore};
pub use transport::Transport;
