//! MCP client: a pool of tool-server connections behind one call interface.
//!
//! This module handles:
//! - Subprocess (stdio) and streamed-HTTP transports speaking JSON-RPC 2.0
//! - One session per configured server, with push-based disconnect detection
//! - Tool discovery and best-effort argument checks against discovered schemas
//! - Tool calls that reconnect and retry once when the connection was lost
//! - Configuration loading, a discovery cache, and the host-facing tool surface

pub mod advisory;
pub mod cache;
pub mod config;
pub mod errors;
pub mod host;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use advisory::ToolSchema;
pub use cache::{DiscoveryCache, JsonFileCache, MemoryCache, ServerToolsRecord};
pub use errors::McpError;
pub use host::{HostTool, HostToolResult, ToolHost};
pub use lifecycle::{Connector, DefaultConnector, DisconnectNotifier};
pub use pool::{ConnectionPool, Session};
pub use registry::{ToolRegistry, ToolSource};
pub use types::{
    CallToolResult, McpToolDefinition, ServerDescriptor, ServerStatus, TransportConfig,
    TransportKind,
};
