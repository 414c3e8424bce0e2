//! Host-facing tool surface.
//!
//! Ties the pool to configuration, the discovery cache and the registry:
//! - tools can be listed from cache before any server is running
//! - a live discovery replaces cached entries and refreshes the cache
//! - calls connect lazily and come back as `{content: [{type, text}], isError}`

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::cache::{DiscoveryCache, ServerToolsRecord};
use super::errors::McpError;
use super::pool::ConnectionPool;
use super::registry::{RegisteredTool, ToolRegistry, ToolResolution, ToolSource};
use super::types::{CallToolResult, McpToolDefinition, ServerDescriptor, ServerStatus};

// ─── Result Shape ────────────────────────────────────────────────────────────

/// One text block of a host result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl TextContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: text.into(),
        }
    }
}

/// What a host callback returns for a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostToolResult {
    pub content: Vec<TextContent>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl From<CallToolResult> for HostToolResult {
    fn from(result: CallToolResult) -> Self {
        Self {
            content: vec![TextContent::text(result.to_text())],
            is_error: result.is_error,
        }
    }
}

/// A tool as registered with the host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTool {
    pub qualified_name: String,
    pub server: String,
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<serde_json::Value>,
    pub source: ToolSource,
}

impl HostTool {
    /// Entry point a host binds to this tool.
    pub async fn call(
        &self,
        host: &ToolHost,
        args: serde_json::Value,
    ) -> Result<HostToolResult, McpError> {
        host.call(&self.server, &self.name, args).await
    }
}

impl From<&RegisteredTool> for HostTool {
    fn from(tool: &RegisteredTool) -> Self {
        Self {
            qualified_name: tool.qualified_name(),
            server: tool.server.clone(),
            name: tool.definition.name.clone(),
            description: tool.definition.description.clone(),
            input_schema: tool.definition.input_schema.clone(),
            source: tool.source,
        }
    }
}

// ─── ToolHost ────────────────────────────────────────────────────────────────

/// Configured servers, their pool sessions, and the tools they expose.
pub struct ToolHost {
    pool: ConnectionPool,
    descriptors: BTreeMap<String, ServerDescriptor>,
    cache: Arc<dyn DiscoveryCache>,
    registry: RwLock<ToolRegistry>,
}

impl ToolHost {
    pub fn new(
        descriptors: Vec<ServerDescriptor>,
        pool: ConnectionPool,
        cache: Arc<dyn DiscoveryCache>,
    ) -> Self {
        Self {
            pool,
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            cache,
            registry: RwLock::new(ToolRegistry::new()),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Configured descriptors, ordered by name.
    pub fn descriptors(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.descriptors.values()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Register provisional tools from the discovery cache.
    ///
    /// Records written for a different transport recipe are skipped, as are
    /// servers that already have live tools. Returns how many servers were
    /// loaded.
    pub async fn load_cached(&self) -> usize {
        let mut registry = self.registry.write().await;
        let mut loaded = 0;
        for (name, descriptor) in &self.descriptors {
            if registry.source_of(name) == Some(ToolSource::Live) {
                continue;
            }
            match self.cache.load(name) {
                Ok(Some(record)) if record.matches(descriptor) => {
                    registry.register_server_tools(name, record.tools, ToolSource::Cached);
                    loaded += 1;
                }
                Ok(Some(_)) => {
                    tracing::debug!(server = %name, "cached tools belong to an older config, ignoring");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "failed to read discovery cache");
                }
            }
        }
        tracing::info!(servers = loaded, "loaded cached tool metadata");
        loaded
    }

    /// Connect and discover every configured server concurrently.
    ///
    /// Returns the servers that failed (partial startup is OK).
    pub async fn start_all(&self) -> Vec<(String, McpError)> {
        let attempts = self.descriptors.keys().map(|name| async move {
            let outcome = self.connect_server(name).await;
            (name.clone(), outcome)
        });

        let mut failures = Vec::new();
        for (name, outcome) in futures::future::join_all(attempts).await {
            if let Err(e) = outcome {
                tracing::error!(server = %name, error = %e, "failed to start server");
                failures.push((name, e));
            }
        }
        failures
    }

    /// Connect one configured server and discover its tools.
    pub async fn connect_server(&self, name: &str) -> Result<Vec<McpToolDefinition>, McpError> {
        let descriptor = self
            .descriptors
            .get(name)
            .ok_or_else(|| McpError::UnknownServer {
                name: name.to_string(),
            })?;
        self.pool.connect(descriptor).await?;
        self.discover(name).await
    }

    /// Run a live discovery, register the result and refresh the cache.
    pub async fn discover(&self, server: &str) -> Result<Vec<McpToolDefinition>, McpError> {
        let tools = self.pool.list_tools(server).await?;

        self.registry
            .write()
            .await
            .register_server_tools(server, tools.clone(), ToolSource::Live);

        if let Some(descriptor) = self.descriptors.get(server) {
            let record = ServerToolsRecord::from_tools(descriptor, &tools);
            if let Err(e) = self.cache.store(server, record) {
                tracing::warn!(server, error = %e, "failed to write discovery cache");
            }
        }
        Ok(tools)
    }

    /// Shut down every server.
    pub async fn shutdown(&self) {
        self.pool.close_all().await;
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// Every known tool, cached or live, ordered by qualified name.
    pub async fn tools(&self) -> Vec<HostTool> {
        self.registry
            .read()
            .await
            .all_tools()
            .map(HostTool::from)
            .collect()
    }

    /// Connection status of every configured server.
    pub async fn status(&self) -> Vec<(String, ServerStatus)> {
        let mut out = Vec::with_capacity(self.descriptors.len());
        for name in self.descriptors.keys() {
            out.push((name.clone(), self.pool.get_status(name).await));
        }
        out
    }

    /// Call a tool, connecting (and rediscovering) first if needed.
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<HostToolResult, McpError> {
        if !self.pool.get_status(server).await.connected {
            tracing::debug!(server, tool, "server not connected, connecting before call");
            self.connect_server(server).await?;
        }

        let result = self.pool.invoke(server, tool, args).await.map_err(|e| {
            tracing::error!(server, tool, error = %e, "tool call failed");
            e
        })?;
        if result.is_error {
            tracing::debug!(server, tool, "tool reported an error result");
        }
        Ok(HostToolResult::from(result))
    }

    /// Call a tool by qualified (`server.tool`) or unambiguous bare name.
    pub async fn call_by_name(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<HostToolResult, McpError> {
        let tool = {
            let registry = self.registry.read().await;
            let qualified = match registry.resolve(name) {
                ToolResolution::Exact(q) => q,
                ToolResolution::Unprefixed { resolved, .. } => resolved,
                ToolResolution::Ambiguous { candidates, .. } => {
                    return Err(McpError::ConfigError {
                        reason: format!(
                            "tool name '{name}' is ambiguous: {}",
                            candidates.join(", ")
                        ),
                    });
                }
                ToolResolution::NotFound(_) => {
                    return Err(McpError::ConfigError {
                        reason: format!("no registered tool named '{name}'"),
                    });
                }
            };
            registry.get(&qualified).map(HostTool::from)
        };

        match tool {
            Some(tool) => tool.call(self, args).await,
            None => Err(McpError::ConfigError {
                reason: format!("no registered tool named '{name}'"),
            }),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
