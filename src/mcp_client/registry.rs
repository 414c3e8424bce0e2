//! Tool registry — aggregates tool definitions across all servers.
//!
//! Provides:
//! - Tool lookup by fully-qualified name (`server.tool`)
//! - Resolution of bare tool names when they are unambiguous
//! - Tracking whether a server's tools came from the cache or a live discovery

use std::collections::BTreeMap;

use super::types::McpToolDefinition;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Where a registered tool definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSource {
    /// Loaded from the discovery cache; provisional until rediscovered.
    Cached,
    /// Returned by a live `tools/list` on the current session.
    Live,
}

/// A tool as the host sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredTool {
    pub server: String,
    pub definition: McpToolDefinition,
    pub source: ToolSource,
}

impl RegisteredTool {
    /// `server.tool`
    pub fn qualified_name(&self) -> String {
        qualify(&self.server, &self.definition.name)
    }
}

/// Result of resolving a tool name against the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResolution {
    /// Name found as-is.
    Exact(String),
    /// Name lacked a server prefix but matched exactly one registered tool.
    Unprefixed { original: String, resolved: String },
    /// Bare name registered by several servers.
    Ambiguous { original: String, candidates: Vec<String> },
    NotFound(String),
}

pub fn qualify(server: &str, tool: &str) -> String {
    format!("{server}.{tool}")
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool registry across all servers.
///
/// Keys are `"server.tool"`. Tool names may themselves contain dots, so the
/// owning server is stored explicitly rather than parsed back out.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every tool of `server` with `tools`.
    pub fn register_server_tools(
        &mut self,
        server: &str,
        tools: Vec<McpToolDefinition>,
        source: ToolSource,
    ) {
        self.unregister_server(server);
        let count = tools.len();
        for definition in tools {
            let entry = RegisteredTool {
                server: server.to_string(),
                definition,
                source,
            };
            self.tools.insert(entry.qualified_name(), entry);
        }
        tracing::debug!(server, count, ?source, "registered server tools");
    }

    /// Remove all tools belonging to a server.
    pub fn unregister_server(&mut self, server: &str) {
        self.tools.retain(|_, tool| tool.server != server);
    }

    /// Look up a tool by its fully-qualified name.
    pub fn get(&self, qualified_name: &str) -> Option<&RegisteredTool> {
        self.tools.get(qualified_name)
    }

    /// Look up a tool by server and bare tool name.
    pub fn find(&self, server: &str, tool: &str) -> Option<&RegisteredTool> {
        self.tools.get(&qualify(server, tool))
    }

    /// Resolve a possibly unqualified tool name.
    pub fn resolve(&self, name: &str) -> ToolResolution {
        if self.tools.contains_key(name) {
            return ToolResolution::Exact(name.to_string());
        }

        let candidates: Vec<String> = self
            .tools
            .iter()
            .filter(|(_, tool)| tool.definition.name == name)
            .map(|(qualified, _)| qualified.clone())
            .collect();

        match candidates.len() {
            0 => ToolResolution::NotFound(name.to_string()),
            1 => ToolResolution::Unprefixed {
                original: name.to_string(),
                resolved: candidates.into_iter().next().unwrap_or_default(),
            },
            _ => ToolResolution::Ambiguous {
                original: name.to_string(),
                candidates,
            },
        }
    }

    /// All registered tools, ordered by qualified name.
    pub fn all_tools(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.tools.values()
    }

    /// Tools of one server, ordered by name.
    pub fn server_tools(&self, server: &str) -> Vec<&RegisteredTool> {
        self.tools
            .values()
            .filter(|tool| tool.server == server)
            .collect()
    }

    /// Where `server`'s tools currently come from, if it has any registered.
    pub fn source_of(&self, server: &str) -> Option<ToolSource> {
        self.tools
            .values()
            .find(|tool| tool.server == server)
            .map(|tool| tool.source)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Return all unique server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.values().map(|t| t.server.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
