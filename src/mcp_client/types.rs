//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the connection
//! recipe (`ServerDescriptor`) handed to the pool by the config loader.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revision requested during the handshake.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// MCP `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(rename = "serverInfo", default)]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        rename = "inputSchema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<serde_json::Value>,
}

/// `tools/list` result page.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

/// `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Flatten the content list into one text body.
    ///
    /// Text fragments are joined with newlines; non-text blocks become short
    /// placeholders so the caller still sees that something was returned.
    pub fn to_text(&self) -> String {
        self.content
            .iter()
            .map(ContentBlock::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Content block in a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "audio")]
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "resource")]
    Resource { resource: ResourceContent },
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    fn render(&self) -> String {
        match self {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::Image { data, mime_type } => {
                format!("[image: {mime_type}, {} bytes]", data.len())
            }
            ContentBlock::Audio { data, mime_type } => {
                format!("[audio: {mime_type}, {} bytes]", data.len())
            }
            ContentBlock::Resource { resource } => match &resource.text {
                Some(text) => text.clone(),
                None => format!("[resource: {}]", resource.uri),
            },
            ContentBlock::Unsupported => "[unsupported content]".to_string(),
        }
    }
}

/// Embedded resource inside a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceContent {
    pub uri: String,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub blob: Option<String>,
}

// ─── Server Descriptor ───────────────────────────────────────────────────────

/// Which transport a server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Subprocess,
    StreamedHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Subprocess => f.write_str("subprocess"),
            TransportKind::StreamedHttp => f.write_str("streamed-http"),
        }
    }
}

/// Transport-specific connection parameters. Exactly one kind is active.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// Child process speaking line-delimited JSON-RPC on stdin/stdout.
    Subprocess {
        command: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        env: BTreeMap<String, String>,
    },
    /// HTTP(S) endpoint speaking the streamable HTTP transport.
    StreamedHttp {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Subprocess { .. } => TransportKind::Subprocess,
            TransportConfig::StreamedHttp { .. } => TransportKind::StreamedHttp,
        }
    }
}

/// Connection recipe for one server identity. Created once from
/// configuration, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    /// Unique identity chosen by configuration.
    pub name: String,
    pub transport: TransportConfig,
    /// Whether loopback/private network addresses were allowed by config.
    pub allow_private_network: bool,
    /// Idle timeout per call; `None` uses the pool default.
    pub timeout: Option<Duration>,
    /// Hard cap on one call, progress or not; `None` uses the pool default.
    pub max_total_timeout: Option<Duration>,
}

impl ServerDescriptor {
    /// Descriptor for a subprocess server with no extra settings.
    pub fn subprocess(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportConfig::Subprocess {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                cwd: None,
                env: BTreeMap::new(),
            },
            allow_private_network: false,
            timeout: None,
            max_total_timeout: None,
        }
    }

    /// Descriptor for a streamed-HTTP server with no extra settings.
    pub fn streamed_http(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportConfig::StreamedHttp {
                url: url.to_string(),
                headers: BTreeMap::new(),
            },
            allow_private_network: false,
            timeout: None,
            max_total_timeout: None,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Health snapshot for one server identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub connected: bool,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert!(resp.result.is_none());
        let err = resp.error.unwrap();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_tool_definition_without_schema() {
        let json = r#"{"name": "ping"}"#;
        let tool: McpToolDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "ping");
        assert!(tool.description.is_none());
        assert!(tool.input_schema.is_none());
    }

    #[test]
    fn test_tools_list_with_cursor() {
        let json = r#"{
            "tools": [{"name": "forecast", "inputSchema": {"type": "object"}}],
            "nextCursor": "page-2"
        }"#;
        let page: ToolsListResult = serde_json::from_str(json).unwrap();
        assert_eq!(page.tools.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("page-2"));
    }

    #[test]
    fn test_call_tool_result_to_text() {
        let json = r#"{
            "content": [
                {"type": "text", "text": "Sunny"},
                {"type": "image", "data": "aGVsbG8=", "mimeType": "image/png"},
                {"type": "resource", "resource": {"uri": "file:///tmp/a.txt"}},
                {"type": "text", "text": "22C"}
            ],
            "isError": false
        }"#;
        let result: CallToolResult = serde_json::from_str(json).unwrap();
        assert_eq!(
            result.to_text(),
            "Sunny\n[image: image/png, 8 bytes]\n[resource: file:///tmp/a.txt]\n22C"
        );
    }

    #[test]
    fn test_call_tool_result_unknown_block_type() {
        let json = r#"{"content": [{"type": "resource_link", "uri": "x"}], "isError": true}"#;
        let result: CallToolResult = serde_json::from_str(json).unwrap();
        assert!(result.is_error);
        assert!(matches!(result.content[0], ContentBlock::Unsupported));
    }

    #[test]
    fn test_descriptor_kind() {
        let stdio = ServerDescriptor::subprocess("fs", "npx", &["-y", "fs-server"]);
        assert_eq!(stdio.kind(), TransportKind::Subprocess);
        let http = ServerDescriptor::streamed_http("search", "https://mcp.example.com/mcp");
        assert_eq!(http.kind(), TransportKind::StreamedHttp);
        assert_eq!(http.kind().to_string(), "streamed-http");
    }
}
