//! Server connection lifecycle.
//!
//! Builds a live transport for a [`ServerDescriptor`] and runs the MCP
//! initialization handshake on it. Subprocess servers get a
//! [`DisconnectNotifier`] attached so the pool learns about a dead child the
//! moment its pipes close, without polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::time::Instant;

use super::errors::McpError;
use super::transport::{
    HttpTransport, RequestOptions, StdioTransport, Transport, TransportListener,
};
use super::types::{InitializeResult, ServerDescriptor, TransportConfig, PROTOCOL_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the initialize handshake.
///
/// Generous because some servers import heavy frameworks at startup.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to collect stderr from a server that failed to start.
const STDERR_CAPTURE_WINDOW: Duration = Duration::from_millis(500);

/// Longest stderr excerpt attached to a connect error.
const MAX_STDERR_CHARS: usize = 2000;

// ─── Disconnect Notification ─────────────────────────────────────────────────

/// Flips a session's connected flag when its transport reports failure.
///
/// Each session owns its own flag, so a late event from a replaced
/// transport can only ever touch the session it belonged to.
#[derive(Clone)]
pub struct DisconnectNotifier {
    server: Arc<str>,
    connected: Arc<AtomicBool>,
}

impl DisconnectNotifier {
    pub fn new(server: &str, connected: Arc<AtomicBool>) -> Self {
        Self {
            server: Arc::from(server),
            connected,
        }
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl TransportListener for DisconnectNotifier {
    fn on_error(&self, reason: &str) {
        tracing::error!(server = %self.server, reason, "server transport error");
        self.mark_disconnected();
    }

    fn on_close(&self) {
        tracing::warn!(server = %self.server, "server connection closed");
        self.mark_disconnected();
    }
}

// ─── Connector ───────────────────────────────────────────────────────────────

/// A freshly initialized connection.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub init: InitializeResult,
}

/// Builds initialized transports from descriptors.
///
/// The pool only talks to this trait, which lets tests swap in scripted
/// connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        notifier: DisconnectNotifier,
    ) -> Result<Connection, McpError>;
}

/// Spawns subprocess servers and opens streamed-HTTP sessions.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    init_timeout: Duration,
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self {
            init_timeout: INIT_TIMEOUT,
        }
    }
}

impl DefaultConnector {
    pub fn with_init_timeout(init_timeout: Duration) -> Self {
        Self { init_timeout }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        notifier: DisconnectNotifier,
    ) -> Result<Connection, McpError> {
        let name = descriptor.name.as_str();
        match &descriptor.transport {
            TransportConfig::Subprocess {
                command,
                args,
                cwd,
                env,
            } => {
                let listener: Arc<dyn TransportListener> = Arc::new(notifier);
                let (transport, stderr) =
                    StdioTransport::spawn(name, command, args, cwd.as_ref(), env, Some(listener))?;
                let transport: Arc<dyn Transport> = Arc::new(transport);

                match handshake(transport.as_ref(), name, self.init_timeout).await {
                    Ok(init) => {
                        if let Some(stderr) = stderr {
                            tokio::spawn(drain_stderr(name.to_string(), stderr));
                        }
                        Ok(Connection { transport, init })
                    }
                    Err(e) => {
                        let stderr_ctx = read_stderr_on_failure(stderr).await;
                        if !stderr_ctx.is_empty() {
                            tracing::warn!(
                                server = name,
                                stderr = %stderr_ctx,
                                "server stderr captured on failure"
                            );
                        }
                        let _ = transport.close().await;
                        Err(McpError::ConnectionFailed {
                            name: name.to_string(),
                            reason: format!("{e}{}", format_stderr_suffix(&stderr_ctx)),
                        })
                    }
                }
            }
            TransportConfig::StreamedHttp { url, headers } => {
                // No push channel to watch; failures surface on the next request.
                drop(notifier);
                let transport: Arc<dyn Transport> =
                    Arc::new(HttpTransport::open(name, url, headers)?);

                match handshake(transport.as_ref(), name, self.init_timeout).await {
                    Ok(init) => Ok(Connection { transport, init }),
                    Err(e) => {
                        let _ = transport.close().await;
                        Err(McpError::ConnectionFailed {
                            name: name.to_string(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
        }
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Perform the MCP initialization handshake.
pub async fn handshake(
    transport: &dyn Transport,
    server_name: &str,
    init_timeout: Duration,
) -> Result<InitializeResult, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "toolmux",
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let result = transport
        .request(
            "initialize",
            Some(params),
            RequestOptions::with_timeout(init_timeout),
        )
        .await?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InvalidResponse {
            server: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    transport.notify("notifications/initialized", None).await?;

    tracing::info!(
        server = server_name,
        kind = %transport.kind(),
        protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
        "server initialized"
    );
    Ok(init)
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// Forward a running server's stderr to debug logs until it closes.
async fn drain_stderr(server: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, line = %line, "server stderr");
    }
}

/// Read whatever stderr a failed server produced within a short window.
async fn read_stderr_on_failure(stderr_handle: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr_handle else {
        return String::new();
    };

    let deadline = Instant::now() + STDERR_CAPTURE_WINDOW;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match tokio::time::timeout_at(deadline, stderr.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > MAX_STDERR_CHARS * 4 {
                    break;
                }
            }
            _ => break,
        }
    }

    let text = String::from_utf8_lossy(&buf);
    if text.chars().count() > MAX_STDERR_CHARS {
        let mut cut: String = text.chars().take(MAX_STDERR_CHARS).collect();
        cut.push_str("...(truncated)");
        cut
    } else {
        text.into_owned()
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_notifier_flips_only_its_own_flag() {
        let first = Arc::new(AtomicBool::new(true));
        let second = Arc::new(AtomicBool::new(true));
        let notifier = DisconnectNotifier::new("fs", Arc::clone(&first));

        notifier.on_close();
        assert!(!first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));

        first.store(true, Ordering::SeqCst);
        notifier.on_error("broken pipe");
        assert!(!first.load(Ordering::SeqCst));
    }

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(
            format_stderr_suffix("ModuleNotFoundError\n"),
            " | stderr: ModuleNotFoundError"
        );
    }

    #[tokio::test]
    async fn test_handshake_sends_initialize_then_initialized() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, mut server_write) = tokio::io::split(server);
        let transport = StdioTransport::from_streams("fake", client_read, client_write, None, None);

        let fake = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let init: serde_json::Value =
                serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(init["method"], "initialize");
            assert_eq!(init["params"]["protocolVersion"], PROTOCOL_VERSION);
            assert_eq!(init["params"]["clientInfo"]["name"], "toolmux");

            let reply = serde_json::json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake", "version": "1.0"}
                }
            });
            server_write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();

            let initialized: serde_json::Value =
                serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(initialized["method"], "notifications/initialized");
            assert!(initialized.get("id").is_none());
        });

        let init = handshake(&transport, "fake", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(init.protocol_version.as_deref(), Some(PROTOCOL_VERSION));
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_missing_binary_is_connection_failed() {
        let descriptor =
            ServerDescriptor::subprocess("ghost", "/nonexistent/toolmux-test-server", &[]);
        let notifier = DisconnectNotifier::new("ghost", Arc::new(AtomicBool::new(true)));
        let err = DefaultConnector::default()
            .connect(&descriptor, notifier)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::ConnectionFailed { ref name, .. } if name == "ghost"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_failure_carries_stderr() {
        let descriptor = ServerDescriptor::subprocess(
            "crashy",
            "sh",
            &["-c", "echo 'fatal: missing API key' >&2; exit 1"],
        );
        let connected = Arc::new(AtomicBool::new(true));
        let notifier = DisconnectNotifier::new("crashy", Arc::clone(&connected));
        let err = DefaultConnector::with_init_timeout(Duration::from_secs(5))
            .connect(&descriptor, notifier)
            .await
            .err()
            .unwrap();
        match err {
            McpError::ConnectionFailed { reason, .. } => {
                assert!(reason.contains("missing API key"), "reason: {reason}");
            }
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
    }
}
