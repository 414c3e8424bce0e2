//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing JSON-RPC messages to stdin from a dedicated writer task
//! - Reading JSON-RPC messages from stdout on a dedicated reader task
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! Many requests can be in flight at once; the reader routes each response
//! to its waiter by id. When the pipe breaks or the child exits, every
//! waiter fails with a connection-class error and the registered
//! [`TransportListener`] is told, without anyone polling.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, Mutex};

use super::{
    await_response, extract_result, next_request_id, route_incoming, with_progress_token,
    PendingRequests, RequestOptions, ServerRequest, Transport, TransportListener,
};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{error_codes, JsonRpcRequest, TransportKind};

/// Time a child gets to exit on its own after stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Outgoing line buffer between callers and the writer task.
const WRITE_QUEUE_DEPTH: usize = 64;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    pending: PendingRequests,
    /// Sender into the writer task; taken on close so stdin gets dropped.
    writer: Mutex<Option<mpsc::Sender<String>>>,
    child: Mutex<Option<Child>>,
    /// Reader task is still consuming stdout.
    alive: Arc<AtomicBool>,
    /// `close()` was called; suppresses listener notifications.
    closed: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawn a server process and wire its stdio.
    ///
    /// Returns the transport plus the child's stderr, which the caller
    /// decides how to consume (captured on handshake failure, logged after).
    pub fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        cwd: Option<&PathBuf>,
        env: &BTreeMap<String, String>,
        listener: Option<Arc<dyn TransportListener>>,
    ) -> Result<(Self, Option<ChildStderr>), McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.envs(env);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            #[allow(unused_imports)]
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectionFailed {
            name: name.to_string(),
            reason: format!("failed to spawn '{command}': {e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::ConnectionFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::ConnectionFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        tracing::debug!(
            server = name,
            command,
            pid = ?child.id(),
            "spawned server process"
        );

        let transport = Self::from_streams(name, stdout, stdin, Some(child), listener);
        Ok((transport, stderr))
    }

    /// Build a transport over arbitrary byte streams.
    ///
    /// `reader` carries server → client lines, `writer` client → server.
    pub fn from_streams<R, W>(
        name: &str,
        reader: R,
        writer: W,
        child: Option<Child>,
        listener: Option<Arc<dyn TransportListener>>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = PendingRequests::new();
        let alive = Arc::new(AtomicBool::new(true));
        let closed = Arc::new(AtomicBool::new(false));
        let (writer_tx, writer_rx) = mpsc::channel::<String>(WRITE_QUEUE_DEPTH);

        tokio::spawn(write_loop(
            name.to_string(),
            writer,
            writer_rx,
            pending.clone(),
            Arc::clone(&closed),
            listener.clone(),
        ));
        tokio::spawn(read_loop(
            name.to_string(),
            reader,
            writer_tx.downgrade(),
            pending.clone(),
            Arc::clone(&alive),
            Arc::clone(&closed),
            listener,
        ));

        Self {
            server_name: name.to_string(),
            pending,
            writer: Mutex::new(Some(writer_tx)),
            child: Mutex::new(child),
            alive,
            closed,
        }
    }

    async fn send_line(&self, line: String) -> Result<(), McpError> {
        let tx = self
            .writer
            .lock()
            .await
            .clone()
            .ok_or_else(|| McpError::ConnectionLost {
                server: self.server_name.clone(),
                reason: "transport closed".into(),
            })?;
        tx.send(line).await.map_err(|_| McpError::ConnectionLost {
            server: self.server_name.clone(),
            reason: "stdin writer stopped (channel closed)".into(),
        })
    }

    fn encode<T: serde::Serialize>(&self, message: &T) -> Result<String, McpError> {
        let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');
        Ok(json)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Subprocess
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        options: RequestOptions,
    ) -> Result<serde_json::Value, McpError> {
        let id = next_request_id();
        let params = if options.reset_timeout_on_progress {
            with_progress_token(params, id)
        } else {
            params
        };
        let line = self.encode(&JsonRpcRequest::new(id, method, params))?;

        // Dropping the handle on any early return unregisters the id.
        let handle = self.pending.register(id);
        if !self.alive.load(Ordering::SeqCst) {
            return Err(McpError::channel_closed(&self.server_name));
        }
        self.send_line(line).await?;

        let response = await_response(handle, &self.server_name, method, options).await?;
        extract_result(response)
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }
        let line = self.encode(&notification)?;
        self.send_line(line).await
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping the last sender ends the writer task, which closes stdin.
        self.writer.lock().await.take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.server_name, %status, "server process exited");
                }
                _ => {
                    tracing::debug!(
                        server = %self.server_name,
                        "server process did not exit after stdin closed, killing"
                    );
                    let _ = child.kill().await;
                }
            }
        }

        self.pending.fail_all(&self.server_name);
        Ok(())
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

async fn write_loop<W>(
    server: String,
    mut writer: W,
    mut rx: mpsc::Receiver<String>,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
    listener: Option<Arc<dyn TransportListener>>,
) where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(line) = rx.recv().await {
        let written = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let err = McpError::from_io(&server, "failed to write to stdin", &e);
            if !closed.load(Ordering::SeqCst) {
                if let Some(listener) = &listener {
                    listener.on_error(&err.to_string());
                }
            }
            pending.fail_all(&server);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(
    server: String,
    reader: R,
    writer: mpsc::WeakSender<String>,
    pending: PendingRequests,
    alive: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    listener: Option<Arc<dyn TransportListener>>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line_buf: Vec<u8> = Vec::new();

    let failure = loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf).await {
            Ok(0) => break None,
            Ok(_) => {
                let Ok(line) = std::str::from_utf8(&line_buf) else {
                    tracing::trace!(server = %server, bytes = line_buf.len(), "skipping non-UTF-8 stdout line");
                    continue;
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                // Non-JSON lines are server log output; skip them.
                let Ok(message) = serde_json::from_str::<serde_json::Value>(trimmed) else {
                    tracing::trace!(server = %server, line = trimmed, "skipping non-JSON stdout line");
                    continue;
                };
                for request in route_incoming(&pending, &server, message) {
                    answer_server_request(&server, &writer, request).await;
                }
            }
            Err(e) => break Some(McpError::from_io(&server, "failed to read from stdout", &e)),
        }
    };

    alive.store(false, Ordering::SeqCst);
    if !closed.load(Ordering::SeqCst) {
        if let Some(listener) = &listener {
            match &failure {
                Some(err) => listener.on_error(&err.to_string()),
                None => listener.on_close(),
            }
        }
    }
    pending.fail_all(&server);
}

/// Reply to a request the server initiated. Only `ping` is supported.
async fn answer_server_request(
    server: &str,
    writer: &mpsc::WeakSender<String>,
    request: ServerRequest,
) {
    let reply = if request.method == "ping" {
        serde_json::json!({"jsonrpc": "2.0", "id": request.id, "result": {}})
    } else {
        tracing::debug!(server, method = %request.method, "unsupported server request");
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": request.id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("method '{}' not supported by client", request.method),
            }
        })
    };

    let Some(tx) = writer.upgrade() else {
        return;
    };
    let _ = tx.send(format!("{reply}\n")).await;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, DuplexStream, ReadHalf, WriteHalf};

    #[derive(Default)]
    struct RecordingListener {
        closes: AtomicUsize,
        errors: std::sync::Mutex<Vec<String>>,
    }

    impl TransportListener for RecordingListener {
        fn on_error(&self, reason: &str) {
            self.errors.lock().unwrap().push(reason.to_string());
        }

        fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeServer {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn next_message(&mut self) -> serde_json::Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, message: serde_json::Value) {
            let line = format!("{message}\n");
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }
    }

    fn connect(listener: Arc<RecordingListener>) -> (StdioTransport, FakeServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let transport = StdioTransport::from_streams(
            "fake",
            client_read,
            client_write,
            None,
            Some(listener as Arc<dyn TransportListener>),
        );
        let server = FakeServer {
            lines: BufReader::new(server_read).lines(),
            writer: server_write,
        };
        (transport, server)
    }

    fn opts() -> RequestOptions {
        RequestOptions::with_timeout(Duration::from_secs(2))
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_request_response_skips_log_noise() {
        let listener = Arc::new(RecordingListener::default());
        let (transport, mut server) = connect(Arc::clone(&listener));

        let call = tokio::spawn(async move {
            let result = transport.request("tools/list", None, opts()).await;
            (transport, result)
        });

        let request = server.next_message().await;
        assert_eq!(request["method"], "tools/list");
        server
            .writer
            .write_all(b"server booting...\n")
            .await
            .unwrap();
        server
            .send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {"tools": [{"name": "echo"}]}
            }))
            .await;

        let (_transport, result) = call.await.unwrap();
        assert_eq!(result.unwrap()["tools"][0]["name"], "echo");
        assert_eq!(listener.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_utf8_stdout_line_is_skipped() {
        let listener = Arc::new(RecordingListener::default());
        let (transport, mut server) = connect(Arc::clone(&listener));

        let call = tokio::spawn(async move {
            let result = transport.request("tools/list", None, opts()).await;
            (transport, result)
        });

        let request = server.next_message().await;
        // "café" in Latin-1
        server.writer.write_all(b"caf\xe9 ready\n").await.unwrap();
        server
            .send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {"tools": []}
            }))
            .await;

        let (transport, result) = call.await.unwrap();
        assert!(result.is_ok());
        assert!(listener.errors.lock().unwrap().is_empty());
        assert_eq!(listener.closes.load(Ordering::SeqCst), 0);
        assert!(transport.alive.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_abandoned_request_is_unregistered() {
        let listener = Arc::new(RecordingListener::default());
        let (transport, mut server) = connect(listener);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            transport.request("tools/call", None, opts()),
        )
        .await;
        assert!(abandoned.is_err());
        let request = server.next_message().await;
        assert_eq!(transport.pending.len(), 0);

        // The late answer finds nobody waiting and is dropped.
        server
            .send(serde_json::json!({"jsonrpc": "2.0", "id": request["id"], "result": {}}))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.pending.len(), 0);
        assert!(transport.alive.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_keepalive_request_carries_progress_token() {
        let listener = Arc::new(RecordingListener::default());
        let (transport, mut server) = connect(listener);

        let call = tokio::spawn(async move {
            transport
                .request(
                    "tools/call",
                    Some(serde_json::json!({"name": "build", "arguments": {}})),
                    RequestOptions::keepalive(
                        Duration::from_millis(150),
                        Duration::from_secs(5),
                    ),
                )
                .await
        });

        let request = server.next_message().await;
        let token = request["params"]["_meta"]["progressToken"].clone();
        assert_eq!(token, request["id"]);

        for step in 1..=3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            server
                .send(serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/progress",
                    "params": {"progressToken": token, "progress": step}
                }))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        server
            .send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {"content": [], "isError": false}
            }))
            .await;

        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_answers_server_ping() {
        let listener = Arc::new(RecordingListener::default());
        let (_transport, mut server) = connect(listener);

        server
            .send(serde_json::json!({"jsonrpc": "2.0", "id": "p-1", "method": "ping"}))
            .await;
        let reply = server.next_message().await;
        assert_eq!(reply["id"], "p-1");
        assert_eq!(reply["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_peer_hangup_fires_close_listener_and_fails_inflight() {
        let listener = Arc::new(RecordingListener::default());
        let (transport, mut server) = connect(Arc::clone(&listener));
        let transport = Arc::new(transport);

        let inflight = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("tools/call", None, opts()).await })
        };
        let _ = server.next_message().await;
        drop(server);

        let err = inflight.await.unwrap().unwrap_err();
        assert!(err.is_connection_class(), "got {err:?}");
        wait_for(|| listener.closes.load(Ordering::SeqCst) == 1).await;

        // Later requests fail fast instead of waiting for the deadline.
        let err = transport.request("tools/list", None, opts()).await.unwrap_err();
        assert!(err.is_connection_class());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silent() {
        let listener = Arc::new(RecordingListener::default());
        let (transport, server) = connect(Arc::clone(&listener));

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        drop(server);

        let err = transport.request("tools/list", None, opts()).await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionLost { .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.closes.load(Ordering::SeqCst), 0);
        assert!(listener.errors.lock().unwrap().is_empty());
    }
}
