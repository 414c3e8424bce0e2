//! JSON-RPC transports.
//!
//! Two wire carriers share one request/response core:
//! - [`stdio::StdioTransport`]: line-delimited JSON over a child process's stdio
//! - [`http::HttpTransport`]: streamable HTTP (JSON or SSE response bodies)
//!
//! Both register every outgoing request in a [`PendingRequests`] table and
//! resolve it from whatever task reads the wire. Progress notifications are
//! routed to the waiting request so it can push its idle deadline forward.

pub mod http;
pub mod stdio;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::errors::McpError;
use super::types::{JsonRpcResponse, TransportKind};

pub use http::HttpTransport;
pub use stdio::StdioTransport;

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// Deadlines for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Idle deadline: how long to wait without a response or progress.
    pub timeout: Duration,
    /// Whether a progress notification restarts the idle deadline.
    pub reset_timeout_on_progress: bool,
    /// Absolute cap regardless of progress.
    pub max_total_timeout: Option<Duration>,
}

impl RequestOptions {
    /// Plain deadline, no progress keepalive.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            reset_timeout_on_progress: false,
            max_total_timeout: None,
        }
    }

    /// Progress-keepalive deadline bounded by `max_total`.
    pub fn keepalive(timeout: Duration, max_total: Duration) -> Self {
        Self {
            timeout,
            reset_timeout_on_progress: true,
            max_total_timeout: Some(max_total),
        }
    }
}

/// A bidirectional JSON-RPC channel to one MCP server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which wire carrier this is.
    fn kind(&self) -> TransportKind;

    /// Send a request and wait for its result (the `result` member only;
    /// JSON-RPC error objects become [`McpError::ServerError`]).
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        options: RequestOptions,
    ) -> Result<serde_json::Value, McpError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<serde_json::Value>)
        -> Result<(), McpError>;

    /// Release the channel. Safe to call more than once.
    async fn close(&self) -> Result<(), McpError>;
}

/// Passive hooks a transport invokes when the channel fails underneath it.
///
/// Called from transport tasks; implementations must not block or panic.
pub trait TransportListener: Send + Sync {
    /// The channel reported an I/O error.
    fn on_error(&self, reason: &str);
    /// The channel closed (peer exited or hung up).
    fn on_close(&self);
}

// ─── Pending Requests ────────────────────────────────────────────────────────

/// A `notifications/progress` payload routed to its request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub total: Option<f64>,
    pub message: Option<String>,
}

type ResponseSender = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

struct PendingEntry {
    response: ResponseSender,
    progress: mpsc::UnboundedSender<ProgressUpdate>,
}

/// Receiving side of one registered request.
///
/// Dropping the handle unregisters the request, so a caller that stops
/// waiting leaves nothing behind in the table.
pub(crate) struct PendingHandle {
    pub id: u64,
    pending: PendingRequests,
    response: oneshot::Receiver<Result<JsonRpcResponse, McpError>>,
    progress: mpsc::UnboundedReceiver<ProgressUpdate>,
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

/// In-flight requests keyed by JSON-RPC id.
///
/// The map lock is never held across an `.await`.
#[derive(Clone, Default)]
pub(crate) struct PendingRequests {
    inner: Arc<Mutex<HashMap<u64, PendingEntry>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, PendingEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request id before it is written to the wire.
    pub fn register(&self, id: u64) -> PendingHandle {
        let (response_tx, response_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        self.entries().insert(
            id,
            PendingEntry {
                response: response_tx,
                progress: progress_tx,
            },
        );
        PendingHandle {
            id,
            pending: self.clone(),
            response: response_rx,
            progress: progress_rx,
        }
    }

    /// Deliver a response (or a transport failure) to whoever waits on `id`.
    ///
    /// Returns `false` when nobody is waiting anymore, which is not an error:
    /// the caller may have timed out or walked away.
    pub fn resolve(&self, id: u64, outcome: Result<JsonRpcResponse, McpError>) -> bool {
        let entry = self.entries().remove(&id);
        match entry {
            Some(entry) => entry.response.send(outcome).is_ok(),
            None => false,
        }
    }

    fn progress(&self, id: u64, update: ProgressUpdate) {
        if let Some(entry) = self.entries().get(&id) {
            let _ = entry.progress.send(update);
        }
    }

    pub fn remove(&self, id: u64) {
        self.entries().remove(&id);
    }

    /// Fail every in-flight request with a connection-class error.
    pub fn fail_all(&self, server: &str) {
        let drained: Vec<PendingEntry> = self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            let _ = entry.response.send(Err(McpError::channel_closed(server)));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Wait for a registered request, honouring idle/total deadlines and
/// progress keepalive. The request is unregistered however this ends,
/// including when the future is dropped.
pub(crate) async fn await_response(
    mut handle: PendingHandle,
    server: &str,
    method: &str,
    options: RequestOptions,
) -> Result<JsonRpcResponse, McpError> {
    let start = Instant::now();
    let total_deadline = options.max_total_timeout.map(|total| start + total);
    let mut idle_deadline = start + options.timeout;
    let mut progress_open = true;

    loop {
        let (deadline, fired) = match total_deadline {
            Some(total) if total < idle_deadline => (total, options.max_total_timeout),
            _ => (idle_deadline, Some(options.timeout)),
        };

        tokio::select! {
            outcome = &mut handle.response => {
                return match outcome {
                    Ok(result) => result,
                    Err(_) => Err(McpError::channel_closed(server)),
                };
            }
            update = handle.progress.recv(), if progress_open => {
                match update {
                    Some(update) => {
                        tracing::trace!(
                            server,
                            method,
                            progress = update.progress,
                            total = ?update.total,
                            "progress notification"
                        );
                        if options.reset_timeout_on_progress {
                            idle_deadline = Instant::now() + options.timeout;
                        }
                    }
                    None => progress_open = false,
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let timeout_ms = fired
                    .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                    .unwrap_or_default();
                return Err(McpError::Timeout {
                    server: server.to_string(),
                    method: method.to_string(),
                    timeout_ms,
                });
            }
        }
    }
}

// ─── Incoming Messages ───────────────────────────────────────────────────────

/// A request the server sent to us (e.g. `ping`).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServerRequest {
    pub id: serde_json::Value,
    pub method: String,
}

/// Route one decoded message (or batch) from the wire.
///
/// Responses resolve their pending entry, progress notifications are forwarded
/// to the matching request, and server-initiated requests are handed back for
/// the transport to answer.
pub(crate) fn route_incoming(
    pending: &PendingRequests,
    server: &str,
    message: serde_json::Value,
) -> Vec<ServerRequest> {
    let messages = match message {
        serde_json::Value::Array(batch) => batch,
        single => vec![single],
    };

    let mut requests = Vec::new();
    for msg in messages {
        let method = msg.get("method").and_then(|m| m.as_str()).map(String::from);
        match (method, msg.get("id").cloned()) {
            (Some(method), Some(id)) => requests.push(ServerRequest { id, method }),
            (Some(method), None) => {
                if method == "notifications/progress" {
                    route_progress(pending, msg.get("params"));
                } else {
                    tracing::debug!(server, method = %method, "ignoring server notification");
                }
            }
            (None, Some(_)) => match serde_json::from_value::<JsonRpcResponse>(msg) {
                Ok(response) => {
                    let id = response.id;
                    if !pending.resolve(id, Ok(response)) {
                        tracing::debug!(server, id, "response for request nobody is awaiting");
                    }
                }
                Err(e) => {
                    tracing::debug!(server, error = %e, "skipping malformed response");
                }
            },
            (None, None) => {
                tracing::debug!(server, "skipping message without id or method");
            }
        }
    }
    requests
}

fn route_progress(pending: &PendingRequests, params: Option<&serde_json::Value>) {
    let Some(params) = params else {
        return;
    };
    let token = match params.get("progressToken") {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    let Some(id) = token else {
        return;
    };
    let update = ProgressUpdate {
        progress: params
            .get("progress")
            .and_then(|p| p.as_f64())
            .unwrap_or_default(),
        total: params.get("total").and_then(|t| t.as_f64()),
        message: params
            .get("message")
            .and_then(|m| m.as_str())
            .map(String::from),
    };
    pending.progress(id, update);
}

// ─── Request Helpers ─────────────────────────────────────────────────────────

/// Tag request params with `_meta.progressToken = id`.
pub(crate) fn with_progress_token(
    params: Option<serde_json::Value>,
    id: u64,
) -> Option<serde_json::Value> {
    let mut params = match params {
        Some(serde_json::Value::Object(map)) => map,
        Some(other) => return Some(other),
        None => serde_json::Map::new(),
    };
    let meta = params
        .entry("_meta")
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    if let Some(meta) = meta.as_object_mut() {
        meta.insert("progressToken".to_string(), serde_json::Value::from(id));
    }
    Some(serde_json::Value::Object(params))
}

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: -32603,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
