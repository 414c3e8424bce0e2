//! Streamable HTTP transport.
//!
//! Every JSON-RPC message is POSTed to the server URL. The server answers
//! either with a plain JSON body or with an SSE stream carrying progress
//! notifications followed by the response. A session id handed out on
//! `initialize` is echoed on every later request and released with a
//! `DELETE` on close.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client as HttpClient, StatusCode};
use tokio::sync::RwLock;

use super::{
    await_response, extract_result, next_request_id, route_incoming, with_progress_token,
    PendingRequests, RequestOptions, ServerRequest, Transport,
};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{error_codes, JsonRpcRequest, TransportKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_HEADER: &str = "Mcp-Session-Id";
const PROTOCOL_HEADER: &str = "MCP-Protocol-Version";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Longest error body we keep in an [`McpError::HttpError`].
const MAX_ERROR_BODY: usize = 2000;

// ─── Transport ───────────────────────────────────────────────────────────────

/// JSON-RPC over streamable HTTP.
pub struct HttpTransport {
    inner: Arc<HttpInner>,
    closed: AtomicBool,
}

struct HttpInner {
    server_name: String,
    url: String,
    http: HttpClient,
    headers: BTreeMap<String, String>,
    pending: PendingRequests,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
}

impl HttpTransport {
    /// Build a transport for `url`. No traffic happens until the first request.
    pub fn open(
        name: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self, McpError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| McpError::ConnectionFailed {
                name: name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            inner: Arc::new(HttpInner {
                server_name: name.to_string(),
                url: url.to_string(),
                http,
                headers: headers.clone(),
                pending: PendingRequests::new(),
                session_id: RwLock::new(None),
                protocol_version: RwLock::new(None),
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Session id assigned by the server, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().await.clone()
    }

    fn ensure_open(&self) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionLost {
                server: self.inner.server_name.clone(),
                reason: "transport closed".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamedHttp
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        options: RequestOptions,
    ) -> Result<serde_json::Value, McpError> {
        self.ensure_open()?;

        let id = next_request_id();
        let params = if options.reset_timeout_on_progress {
            with_progress_token(params, id)
        } else {
            params
        };
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params)).map_err(|e| {
            McpError::TransportError {
                server: self.inner.server_name.clone(),
                reason: format!("failed to serialize request: {e}"),
            }
        })?;

        let handle = self.inner.pending.register(id);
        let _pump = AbortOnDrop(tokio::spawn(pump_request(Arc::clone(&self.inner), id, body)));

        let outcome = await_response(handle, &self.inner.server_name, method, options).await;

        let result = extract_result(outcome?)?;
        if method == "initialize" {
            if let Some(version) = result.get("protocolVersion").and_then(|v| v.as_str()) {
                *self.inner.protocol_version.write().await = Some(version.to_string());
            }
        }
        Ok(result)
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.ensure_open()?;

        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let response = self.inner.post(&notification).await?;
        self.inner.check_status(response).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let session = self.inner.session_id.write().await.take();
        if let Some(session) = session {
            let mut req = self
                .inner
                .http
                .delete(&self.inner.url)
                .header(SESSION_HEADER, session)
                .timeout(CLOSE_TIMEOUT);
            for (key, value) in &self.inner.headers {
                req = req.header(key.as_str(), value.as_str());
            }
            if let Err(e) = req.send().await {
                tracing::debug!(
                    server = %self.inner.server_name,
                    error = %e,
                    "failed to release HTTP session"
                );
            }
        }

        self.inner.pending.fail_all(&self.inner.server_name);
        Ok(())
    }
}

// ─── Request Pump ────────────────────────────────────────────────────────────

/// Aborts the request's POST task when the caller finishes or walks away.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// POST one request and feed whatever comes back into the pending table.
async fn pump_request(inner: Arc<HttpInner>, id: u64, body: serde_json::Value) {
    if let Err(err) = inner.exchange(&body).await {
        // No-op when the response already arrived on the stream.
        inner.pending.resolve(id, Err(err));
    }
}

impl HttpInner {
    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, McpError> {
        let mut req = self
            .http
            .post(&self.url)
            .header(ACCEPT, ACCEPT_BOTH)
            .json(body);
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }
        if let Some(session) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, session);
        }
        if let Some(version) = self.protocol_version.read().await.as_deref() {
            req = req.header(PROTOCOL_HEADER, version);
        }

        req.send()
            .await
            .map_err(|e| McpError::from_http(&self.server_name, &e))
    }

    /// Map a non-2xx status to an error. A 404 while holding a session id
    /// means the server forgot the session, which is a lost connection.
    async fn check_status(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, McpError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::NOT_FOUND && self.session_id.read().await.is_some() {
            return Err(McpError::ConnectionLost {
                server: self.server_name.clone(),
                reason: "HTTP session expired (404)".into(),
            });
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(McpError::HttpError {
            server: self.server_name.clone(),
            status: status.as_u16(),
            body,
        })
    }

    /// Run one POST to completion. Returns `Err` when the body ended without
    /// producing a response for the request.
    async fn exchange(self: &Arc<Self>, body: &serde_json::Value) -> Result<(), McpError> {
        let response = self.post(body).await?;
        let response = self.check_status(response).await?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = self.session_id.write().await;
            if slot.is_none() {
                tracing::debug!(server = %self.server_name, session, "HTTP session established");
                *slot = Some(session.to_string());
            }
        }

        if response.status() == StatusCode::ACCEPTED {
            return Err(McpError::InvalidResponse {
                server: self.server_name.clone(),
                reason: "server accepted the request without returning a response".into(),
            });
        }

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_sse {
            let mut events = Box::pin(sse_events(response.bytes_stream()));
            while let Some(event) = events.next().await {
                let data = event.map_err(|e| McpError::from_http(&self.server_name, &e))?;
                match serde_json::from_str::<serde_json::Value>(&data) {
                    Ok(message) => self.dispatch(message).await,
                    Err(e) => {
                        tracing::debug!(server = %self.server_name, error = %e, "skipping malformed SSE event");
                    }
                }
            }
            Err(McpError::ConnectionLost {
                server: self.server_name.clone(),
                reason: "response stream ended before a result arrived".into(),
            })
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| McpError::from_http(&self.server_name, &e))?;
            let message = serde_json::from_str::<serde_json::Value>(&text).map_err(|e| {
                McpError::InvalidResponse {
                    server: self.server_name.clone(),
                    reason: format!("response body is not JSON: {e}"),
                }
            })?;
            self.dispatch(message).await;
            Err(McpError::InvalidResponse {
                server: self.server_name.clone(),
                reason: "response body did not answer the request".into(),
            })
        }
    }

    async fn dispatch(self: &Arc<Self>, message: serde_json::Value) {
        for request in route_incoming(&self.pending, &self.server_name, message) {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.answer_server_request(request).await });
        }
    }

    /// Reply to a request the server initiated. Only `ping` is supported.
    async fn answer_server_request(&self, request: ServerRequest) {
        let reply = if request.method == "ping" {
            serde_json::json!({"jsonrpc": "2.0", "id": request.id, "result": {}})
        } else {
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": request.id,
                "error": {
                    "code": error_codes::METHOD_NOT_FOUND,
                    "message": format!("method '{}' not supported by client", request.method),
                }
            })
        };
        if let Err(e) = self.post(&reply).await {
            tracing::debug!(server = %self.server_name, error = %e, "failed to answer server request");
        }
    }
}

// ─── SSE Parsing ─────────────────────────────────────────────────────────────

/// Split a byte stream into SSE events, yielding each event's `data` payload.
///
/// Multi-line `data:` fields are joined with `\n`. Events without data
/// (comments, keep-alives) are skipped.
pub(crate) fn sse_events<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<String, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    stream::unfold(
        (Box::pin(byte_stream), String::new(), false),
        |(mut byte_stream, mut buffer, mut done)| async move {
            loop {
                if let Some(event_end) = buffer.find("\n\n") {
                    let event = buffer[..event_end].to_string();
                    buffer.drain(..event_end + 2);
                    match event_data(&event) {
                        Some(data) => return Some((Ok(data), (byte_stream, buffer, done))),
                        None => continue,
                    }
                }

                if done {
                    let rest = std::mem::take(&mut buffer);
                    return event_data(&rest).map(|data| (Ok(data), (byte_stream, buffer, done)));
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(bytes.as_ref()));
                        if buffer.contains('\r') {
                            buffer = buffer.replace("\r\n", "\n");
                        }
                    }
                    Some(Err(e)) => {
                        done = true;
                        return Some((Err(e), (byte_stream, buffer, done)));
                    }
                    None => done = true,
                }
            }
        },
    )
}

fn event_data(event: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in event.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        }
    }
    data.filter(|d| !d.trim().is_empty())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
