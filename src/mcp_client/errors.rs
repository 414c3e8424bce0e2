//! MCP client error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the server and tool
//! context needed to build meaningful log entries.

use thiserror::Error;

/// Markers that identify a connectivity failure from its description alone.
///
/// Used as a fallback for errors that reach us only as text (remote I/O
/// failures surfaced by HTTP stacks, OS error strings from child pipes).
const CONNECTION_MARKERS: &[&str] = &[
    "connection closed",
    "channel closed",
    "transport closed",
    "connection refused",
    "econnrefused",
    "connection reset",
    "econnreset",
    "connection aborted",
    "econnaborted",
    "broken pipe",
    "epipe",
    "network unreachable",
    "enetunreach",
    "host unreachable",
    "ehostunreach",
    "no route to host",
    "connection timed out",
    "etimedout",
    "not connected",
    "unexpected eof",
];

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The operation referenced a server identity with no session in the pool.
    #[error("unknown server: '{name}'")]
    UnknownServer { name: String },

    /// Building the transport or completing the handshake failed.
    #[error("failed to connect to server '{name}': {reason}")]
    ConnectionFailed { name: String, reason: String },

    /// A reconnect completed but no session occupies the slot afterwards.
    #[error("reconnect to server '{name}' did not produce a session")]
    ReconnectFailed { name: String },

    /// Connection-class transport failure: closed channel, refused, reset,
    /// aborted, unreachable or timed-out connection.
    #[error("connection to server '{server}' lost: {reason}")]
    ConnectionLost { server: String, reason: String },

    /// Any other transport-level failure (serialization, unclassified I/O).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request exceeded its idle or total deadline.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Non-2xx HTTP response from a streamed-HTTP server.
    #[error("HTTP {status} from server '{server}': {body}")]
    HttpError {
        server: String,
        status: u16,
        body: String,
    },

    /// The server sent something that is not a valid protocol payload.
    #[error("invalid response from server '{server}': {reason}")]
    InvalidResponse { server: String, reason: String },

    /// Configuration error (missing servers, bad config file, policy violation).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// Discovery cache read/write failure.
    #[error("cache error: {reason}")]
    CacheError { reason: String },
}

impl McpError {
    /// Whether this failure means the transport itself is gone.
    ///
    /// Connection-class failures are the only ones the pool recovers from
    /// (by reconnecting once). Request timeouts are deliberately excluded:
    /// a slow tool is not a dead connection.
    pub fn is_connection_class(&self) -> bool {
        match self {
            McpError::ConnectionLost { .. } => true,
            McpError::TransportError { reason, .. } => describes_connection_loss(reason),
            McpError::HttpError { body, .. } => describes_connection_loss(body),
            _ => false,
        }
    }

    /// Convert an I/O error from a transport pipe or socket.
    pub fn from_io(server: &str, context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let reason = format!("{context}: {err}");
        match err.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof => McpError::ConnectionLost {
                server: server.to_string(),
                reason,
            },
            _ => McpError::TransportError {
                server: server.to_string(),
                reason,
            },
        }
    }

    /// Convert a `reqwest` error from the streamed-HTTP transport.
    pub fn from_http(server: &str, err: &reqwest::Error) -> Self {
        let reason = error_chain(err);
        if err.is_connect() || err.is_timeout() || describes_connection_loss(&reason) {
            McpError::ConnectionLost {
                server: server.to_string(),
                reason,
            }
        } else {
            McpError::TransportError {
                server: server.to_string(),
                reason,
            }
        }
    }

    /// Shorthand for the error every pending request receives when the
    /// channel goes away underneath it.
    pub fn channel_closed(server: &str) -> Self {
        McpError::ConnectionLost {
            server: server.to_string(),
            reason: "connection closed before a response arrived".into(),
        }
    }
}

/// Classify a failure description as connectivity loss.
pub fn describes_connection_loss(description: &str) -> bool {
    let lower = description.to_lowercase();
    CONNECTION_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Flatten an error and its sources into one line (`outer: inner: root`).
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}
