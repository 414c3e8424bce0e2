//! Connection pool and call dispatch.
//!
//! Owns exactly one [`Session`] per server identity. Callers address servers
//! by name only and never see a transport. When a call fails because the
//! connection went away, the pool replaces the session with a brand-new one
//! and retries the call once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use super::advisory::{self, ToolSchema};
use super::errors::McpError;
use super::lifecycle::{Connection, Connector, DefaultConnector, DisconnectNotifier};
use super::transport::{RequestOptions, Transport};
use super::types::{
    CallToolResult, McpToolDefinition, ServerDescriptor, ServerInfo, ServerStatus,
    ToolsListResult,
};

/// Idle timeout for one call when the descriptor sets none.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Hard cap on one call, progress or not, when the descriptor sets none.
pub const DEFAULT_MAX_TOTAL_TIMEOUT: Duration = Duration::from_secs(600);

// ─── Session ─────────────────────────────────────────────────────────────────

/// Live binding of one server identity to an open transport.
///
/// Never repaired in place: a reconnect builds a new session and the old one
/// is shut down.
pub struct Session {
    descriptor: ServerDescriptor,
    transport: Arc<dyn Transport>,
    connected: Arc<AtomicBool>,
    schemas: RwLock<HashMap<String, ToolSchema>>,
    server_info: Option<ServerInfo>,
    protocol_version: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.descriptor.name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Best-effort transport close. Errors are logged, never returned.
    async fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.transport.close().await {
            tracing::debug!(server = %self.name(), error = %e, "error while closing transport");
        }
    }
}

// ─── Pool ────────────────────────────────────────────────────────────────────

/// One session per configured server, with reconnect-and-retry on calls.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Serializes reconnects per identity.
    reconnect_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    call_timeout: Duration,
    max_total_timeout: Duration,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(Arc::new(DefaultConnector::default()))
    }
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            sessions: RwLock::new(HashMap::new()),
            reconnect_locks: Mutex::new(HashMap::new()),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_total_timeout: DEFAULT_MAX_TOTAL_TIMEOUT,
        }
    }

    /// Override the pool-wide call deadlines.
    pub fn with_timeouts(mut self, call_timeout: Duration, max_total_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self.max_total_timeout = max_total_timeout;
        self
    }

    /// Connect a server and make it the identity's session.
    ///
    /// Any session previously registered under the same identity is replaced
    /// and its transport closed.
    pub async fn connect(&self, descriptor: &ServerDescriptor) -> Result<Arc<Session>, McpError> {
        let session = self.open_session(descriptor).await?;

        let replaced = self
            .sessions
            .write()
            .await
            .insert(descriptor.name.clone(), Arc::clone(&session));
        if let Some(old) = replaced {
            tracing::debug!(server = %descriptor.name, "replacing existing session");
            old.shutdown().await;
        }

        tracing::info!(
            server = %descriptor.name,
            kind = %descriptor.kind(),
            "server connected"
        );
        Ok(session)
    }

    /// Discover a server's tools and refresh its schema table.
    pub async fn list_tools(&self, identity: &str) -> Result<Vec<McpToolDefinition>, McpError> {
        let session = self.session(identity).await?;
        let options = RequestOptions::with_timeout(self.idle_timeout(&session));

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let result = session.transport.request("tools/list", params, options).await?;
            let page: ToolsListResult =
                serde_json::from_value(result).map_err(|e| McpError::InvalidResponse {
                    server: identity.to_string(),
                    reason: format!("failed to parse tools/list result: {e}"),
                })?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    tracing::warn!(server = identity, cursor = %next, "server repeated a tools/list cursor");
                    break;
                }
                _ => break,
            }
        }

        let mut schemas = session.schemas.write().await;
        for tool in &tools {
            if let Some(schema) = tool.input_schema.as_ref().and_then(ToolSchema::from_value) {
                schemas.insert(tool.name.clone(), schema);
            }
        }
        drop(schemas);

        tracing::info!(server = identity, tool_count = tools.len(), "discovered tools");
        Ok(tools)
    }

    /// Call a tool, reconnecting and retrying once on connection loss.
    ///
    /// A result with `isError: true` is a normal response and is returned
    /// as-is.
    pub async fn invoke(
        &self,
        identity: &str,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let session = self.session(identity).await?;

        let diagnostics = {
            let schemas = session.schemas.read().await;
            advisory::check(identity, tool, &args, &schemas)
        };
        for diagnostic in &diagnostics {
            tracing::warn!(server = identity, tool, "{identity}.{tool}: {diagnostic}");
        }

        let err = match self.call_on(&session, tool, &args).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if session.is_connected() && !err.is_connection_class() {
            return Err(err);
        }

        tracing::warn!(
            server = identity,
            tool,
            error = %err,
            "call failed on a lost connection, reconnecting"
        );
        let fresh = self.reconnect(&session).await?;
        self.call_on(&fresh, tool, &args).await
    }

    /// Connection health for one identity. Unknown identities are disconnected.
    pub async fn get_status(&self, identity: &str) -> ServerStatus {
        let connected = self
            .sessions
            .read()
            .await
            .get(identity)
            .is_some_and(|s| s.is_connected());
        ServerStatus { connected }
    }

    /// Close and forget one server. No-op for unknown identities.
    pub async fn close(&self, identity: &str) {
        let removed = self.sessions.write().await.remove(identity);
        if let Some(session) = removed {
            session.shutdown().await;
            tracing::info!(server = identity, "server closed");
        }
    }

    /// Close every tracked server.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        futures::future::join_all(drained.iter().map(|s| s.shutdown())).await;
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "all servers closed");
        }
    }

    /// Tracked identities, sorted.
    pub async fn servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current session for `identity`, connected or not.
    pub async fn get_session(&self, identity: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(identity).cloned()
    }

    pub async fn descriptor(&self, identity: &str) -> Option<ServerDescriptor> {
        self.sessions
            .read()
            .await
            .get(identity)
            .map(|s| s.descriptor.clone())
    }

    /// Schema on file for `tool`, if discovery has produced one.
    pub async fn schema(&self, identity: &str, tool: &str) -> Option<ToolSchema> {
        let session = self.sessions.read().await.get(identity).cloned()?;
        let schemas = session.schemas.read().await;
        schemas.get(tool).cloned()
    }

    // ── internals ──

    /// Build and handshake a session without registering it.
    async fn open_session(&self, descriptor: &ServerDescriptor) -> Result<Arc<Session>, McpError> {
        let connected = Arc::new(AtomicBool::new(true));
        let notifier = DisconnectNotifier::new(&descriptor.name, Arc::clone(&connected));
        let Connection { transport, init } = self.connector.connect(descriptor, notifier).await?;

        Ok(Arc::new(Session {
            descriptor: descriptor.clone(),
            transport,
            connected,
            schemas: RwLock::new(HashMap::new()),
            server_info: init.server_info,
            protocol_version: init.protocol_version,
        }))
    }

    async fn session(&self, identity: &str) -> Result<Arc<Session>, McpError> {
        self.sessions
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer {
                name: identity.to_string(),
            })
    }

    fn idle_timeout(&self, session: &Session) -> Duration {
        session.descriptor.timeout.unwrap_or(self.call_timeout)
    }

    async fn call_on(
        &self,
        session: &Session,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let arguments = if args.is_null() {
            serde_json::json!({})
        } else {
            args.clone()
        };
        let params = serde_json::json!({ "name": tool, "arguments": arguments });
        let options = RequestOptions::keepalive(
            self.idle_timeout(session),
            session
                .descriptor
                .max_total_timeout
                .unwrap_or(self.max_total_timeout),
        );

        let result = session
            .transport
            .request("tools/call", Some(params), options)
            .await?;
        serde_json::from_value(result).map_err(|e| McpError::InvalidResponse {
            server: session.name().to_string(),
            reason: format!("failed to parse tools/call result: {e}"),
        })
    }

    async fn reconnect_lock(&self, identity: &str) -> Arc<Mutex<()>> {
        let mut locks = self.reconnect_locks.lock().await;
        Arc::clone(locks.entry(identity.to_string()).or_default())
    }

    /// Replace `stale` with a freshly connected session.
    ///
    /// Reconnects for one identity run one at a time. A caller that finds a
    /// newer connected session already in the slot uses it as-is. A server
    /// that was closed while the failing call was in flight stays closed: the
    /// new session is only registered if the slot still holds the session it
    /// replaces.
    async fn reconnect(&self, stale: &Arc<Session>) -> Result<Arc<Session>, McpError> {
        let name = stale.name().to_string();
        let lock = self.reconnect_lock(&name).await;
        let _guard = lock.lock().await;

        let current = self.sessions.read().await.get(&name).cloned();
        let Some(current) = current else {
            tracing::debug!(server = %name, "server was closed, not reconnecting");
            return Err(McpError::ReconnectFailed { name });
        };
        if !Arc::ptr_eq(&current, stale) && current.is_connected() {
            tracing::debug!(server = %name, "session already replaced, reusing it");
            return Ok(current);
        }

        current.shutdown().await;

        let fresh = match self.open_session(&stale.descriptor).await {
            Ok(fresh) => fresh,
            Err(e) => {
                let mut sessions = self.sessions.write().await;
                if sessions.get(&name).is_some_and(|s| Arc::ptr_eq(s, &current)) {
                    sessions.remove(&name);
                }
                return Err(e);
            }
        };

        let installed = {
            let mut sessions = self.sessions.write().await;
            if sessions.get(&name).is_some_and(|s| Arc::ptr_eq(s, &current)) {
                sessions.insert(name.clone(), Arc::clone(&fresh));
                None
            } else {
                Some(sessions.get(&name).filter(|s| s.is_connected()).cloned())
            }
        };

        match installed {
            None => {
                tracing::info!(server = %name, "reconnected");
                Ok(fresh)
            }
            // Closed or explicitly reconnected while we were handshaking.
            Some(winner) => {
                fresh.shutdown().await;
                winner.ok_or(McpError::ReconnectFailed { name })
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
