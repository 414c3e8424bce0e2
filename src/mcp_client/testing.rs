//! Scripted connector and transport for pool and host tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::json;

use super::errors::McpError;
use super::lifecycle::{Connection, Connector, DisconnectNotifier};
use super::pool::ConnectionPool;
use super::transport::{RequestOptions, Transport};
use super::types::{InitializeResult, McpToolDefinition, ServerDescriptor, TransportKind};

/// Scripted behaviour shared by every transport a [`MockConnector`] builds.
#[derive(Default)]
pub(crate) struct MockState {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub calls: AtomicUsize,
    pub connect_failures: AtomicUsize,
    /// Handshake latency in milliseconds.
    pub connect_delay_ms: AtomicU64,
    /// server → remaining `tools/call` attempts that fail with connection loss
    pub call_failures: StdMutex<HashMap<String, usize>>,
    pub notifiers: StdMutex<Vec<(String, DisconnectNotifier)>>,
    pub tools: StdMutex<Vec<McpToolDefinition>>,
    pub page_size: AtomicUsize,
}

pub(crate) struct MockConnector {
    pub state: Arc<MockState>,
}

pub(crate) struct MockTransport {
    server: String,
    state: Arc<MockState>,
    closed: AtomicBool,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        notifier: DisconnectNotifier,
    ) -> Result<Connection, McpError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        let failing = self.state.connect_failures.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.connect_failures.store(failing - 1, Ordering::SeqCst);
            return Err(McpError::ConnectionFailed {
                name: descriptor.name.clone(),
                reason: "handshake refused".into(),
            });
        }
        self.state
            .notifiers
            .lock()
            .unwrap()
            .push((descriptor.name.clone(), notifier));
        let transport = MockTransport {
            server: descriptor.name.clone(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        };
        Ok(Connection {
            transport: Arc::new(transport),
            init: serde_json::from_value::<InitializeResult>(json!({
                "protocolVersion": "2025-03-26",
                "serverInfo": {"name": descriptor.name, "version": "0.0.1"}
            }))
            .unwrap(),
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Subprocess
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        options: RequestOptions,
    ) -> Result<serde_json::Value, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::channel_closed(&self.server));
        }
        let params = params.unwrap_or_default();
        match method {
            "tools/list" => {
                let tools = self.state.tools.lock().unwrap().clone();
                let page_size = match self.state.page_size.load(Ordering::SeqCst) {
                    0 => tools.len().max(1),
                    n => n,
                };
                let start: usize = params["cursor"]
                    .as_str()
                    .map(|c| c.parse().unwrap())
                    .unwrap_or(0);
                let end = (start + page_size).min(tools.len());
                let next = (end < tools.len()).then(|| end.to_string());
                Ok(json!({"tools": tools[start..end].to_vec(), "nextCursor": next}))
            }
            "tools/call" => {
                assert!(options.reset_timeout_on_progress);
                self.state.calls.fetch_add(1, Ordering::SeqCst);
                {
                    let mut failures = self.state.call_failures.lock().unwrap();
                    if let Some(remaining) = failures.get_mut(&self.server) {
                        if *remaining > 0 {
                            *remaining -= 1;
                            return Err(McpError::ConnectionLost {
                                server: self.server.clone(),
                                reason: "Connection reset by peer".into(),
                            });
                        }
                    }
                }
                match params["name"].as_str() {
                    Some("broken") => Ok(json!({
                        "content": [{"type": "text", "text": "disk full"}],
                        "isError": true
                    })),
                    Some("bad_params") => Err(McpError::ServerError {
                        code: -32602,
                        message: "Invalid params".into(),
                        data: None,
                    }),
                    Some("slow") => Err(McpError::Timeout {
                        server: self.server.clone(),
                        method: method.to_string(),
                        timeout_ms: options.timeout.as_millis() as u64,
                    }),
                    _ => Ok(json!({
                        "content": [{"type": "text", "text": params["arguments"].to_string()}],
                        "isError": false
                    })),
                }
            }
            other => panic!("unexpected method {other}"),
        }
    }

    async fn notify(
        &self,
        _method: &str,
        _params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Err(McpError::TransportError {
            server: self.server.clone(),
            reason: "close always complains".into(),
        })
    }
}

pub(crate) fn mock_pool() -> (ConnectionPool, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let connector = MockConnector {
        state: Arc::clone(&state),
    };
    (ConnectionPool::new(Arc::new(connector)), state)
}

pub(crate) fn weather() -> ServerDescriptor {
    ServerDescriptor::subprocess("weather", "weather-server", &[])
}

pub(crate) fn forecast_tool() -> McpToolDefinition {
    McpToolDefinition {
        name: "forecast".into(),
        description: Some("Weather forecast".into()),
        input_schema: Some(json!({
            "type": "object",
            "required": ["city"],
            "properties": {"city": {"type": "string"}}
        })),
    }
}

pub(crate) fn fail_next_calls(state: &MockState, server: &str, n: usize) {
    state
        .call_failures
        .lock()
        .unwrap()
        .insert(server.to_string(), n);
}

pub(crate) fn notifier_for(state: &MockState, server: &str) -> DisconnectNotifier {
    state
        .notifiers
        .lock()
        .unwrap()
        .iter()
        .rev()
        .find(|(name, _)| name == server)
        .map(|(_, n)| n.clone())
        .unwrap()
}
