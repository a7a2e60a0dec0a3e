//! JSON-RPC 2.0 client for the RAD Studio debugger plugin.
//!
//! This module provides `RpcClient`, an async client that talks to the
//! plugin over TCP. Calls are correlated by id, so any number may be in
//! flight at once; notifications pushed by the plugin are buffered in the
//! connection's event queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::config::RpcConfig;
use crate::ipc::connection::Connection;
use crate::ipc::events::EventQueue;
use crate::ipc::message::{JsonRpcError, Message, Notification, RequestId};
use crate::ipc::router::ResponseRouter;
use crate::models::ConnectionState;

/// IPC-specific error types.
///
/// `Timeout` ("the plugin never answered") is kept apart from
/// `ServerError` ("the plugin said no").
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to reach the plugin.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// A message was sent before `connect()`.
    #[error("Not connected")]
    NotConnected,

    /// The connection ended while the call was pending, or before it began.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Request timed out waiting for response.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Protocol-level error (encoding, id reuse).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Plugin returned a JSON-RPC error response.
    #[error("Server error {code}: {message}")]
    ServerError {
        /// JSON-RPC error code
        code: i32,
        /// Error message
        message: String,
        /// Optional additional data
        data: Option<Value>,
    },

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl IpcError {
    /// Remote error code, if the plugin rejected the call.
    pub fn code(&self) -> Option<i32> {
        match self {
            IpcError::ServerError { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, IpcError::Timeout(_))
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::AddrNotAvailable
            | ErrorKind::TimedOut => IpcError::ConnectionFailed(err),
            _ => IpcError::Io(err),
        }
    }
}

impl From<JsonRpcError> for IpcError {
    fn from(err: JsonRpcError) -> Self {
        IpcError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Removes the pending entry however the call ends: resolved, timed out,
/// failed to send, or dropped by its caller.
struct PendingGuard<'a> {
    router: &'a ResponseRouter,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.router.abandon(&self.id);
    }
}

/// Client for the debugger plugin.
///
/// The connection is opened lazily by the first call. All methods take
/// `&self`, so one client can serve concurrent callers.
///
/// # Example
///
/// ```ignore
/// use delphi_debugger::config::RpcConfig;
/// use delphi_debugger::ipc::RpcClient;
/// use serde_json::json;
///
/// let client = RpcClient::new(RpcConfig::new("127.0.0.1", 5645).with_token("abc123"));
/// let bp = client.call_default("debug/setBreakpoint", json!({"file": "foo.pas", "line": 42})).await?;
/// let events = client.events().drain(50);
/// ```
pub struct RpcClient {
    connection: Connection,
    /// Monotonically increasing request ID counter.
    request_id: AtomicU64,
    /// Default request timeout.
    timeout: Duration,
}

impl RpcClient {
    pub fn new(config: RpcConfig) -> Self {
        let timeout = config.timeout;
        Self {
            connection: Connection::new(config),
            request_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Create a client and connect immediately.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::ConnectionFailed` if the plugin is unreachable.
    pub async fn connect(config: RpcConfig) -> Result<Self, IpcError> {
        let client = Self::new(config);
        client.ensure_connected().await?;
        Ok(client)
    }

    /// Set the default request timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Notifications received from the plugin.
    pub fn events(&self) -> Arc<EventQueue> {
        self.connection.events()
    }

    /// Wait for the oldest queued event. `None` once the connection has
    /// closed and every buffered event was taken.
    pub async fn next_event(&self) -> Option<Notification> {
        self.connection.router().events().next().await
    }

    /// Take up to `max` buffered events without waiting.
    pub fn drain_events(&self, max: usize) -> Vec<Notification> {
        self.connection.router().events().drain(max)
    }

    /// Number of calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.connection.router().pending_count()
    }

    /// Connect if not already Ready.
    pub async fn ensure_connected(&self) -> Result<(), IpcError> {
        if self.connection.state() == ConnectionState::Ready {
            return Ok(());
        }
        self.connection.connect().await
    }

    /// Send a request and wait for its response.
    ///
    /// `timeout_after` bounds the whole call: connecting, writing the request
    /// and waiting for the answer.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The call does not finish within `timeout_after` (`IpcError::Timeout`)
    /// - The connection ends first (`IpcError::Closed`)
    /// - The plugin returns an error (`IpcError::ServerError`)
    /// - The plugin cannot be reached (`IpcError::ConnectionFailed`)
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout_after: Duration,
    ) -> Result<Value, IpcError> {
        match timeout(timeout_after, self.exchange(method, params)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(method, "Request timed out");
                Err(IpcError::Timeout(timeout_after))
            }
        }
    }

    /// Connect, send and wait, with no deadline of its own. Dropping this
    /// future removes the pending entry.
    async fn exchange(&self, method: &str, params: Value) -> Result<Value, IpcError> {
        self.ensure_connected().await?;

        let router = self.connection.router();
        let id = RequestId::Number(self.next_id());
        let rx = router.register(id.clone())?;
        let _guard = PendingGuard {
            router: router.as_ref(),
            id: id.clone(),
        };

        debug!(%id, method, "Sending request");
        self.connection
            .send(&Message::request(id, method, params))
            .await?;

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(IpcError::Closed(
                "pending call dropped without a response".to_string(),
            )),
        }
    }

    /// [`call`](Self::call) with the configured default timeout.
    pub async fn call_default(&self, method: &str, params: Value) -> Result<Value, IpcError> {
        self.call(method, params, self.timeout).await
    }

    /// Send a notification. No response is expected.
    ///
    /// Connecting and writing are bounded by the default timeout.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), IpcError> {
        let send = async {
            self.ensure_connected().await?;
            self.connection
                .send(&Message::notification(method, params))
                .await
        };
        timeout(self.timeout, send)
            .await
            .map_err(|_| IpcError::Timeout(self.timeout))?
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// Generate the next request ID.
    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }
}
