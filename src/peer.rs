//! Reference implementation of the debugger plugin side.
//!
//! `MockPeer` speaks the same newline-delimited JSON-RPC as the real plugin
//! and answers the `debug/*` command set with canned results and simulated
//! events. It exists to exercise the client end to end without an IDE.
//!
//! Each accepted connection is an independent session:
//!
//! ```text
//! Unauthenticated ── auth/handshake{token} ──► Authenticated
//! ```
//!
//! With no token configured a session starts Authenticated. Requests sent
//! while Unauthenticated get a 401 error. Notifications are never answered.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::{PeerConfig, RpcConfig};
use crate::ipc::{read_message, write_message, JsonRpcError, Message, Request, RequestId};
use crate::models::{
    methods, Breakpoint, OutputEvent, RemoveBreakpointParams, RunParams, SetBreakpointParams,
    StoppedEvent,
};

/// First generated breakpoint number on every connection.
const FIRST_BREAKPOINT_ID: u64 = 1000;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type SharedWriter = Arc<AsyncMutex<OwnedWriteHalf>>;

/// A bound, not yet serving, reference peer.
pub struct MockPeer {
    config: Arc<PeerConfig>,
    listener: TcpListener,
}

impl MockPeer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(config: PeerConfig) -> Result<Self> {
        let address = config.address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind reference peer on {}", address))?;
        Ok(Self {
            config: Arc::new(config),
            listener,
        })
    }

    /// Bind and serve in a background task.
    pub async fn spawn(config: PeerConfig) -> Result<PeerHandle> {
        let peer = Self::bind(config).await?;
        let addr = peer.local_addr()?;
        let task = tokio::spawn(peer.serve());
        Ok(PeerHandle { addr, task })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read reference peer address")
    }

    /// Accept connections until the task is cancelled.
    ///
    /// Cancelling this future also cancels every session it started.
    pub async fn serve(self) {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        info!(%remote, "Reference peer accepted connection");
                        sessions.spawn(handle_connection(stream, remote, Arc::clone(&self.config)));
                    }
                    Err(e) => {
                        warn!(error = %e, "Reference peer accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }
    }
}

/// Handle to a peer started with [`MockPeer::spawn`]. Dropping it stops the
/// peer and all of its sessions.
pub struct PeerHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl PeerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client settings pointing at this peer, without a token.
    pub fn client_config(&self) -> RpcConfig {
        RpcConfig::new(self.addr.ip().to_string(), self.addr.port())
    }

    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(stream: TcpStream, remote: SocketAddr, config: Arc<PeerConfig>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut session = Session::new(config, write_half);

    loop {
        match read_message(&mut reader).await {
            Ok(Some(line)) => {
                let message = match Message::decode(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(%remote, error = %e, "Reference peer skipped malformed line");
                        continue;
                    }
                };
                if let Err(e) = session.handle(message).await {
                    warn!(%remote, error = %format!("{:#}", e), "Reference peer write failed");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(%remote, error = %format!("{:#}", e), "Reference peer read failed");
                break;
            }
        }
        session.reap_scheduled();
    }

    info!(%remote, "Reference peer connection closed");
    // Dropping the session aborts any pending scheduled events.
}

/// Per-connection state.
struct Session {
    config: Arc<PeerConfig>,
    authenticated: bool,
    breakpoints: Vec<Breakpoint>,
    next_breakpoint: u64,
    writer: SharedWriter,
    /// Timer-driven notifications owned by this connection.
    scheduled: JoinSet<()>,
}

impl Session {
    fn new(config: Arc<PeerConfig>, writer: OwnedWriteHalf) -> Self {
        let authenticated = config.token.is_none();
        Self {
            config,
            authenticated,
            breakpoints: Vec::new(),
            next_breakpoint: FIRST_BREAKPOINT_ID,
            writer: Arc::new(AsyncMutex::new(writer)),
            scheduled: JoinSet::new(),
        }
    }

    fn reap_scheduled(&mut self) {
        while self.scheduled.try_join_next().is_some() {}
    }

    async fn handle(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Notification(note) if note.method == methods::HANDSHAKE => {
                self.authenticated = self.token_matches(note.params.get("token"));
                if self.authenticated {
                    debug!("Handshake accepted");
                } else {
                    warn!("Handshake rejected: token mismatch");
                }
                Ok(())
            }
            Message::Notification(note) => {
                debug!(method = %note.method, "Ignoring notification");
                Ok(())
            }
            Message::Response(resp) => {
                debug!(id = %resp.id, "Ignoring unsolicited response");
                Ok(())
            }
            Message::Request(req) if !self.authenticated => {
                debug!(method = %req.method, "Rejecting unauthenticated request");
                self.send(&Message::failure(req.id, JsonRpcError::unauthorized()))
                    .await
            }
            Message::Request(req) => self.dispatch(req).await,
        }
    }

    fn token_matches(&self, offered: Option<&Value>) -> bool {
        match &self.config.token {
            None => true,
            Some(expected) => offered.and_then(Value::as_str) == Some(expected.as_str()),
        }
    }

    async fn dispatch(&mut self, req: Request) -> Result<()> {
        let Request { id, method, params } = req;
        match method.as_str() {
            methods::RUN => {
                let run: RunParams = serde_json::from_value(params).unwrap_or_default();
                info!(project = ?run.project, args = ?run.args, "Simulating run");
                self.reply(id, json!({ "status": "running" })).await?;
                self.emit_output("Program started\n").await?;
                self.schedule_stop();
                Ok(())
            }
            methods::CONTINUE => {
                self.reply(id, json!({ "status": "continued" })).await?;
                self.emit_output("Continued\n").await
            }
            methods::STEP_OVER => {
                self.reply(id, json!({ "status": "stepped" })).await?;
                self.emit_output("StepOver\n").await
            }
            methods::SET_BREAKPOINT => match self.set_breakpoint(params) {
                Ok(bp) => self.reply(id, json!(bp)).await,
                Err(error) => self.send(&Message::failure(id, error)).await,
            },
            methods::REMOVE_BREAKPOINT => {
                let selector: RemoveBreakpointParams =
                    serde_json::from_value(params).unwrap_or_default();
                let before = self.breakpoints.len();
                self.breakpoints.retain(|bp| {
                    !bp.matches(
                        selector.id.as_deref(),
                        selector.file.as_deref(),
                        selector.line,
                    )
                });
                debug!(removed = before - self.breakpoints.len(), "Removed breakpoints");
                self.reply(id, json!({ "removed": true })).await
            }
            _ => {
                debug!(%method, "Unknown method");
                self.send(&Message::failure(id, JsonRpcError::method_not_found()))
                    .await
            }
        }
    }

    fn set_breakpoint(&mut self, params: Value) -> Result<Breakpoint, JsonRpcError> {
        let params: SetBreakpointParams = serde_json::from_value(params)
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
        if params.file.is_empty() {
            return Err(JsonRpcError::invalid_params("file must not be empty"));
        }
        if params.line == 0 {
            return Err(JsonRpcError::invalid_params("line must be positive"));
        }

        let bp = Breakpoint {
            id: format!("bp-{}", self.next_breakpoint),
            file: params.file,
            line: params.line,
        };
        self.next_breakpoint += 1;
        debug!(id = %bp.id, file = %bp.file, line = bp.line, "Breakpoint set");
        self.breakpoints.push(bp.clone());
        Ok(bp)
    }

    /// Emit `debug/stopped` after the configured delay.
    fn schedule_stop(&mut self) {
        let writer = Arc::clone(&self.writer);
        let delay = self.config.stop_delay;
        self.scheduled.spawn(async move {
            tokio::time::sleep(delay).await;
            let stopped = StoppedEvent {
                reason: "breakpoint".to_string(),
                thread_id: 1,
            };
            let note = Message::notification(methods::STOPPED, json!(stopped));
            if let Err(e) = send_on(&writer, &note).await {
                debug!(error = %format!("{:#}", e), "Stopped event not delivered");
            }
        });
    }

    async fn reply(&self, id: RequestId, result: Value) -> Result<()> {
        self.send(&Message::success(id, result)).await
    }

    async fn emit_output(&self, text: &str) -> Result<()> {
        let note = Message::notification(methods::OUTPUT, json!(OutputEvent::stdout(text)));
        self.send(&note).await
    }

    async fn send(&self, message: &Message) -> Result<()> {
        send_on(&self.writer, message).await
    }
}

async fn send_on(writer: &AsyncMutex<OwnedWriteHalf>, message: &Message) -> Result<()> {
    let mut stream = writer.lock().await;
    write_message(&mut *stream, &message.encode()).await
}
