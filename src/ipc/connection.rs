//! TCP connection to the debugger plugin.
//!
//! A [`Connection`] owns the socket. On connect the read half moves into a
//! background receive loop, the only reader, which feeds the
//! [`ResponseRouter`]. Writes go through an async mutex so concurrent callers
//! never interleave lines.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::ipc::client::IpcError;
use crate::ipc::events::EventQueue;
use crate::ipc::framing::{read_message, write_message};
use crate::ipc::message::Message;
use crate::ipc::router::ResponseRouter;
use crate::models::{methods, ConnectionState};

type SharedState = Arc<Mutex<ConnectionState>>;

/// How long `close()` waits for an in-progress write before giving up on a
/// clean socket shutdown.
const CLOSE_WRITE_GRACE: Duration = Duration::from_millis(500);

fn lock_state(state: &Mutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Connection {
    config: RpcConfig,
    state: SharedState,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    router: Arc<ResponseRouter>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes connect and close.
    lifecycle: AsyncMutex<()>,
    /// Flips to true on teardown; cuts short any write in progress.
    closed: watch::Sender<bool>,
}

impl Connection {
    pub fn new(config: RpcConfig) -> Self {
        let events = Arc::new(EventQueue::new());
        let (closed, _) = watch::channel(false);
        Self {
            config,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            writer: AsyncMutex::new(None),
            router: Arc::new(ResponseRouter::new(events)),
            receive_task: Mutex::new(None),
            lifecycle: AsyncMutex::new(()),
            closed,
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *lock_state(&self.state)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = lock_state(&self.state);
        let previous = *state;
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
            *state = next;
        }
    }

    pub fn router(&self) -> &Arc<ResponseRouter> {
        &self.router
    }

    pub fn events(&self) -> Arc<EventQueue> {
        Arc::clone(self.router.events())
    }

    /// Open the socket, send the handshake if a token is configured, and
    /// start the receive loop.
    ///
    /// A no-op when already Ready.
    ///
    /// # Errors
    ///
    /// - `IpcError::ConnectionFailed` if the plugin is unreachable
    /// - `IpcError::Closed` if this connection was already closed
    /// - `IpcError::Closed` if the handshake could not be written
    pub async fn connect(&self) -> Result<(), IpcError> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Closed => {
                return Err(IpcError::Closed("connection already closed".to_string()))
            }
            _ => {}
        }

        let address = self.config.address();
        self.set_state(ConnectionState::Connecting);
        let mut attempt = ConnectAttempt {
            state: &self.state,
            finished: false,
        };
        info!(%address, "Connecting to debugger plugin");

        let stream = match TcpStream::connect(&address).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%address, error = %e, "Connection to debugger plugin failed");
                return Err(IpcError::from(e));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (read_half, mut write_half) = stream.into_split();

        if let Some(token) = &self.config.token {
            self.set_state(ConnectionState::Authenticating);
            let handshake = Message::notification(methods::HANDSHAKE, json!({ "token": token }));
            if let Err(e) = write_message(&mut write_half, &handshake.encode()).await {
                return Err(IpcError::Closed(format!("Failed to send handshake: {:#}", e)));
            }
            debug!("Handshake sent");
        }

        *self.writer.lock().await = Some(write_half);
        // Ready before the loop starts, so a loop that ends at once can still
        // move the state to Closed.
        self.set_state(ConnectionState::Ready);
        attempt.finished = true;

        let task = tokio::spawn(receive_loop(
            BufReader::new(read_half),
            Arc::clone(&self.router),
            Arc::clone(&self.state),
        ));
        *self
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!(%address, "Connected to debugger plugin");
        Ok(())
    }

    /// Write one message.
    ///
    /// # Errors
    ///
    /// - `IpcError::NotConnected` before `connect()`
    /// - `IpcError::Closed` after close or when the write fails
    ///
    /// If this future is dropped mid-write the line on the wire is cut short,
    /// so the connection is torn down.
    pub async fn send(&self, message: &Message) -> Result<(), IpcError> {
        let mut writer = self.writer.lock().await;
        if self.state() == ConnectionState::Closed {
            return Err(IpcError::Closed("connection closed".to_string()));
        }
        let Some(stream) = writer.as_mut() else {
            return Err(IpcError::NotConnected);
        };

        let encoded = message.encode();
        let mut closed = self.closed.subscribe();
        let mut write = InterruptedWrite {
            connection: self,
            finished: false,
        };
        let result = tokio::select! {
            result = write_message(stream, &encoded) => result,
            _ = closed.wait_for(|closed| *closed) => {
                write.finished = true;
                return Err(IpcError::Closed("connection closed during write".to_string()));
            }
        };
        write.finished = true;

        if let Err(e) = result {
            self.teardown("write failed");
            return Err(IpcError::Closed(format!("Failed to send message: {:#}", e)));
        }
        Ok(())
    }

    /// Everything `close()` does that needs no await: mark Closed, stop the
    /// receive loop, fail pending calls, close the event queue.
    fn teardown(&self, reason: &str) {
        self.set_state(ConnectionState::Closed);
        self.closed.send_replace(true);
        if let Some(task) = self
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.router.fail_all(reason);
        self.router.events().close();
    }

    /// Shut the socket down, stop the receive loop and fail pending calls.
    ///
    /// Idempotent. Pending calls are failed before the write half is
    /// touched, so a write stuck on a full socket cannot hold them up.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let was_closed = self.state() == ConnectionState::Closed;
        self.teardown("connection closed");

        match tokio::time::timeout(CLOSE_WRITE_GRACE, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Some(mut stream) = writer.take() {
                    if let Err(e) = stream.shutdown().await {
                        debug!(error = %e, "Socket shutdown failed");
                    }
                }
            }
            Err(_) => debug!("Write still in progress; leaving socket to drop"),
        }

        if !was_closed {
            info!("Connection to debugger plugin closed");
        }
    }
}

/// Returns the state to Disconnected if `connect()` is dropped part way.
struct ConnectAttempt<'a> {
    state: &'a Mutex<ConnectionState>,
    finished: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = lock_state(self.state);
            if matches!(
                *state,
                ConnectionState::Connecting | ConnectionState::Authenticating
            ) {
                debug!("Connect attempt abandoned");
                *state = ConnectionState::Disconnected;
            }
        }
    }
}

/// Tears the connection down if a write does not run to completion.
struct InterruptedWrite<'a> {
    connection: &'a Connection,
    finished: bool,
}

impl Drop for InterruptedWrite<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Write interrupted mid-line; closing connection");
            self.connection.teardown("write interrupted");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown("connection dropped");
    }
}

/// Read lines until EOF or a read error, routing every decodable message.
async fn receive_loop<R>(mut reader: R, router: Arc<ResponseRouter>, state: SharedState)
where
    R: AsyncBufRead + Unpin,
{
    let reason = loop {
        match read_message(&mut reader).await {
            Ok(Some(line)) => match Message::decode(&line) {
                Ok(message) => router.dispatch(message),
                Err(e) => debug!(error = %e, "Discarding malformed line"),
            },
            Ok(None) => {
                info!("Debugger plugin closed the connection");
                break "connection closed by peer".to_string();
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Receive loop failed");
                break format!("read failed: {:#}", e);
            }
        }
    };

    *lock_state(&state) = ConnectionState::Closed;
    router.fail_all(&reason);
    router.events().close();
}
