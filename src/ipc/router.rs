//! Response routing for the receive loop.
//!
//! Incoming responses resolve the pending call registered under their id.
//! Everything id-less goes to the [`EventQueue`]. The pending table is the
//! only state touched by both the receive loop and callers, so it sits
//! behind a mutex that is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::ipc::client::IpcError;
use crate::ipc::events::EventQueue;
use crate::ipc::message::{Message, Notification, RequestId, Response};

/// Resolution delivered to a waiting caller.
pub type CallOutcome = Result<Value, IpcError>;

#[derive(Debug, Default)]
struct PendingTable {
    calls: HashMap<RequestId, oneshot::Sender<CallOutcome>>,
    /// Set once the connection ends; no new calls may register after this.
    closed_reason: Option<String>,
}

#[derive(Debug)]
pub struct ResponseRouter {
    pending: Mutex<PendingTable>,
    events: Arc<EventQueue>,
}

impl ResponseRouter {
    pub fn new(events: Arc<EventQueue>) -> Self {
        Self {
            pending: Mutex::new(PendingTable::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    /// Register a pending call and return the slot it will be resolved into.
    pub fn register(&self, id: RequestId) -> Result<oneshot::Receiver<CallOutcome>, IpcError> {
        let mut table = self.lock();
        if let Some(reason) = &table.closed_reason {
            return Err(IpcError::Closed(reason.clone()));
        }
        if table.calls.contains_key(&id) {
            return Err(IpcError::Protocol(format!(
                "Request id {} is already in flight",
                id
            )));
        }
        let (tx, rx) = oneshot::channel();
        table.calls.insert(id, tx);
        Ok(rx)
    }

    /// Drop a pending call without resolving it. A response arriving later
    /// for this id is discarded.
    pub fn abandon(&self, id: &RequestId) -> bool {
        self.lock().calls.remove(id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Route one decoded message.
    pub fn dispatch(&self, message: Message) {
        match message {
            Message::Response(response) => self.resolve(response),
            Message::Notification(notification) => {
                debug!(method = %notification.method, "queued event");
                self.events.push(notification);
            }
            Message::Request(request) => {
                // The peer does not expect answers from us; surface it as an event.
                debug!(method = %request.method, id = %request.id, "queued peer request as event");
                self.events
                    .push(Notification::new(request.method, request.params));
            }
        }
    }

    fn resolve(&self, response: Response) {
        let slot = self.lock().calls.remove(&response.id);
        let Some(tx) = slot else {
            debug!(id = %response.id, "discarding response with no pending call");
            return;
        };
        let outcome = response.outcome.map_err(IpcError::from);
        if tx.send(outcome).is_err() {
            debug!(id = %response.id, "caller went away before its response arrived");
        }
    }

    /// Fail every pending call with [`IpcError::Closed`] and refuse new ones.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut table = self.lock();
            if table.closed_reason.is_none() {
                table.closed_reason = Some(reason.to_string());
            }
            table.calls.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), reason, "failing pending calls");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(IpcError::Closed(reason.to_string())));
        }
    }
}
