//! JSON-RPC client for the RAD Studio debugger plugin.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐            TCP              ┌─────────────────────┐
//! │   RpcClient     │  ◄─────────────────────────►│  debugger plugin    │
//! │  + EventQueue   │   newline-delimited JSON    │  (or MockPeer)      │
//! └─────────────────┘                             └─────────────────────┘
//! ```
//!
//! One connection carries both request/response traffic and notifications
//! pushed by the plugin. A single receive loop reads the socket; the
//! [`ResponseRouter`] hands responses to waiting calls by id and queues
//! everything else as events.
//!
//! # Protocol
//!
//! One JSON object per line:
//!
//! ```text
//! {"jsonrpc":"2.0","method":"auth/handshake","params":{"token":"abc123"}}
//! {"jsonrpc":"2.0","id":1,"method":"debug/run","params":{}}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use delphi_debugger::config::RpcConfig;
//! use delphi_debugger::ipc::RpcClient;
//! use serde_json::json;
//!
//! let client = RpcClient::new(RpcConfig::from_env()?);
//! let result = client.call_default("debug/run", json!({})).await?;
//! let event = client.events().next().await;
//! ```

mod client;
mod connection;
mod events;
mod framing;
mod message;
mod router;

pub use client::{IpcError, RpcClient};
pub use connection::Connection;
pub use events::{spawn_event_logger, EventQueue};
pub use framing::{read_message, write_message, MAX_MESSAGE_SIZE};
pub use message::{
    CodecError, JsonRpcError, Message, Notification, Request, RequestId, Response,
    JSONRPC_VERSION,
};
pub use router::{CallOutcome, ResponseRouter};
