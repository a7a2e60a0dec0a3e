//! Delphi debugger bridge library
//!
//! This library provides the pieces behind the `delphi-debugger` binary:
//!
//! - `ipc` - JSON-RPC client for the RAD Studio debugger plugin
//! - `peer` - Reference implementation of the plugin side, for tests and demos
//! - `tools` - Named debugger operations for an external caller
//! - `config` - Connection settings from environment and command line
//! - `models` - Payload types and wire method names
//!
//! # IPC Module
//!
//! ```ignore
//! use delphi_debugger::config::{PeerConfig, RpcConfig};
//! use delphi_debugger::ipc::RpcClient;
//! use delphi_debugger::peer::MockPeer;
//!
//! let peer = MockPeer::spawn(PeerConfig::ephemeral().with_token("abc123")).await?;
//! let client = RpcClient::new(peer.client_config().with_token("abc123"));
//! let result = client.call_default("debug/run", serde_json::json!({})).await?;
//! ```

pub mod config;
pub mod ipc;
pub mod models;
pub mod peer;
pub mod tools;
