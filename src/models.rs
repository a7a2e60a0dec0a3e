//! Data models shared by the client, the tool layer and the reference peer.
//!
//! These types mirror the JSON payloads exchanged with the RAD Studio
//! debugger plugin.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Wire method names.
pub mod methods {
    pub const HANDSHAKE: &str = "auth/handshake";
    pub const RUN: &str = "debug/run";
    pub const CONTINUE: &str = "debug/continue";
    pub const STEP_OVER: &str = "debug/stepOver";
    pub const SET_BREAKPOINT: &str = "debug/setBreakpoint";
    pub const REMOVE_BREAKPOINT: &str = "debug/removeBreakpoint";

    /// Notification carrying program output.
    pub const OUTPUT: &str = "debug/output";
    /// Notification sent when the debuggee stops.
    pub const STOPPED: &str = "debug/stopped";
}

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, handshake being sent.
    Authenticating,
    Ready,
    /// Terminal: closed locally or by the peer.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A breakpoint as reported by `debug/setBreakpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: String,
    pub file: String,
    pub line: u32,
}

impl Breakpoint {
    /// True if this breakpoint is selected by a removal request.
    ///
    /// An id selects exactly that breakpoint. Without an id, the file must
    /// match and, when given, the line too.
    pub fn matches(&self, id: Option<&str>, file: Option<&str>, line: Option<u32>) -> bool {
        if let Some(id) = id {
            return self.id == id;
        }
        match file {
            Some(file) => self.file == file && line.map_or(true, |l| self.line == l),
            None => false,
        }
    }
}

/// Params of `debug/run`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub project: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Params of `debug/setBreakpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBreakpointParams {
    pub file: String,
    pub line: u32,
}

/// Params of `debug/removeBreakpoint`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveBreakpointParams {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub id: Option<String>,
}

/// Payload of a `debug/output` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub category: String,
    pub text: String,
}

impl OutputEvent {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            category: "stdout".to_string(),
            text: text.into(),
        }
    }
}

/// Payload of a `debug/stopped` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEvent {
    pub reason: String,
    pub thread_id: u32,
}
