//! Named debugger operations exposed to an external caller.
//!
//! Each tool is a thin adapter: make sure the connection is up, issue one
//! call (or one non-blocking drain for `poll_events`) and hand the result
//! back unchanged. No retries happen here.
//!
//! [`serve_lines`] exposes the tools over a line protocol, used by the
//! `serve` command on stdio:
//!
//! ```text
//! → {"tool":"set_breakpoint","args":{"file":"foo.pas","line":42}}
//! ← {"ok":true,"result":{"id":"bp-1000","file":"foo.pas","line":42}}
//! ```

use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::RpcConfig;
use crate::ipc::{
    read_message, spawn_event_logger, write_message, IpcError, Notification, RpcClient,
};
use crate::models::{methods, RemoveBreakpointParams, RunParams, SetBreakpointParams};

/// Default `max_items` for `poll_events`.
pub const DEFAULT_POLL_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {source}")]
    InvalidArguments {
        tool: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Rpc(#[from] IpcError),
}

impl ToolError {
    /// Remote error code, if the plugin rejected the call.
    pub fn code(&self) -> Option<i32> {
        match self {
            ToolError::Rpc(err) => err.code(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoveArgs {
    file: String,
    line: Option<u32>,
    #[serde(alias = "breakpoint_id")]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollArgs {
    #[serde(default = "default_poll_limit")]
    max_items: usize,
}

fn default_poll_limit() -> usize {
    DEFAULT_POLL_LIMIT
}

pub struct DebuggerTools {
    client: RpcClient,
    log_events: bool,
    event_logger: Mutex<Option<JoinHandle<()>>>,
}

impl DebuggerTools {
    pub fn new(config: RpcConfig) -> Self {
        let log_events = config.log_events;
        Self {
            client: RpcClient::new(config),
            log_events,
            event_logger: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    async fn ensure_connected(&self) -> Result<(), IpcError> {
        self.client.ensure_connected().await?;
        if self.log_events {
            let mut logger = self
                .event_logger
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if logger.is_none() {
                debug!("Starting background event logger");
                *logger = Some(spawn_event_logger(self.client.events()));
            }
        }
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        self.ensure_connected().await?;
        Ok(self.client.call_default(method, params).await?)
    }

    pub async fn run(&self, project: Option<String>, args: Vec<String>) -> Result<Value, ToolError> {
        let params = RunParams { project, args };
        self.call(methods::RUN, json!(params)).await
    }

    pub async fn cont(&self) -> Result<Value, ToolError> {
        self.call(methods::CONTINUE, json!({})).await
    }

    pub async fn step_over(&self) -> Result<Value, ToolError> {
        self.call(methods::STEP_OVER, json!({})).await
    }

    pub async fn set_breakpoint(&self, file: &str, line: u32) -> Result<Value, ToolError> {
        let params = SetBreakpointParams {
            file: file.to_string(),
            line,
        };
        self.call(methods::SET_BREAKPOINT, json!(params)).await
    }

    pub async fn remove_breakpoint(
        &self,
        file: &str,
        line: Option<u32>,
        id: Option<&str>,
    ) -> Result<Value, ToolError> {
        let params = RemoveBreakpointParams {
            file: Some(file.to_string()),
            line,
            id: id.map(str::to_string),
        };
        self.call(methods::REMOVE_BREAKPOINT, json!(params)).await
    }

    /// Take up to `max_items` buffered events without waiting.
    pub async fn poll_events(&self, max_items: usize) -> Result<Vec<Notification>, ToolError> {
        self.ensure_connected().await?;
        Ok(self.client.drain_events(max_items))
    }

    /// Dispatch a tool by name with JSON arguments.
    pub async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        let args = match args {
            Value::Null => json!({}),
            other => other,
        };
        let parse_error = |source| ToolError::InvalidArguments {
            tool: tool.to_string(),
            source,
        };

        match tool {
            "run" => {
                let RunParams { project, args } =
                    serde_json::from_value(args).map_err(parse_error)?;
                self.run(project, args).await
            }
            "continue" | "cont" => self.cont().await,
            "step_over" => self.step_over().await,
            "set_breakpoint" => {
                let SetBreakpointParams { file, line } =
                    serde_json::from_value(args).map_err(parse_error)?;
                self.set_breakpoint(&file, line).await
            }
            "remove_breakpoint" => {
                let RemoveArgs { file, line, id } =
                    serde_json::from_value(args).map_err(parse_error)?;
                self.remove_breakpoint(&file, line, id.as_deref()).await
            }
            "poll_events" => {
                let PollArgs { max_items } = serde_json::from_value(args).map_err(parse_error)?;
                let events = self.poll_events(max_items).await?;
                Ok(json!(events))
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    /// Close the connection and wait for the event logger to finish.
    pub async fn shutdown(&self) {
        self.client.close().await;
        let logger = self
            .event_logger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(logger) = logger {
            let _ = logger.await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolRequest {
    tool: String,
    #[serde(default)]
    args: Value,
}

fn error_reply(err: &ToolError) -> Value {
    let mut reply = json!({ "ok": false, "error": err.to_string() });
    if let Some(code) = err.code() {
        reply["code"] = json!(code);
    }
    reply
}

/// Answer one tool request per input line until EOF.
///
/// Lines that are not a valid request, including ones that are not UTF-8,
/// get an `ok:false` reply and serving continues.
///
/// # Errors
///
/// Returns an error only if reading input or writing a reply fails, or a
/// line exceeds the framing limit; tool failures are reported in the reply
/// line.
pub async fn serve_lines<R, W>(tools: &DebuggerTools, mut reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(line) = read_message(&mut reader)
        .await
        .context("Failed to read tool request")?
    {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let reply = match serde_json::from_slice::<ToolRequest>(&line) {
            Ok(request) => {
                debug!(tool = %request.tool, "Invoking tool");
                match tools.invoke(&request.tool, request.args).await {
                    Ok(result) => json!({ "ok": true, "result": result }),
                    Err(e) => error_reply(&e),
                }
            }
            Err(e) => json!({ "ok": false, "error": format!("Invalid tool request: {}", e) }),
        };

        write_message(&mut writer, &reply.to_string()).await?;
    }

    info!("Tool input closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::peer::MockPeer;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_unknown_tool_is_not_an_rpc_error() {
        let tools = DebuggerTools::new(RpcConfig::default());
        let err = tools.invoke("evaluate", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "evaluate"));
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_reported_before_connecting() {
        let tools = DebuggerTools::new(RpcConfig::default());
        let err = tools
            .invoke("set_breakpoint", json!({"file": "foo.pas"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { ref tool, .. } if tool == "set_breakpoint"));
        assert_eq!(tools.client().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_invoke_round_trip_against_reference_peer() {
        let peer = MockPeer::spawn(
            PeerConfig::ephemeral()
                .with_token("abc123")
                .with_stop_delay(Duration::from_millis(10)),
        )
        .await
        .unwrap();
        let tools = DebuggerTools::new(peer.client_config().with_token("abc123"));

        let bp = tools
            .invoke("set_breakpoint", json!({"file": "foo.pas", "line": 42}))
            .await
            .unwrap();
        assert_eq!(bp["file"], "foo.pas");
        assert_eq!(bp["line"], 42);

        let removed = tools
            .invoke(
                "remove_breakpoint",
                json!({"file": "foo.pas", "breakpoint_id": bp["id"]}),
            )
            .await
            .unwrap();
        assert_eq!(removed, json!({"removed": true}));

        let events = tools.invoke("poll_events", Value::Null).await.unwrap();
        assert_eq!(events, json!([]));

        tools.shutdown().await;
    }

    #[tokio::test]
    async fn test_serve_lines_replies_per_request() {
        let peer = MockPeer::spawn(PeerConfig::ephemeral().with_token("xyz"))
            .await
            .unwrap();
        let tools = DebuggerTools::new(peer.client_config());

        let (mut input, input_reader) = duplex(4096);
        let (output_writer, output) = duplex(4096);

        input
            .write_all(b"{\"tool\":\"continue\"}\n\nnot json\n\xff\xfe\n{\"tool\":\"nope\"}\n")
            .await
            .unwrap();
        drop(input);

        serve_lines(&tools, BufReader::new(input_reader), output_writer)
            .await
            .unwrap();

        let mut lines = BufReader::new(output).lines();
        let mut replies = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            replies.push(serde_json::from_str::<Value>(&line).unwrap());
        }

        assert_eq!(replies.len(), 4);
        assert_eq!(replies[0]["ok"], false);
        assert_eq!(replies[0]["code"], 401);
        for reply in &replies[1..3] {
            assert_eq!(reply["ok"], false);
            assert!(reply["error"]
                .as_str()
                .unwrap()
                .starts_with("Invalid tool request"));
        }
        assert_eq!(replies[3]["error"], "Unknown tool: nope");

        tools.shutdown().await;
    }
}
