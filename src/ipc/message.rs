//! JSON-RPC 2.0 message model and codec.
//!
//! Every line on the wire is one JSON object. Classification follows the
//! fields present rather than a tag:
//!
//! - `id` plus `result` or `error` is a [`Response`]
//! - `id` plus `method` is a [`Request`]
//! - `method` without `id` is a [`Notification`]
//!
//! Missing or `null` params decode as an empty object.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};
use thiserror::Error;

/// Protocol version carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Correlation token linking a request to its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    /// Any number that is not a `u64` (negative or fractional), echoed back
    /// exactly as received. Never holds a value `Number` could.
    Other(Number),
    String(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(match n.as_u64() {
                Some(n) => RequestId::Number(n),
                None => RequestId::Other(n.clone()),
            }),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => json!(n),
            RequestId::Other(n) => Value::Number(n.clone()),
            RequestId::String(s) => json!(s),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Other(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub const UNAUTHORIZED: i32 = 401;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(Self::UNAUTHORIZED, "unauthorized")
    }

    pub fn method_not_found() -> Self {
        Self::new(Self::METHOD_NOT_FOUND, "Method not found")
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self {
            code: Self::INVALID_PARAMS,
            message: "Invalid params".to_string(),
            data: Some(json!({ "detail": detail.into() })),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    /// Exactly one of `result` or `error` on the wire.
    pub outcome: Result<Value, JsonRpcError>,
}

/// An id-less message. On the client side these are the debugger events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Reasons a line could not be decoded into a [`Message`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("invalid correlation id: {0}")]
    InvalidId(Value),

    #[error("response carries both result and error")]
    AmbiguousResponse,

    #[error("malformed error object: {0}")]
    InvalidError(#[source] serde_json::Error),

    #[error("method must be a string")]
    InvalidMethod,

    #[error("message is neither request, response nor notification")]
    Unclassifiable,
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Message::Request(Request {
            id: id.into(),
            method: method.into(),
            params: normalize_params(params),
        })
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message::Notification(Notification::new(method, normalize_params(params)))
    }

    pub fn success(id: RequestId, result: Value) -> Self {
        Message::Response(Response {
            id,
            outcome: Ok(result),
        })
    }

    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Message::Response(Response {
            id,
            outcome: Err(error),
        })
    }

    /// Decode one line (without its terminator).
    pub fn decode(line: &[u8]) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_slice(line)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let Value::Object(mut obj) = value else {
            return Err(CodecError::NotAnObject);
        };

        let id = match obj.remove("id") {
            None => None,
            Some(raw) => Some(RequestId::from_value(&raw).ok_or(CodecError::InvalidId(raw))?),
        };
        let result = obj.remove("result");
        let error = obj.remove("error");
        let method = match obj.remove("method") {
            None => None,
            Some(Value::String(m)) => Some(m),
            Some(_) => return Err(CodecError::InvalidMethod),
        };
        let params = normalize_params(obj.remove("params").unwrap_or(Value::Null));

        match (id, method, result, error) {
            (Some(_), _, Some(_), Some(_)) => Err(CodecError::AmbiguousResponse),
            (Some(id), _, Some(result), None) => Ok(Message::Response(Response {
                id,
                outcome: Ok(result),
            })),
            (Some(id), _, None, Some(error)) => {
                let error: JsonRpcError =
                    serde_json::from_value(error).map_err(CodecError::InvalidError)?;
                Ok(Message::Response(Response {
                    id,
                    outcome: Err(error),
                }))
            }
            (Some(id), Some(method), None, None) => {
                Ok(Message::Request(Request { id, method, params }))
            }
            (None, Some(method), None, None) => {
                Ok(Message::Notification(Notification { method, params }))
            }
            _ => Err(CodecError::Unclassifiable),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Message::Request(req) => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": req.id.to_value(),
                "method": req.method,
                "params": req.params,
            }),
            Message::Response(resp) => {
                let mut obj = Map::new();
                obj.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
                obj.insert("id".into(), resp.id.to_value());
                match &resp.outcome {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        obj.insert("error".into(), json!(error));
                    }
                }
                Value::Object(obj)
            }
            Message::Notification(note) => json!({
                "jsonrpc": JSONRPC_VERSION,
                "method": note.method,
                "params": note.params,
            }),
        }
    }

    /// Encode as a single line of compact JSON, without the terminator.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }
}

fn normalize_params(params: Value) -> Value {
    match params {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}
