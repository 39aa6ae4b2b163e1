//! JSON-RPC 2.0 wire types for the agent stdio protocol.
//!
//! Inbound lines are classified into [`RpcMessage`] variants; outbound frames
//! are built as [`serde_json::Value`] objects and handed to the writer task.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Generic server error; agents also use it to signal "authentication required".
pub const AUTH_REQUIRED: i64 = -32000;
/// Generic server error raised by the proxy itself.
pub const SERVER_ERROR: i64 = -32000;
/// Resource not found (ACP extension).
pub const RESOURCE_NOT_FOUND: i64 = -32004;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Internal error while handling a request.
pub const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Error without a data payload.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// `-32601 method not found`.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// `-32602 invalid params`.
    #[must_use]
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, detail)
    }

    /// `-32603 internal error`.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, detail)
    }
}

/// A classified inbound JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// Agent-initiated call expecting a response.
    Request {
        /// Request id, echoed in the response.
        id: Value,
        /// Method name.
        method: String,
        /// Parameters (`null` when absent).
        params: Value,
    },
    /// Reply to a proxy-initiated call.
    Response {
        /// Id of the originating request.
        id: Value,
        /// `Ok(result)` or the agent's error object.
        outcome: std::result::Result<Value, RpcError>,
    },
    /// Fire-and-forget message.
    Notification {
        /// Method name.
        method: String,
        /// Parameters (`null` when absent).
        params: Value,
    },
}

impl RpcMessage {
    /// Classify a decoded JSON value. Returns `None` for values that are not
    /// JSON-RPC messages (non-objects, or objects with neither a method nor
    /// an id).
    #[must_use]
    pub fn classify(value: Value) -> Option<Self> {
        let Value::Object(mut obj) = value else {
            return None;
        };
        let id = obj.remove("id").filter(|v| !v.is_null());
        let method = obj
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let params = obj.remove("params").unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => Some(Self::Request { id, method, params }),
            (None, Some(method)) => Some(Self::Notification { method, params }),
            (Some(id), None) => {
                let outcome = match obj.remove("error") {
                    Some(err) if !err.is_null() => Err(parse_error_object(err)),
                    _ => Ok(obj.remove("result").unwrap_or(Value::Null)),
                };
                Some(Self::Response { id, outcome })
            }
            (None, None) => None,
        }
    }
}

fn parse_error_object(err: Value) -> RpcError {
    serde_json::from_value::<RpcError>(err.clone()).unwrap_or_else(|_| {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| err.to_string(), str::to_owned);
        RpcError::new(INTERNAL_ERROR, message)
    })
}

/// Correlation key for a request id: numbers and strings map to their
/// textual form so `5` and `"5"` correlate the same way.
#[must_use]
pub fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Build a request frame.
#[must_use]
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// Build a notification frame.
#[must_use]
pub fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

/// Build a success response frame.
#[must_use]
pub fn ok_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response frame.
#[must_use]
pub fn error_response(id: Value, error: &RpcError) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}
