//! JSON-RPC 2.0 framing
//!
//! The gateway treats every body it touches as a sequence of frames. A frame
//! carrying a `method` is a request when an `id` rides along and a
//! notification when none does; a frame carrying `result` or `error` answers
//! an earlier request. The types here stay close to the wire and leave all
//! interpretation to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Version marker stamped on every frame
pub const JSONRPC_VERSION: &str = "2.0";

/// A method-bearing frame
///
/// The `id`, when present, is opaque: the gateway echoes it back on the
/// answer and otherwise never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,

    pub method: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Correlation id; absent on notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    /// A request whose answer must echo `id`
    pub fn call(method: impl Into<String>, params: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    /// A fire-and-forget notification
    pub fn notify(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Whether an answer must eventually be produced for this frame
    pub fn expects_response(&self) -> bool {
        self.id.is_some()
    }
}

/// An answer frame, carrying a `result` or an `error` member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,

    pub id: Option<Value>,
}

impl JsonRpcResponse {
    /// Answer `id` with a result
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Answer `id` with an error object
    pub fn failure(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The error member of a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)?;
        if let Some(data) = &self.data {
            write!(f, ": {}", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for JsonRpcError {}

/// Printable form of a frame id
///
/// Used as the correlation key in pending-request tables and as the request
/// id column of audit rows; string ids keep their text, everything else its
/// JSON rendering.
pub fn id_text(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One element of a POST body
///
/// Requests and notifications share [`JsonRpcRequest`]; the presence of an
/// `id` decides which one a frame is. Anything with a `result` or `error`
/// member instead of a `method` is a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcFrame {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl JsonRpcFrame {
    /// True for a request that expects a response
    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcFrame::Request(r) if r.expects_response())
    }

    /// True for a fire-and-forget notification
    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcFrame::Request(r) if !r.expects_response())
    }

    /// True for a response frame
    pub fn is_response(&self) -> bool {
        matches!(self, JsonRpcFrame::Response(_))
    }

    /// Method name, when this frame carries one
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcFrame::Request(r) => Some(&r.method),
            JsonRpcFrame::Response(_) => None,
        }
    }

    /// Frame id, when present
    pub fn id(&self) -> Option<&Value> {
        match self {
            JsonRpcFrame::Request(r) => r.id.as_ref(),
            JsonRpcFrame::Response(r) => r.id.as_ref(),
        }
    }
}

/// Parse a POST body into its frames
///
/// Accepts a single JSON-RPC object or a batch array. Returns the frames in
/// body order together with a flag telling whether the body was a batch.
pub fn parse_frames(body: &[u8]) -> Result<(Vec<JsonRpcFrame>, bool), serde_json::Error> {
    let value: Value = serde_json::from_slice(body)?;
    match value {
        Value::Array(items) => {
            let mut frames = Vec::with_capacity(items.len());
            for item in items {
                frames.push(serde_json::from_value(item)?);
            }
            Ok((frames, true))
        }
        other => Ok((vec![serde_json::from_value(other)?], false)),
    }
}
