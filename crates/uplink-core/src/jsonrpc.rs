//! JSON-RPC 2.0 envelopes exchanged over the control channel.
//!
//! The cloud side both calls methods on the device (inbound calls) and
//! answers requests the device sent it (forwarded logs and stats). Every
//! inbound text message is classified into one of those two shapes.

use crate::error::UplinkError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const SERVER_ERROR: i64 = -32000;

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// A method call, inbound from the cloud or outbound from the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// Absent for notifications, which never get a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Value, id: impl Into<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }
}

/// Structured error object of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: "Method not found".into(),
            data: Some(Value::String(method.to_string())),
        }
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, detail)
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, detail)
    }
}

impl From<UplinkError> for RpcError {
    fn from(e: UplinkError) -> Self {
        match e {
            UplinkError::InvalidParams(msg) => Self::invalid_params(msg),
            UplinkError::InvalidMessage(msg) => Self::invalid_request(msg),
            other => Self::new(SERVER_ERROR, other.to_string()),
        }
    }
}

/// A response to a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: default_version(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing plain Value trees cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The cloud's answer to a request this device sent earlier.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl Reply {
    /// The cloud acknowledges forwarded records with `{"success": true}`.
    pub fn is_success(&self) -> bool {
        self.result
            .as_ref()
            .and_then(|r| r.get("success"))
            .map(|s| match s {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
                _ => false,
            })
            .unwrap_or(false)
    }

    pub fn id_str(&self) -> Option<&str> {
        self.id.as_str()
    }
}

/// Classification of one inbound data message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Call(Request),
    Reply(Reply),
    Invalid(String),
}

/// Parse and classify an inbound message.
///
/// A `"method"` key marks a call; an `"id"` with `"result"` or `"error"`
/// marks a reply. Anything else is invalid.
pub fn classify(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Inbound::Invalid(format!("parse error: {e}")),
    };
    let Value::Object(map) = value else {
        return Inbound::Invalid("not a valid request or response".into());
    };

    if map.contains_key("method") {
        return match serde_json::from_value::<Request>(Value::Object(map)) {
            Ok(req) => Inbound::Call(req),
            Err(e) => Inbound::Invalid(format!("malformed request: {e}")),
        };
    }

    if map.contains_key("id") && (map.contains_key("result") || map.contains_key("error")) {
        return Inbound::Reply(reply_from_map(map));
    }

    Inbound::Invalid("not a valid request or response".into())
}

fn reply_from_map(mut map: Map<String, Value>) -> Reply {
    Reply {
        id: map.remove("id").unwrap_or(Value::Null),
        result: map.remove("result"),
        error: map.remove("error"),
    }
}
