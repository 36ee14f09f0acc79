//! JSON-RPC 2.0 envelope types and the classification rule that tells a
//! connection whether an inbound object is a response, a request or a
//! notification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JsonRpcError;

pub const JSONRPC_VERSION: &str = "2.0";

/// An outgoing or incoming JSON-RPC request: `{jsonrpc, id, method, params?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// New request with a freshly generated v4-UUID id, per §4.3.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::String(Uuid::new_v4().to_string()),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC notification: `{jsonrpc, method, params?}` -- no `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), method: method.into(), params }
    }
}

/// A JSON-RPC response, either `{id, result}` or `{id, error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), id, result: Some(result), error: None }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), id, result: None, error: Some(error) }
    }
}

/// The result of classifying an arbitrary decoded JSON object against the
/// four envelope shapes in §3. Rule order matches §4.3 exactly: response
/// shape is checked before request shape, since a response also carries an
/// `id`.
#[derive(Debug)]
pub enum Envelope {
    Response(JsonRpcResponse),
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    /// Doesn't match any recognized shape; callers should log and ignore it.
    Unrecognized(Value),
}

pub fn classify(value: Value) -> Envelope {
    let has_id = value.get("id").is_some();
    let has_result_or_error = value.get("result").is_some() || value.get("error").is_some();
    let has_method = value.get("method").is_some();

    if has_id && has_result_or_error {
        match serde_json::from_value::<JsonRpcResponse>(value.clone()) {
            Ok(resp) => return Envelope::Response(resp),
            Err(_) => return Envelope::Unrecognized(value),
        }
    }

    if has_method && has_id {
        return match serde_json::from_value::<JsonRpcRequest>(value.clone()) {
            Ok(req) => Envelope::Request(req),
            Err(_) => Envelope::Unrecognized(value),
        };
    }

    if has_method && !has_id {
        return match serde_json::from_value::<JsonRpcNotification>(value.clone()) {
            Ok(n) => Envelope::Notification(n),
            Err(_) => Envelope::Unrecognized(value),
        };
    }

    Envelope::Unrecognized(value)
}
