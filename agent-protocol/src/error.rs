//! Error taxonomy for the framing, transport and JSON-RPC connection layers.
//!
//! Mirrors the error shape used throughout the crate: a `thiserror` enum of named
//! variants, each carrying a `message` plus an optional boxed source, with small
//! helper constructors so call sites read like `Error::timeout(method, dur)`
//! rather than hand-building variants.

use std::time::Duration;

/// Standard JSON-RPC 2.0 reserved error codes, plus the ones this layer uses itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    Custom(i64),
}

impl JsonRpcErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            JsonRpcErrorCode::ParseError => -32700,
            JsonRpcErrorCode::InvalidRequest => -32600,
            JsonRpcErrorCode::MethodNotFound => -32601,
            JsonRpcErrorCode::InvalidParams => -32602,
            JsonRpcErrorCode::InternalError => -32603,
            JsonRpcErrorCode::Custom(c) => *c,
        }
    }
}

impl From<i64> for JsonRpcErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -32700 => JsonRpcErrorCode::ParseError,
            -32600 => JsonRpcErrorCode::InvalidRequest,
            -32601 => JsonRpcErrorCode::MethodNotFound,
            -32602 => JsonRpcErrorCode::InvalidParams,
            -32603 => JsonRpcErrorCode::InternalError,
            other => JsonRpcErrorCode::Custom(other),
        }
    }
}

/// A structured JSON-RPC error object: `{code, message, data?}`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: impl Into<JsonRpcErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into().code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(JsonRpcErrorCode::MethodNotFound, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(JsonRpcErrorCode::InvalidParams, message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(JsonRpcErrorCode::InvalidRequest, message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(JsonRpcErrorCode::InternalError, message.into())
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// A small exponential/linear backoff helper used by callers that retry a bulk
/// operation a bounded number of times (the SDK's only retrying operation is
/// session teardown during `Client::stop`).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub exponential: bool,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay, exponential: true }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay, exponential: false }
    }

    /// Delay to wait before retry attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.exponential {
            self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
        } else {
            self.base_delay * attempt.max(1)
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy exposed across framing, transport and connection boundaries.
///
/// Every caller-facing failure mode named by the protocol core lands in one of
/// these variants: framing failures are irrecoverable for the byte stream that
/// produced them, transport failures propagate through the connection's pending
/// requests, JSON-RPC errors carry the peer's structured error unchanged, and
/// `State`/`Timeout` describe local misuse rather than remote failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("framing error: {message}")]
    Framing {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{0}")]
    JsonRpc(JsonRpcError),

    #[error("request '{method}' timed out after {duration:?}")]
    Timeout { method: String, duration: Duration },

    #[error("invalid state: {message}")]
    State { message: String },

    #[error("protocol version mismatch: {message}")]
    ProtocolVersion { message: String },

    #[error("serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    pub fn framing(message: impl Into<String>) -> Self {
        Error::Framing { message: message.into(), source: None }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport { message: message.into(), source: None }
    }

    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Transport { message: message.into(), source: Some(Box::new(source)) }
    }

    pub fn timeout(method: impl Into<String>, duration: Duration) -> Self {
        Error::Timeout { method: method.into(), duration }
    }

    pub fn state(message: impl Into<String>) -> Self {
        Error::State { message: message.into() }
    }

    pub fn protocol_version(message: impl Into<String>) -> Self {
        Error::ProtocolVersion { message: message.into() }
    }

    pub fn method_not_found(method: &str) -> Self {
        Error::JsonRpc(JsonRpcError::method_not_found(method))
    }

    /// Is this failure plausibly transient, i.e. worth a bulk retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Timeout { .. })
    }

    /// Fold this error into a JSON-RPC error object suitable for a reply frame.
    /// `JsonRpc` errors pass their code/message/data through unchanged; everything
    /// else becomes an Internal error carrying the stringified cause.
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        match self {
            Error::JsonRpc(e) => e.clone(),
            other => JsonRpcError::internal(format!("Internal error: {other}")),
        }
    }
}

impl From<JsonRpcError> for Error {
    fn from(e: JsonRpcError) -> Self {
        Error::JsonRpc(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization { message: e.to_string(), source: Some(Box::new(e)) }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Error::Framing { message: format!("invalid utf-8: {e}"), source: Some(Box::new(e)) }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Self {
        Error::Framing { message: format!("invalid utf-8: {e}"), source: Some(Box::new(e)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonrpc_error_round_trips_through_to_jsonrpc_error() {
        let original = JsonRpcError::invalid_params("missing field");
        let err: Error = original.clone().into();
        assert_eq!(err.to_jsonrpc_error(), original);
    }

    #[test]
    fn non_jsonrpc_errors_become_internal_error() {
        let err = Error::transport("socket reset");
        let jre = err.to_jsonrpc_error();
        assert_eq!(jre.code, JsonRpcErrorCode::InternalError.code());
        assert!(jre.message.contains("socket reset"));
    }

    #[test]
    fn exponential_backoff_matches_documented_schedule() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
