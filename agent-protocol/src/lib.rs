//! # agent-protocol
//!
//! Framing, transport and JSON-RPC 2.0 connection layer shared by clients
//! that drive a long-running agent process over a bidirectional channel.
//!
//! This crate is deliberately narrow: it owns byte framing, the transport
//! contract, and request/response correlation with timeouts. It does not
//! know about sessions, tools or the agent's event vocabulary -- that lives
//! one layer up, in `agent-client`.
//!
//! ## Layers
//!
//! - [`framing`] -- `Content-Length` length-prefixed message codec
//! - [`transport`] -- the `Transport` trait plus an in-memory paired
//!   transport for tests
//! - [`jsonrpc`] -- envelope types and classification
//! - [`connection`] -- request/response correlation, handler dispatch, close
//!   semantics
//! - [`error`] -- the shared error taxonomy

pub mod connection;
pub mod error;
pub mod framing;
pub mod jsonrpc;
pub mod transport;

pub mod prelude {
    pub use crate::connection::{Connection, NotificationHandler, RequestHandler};
    pub use crate::error::{Error, JsonRpcError, JsonRpcErrorCode, Result, RetryPolicy};
    pub use crate::framing::{encode, Decoded, DecoderLimits, FrameDecoder};
    pub use crate::jsonrpc::{
        classify, Envelope, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION,
    };
    pub use crate::transport::{ChannelTransport, Transport};
}
