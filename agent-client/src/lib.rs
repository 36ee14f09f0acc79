//! # agent-client
//!
//! A client SDK for driving a long-running agent process over the
//! bidirectional JSON-RPC connection defined in `agent-protocol`: connection
//! lifecycle and handshake, sessions, tool dispatch, and the session event
//! model.
//!
//! ## Layers
//!
//! - [`client`] -- `Client`: transport lifecycle, handshake, server→client
//!   routing, session registry, metadata cache
//! - [`session`] -- `Session`: event subscription, tool fallback chain,
//!   send/sendAndWait, idempotent destroy
//! - [`event`] -- the closed `SessionEvent` union and its factory parser
//! - [`tool`] -- `ToolHandler`, `ToolResult` and the tool registry
//! - [`config`] -- configuration value objects forwarded to the agent

pub mod client;
pub mod config;
pub mod event;
pub mod session;
pub mod tool;

pub mod prelude {
    pub use crate::client::{Client, ClientError, ClientState, HookHandler, PermissionHandler, UserInputHandler};
    pub use crate::config::{ClientOptions, SessionConfig, ToolDefinition};
    pub use crate::event::{EventBase, SessionEvent};
    pub use crate::session::{DestroyedHandler, EventHandler, SendResult, Session, SessionError};
    pub use crate::tool::{ToolHandler, ToolRegistry, ToolResult};
}
