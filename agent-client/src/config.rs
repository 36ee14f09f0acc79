//! Configuration value objects. These are inert: field-by-field serializers
//! to JSON maps with the omit-null/empty discipline the server expects (§3,
//! "Configuration objects"). The crate never interprets their contents beyond
//! forwarding, the same way `ServiceContext`/`AuthContext` are built up with
//! chainable `with_x` methods and serialized as-is by the protocol core.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// A single tool definition offered to the agent. Exposed both at client
/// level (fallback for every session) and per-session (§4.4, §4.5).
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), description: None, input_schema: None }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }
}

/// Options governing `Client::start` and auto-behavior (§4.4).
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub auto_restart: bool,
    pub auto_start: bool,
    pub request_timeout: std::time::Duration,
    pub tools: Vec<ToolDefinition>,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self { request_timeout: std::time::Duration::from_secs(30), ..Default::default() }
    }

    pub fn with_auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }

    pub fn with_auto_start(mut self, enabled: bool) -> Self {
        self.auto_start = enabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }
}

/// Per-session configuration forwarded verbatim to `session.create`/`session.resume`
/// (minus the tool list, which the client merges in separately per §4.4).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
    /// Session-level tool fallback list (§4.5 second fallback tier). Skipped
    /// on the wire: the client merges this into the tool list sent with
    /// `session.create`/`session.resume` itself, it isn't nested config.
    #[serde(skip)]
    pub tools: Vec<ToolDefinition>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace_path(mut self, path: impl Into<String>) -> Self {
        self.workspace_path = Some(path.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }
}
