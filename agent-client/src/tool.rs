//! Tool dispatch (§4.5): the session-local → session-config → client-level
//! fallback chain, the `ToolResult` sum type, and its canonical JSON
//! encodings.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ToolDefinition;

/// A registered tool handler. Implementations that can fail should return
/// `Err` rather than panic; the session converts a failed call into a
/// `ToolResult::Failure` carrying the stringified error, it never lets a
/// handler failure escape to the caller.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> anyhow::Result<ToolResult>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<ToolResult>> + Send,
{
    async fn call(&self, arguments: Value) -> anyhow::Result<ToolResult> {
        (self)(arguments).await
    }
}

/// The result of one tool invocation, reported back to the server.
#[derive(Debug, Clone)]
pub enum ToolResult {
    Success(String),
    Failure { error: String, text_for_llm: Option<String> },
    Object {
        text: String,
        kind: String,
        error: Option<String>,
        telemetry: Option<Value>,
        binaries: Option<Value>,
        session_log: Option<Value>,
    },
}

impl ToolResult {
    pub fn success(text: impl Into<String>) -> Self {
        ToolResult::Success(text.into())
    }

    pub fn failure(error: impl Into<String>) -> Self {
        ToolResult::Failure { error: error.into(), text_for_llm: None }
    }

    pub fn failure_with_text(error: impl Into<String>, text_for_llm: impl Into<String>) -> Self {
        ToolResult::Failure { error: error.into(), text_for_llm: Some(text_for_llm.into()) }
    }

    /// The canonical wire encoding used as the `result` field of a `tool.call`
    /// reply (§4.5, §4.4).
    pub fn to_json(&self) -> Value {
        match self {
            ToolResult::Success(text) => json!({
                "textResultForLlm": text,
                "resultType": "success",
                "toolTelemetry": {},
            }),
            ToolResult::Failure { error, text_for_llm } => json!({
                "textResultForLlm": text_for_llm.clone().unwrap_or_else(|| format!("Error: {error}")),
                "resultType": "failure",
                "error": error,
                "toolTelemetry": {},
            }),
            ToolResult::Object { text, kind, error, telemetry, binaries, session_log } => {
                let mut obj = serde_json::Map::new();
                obj.insert("text".to_string(), json!(text));
                obj.insert("kind".to_string(), json!(kind));
                if let Some(e) = error {
                    obj.insert("error".to_string(), json!(e));
                }
                if let Some(t) = telemetry {
                    obj.insert("telemetry".to_string(), t.clone());
                }
                if let Some(b) = binaries {
                    obj.insert("binaries".to_string(), b.clone());
                }
                if let Some(s) = session_log {
                    obj.insert("sessionLog".to_string(), s.clone());
                }
                Value::Object(obj)
            }
        }
    }
}

/// Name → handler map used at each of the three fallback tiers (§4.5).
#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

/// Merge client-level tools first, then session-level, de-duplicated by
/// name with session-level winning ties (§4.4 "Session create / resume").
pub fn merge_tool_lists(client_tools: &[ToolDefinition], session_tools: &[ToolDefinition]) -> Vec<ToolDefinition> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for tool in session_tools.iter().chain(client_tools.iter()) {
        if seen.insert(tool.name.clone()) {
            merged.push(tool.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_result_encodes_canonical_shape() {
        let result = ToolResult::success("Hello, World!");
        assert_eq!(
            result.to_json(),
            json!({"textResultForLlm": "Hello, World!", "resultType": "success", "toolTelemetry": {}})
        );
    }

    #[test]
    fn failure_result_uses_default_text_when_none_given() {
        let result = ToolResult::failure("Unknown tool: frobnicate");
        let encoded = result.to_json();
        assert_eq!(encoded["resultType"], "failure");
        assert_eq!(encoded["error"], "Unknown tool: frobnicate");
        assert!(encoded["textResultForLlm"].as_str().unwrap().contains("Unknown tool"));
    }

    #[test]
    fn object_result_omits_absent_optional_fields() {
        let result = ToolResult::Object {
            text: "done".into(),
            kind: "diff".into(),
            error: None,
            telemetry: None,
            binaries: None,
            session_log: None,
        };
        let encoded = result.to_json();
        assert_eq!(encoded, json!({"text": "done", "kind": "diff"}));
    }

    #[test]
    fn merge_prefers_session_tool_over_client_tool_with_same_name() {
        let client_tools = vec![ToolDefinition::new("greet").with_description("client version")];
        let session_tools = vec![ToolDefinition::new("greet").with_description("session version")];
        let merged = merge_tool_lists(&client_tools, &session_tools);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].description.as_deref(), Some("session version"));
    }
}
