//! The session event model (§4.6, §6): a closed discriminated union over the
//! server's `type` string, parsed through a per-discriminant factory with an
//! `Unknown` fallback for anything the registry doesn't recognize.
//!
//! Parsing tolerates two payload shapes: a flat object, or one wrapped in
//! `{data: {...}}` (§9, back-compat). Field lookup tries the flat location
//! first, then falls back to `data.<field>`.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Fields present on every event variant.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBase {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub parent_id: Option<String>,
    pub ephemeral: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to parse session event: {0}")]
pub struct EventParseError(pub String);

/// Declares the closed set of "simple" variants -- those whose only payload
/// beyond the base fields is the untouched data object -- plus the small set
/// of variants with fields the SDK interprets directly (send/sendAndWait
/// aggregation needs these typed).
macro_rules! simple_events {
    ($($variant:ident => $discriminant:literal),+ $(,)?) => {
        #[derive(Debug, Clone)]
        pub enum SessionEvent {
            $(
                #[doc = concat!("`", $discriminant, "`")]
                $variant { base: EventBase, data: Value },
            )+
            /// `session.start` -- carries its own sessionId in the payload (§4.4).
            SessionStart { base: EventBase, session_id: Option<String>, data: Value },
            /// `session.error` -- terminates an in-flight `sendAndWait` (§4.5).
            SessionError { base: EventBase, message: String, data: Value },
            /// `assistant.message` -- a complete assistant message.
            AssistantMessage { base: EventBase, content: String, data: Value },
            /// `assistant.message_delta` -- a streaming fragment to append in arrival order.
            AssistantMessageDelta { base: EventBase, delta_content: String, data: Value },
            /// Discriminator not present in the registry; the raw object is preserved.
            Unknown { base: EventBase, raw: Value },
        }

        impl SessionEvent {
            pub fn discriminant(&self) -> &str {
                match self {
                    $(SessionEvent::$variant { .. } => $discriminant,)+
                    SessionEvent::SessionStart { .. } => "session.start",
                    SessionEvent::SessionError { .. } => "session.error",
                    SessionEvent::AssistantMessage { .. } => "assistant.message",
                    SessionEvent::AssistantMessageDelta { .. } => "assistant.message_delta",
                    SessionEvent::Unknown { .. } => "unknown",
                }
            }

            pub fn base(&self) -> &EventBase {
                match self {
                    $(SessionEvent::$variant { base, .. } => base,)+
                    SessionEvent::SessionStart { base, .. } => base,
                    SessionEvent::SessionError { base, .. } => base,
                    SessionEvent::AssistantMessage { base, .. } => base,
                    SessionEvent::AssistantMessageDelta { base, .. } => base,
                    SessionEvent::Unknown { base, .. } => base,
                }
            }
        }

        fn parse_simple(discriminant: &str, base: EventBase, data: Value) -> Option<SessionEvent> {
            match discriminant {
                $($discriminant => Some(SessionEvent::$variant { base, data }),)+
                _ => None,
            }
        }
    };
}

simple_events! {
    SessionResume => "session.resume",
    SessionIdle => "session.idle",
    SessionShutdown => "session.shutdown",
    SessionTitleChanged => "session.title_changed",
    SessionModelChange => "session.model_change",
    SessionModeChanged => "session.mode_changed",
    SessionPlanChanged => "session.plan_changed",
    SessionTruncation => "session.truncation",
    SessionInfo => "session.info",
    SessionWarning => "session.warning",
    SessionHandoff => "session.handoff",
    SessionWorkspaceFileChanged => "session.workspace_file_changed",
    SessionSnapshotRewind => "session.snapshot_rewind",
    SessionContextChanged => "session.context_changed",
    SessionUsageInfo => "session.usage_info",
    SessionCompactionStart => "session.compaction_start",
    SessionCompactionComplete => "session.compaction_complete",
    SessionTaskComplete => "session.task_complete",
    UserMessage => "user.message",
    SystemMessage => "system.message",
    PendingMessagesModified => "pending_messages.modified",
    AssistantTurnStart => "assistant.turn_start",
    AssistantIntent => "assistant.intent",
    AssistantReasoning => "assistant.reasoning",
    AssistantReasoningDelta => "assistant.reasoning_delta",
    AssistantStreamingDelta => "assistant.streaming_delta",
    AssistantTurnEnd => "assistant.turn_end",
    AssistantUsage => "assistant.usage",
    AssistantThinking => "assistant.thinking",
    Abort => "abort",
    ToolUserRequested => "tool.user_requested",
    ToolCall => "tool.call",
    ToolExecutionStart => "tool.execution_start",
    ToolExecutionPartialResult => "tool.execution_partial_result",
    ToolExecutionProgress => "tool.execution_progress",
    ToolExecutionComplete => "tool.execution_complete",
    SkillInvoked => "skill.invoked",
    SubagentStarted => "subagent.started",
    SubagentCompleted => "subagent.completed",
    SubagentFailed => "subagent.failed",
    SubagentSelected => "subagent.selected",
    HookStart => "hook.start",
    HookEnd => "hook.end",
}

/// Look up `key` in the flat object first, then in `data.<key>` (§9).
fn field<'a>(flat: &'a Value, data: &'a Value, key: &str) -> Option<&'a Value> {
    flat.get(key).filter(|v| !v.is_null()).or_else(|| data.get(key).filter(|v| !v.is_null()))
}

fn field_str(flat: &Value, data: &Value, key: &str) -> Option<String> {
    field(flat, data, key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

impl SessionEvent {
    /// Parse one decoded JSON object into a `SessionEvent`. Required base
    /// fields (`id`, `timestamp`, `type`) missing is a parse error; optional
    /// fields default per §3 (`ephemeral` false, `parentId` absent).
    pub fn parse(value: &Value) -> Result<SessionEvent, EventParseError> {
        let discriminant = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EventParseError("missing 'type' discriminator".to_string()))?
            .to_string();

        let data = value.get("data").cloned().unwrap_or(Value::Null);

        let id = field_str(value, &data, "id")
            .ok_or_else(|| EventParseError("missing required field 'id'".to_string()))?;
        let timestamp = field(value, &data, "timestamp")
            .ok_or_else(|| EventParseError("missing required field 'timestamp'".to_string()))?;
        let timestamp = parse_timestamp(timestamp)
            .ok_or_else(|| EventParseError("unparseable 'timestamp'".to_string()))?;
        let parent_id = field_str(value, &data, "parentId");
        let ephemeral = field(value, &data, "ephemeral").and_then(|v| v.as_bool()).unwrap_or(false);

        let base = EventBase { id, timestamp, parent_id, ephemeral };

        let event = match discriminant.as_str() {
            "session.start" => {
                let session_id = field_str(value, &data, "sessionId");
                SessionEvent::SessionStart { base, session_id, data: data.clone() }
            }
            "session.error" => {
                let message = field_str(value, &data, "message")
                    .ok_or_else(|| EventParseError("session.error missing 'message'".to_string()))?;
                SessionEvent::SessionError { base, message, data: data.clone() }
            }
            "assistant.message" => {
                let content = field_str(value, &data, "content")
                    .ok_or_else(|| EventParseError("assistant.message missing 'content'".to_string()))?;
                SessionEvent::AssistantMessage { base, content, data: data.clone() }
            }
            "assistant.message_delta" => {
                let delta_content = field_str(value, &data, "deltaContent")
                    .ok_or_else(|| EventParseError("assistant.message_delta missing 'deltaContent'".to_string()))?;
                SessionEvent::AssistantMessageDelta { base, delta_content, data: data.clone() }
            }
            other => match parse_simple(other, base.clone(), data.clone()) {
                Some(event) => event,
                None => SessionEvent::Unknown { base, raw: value.clone() },
            },
        };

        Ok(event)
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = value.as_str() {
        return DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc));
    }
    if let Some(ms) = value.as_i64() {
        return DateTime::from_timestamp_millis(ms);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_fields(type_: &str) -> Value {
        json!({"id": "e1", "timestamp": "2026-01-01T00:00:00Z", "type": type_})
    }

    #[test]
    fn unknown_discriminant_preserves_raw_json() {
        let raw = json!({"id": "e1", "timestamp": "2026-01-01T00:00:00Z", "type": "totally.new.kind"});
        let event = SessionEvent::parse(&raw).unwrap();
        match event {
            SessionEvent::Unknown { raw: r, .. } => assert_eq!(r, raw),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_field_is_a_parse_error() {
        let mut v = base_fields("assistant.message");
        v.as_object_mut().unwrap().remove("id");
        assert!(SessionEvent::parse(&v).is_err());
    }

    #[test]
    fn assistant_message_flat_shape_parses_content() {
        let mut v = base_fields("assistant.message");
        v["content"] = json!("hello");
        let event = SessionEvent::parse(&v).unwrap();
        match event {
            SessionEvent::AssistantMessage { content, .. } => assert_eq!(content, "hello"),
            other => panic!("expected AssistantMessage, got {other:?}"),
        }
    }

    #[test]
    fn wrapped_data_shape_is_tolerated_as_fallback() {
        let mut v = base_fields("assistant.message");
        v["data"] = json!({"content": "wrapped"});
        let event = SessionEvent::parse(&v).unwrap();
        match event {
            SessionEvent::AssistantMessage { content, .. } => assert_eq!(content, "wrapped"),
            other => panic!("expected AssistantMessage, got {other:?}"),
        }
    }

    #[test]
    fn flat_field_takes_priority_over_wrapped_field() {
        let mut v = base_fields("assistant.message");
        v["content"] = json!("flat");
        v["data"] = json!({"content": "wrapped"});
        let event = SessionEvent::parse(&v).unwrap();
        match event {
            SessionEvent::AssistantMessage { content, .. } => assert_eq!(content, "flat"),
            other => panic!("expected AssistantMessage, got {other:?}"),
        }
    }

    #[test]
    fn ephemeral_defaults_false_when_absent() {
        let v = base_fields("session.idle");
        let event = SessionEvent::parse(&v).unwrap();
        assert!(!event.base().ephemeral);
    }
}
