//! The outward event stream and tool-call records.
//!
//! [`StreamChunk`] is the only thing callers of a turn ever see; it
//! serialises to `{"type": "message" | "tool_call" | "error" | "done", ...}`
//! with one JSON object per SSE `data:` frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tools::split_instructions;

/// Lifecycle of a tool call: `calling` then `success` or `error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    #[default]
    Calling,
    Success,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Calling => "calling",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Calling)
    }

    /// Status line shown next to the call.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Calling => "Running...",
            Self::Success => "Call succeeded",
            Self::Error => "Call failed",
        }
    }
}

impl std::fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tool invocation inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Identity within the turn; the tool name is only an attribute.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub status: ToolCallStatus,
    #[serde(default)]
    pub message: String,
    /// The model's justification, stripped from `arguments`.
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default)]
    pub result: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ToolCallRecord {
    /// A fresh record in `calling` state built from raw call arguments.
    pub fn started(call_id: impl Into<String>, tool_name: impl Into<String>, raw: &Value) -> Self {
        let (instructions, arguments) = split_instructions(raw);
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            status: ToolCallStatus::Calling,
            message: ToolCallStatus::Calling.default_message().to_owned(),
            instructions: instructions.unwrap_or_default(),
            arguments,
            result: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Move to `next`. Returns `false` (and changes nothing) if that would
    /// regress a terminal status.
    pub fn advance(&mut self, next: ToolCallStatus) -> bool {
        if self.status.is_terminal() && next != self.status {
            return false;
        }
        self.status = next;
        self.message = next.default_message().to_owned();
        true
    }

    /// Generic key/value form used for persistence.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Rebuild from the persisted form. Unreadable entries yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// An event of the outward stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Message {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    ToolCall {
        tool_call: ToolCallRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    Error {
        error: String,
    },
    Done {
        message_id: String,
    },
}

impl StreamChunk {
    pub fn message(content: impl Into<String>, message_id: &str) -> Self {
        Self::Message {
            content: content.into(),
            message_id: Some(message_id.to_owned()),
        }
    }

    pub fn tool_call(record: ToolCallRecord, message_id: &str) -> Self {
        Self::ToolCall {
            tool_call: record,
            message_id: Some(message_id.to_owned()),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn done(message_id: impl Into<String>) -> Self {
        Self::Done {
            message_id: message_id.into(),
        }
    }

    /// `error` and `done` end a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shapes() {
        let msg = serde_json::to_value(StreamChunk::message("hi", "m1")).unwrap();
        assert_eq!(msg, json!({"type": "message", "content": "hi", "message_id": "m1"}));

        let err = serde_json::to_value(StreamChunk::error("boom")).unwrap();
        assert_eq!(err, json!({"type": "error", "error": "boom"}));

        let done = serde_json::to_value(StreamChunk::done("m1")).unwrap();
        assert_eq!(done, json!({"type": "done", "message_id": "m1"}));

        let record = ToolCallRecord::started("c1", "web_search", &json!({"q": "x"}));
        let tc = serde_json::to_value(StreamChunk::tool_call(record, "m1")).unwrap();
        assert_eq!(tc["type"], "tool_call");
        assert_eq!(tc["tool_call"]["tool_name"], "web_search");
        assert_eq!(tc["tool_call"]["status"], "calling");
        assert_eq!(tc["tool_call"]["message"], "Running...");
        assert!(tc["tool_call"]["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn started_strips_instructions() {
        let record = ToolCallRecord::started(
            "c1",
            "browser_navigate",
            &json!({"url": "https://example.com", "instructions": "Open the page"}),
        );
        assert_eq!(record.instructions, "Open the page");
        assert_eq!(Value::Object(record.arguments), json!({"url": "https://example.com"}));
    }

    #[test]
    fn status_never_regresses() {
        let mut record = ToolCallRecord::started("c1", "t", &json!({}));
        assert!(record.advance(ToolCallStatus::Success));
        assert_eq!(record.message, "Call succeeded");
        assert!(!record.advance(ToolCallStatus::Calling));
        assert!(!record.advance(ToolCallStatus::Error));
        assert_eq!(record.status, ToolCallStatus::Success);
    }

    #[test]
    fn persisted_form_round_trips_keys() {
        let mut record = ToolCallRecord::started("c9", "run_script", &json!({"id": 3}));
        record.advance(ToolCallStatus::Error);
        record.result = "Error: nope".into();

        let value = record.to_value();
        for key in ["tool_name", "status", "message", "instructions", "arguments", "result", "timestamp"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(ToolCallRecord::from_value(&value), Some(record));
        assert!(ToolCallRecord::from_value(&json!({"status": "success"})).is_none());
    }
}
