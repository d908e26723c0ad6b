//! In-memory chat sessions and their persisted form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agentwing_store::{MessageRecord, SessionRecord};

use crate::events::ToolCallRecord;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// One entry of a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
        }
    }

    pub fn to_record(&self, session_id: &str) -> MessageRecord {
        MessageRecord {
            id: self.id.clone(),
            session_id: session_id.to_owned(),
            role: self.role.as_str().to_owned(),
            content: self.content.clone(),
            tool_calls: self.tool_calls.iter().map(ToolCallRecord::to_value).collect(),
            created_at: self.timestamp.timestamp_millis(),
        }
    }

    /// Rebuild from storage. Rows with an unknown role are skipped, as are
    /// unreadable tool-call entries.
    pub fn from_record(record: &MessageRecord) -> Option<Self> {
        let role = MessageRole::parse(&record.role)?;
        Some(Self {
            id: record.id.clone(),
            role,
            content: record.content.clone(),
            timestamp: from_millis(record.created_at),
            tool_calls: record
                .tool_calls
                .iter()
                .filter_map(ToolCallRecord::from_value)
                .collect(),
        })
    }
}

/// A conversation owned by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    /// `None` means the process default configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_config_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(id: impl Into<String>, llm_config_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            llm_config_id: llm_config_id.filter(|id| !id.is_empty()),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append and bump `updated_at`.
    pub fn push(&mut self, message: ChatMessage) {
        self.updated_at = Utc::now().max(message.timestamp);
        self.messages.push(message);
    }

    /// Title shown in listings: the start of the first user message.
    pub fn title(&self) -> String {
        self.messages
            .iter()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.chars().take(50).collect())
            .unwrap_or_default()
    }

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            title: self.title(),
            llm_config_id: self.llm_config_id.clone(),
            created_at: self.created_at.timestamp_millis(),
            updated_at: self.updated_at.timestamp_millis(),
        }
    }

    pub fn from_record(record: &SessionRecord, messages: &[MessageRecord]) -> Self {
        Self {
            id: record.id.clone(),
            llm_config_id: record.llm_config_id.clone().filter(|id| !id.is_empty()),
            messages: messages.iter().filter_map(ChatMessage::from_record).collect(),
            created_at: from_millis(record.created_at),
            updated_at: from_millis(record.updated_at),
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
