//! Per-agent conversation memory.
//!
//! Each agent keeps its own buffer keyed by conversation identity, so the
//! evaluator (which runs under `{session}_eval`) never sees the worker
//! agents' history and two sessions never share one.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::llm::types::{Message, Role};

/// Default number of messages retained per conversation.
pub const DEFAULT_MEMORY_WINDOW: usize = 40;

/// Windowed message history keyed by conversation id.
#[derive(Debug)]
pub struct ConversationMemory {
    window: usize,
    conversations: Mutex<HashMap<String, Vec<Message>>>,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_WINDOW)
    }
}

impl ConversationMemory {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of a conversation's retained messages.
    pub fn history(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations
            .lock()
            .ok()
            .and_then(|map| map.get(conversation_id).cloned())
            .unwrap_or_default()
    }

    /// Append messages, trimming to the window.
    ///
    /// After trimming, leading tool results whose originating call was cut
    /// off are dropped as well; providers reject a tool result without its
    /// call.
    pub fn append(&self, conversation_id: &str, messages: impl IntoIterator<Item = Message>) {
        let Ok(mut map) = self.conversations.lock() else {
            return;
        };
        let buf = map.entry(conversation_id.to_owned()).or_default();
        buf.extend(messages);

        if buf.len() > self.window {
            let excess = buf.len() - self.window;
            buf.drain(..excess);
        }
        let orphans = buf.iter().take_while(|m| m.role == Role::Tool).count();
        buf.drain(..orphans);
    }

    pub fn clear(&self, conversation_id: &str) {
        if let Ok(mut map) = self.conversations.lock() {
            map.remove(conversation_id);
        }
    }

    pub fn len(&self, conversation_id: &str) -> usize {
        self.conversations
            .lock()
            .map(|map| map.get(conversation_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, conversation_id: &str) -> bool {
        self.len(conversation_id) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversations_are_isolated() {
        let mem = ConversationMemory::default();
        mem.append("a", [Message::user("hi a")]);
        mem.append("b", [Message::user("hi b")]);
        assert_eq!(mem.history("a")[0].content, "hi a");
        assert_eq!(mem.history("b")[0].content, "hi b");
        mem.clear("a");
        assert!(mem.is_empty("a"));
        assert_eq!(mem.len("b"), 1);
    }

    #[test]
    fn window_drops_oldest_and_orphan_tool_results() {
        let mem = ConversationMemory::new(3);
        mem.append(
            "c",
            [
                Message::user("q"),
                Message::assistant_tool_calls(vec![]),
                Message::tool_result("t1", "r1"),
                Message::tool_result("t2", "r2"),
                Message::assistant("answer"),
            ],
        );
        let history = mem.history("c");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "answer");
    }
}
