//! Short-Term History (C3) — per-session ordered message log, bounded by a
//! retention window applied after each turn.

use crate::models::ChatMessage;
use std::collections::HashMap;
use std::sync::Mutex;

pub struct History {
    window: usize,
    sessions: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl History {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a clone of the session's current messages, lazily creating an
    /// empty history on first access.
    pub fn get(&self, session: &str) -> Vec<ChatMessage> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(session.to_string()).or_default().clone()
    }

    pub fn append(&self, session: &str, message: ChatMessage) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(session.to_string()).or_default().push(message);
    }

    pub fn append_all(&self, session: &str, messages: impl IntoIterator<Item = ChatMessage>) {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.entry(session.to_string()).or_default();
        entry.extend(messages);
    }

    /// Keeps the last `window` messages. If the first kept message is a tool
    /// result, walks backwards for the assistant message that emitted the
    /// matching tool-call id and prepends it, so every tool-result stays
    /// paired with its originating assistant message.
    pub fn trim(&self, session: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(messages) = sessions.get_mut(session) {
            *messages = trim_messages(messages, self.window);
        }
    }
}

pub fn trim_messages(messages: &[ChatMessage], window: usize) -> Vec<ChatMessage> {
    if messages.len() <= window {
        return messages.to_vec();
    }

    let start = messages.len() - window;
    let mut kept_start = start;

    if let ChatMessage::Tool { tool_call_id, .. } = &messages[start] {
        let target_id = tool_call_id.clone();
        for i in (0..start).rev() {
            if messages[i].tool_call_ids().contains(&target_id.as_str()) {
                kept_start = i;
                break;
            }
        }
    }

    messages[kept_start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ToolCallRecord;

    fn assistant_with_call(id: &str) -> ChatMessage {
        ChatMessage::Assistant {
            content: None,
            tool_calls: vec![ToolCallRecord {
                id: id.to_string(),
                name: "web_search".to_string(),
                args: serde_json::json!({}),
            }],
        }
    }

    fn tool_result(id: &str) -> ChatMessage {
        ChatMessage::Tool {
            tool_call_id: id.to_string(),
            content: "result".to_string(),
        }
    }

    fn has_orphan_tool_result(messages: &[ChatMessage]) -> bool {
        for (i, msg) in messages.iter().enumerate() {
            if let ChatMessage::Tool { tool_call_id, .. } = msg {
                let paired = messages[..i]
                    .iter()
                    .any(|m| m.tool_call_ids().contains(&tool_call_id.as_str()));
                if !paired {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    fn trim_prepends_assistant_for_orphaned_tool_result() {
        let mut messages = vec![ChatMessage::User {
            content: "hi".to_string(),
        }];
        for i in 0..10 {
            let id = format!("call_{}", i);
            messages.push(assistant_with_call(&id));
            messages.push(tool_result(&id));
        }

        let trimmed = trim_messages(&messages, 3);
        assert!(!has_orphan_tool_result(&trimmed));
    }

    #[test]
    fn trim_is_noop_under_window() {
        let messages = vec![
            ChatMessage::User { content: "a".to_string() },
            ChatMessage::Assistant { content: Some("b".to_string()), tool_calls: vec![] },
        ];
        let trimmed = trim_messages(&messages, 8);
        assert_eq!(trimmed.len(), 2);
    }

    #[test]
    fn history_appends_and_trims_per_session() {
        let history = History::new(2);
        history.append("s1", ChatMessage::User { content: "1".to_string() });
        history.append("s1", ChatMessage::User { content: "2".to_string() });
        history.append("s1", ChatMessage::User { content: "3".to_string() });
        history.trim("s1");
        assert_eq!(history.get("s1").len(), 2);
    }
}
