//! Session Summariser (C11) — periodically condenses short-term history into
//! durable long-term memory bullets (spec §4.10). Runs after the agent loop;
//! errors are swallowed, matching §7's propagation policy for this component.

use crate::models::ChatMessage;
use crate::reasoner::{Reasoner, ReasonerRequest};
use crate::services::Services;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = r#"You condense a conversation into durable facts worth remembering
about the user across future sessions. Respond with strict JSON only, matching:
{"bullets": [string, ...]}
Produce 3 to 8 bullets. Each bullet must be a standalone fact, 5 to 300 characters,
written in third person, with no conversational filler."#;

#[derive(Debug, Deserialize)]
struct SummaryOutput {
    bullets: Vec<String>,
}

/// Runs C11 if a username is present and the session's history exceeds the
/// retention window. All failures (model call, parse, persistence) are
/// logged and swallowed — summarisation never fails the enclosing request.
pub async fn maybe_summarise(services: &Services, session_id: &str, username: Option<&str>) {
    let Some(username) = username else { return };

    let messages = services.history.get(session_id);
    if messages.len() <= services.config.chat_memory_window {
        return;
    }

    match summarise(services.aux_reasoner.as_ref(), &messages).await {
        Ok(bullets) => {
            for bullet in bullets {
                if let Err(e) = services.memory.add(username, &bullet, &["summary".to_string()]) {
                    warn!("failed to persist summary bullet for {}: {}", username, e);
                }
            }
        }
        Err(e) => {
            debug!("session summarisation skipped for {}: {}", session_id, e);
        }
    }
}

async fn summarise(reasoner: &dyn Reasoner, messages: &[ChatMessage]) -> anyhow::Result<Vec<String>> {
    let transcript = render_transcript(messages);

    let request = ReasonerRequest::new(vec![
        ChatMessage::System { content: SYSTEM_PROMPT.to_string() },
        ChatMessage::User { content: transcript },
    ])
    .with_temperature(0.2)
    .with_json_schema(json!({
        "name": "session_summary",
        "schema": {
            "type": "object",
            "properties": {
                "bullets": {
                    "type": "array",
                    "items": {"type": "string"},
                    "minItems": 3,
                    "maxItems": 8
                }
            },
            "required": ["bullets"]
        }
    }));

    let response = reasoner.complete(request).await?;
    let content = match response {
        ChatMessage::Assistant { content: Some(c), .. } => c,
        _ => anyhow::bail!("summariser received no content"),
    };

    let parsed: SummaryOutput = serde_json::from_str(&content)?;
    let bullets: Vec<String> = parsed
        .bullets
        .into_iter()
        .map(|b| b.trim().to_string())
        .filter(|b| (5..=300).contains(&b.chars().count()))
        .collect();

    if bullets.is_empty() {
        anyhow::bail!("summariser produced no usable bullets");
    }

    Ok(bullets)
}

fn render_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter_map(|m| match m {
            ChatMessage::User { content } => Some(format!("user: {}", content)),
            ChatMessage::Assistant { content: Some(c), .. } => Some(format!("assistant: {}", c)),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_transcript_skips_tool_and_empty_assistant_messages() {
        let messages = vec![
            ChatMessage::User { content: "hi".to_string() },
            ChatMessage::Assistant { content: None, tool_calls: vec![] },
            ChatMessage::Tool { tool_call_id: "call_1".to_string(), content: "[]".to_string() },
            ChatMessage::Assistant { content: Some("hello".to_string()), tool_calls: vec![] },
        ];
        let rendered = render_transcript(&messages);
        assert_eq!(rendered, "user: hi\nassistant: hello");
    }
}
