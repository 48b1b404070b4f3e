//! Intent Classifier (C5) — maps a user query to {boolean, specific,
//! contextual} with an optional target noun phrase.

use crate::models::{ChatMessage, Intent};
use crate::reasoner::{Reasoner, ReasonerRequest};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const SYSTEM_PROMPT: &str = r#"You classify the intent behind a user's research query.
Respond with strict JSON only, no prose, matching:
{"intent": "boolean" | "specific" | "contextual", "target": string | null}

- boolean: a yes/no question ("Is X profitable?")
- specific: asks for one concrete fact ("Who is the CEO of X?")
- contextual: open-ended background / overview request
"target" is the noun phrase the query is actually asking about, or null."#;

#[derive(Debug, Deserialize)]
struct IntentModelOutput {
    intent: String,
    #[serde(default)]
    target: Option<String>,
}

pub struct IntentResult {
    pub intent: Intent,
    pub target: Option<String>,
}

pub async fn classify(reasoner: &dyn Reasoner, query: &str) -> IntentResult {
    match classify_via_model(reasoner, query).await {
        Ok(result) => result,
        Err(e) => {
            debug!("intent classifier model path failed, using heuristic fallback: {}", e);
            classify_heuristic(query)
        }
    }
}

async fn classify_via_model(reasoner: &dyn Reasoner, query: &str) -> anyhow::Result<IntentResult> {
    let request = ReasonerRequest::new(vec![
        ChatMessage::System { content: SYSTEM_PROMPT.to_string() },
        ChatMessage::User { content: query.to_string() },
    ])
    .with_temperature(0.0)
    .with_json_schema(json!({
        "name": "intent_classification",
        "schema": {
            "type": "object",
            "properties": {
                "intent": {"type": "string", "enum": ["boolean", "specific", "contextual"]},
                "target": {"type": ["string", "null"]}
            },
            "required": ["intent"]
        }
    }));

    let response = reasoner.complete(request).await?;
    let content = match response {
        ChatMessage::Assistant { content: Some(c), .. } => c,
        _ => anyhow::bail!("intent classifier received no content"),
    };
    let parsed: IntentModelOutput = serde_json::from_str(&content)?;
    let intent = match parsed.intent.as_str() {
        "boolean" => Intent::Boolean,
        "specific" => Intent::Specific,
        "contextual" => Intent::Contextual,
        other => anyhow::bail!("unknown intent '{}'", other),
    };
    Ok(IntentResult { intent, target: parsed.target })
}

/// Leading-interrogative heuristic, used when the model path fails to parse.
fn classify_heuristic(query: &str) -> IntentResult {
    let trimmed = query.trim().to_lowercase();
    let first_word = trimmed.split_whitespace().next().unwrap_or("");

    const BOOLEAN_LEADS: &[&str] = &[
        "is", "are", "was", "were", "does", "do", "did", "can", "could", "will", "would", "has", "have", "should",
    ];
    const SPECIFIC_LEADS: &[&str] = &["who", "what", "when", "where", "which", "how", "why"];

    let intent = if BOOLEAN_LEADS.contains(&first_word) {
        Intent::Boolean
    } else if SPECIFIC_LEADS.contains(&first_word) {
        Intent::Specific
    } else {
        Intent::Contextual
    };

    IntentResult { intent, target: None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_classifies_boolean_leads() {
        let result = classify_heuristic("Is OpenAI profitable?");
        assert_eq!(result.intent, Intent::Boolean);
    }

    #[test]
    fn heuristic_classifies_specific_leads() {
        let result = classify_heuristic("Who is the CEO of Artisan AI?");
        assert_eq!(result.intent, Intent::Specific);
    }

    #[test]
    fn heuristic_falls_back_to_contextual() {
        let result = classify_heuristic("Tell me about Stripe");
        assert_eq!(result.intent, Intent::Contextual);
    }
}
