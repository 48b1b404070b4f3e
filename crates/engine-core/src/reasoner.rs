//! The Reasoner capability boundary (spec §1, §9): the engine is deliberately
//! agnostic to the concrete model provider. `Reasoner` is the one interface
//! the rest of the engine depends on; `OpenAiCompatibleReasoner` is the only
//! implementation, talking to any OpenAI-chat-completions-shaped endpoint via
//! a hand-rolled chat-completions POST.

use crate::models::{ChatMessage, ToolCallRecord};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ReasonerError {
    #[error("reasoner request failed: {0}")]
    Request(String),
    #[error("reasoner returned an unparseable response: {0}")]
    InvalidResponse(String),
}

/// A tool's JSON-schema-shaped definition, as surfaced to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ReasonerRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: f32,
    /// When set, the provider is asked to constrain output to this JSON
    /// schema (used by C5/C6/C8's nudge repair and C11 — strict-JSON calls
    /// that never need tool-calling).
    pub response_schema: Option<Value>,
}

impl ReasonerRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            temperature: 0.7,
            response_schema: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_json_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

#[async_trait::async_trait]
pub trait Reasoner: Send + Sync {
    async fn complete(&self, request: ReasonerRequest) -> Result<ChatMessage, ReasonerError>;
}

/// Talks to any OpenAI-compatible `/chat/completions` endpoint. Retries
/// transient failures twice with exponential backoff (spec §5: "2 retries").
pub struct OpenAiCompatibleReasoner {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

const MAX_RETRIES: u32 = 2;

impl OpenAiCompatibleReasoner {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
        }
    }

    fn build_body(&self, request: &ReasonerRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(message_to_wire).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
        });

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        if let Some(schema) = &request.response_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": schema,
            });
        }

        body
    }
}

#[async_trait::async_trait]
impl Reasoner for OpenAiCompatibleReasoner {
    async fn complete(&self, request: ReasonerRequest) -> Result<ChatMessage, ReasonerError> {
        let body = self.build_body(&request);
        let url = format!("{}/chat/completions", self.api_url);

        let mut backoff = Duration::from_millis(250);
        let mut last_err = String::new();

        for attempt in 0..=MAX_RETRIES {
            let send = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send();

            match tokio::time::timeout(self.timeout, send).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    let parsed: Value = response
                        .json()
                        .await
                        .map_err(|e| ReasonerError::InvalidResponse(e.to_string()))?;
                    return parse_choice(&parsed);
                }
                Ok(Ok(response)) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    last_err = format!("{}: {}", status, text);
                    warn!("reasoner call failed (attempt {}/{}): {}", attempt + 1, MAX_RETRIES + 1, last_err);
                }
                Ok(Err(e)) => {
                    last_err = e.to_string();
                    warn!("reasoner transport error (attempt {}/{}): {}", attempt + 1, MAX_RETRIES + 1, last_err);
                }
                Err(_) => {
                    last_err = format!("timed out after {:?}", self.timeout);
                    warn!("reasoner call timed out (attempt {}/{})", attempt + 1, MAX_RETRIES + 1);
                }
            }

            if attempt < MAX_RETRIES {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(ReasonerError::Request(last_err))
    }
}

fn message_to_wire(message: &ChatMessage) -> Value {
    match message {
        ChatMessage::System { content } => json!({ "role": "system", "content": content }),
        ChatMessage::User { content } => json!({ "role": "user", "content": content }),
        ChatMessage::Assistant { content, tool_calls } => {
            let mut value = json!({
                "role": "assistant",
                "content": content,
            });
            if !tool_calls.is_empty() {
                value["tool_calls"] = json!(tool_calls
                    .iter()
                    .map(|t| json!({
                        "id": t.id,
                        "type": "function",
                        "function": { "name": t.name, "arguments": t.args.to_string() },
                    }))
                    .collect::<Vec<_>>());
            }
            value
        }
        ChatMessage::Tool { tool_call_id, content } => json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "content": content,
        }),
    }
}

fn parse_choice(body: &Value) -> Result<ChatMessage, ReasonerError> {
    let message = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| ReasonerError::InvalidResponse("missing choices[0].message".to_string()))?;

    let content = message.get("content").and_then(Value::as_str).map(str::to_string);

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    let id = c.get("id")?.as_str()?.to_string();
                    let function = c.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let raw_args = function.get("arguments")?.as_str().unwrap_or("{}");
                    let args: Value = serde_json::from_str(raw_args).unwrap_or_else(|e| {
                        debug!("tool call '{}' had unparseable arguments: {}", name, e);
                        json!({})
                    });
                    Some(ToolCallRecord { id, name, args })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(ChatMessage::Assistant { content, tool_calls })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text_choice() {
        let body = json!({
            "choices": [{ "message": { "role": "assistant", "content": "hello" } }]
        });
        let msg = parse_choice(&body).unwrap();
        match msg {
            ChatMessage::Assistant { content, tool_calls } => {
                assert_eq!(content.as_deref(), Some("hello"));
                assert!(tool_calls.is_empty());
            }
            _ => panic!("expected assistant message"),
        }
    }

    #[test]
    fn parses_tool_call_choice() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "web_search", "arguments": "{\"query\":\"x\"}" }
                    }]
                }
            }]
        });
        let msg = parse_choice(&body).unwrap();
        match msg {
            ChatMessage::Assistant { tool_calls, .. } => {
                assert_eq!(tool_calls.len(), 1);
                assert_eq!(tool_calls[0].name, "web_search");
                assert_eq!(tool_calls[0].args["query"], "x");
            }
            _ => panic!("expected assistant message"),
        }
    }

    #[test]
    fn message_to_wire_round_trips_tool_call() {
        let msg = ChatMessage::Assistant {
            content: None,
            tool_calls: vec![ToolCallRecord {
                id: "call_1".to_string(),
                name: "web_search".to_string(),
                args: json!({"query": "x"}),
            }],
        };
        let wire = message_to_wire(&msg);
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "web_search");
    }
}
