//! Tool Runtime (C7) — schema-validated invocation of the four tools exposed
//! to the Reasoner, with fingerprint dedup, a per-run cache, a web-search
//! budget, and a relevance filter guarding `web_search`.
//!
//! `web_search`/`latest_finder` come straight from `engine-tools`; `knowledge_query`
//! and `evaluate_plausibility` live here because they need the entity/fact
//! store and, for `knowledge_query`, a nested agent run.

use crate::fact::FactRow;
use crate::models::ChatMessage;
use crate::reasoner::{ReasonerRequest, ToolSpec};
use crate::services::Services;
use engine_tools::latest_finder::LatestFinderArgs;
use engine_tools::web_search::WebSearchArgs;
use engine_tools::{LatestFinder, WebSearch};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "web_search".to_string(),
            description: "Search the web for current information, news, facts, or any topic. \
                Use this when you need up-to-date information or don't know something."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The search query, at least 2 characters" },
                    "num": { "type": "integer", "description": "Number of results, 1-10, default 3" },
                    "include_content": { "type": "boolean", "description": "Fetch page content, default true" },
                    "days": { "type": "integer", "description": "Restrict to the last N days" },
                    "depth": { "type": "string", "enum": ["basic", "advanced"] }
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: "latest_finder".to_string(),
            description: "Find the most recent, corroborated date or event for a topic by issuing \
                recency-biased searches until two credible sources agree."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The topic or entity to investigate" }
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: "knowledge_query".to_string(),
            description: "Look up previously stored facts about a known entity. Does not create \
                new entities; returns ENTITY_UNRESOLVED with suggestions on a miss."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "entity": { "type": "string" },
                    "variable_name": { "type": ["string", "null"] },
                    "question": { "type": ["string", "null"] }
                },
                "required": ["entity"]
            }),
        },
        ToolSpec {
            name: "evaluate_plausibility".to_string(),
            description: "Adjudicate whether one or more claims are plausible, optionally given \
                supporting context. Use this to resolve conflicting claims."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "claims": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                    "context": { "type": ["string", "null"] }
                },
                "required": ["claims"]
            }),
        },
    ]
}

#[derive(Debug, Clone)]
pub struct InvokeResult {
    pub content: String,
    pub success: bool,
    pub metric: Option<i64>,
    pub failure_reason: Option<String>,
}

impl InvokeResult {
    fn ok(content: String, metric: Option<i64>) -> Self {
        Self { content, success: true, metric, failure_reason: None }
    }

    fn err(content: String, reason: impl Into<String>) -> Self {
        Self { content, success: false, metric: None, failure_reason: Some(reason.into()) }
    }

    fn duplicate() -> Self {
        Self::err(json!({"error": "Duplicate tool call blocked"}).to_string(), "duplicate call")
    }

    fn limit_reached() -> Self {
        Self::err(json!({"error": "Web search limit reached"}).to_string(), "web search limit reached")
    }

    fn relevance_blocked() -> Self {
        Self::err(
            json!({"error": "Query failed relevance filter"}).to_string(),
            "query failed relevance filter",
        )
    }

    fn schema_error(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::err(
            json!({"error": "SCHEMA_VALIDATION_ERROR", "detail": detail}).to_string(),
            format!("schema validation: {}", detail),
        )
    }

    fn execution_error(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::err(format!("TOOL_EXECUTION_ERROR: {}", detail), format!("execution error: {}", detail))
    }
}

/// Token set derived from the query, entity hint, intent target, expected
/// variable names, and the router's `vocab_hints.boost`, guarding `web_search`
/// against off-topic or placeholder queries (spec §4.6).
pub struct RelevanceContext {
    tokens: HashSet<String>,
}

const PLACEHOLDER_QUERIES: &[&str] = &["input", "query", "search", "pipeline", "title", "url", "link"];

impl RelevanceContext {
    pub fn build(
        query: &str,
        entity: Option<&str>,
        intent_target: Option<&str>,
        expected_variables: &[String],
        vocab_boost: &[String],
    ) -> Self {
        let mut tokens = HashSet::new();
        tokens.extend(tokenize(query));
        if let Some(e) = entity {
            tokens.extend(tokenize(e));
        }
        if let Some(t) = intent_target {
            tokens.extend(tokenize(t));
        }
        for v in expected_variables {
            tokens.extend(tokenize(v));
        }
        for v in vocab_boost {
            tokens.extend(tokenize(v));
        }
        Self { tokens }
    }

    fn allows(&self, proposed_query: &str) -> bool {
        let trimmed = proposed_query.trim().to_lowercase();
        if PLACEHOLDER_QUERIES.contains(&trimmed.as_str()) {
            return false;
        }
        let proposed_tokens = tokenize(proposed_query);
        let informative = proposed_tokens.iter().filter(|t| t.len() > 2).count();
        if informative < 2 {
            return false;
        }
        proposed_tokens.iter().any(|t| self.tokens.contains(t))
    }
}

fn tokenize(s: &str) -> HashSet<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

fn fingerprint(name: &str, args: &Value) -> String {
    format!("{}:{}", name, canonicalize(args))
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let parts: Vec<String> = sorted.iter().map(|(k, v)| format!("{:?}:{}", k, canonicalize(v))).collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(arr) => {
            let parts: Vec<String> = arr.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

fn fact_to_json(fact: &FactRow) -> Value {
    json!({
        "name": fact.name,
        "value": fact.value,
        "dtype": fact.dtype,
        "confidence": fact.confidence,
        "sources": fact.sources_vec(),
        "observed_at": fact.observed_at,
    })
}

#[derive(Debug, Deserialize)]
struct KnowledgeQueryArgs {
    entity: String,
    #[serde(default)]
    variable_name: Option<String>,
    #[serde(default)]
    question: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EvaluatePlausibilityArgs {
    claims: Vec<String>,
    #[serde(default)]
    context: Option<String>,
}

pub struct ToolRuntime {
    web_search: WebSearch,
    latest_finder: LatestFinder,
    services: Arc<Services>,
    relevance: RelevanceContext,
    max_web_searches: u32,
    web_search_count: Mutex<u32>,
    registry: Mutex<HashSet<String>>,
    cache: Mutex<std::collections::HashMap<String, String>>,
    /// Recursion depth of the agent run this runtime belongs to; passed
    /// depth+1 into any nested run spawned by `knowledge_query`.
    depth: u32,
    /// Cancelled when the enclosing HTTP request's deadline expires, so
    /// in-flight `web_search`/`latest_finder` fetch fan-out aborts rather
    /// than running to completion (spec §5).
    cancel: CancellationToken,
}

impl ToolRuntime {
    pub fn new(
        services: Arc<Services>,
        relevance: RelevanceContext,
        max_web_searches: u32,
        depth: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            web_search: WebSearch::new(services.search.clone()),
            latest_finder: LatestFinder::new(services.search.clone()),
            services,
            relevance,
            max_web_searches,
            web_search_count: Mutex::new(0),
            registry: Mutex::new(HashSet::new()),
            cache: Mutex::new(std::collections::HashMap::new()),
            depth,
            cancel,
        }
    }

    fn take_web_search_budget(&self) -> bool {
        let mut count = self.web_search_count.lock().unwrap();
        if *count >= self.max_web_searches {
            return false;
        }
        *count += 1;
        true
    }

    /// Dispatches one named tool call. First invocation of a given
    /// fingerprint executes for real and caches its content; any repeat of
    /// the same fingerprint is refused with the fixed duplicate-blocked
    /// payload rather than replayed from cache, so the "byte-for-byte equal
    /// across repeats" property holds trivially.
    pub async fn invoke(&self, name: &str, args: Value) -> InvokeResult {
        let fp = fingerprint(name, &args);
        {
            let mut registry = self.registry.lock().unwrap();
            if registry.contains(&fp) {
                return InvokeResult::duplicate();
            }
            registry.insert(fp.clone());
        }

        let result = match name {
            "web_search" => self.invoke_web_search(args).await,
            "latest_finder" => self.invoke_latest_finder(args).await,
            "knowledge_query" => self.invoke_knowledge_query(args).await,
            "evaluate_plausibility" => self.invoke_evaluate_plausibility(args).await,
            other => InvokeResult::schema_error(format!("unknown tool '{}'", other)),
        };

        self.cache.lock().unwrap().insert(fp, result.content.clone());
        result
    }

    async fn invoke_web_search(&self, args: Value) -> InvokeResult {
        let parsed: WebSearchArgs = match serde_json::from_value(args) {
            Ok(v) => v,
            Err(e) => return InvokeResult::schema_error(e.to_string()),
        };
        if !self.relevance.allows(&parsed.query) {
            return InvokeResult::relevance_blocked();
        }
        if !self.take_web_search_budget() {
            return InvokeResult::limit_reached();
        }
        match self.web_search.run(&parsed, &self.cancel).await {
            Ok(hits) => {
                let metric = hits.len() as i64;
                InvokeResult::ok(Value::Array(hits).to_string(), Some(metric))
            }
            Err(e) => InvokeResult::execution_error(e.to_string()),
        }
    }

    async fn invoke_latest_finder(&self, args: Value) -> InvokeResult {
        let parsed: LatestFinderArgs = match serde_json::from_value(args) {
            Ok(v) => v,
            Err(e) => return InvokeResult::schema_error(e.to_string()),
        };
        if !self.take_web_search_budget() {
            return InvokeResult::limit_reached();
        }
        match self.latest_finder.run(&parsed.query, &self.cancel).await {
            Ok(result) => {
                let metric = result
                    .get("corroboration")
                    .and_then(|c| c.get("distinct_sources"))
                    .and_then(Value::as_i64);
                InvokeResult::ok(result.to_string(), metric)
            }
            Err(e) => InvokeResult::execution_error(e.to_string()),
        }
    }

    async fn invoke_knowledge_query(&self, args: Value) -> InvokeResult {
        let parsed: KnowledgeQueryArgs = match serde_json::from_value(args) {
            Ok(v) => v,
            Err(e) => return InvokeResult::schema_error(e.to_string()),
        };

        let existing = match self.services.entities.try_resolve_existing(&parsed.entity) {
            Ok(v) => v,
            Err(e) => return InvokeResult::execution_error(e.to_string()),
        };
        let Some(entity_match) = existing else {
            let suggestions = self.services.entities.search_by_name(&parsed.entity, 5).unwrap_or_default();
            let payload = json!({
                "code": "ENTITY_UNRESOLVED",
                "suggestions": suggestions
                    .into_iter()
                    .map(|m| json!({"id": m.id, "name": m.name, "type": m.entity_type}))
                    .collect::<Vec<_>>(),
            });
            return InvokeResult::ok(payload.to_string(), Some(0));
        };

        match &parsed.variable_name {
            Some(variable_name) => self.knowledge_query_variable(&entity_match.id, variable_name).await,
            None => {
                let facts = self.services.facts.get_facts_for_entity(&entity_match.id).unwrap_or_default();
                let filtered: Vec<FactRow> = match &parsed.question {
                    Some(question) => {
                        let q_tokens = tokenize(question);
                        facts.into_iter().filter(|f| !tokenize(&f.name).is_disjoint(&q_tokens)).collect()
                    }
                    None => facts,
                };
                let metric = filtered.len() as i64;
                let payload: Vec<Value> = filtered.iter().map(fact_to_json).collect();
                InvokeResult::ok(json!({"facts": payload}).to_string(), Some(metric))
            }
        }
    }

    async fn knowledge_query_variable(&self, entity_id: &str, variable_name: &str) -> InvokeResult {
        if let Ok(Some(fact)) = self.services.facts.get_fact(entity_id, variable_name) {
            return InvokeResult::ok(json!({"facts": [fact_to_json(&fact)]}).to_string(), Some(1));
        }

        let similar = self.services.facts.find_similar_fact_names(entity_id, variable_name, 5).unwrap_or_default();
        for name in &similar {
            if let Ok(Some(fact)) = self.services.facts.get_fact(entity_id, name) {
                return InvokeResult::ok(json!({"facts": [fact_to_json(&fact)]}).to_string(), Some(1));
            }
        }

        if self.depth >= 2 {
            return InvokeResult::execution_error("knowledge_query recursion depth limit reached");
        }

        if let Err(e) =
            crate::agent::run_nested_fetch(&self.services, entity_id, variable_name, self.depth + 1, self.cancel.clone()).await
        {
            debug!("nested knowledge_query fetch for {}/{} failed: {}", entity_id, variable_name, e);
        }

        match self.services.facts.get_fact(entity_id, variable_name) {
            Ok(Some(fact)) => InvokeResult::ok(json!({"facts": [fact_to_json(&fact)]}).to_string(), Some(1)),
            _ => InvokeResult::ok(json!({"facts": []}).to_string(), Some(0)),
        }
    }

    async fn invoke_evaluate_plausibility(&self, args: Value) -> InvokeResult {
        let parsed: EvaluatePlausibilityArgs = match serde_json::from_value(args) {
            Ok(v) => v,
            Err(e) => return InvokeResult::schema_error(e.to_string()),
        };
        if parsed.claims.is_empty() {
            return InvokeResult::schema_error("claims must be a non-empty array");
        }

        const SYSTEM_PROMPT: &str = r#"You adjudicate whether claims are plausible, optionally given
supporting context. Respond with strict JSON only, matching:
{"evaluations": [{"claim": string, "plausible": boolean, "confidence": number, "reasoning": string}]}"#;

        let user_content = json!({"claims": parsed.claims, "context": parsed.context}).to_string();
        let request = ReasonerRequest::new(vec![
            ChatMessage::System { content: SYSTEM_PROMPT.to_string() },
            ChatMessage::User { content: user_content },
        ])
        .with_temperature(0.0)
        .with_json_schema(json!({
            "name": "plausibility_evaluation",
            "schema": {
                "type": "object",
                "properties": {
                    "evaluations": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "claim": {"type": "string"},
                                "plausible": {"type": "boolean"},
                                "confidence": {"type": "number"},
                                "reasoning": {"type": "string"}
                            }
                        }
                    }
                }
            }
        }));

        match self.services.aux_reasoner.complete(request).await {
            Ok(ChatMessage::Assistant { content: Some(content), .. }) => match serde_json::from_str::<Value>(&content) {
                Ok(body) => {
                    let metric = body.get("evaluations").and_then(Value::as_array).map(|a| a.len() as i64);
                    InvokeResult::ok(body.to_string(), metric)
                }
                Err(e) => InvokeResult::execution_error(format!("unparseable plausibility response: {}", e)),
            },
            Ok(_) => InvokeResult::execution_error("plausibility model returned no content"),
            Err(e) => InvokeResult::execution_error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_under_key_reordering() {
        let a = json!({"query": "x", "num": 3});
        let b = json!({"num": 3, "query": "x"});
        assert_eq!(fingerprint("web_search", &a), fingerprint("web_search", &b));
    }

    #[test]
    fn relevance_blocks_placeholder_queries() {
        let ctx = RelevanceContext::build("Acme Corp revenue", Some("Acme Corp"), None, &[], &[]);
        assert!(!ctx.allows("search"));
        assert!(!ctx.allows("query"));
    }

    #[test]
    fn relevance_blocks_unrelated_query() {
        let ctx = RelevanceContext::build("Acme Corp revenue", Some("Acme Corp"), None, &[], &[]);
        assert!(!ctx.allows("unrelated topic xyz"));
    }

    #[test]
    fn relevance_allows_query_sharing_a_token() {
        let ctx = RelevanceContext::build("Acme Corp revenue", Some("Acme Corp"), None, &[], &[]);
        assert!(ctx.allows("Acme Corp latest earnings"));
    }
}
