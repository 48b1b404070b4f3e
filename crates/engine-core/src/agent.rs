//! Agent Loop (C9) — classifies intent, runs the inference router, loads
//! trusted facts, then drives a bounded reason-act loop against the
//! Reasoner, routing tool calls through the Tool Runtime (spec §4.8).

use crate::citation;
use crate::fact::FactRow;
use crate::intent::{self, IntentResult};
use crate::models::{AttrConstraint, ChatMessage, EnrichmentResult, IntensityCaps, ResearchIntensity, RouterOutput, VariableHint};
use crate::reasoner::ReasonerRequest;
use crate::router::{self, RouterInput};
use crate::services::Services;
use crate::tools::{tool_specs, RelevanceContext, ToolRuntime};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct AgentLoopInput<'a> {
    pub session_id: &'a str,
    pub query: &'a str,
    pub entity_hint: Option<&'a str>,
    pub expected_variables: &'a [VariableHint],
    pub intensity: ResearchIntensity,
    /// Cancelled when the caller's request deadline expires; threaded into
    /// the tool runtime so in-flight fetches abort cooperatively (spec §5).
    pub cancel: CancellationToken,
}

pub struct AgentLoopOutput {
    pub final_text: String,
    pub router_output: RouterOutput,
}

pub async fn run_agent_loop(services: &Arc<Services>, input: AgentLoopInput<'_>) -> anyhow::Result<AgentLoopOutput> {
    run_agent_loop_at_depth(services, input, 0).await
}

/// Entry point for `knowledge_query`'s recursive fetch: runs a self-contained
/// nested agent turn and finalizes (persists) its own result, since no outer
/// ingress handler exists to do so on its behalf (spec §9: cyclic call is
/// depth-bounded, enforced by the caller in `tools.rs`).
pub async fn run_nested_fetch(
    services: &Arc<Services>,
    entity_id: &str,
    variable_name: &str,
    depth: u32,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let entity = services
        .entities
        .get_by_id(entity_id)?
        .ok_or_else(|| anyhow::anyhow!("entity {} vanished before nested fetch", entity_id))?;

    let query = format!("What is the {} of {}?", variable_name.replace('_', " "), entity.canonical_name);
    let expected = vec![VariableHint { name: variable_name.to_string(), dtype: None, description: None }];
    let session_id = format!("nested:{}:{}", entity_id, variable_name);

    let input = AgentLoopInput {
        session_id: &session_id,
        query: &query,
        entity_hint: Some(entity.canonical_name.as_str()),
        expected_variables: &expected,
        intensity: ResearchIntensity::Low,
        cancel,
    };

    let output = run_agent_loop_at_depth(services, input, depth).await?;
    crate::finalize::finalize(
        services,
        &output.final_text,
        Some(entity.canonical_name.as_str()),
        Some(entity.entity_type.as_str()),
    );
    Ok(())
}

async fn run_agent_loop_at_depth(
    services: &Arc<Services>,
    input: AgentLoopInput<'_>,
    depth: u32,
) -> anyhow::Result<AgentLoopOutput> {
    let intent_result = intent::classify(services.aux_reasoner.as_ref(), input.query).await;

    let router_output = router::run(
        services.aux_reasoner.as_ref(),
        RouterInput { query: input.query, entity_hint: input.entity_hint, expected_variables: input.expected_variables },
    )
    .await;

    let entity_id = match input.entity_hint {
        Some(name) => {
            let entity_type = router_output.entity_type.clone().unwrap_or_else(|| "unknown".to_string());
            services.entities.resolve(name, &entity_type).ok()
        }
        None => None,
    };

    let trusted_facts: Vec<FactRow> = match &entity_id {
        Some(id) => services.facts.get_facts_for_entity(id).unwrap_or_default(),
        None => Vec::new(),
    };

    let caps = input
        .intensity
        .effective_caps(services.config.research_max_steps, services.config.research_max_web_searches);

    let expected_names: Vec<String> = input.expected_variables.iter().map(|v| v.name.clone()).collect();
    let relevance = RelevanceContext::build(
        input.query,
        input.entity_hint,
        intent_result.target.as_deref(),
        &expected_names,
        &router_output.vocab_hints.boost,
    );
    let runtime = ToolRuntime::new(services.clone(), relevance, caps.max_web_searches, depth, input.cancel.clone());

    let system_prompt = build_system_prompt(&input, &intent_result, &router_output, &caps);
    let mut messages = vec![ChatMessage::System { content: system_prompt }];
    messages.extend(services.history.get(input.session_id));

    let intro = build_intro_message(&input, &intent_result, &trusted_facts);
    push_message(services, input.session_id, &mut messages, ChatMessage::User { content: intro });

    let mut tool_outcomes: Vec<ToolOutcome> = Vec::new();
    let mut final_text: Option<String> = None;

    for step_idx in 0..caps.max_steps {
        let is_last_step = step_idx + 1 == caps.max_steps;

        let request = ReasonerRequest::new(messages.clone()).with_tools(tool_specs());
        let assistant_msg = services.reasoner.complete(request).await?;
        push_message(services, input.session_id, &mut messages, assistant_msg.clone());

        let (content, calls) = match &assistant_msg {
            ChatMessage::Assistant { content, tool_calls } => (content.clone(), tool_calls.clone()),
            _ => (None, Vec::new()),
        };

        if calls.is_empty() {
            match evaluate_candidate(content.as_deref().unwrap_or(""), &router_output, input.entity_hint, is_last_step) {
                CandidateOutcome::Accept(text) => {
                    final_text = Some(text);
                    break;
                }
                CandidateOutcome::Nudge(reason) => {
                    push_message(services, input.session_id, &mut messages, ChatMessage::User { content: reason });
                    continue;
                }
            }
        }

        for call in &calls {
            let result = runtime.invoke(&call.name, call.args.clone()).await;
            push_message(
                services,
                input.session_id,
                &mut messages,
                ChatMessage::Tool { tool_call_id: call.id.clone(), content: result.content.clone() },
            );
            tool_outcomes.push(ToolOutcome {
                name: call.name.clone(),
                args: call.args.clone(),
                success: result.success,
                metric: result.metric,
                failure_reason: result.failure_reason.clone(),
            });
        }
        if !tool_outcomes.is_empty() {
            push_message(services, input.session_id, &mut messages, build_tool_outcomes_message(&tool_outcomes));
        }

        if is_last_step {
            push_message(
                services,
                input.session_id,
                &mut messages,
                ChatMessage::User { content: "stop using tools and produce only the final JSON".to_string() },
            );
            let final_request = ReasonerRequest::new(messages.clone());
            let final_msg = services.reasoner.complete(final_request).await?;
            push_message(services, input.session_id, &mut messages, final_msg.clone());
            if let ChatMessage::Assistant { content: Some(c), .. } = final_msg {
                final_text = Some(c);
            }
        }
    }

    services.history.trim(input.session_id);

    Ok(AgentLoopOutput { final_text: final_text.unwrap_or_default(), router_output })
}

fn push_message(services: &Services, session_id: &str, messages: &mut Vec<ChatMessage>, message: ChatMessage) {
    messages.push(message.clone());
    services.history.append(session_id, message);
}

enum CandidateOutcome {
    Accept(String),
    Nudge(String),
}

/// Applies the setup-phase fixups (default subject, forbidden-variable drop)
/// then the subject and citation-gate checks described in spec §4.8 step 2.
/// On the last permitted step, a gate or subject failure no longer nudges
/// (no steps remain to act on it) — instead the best available variables are
/// accepted, dropping any that still lack a subject.
fn evaluate_candidate(
    raw: &str,
    router_output: &RouterOutput,
    entity_hint: Option<&str>,
    is_last_step: bool,
) -> CandidateOutcome {
    let mut result: EnrichmentResult = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => {
            if is_last_step {
                return CandidateOutcome::Accept(raw.to_string());
            }
            return CandidateOutcome::Nudge(format!(
                "Your previous response was not valid JSON matching the required schema ({}). Re-emit the final JSON only.",
                e
            ));
        }
    };

    if let Some(hint) = entity_hint {
        for variable in result.variables.iter_mut() {
            if variable.subject.name.trim().is_empty() {
                variable.subject.name = hint.to_string();
                if variable.subject.entity_type.trim().is_empty() {
                    variable.subject.entity_type =
                        router_output.entity_type.clone().unwrap_or_else(|| "unknown".to_string());
                }
            }
        }
    }

    result
        .variables
        .retain(|v| !matches!(router_output.attr_constraints.get(&v.name), Some(AttrConstraint::Forbidden)));

    let missing_subject = result.variables.iter().any(|v| v.subject.name.trim().is_empty());
    if missing_subject {
        if is_last_step {
            result.variables.retain(|v| !v.subject.name.trim().is_empty());
            return CandidateOutcome::Accept(serde_json::to_string(&result).unwrap_or_default());
        }
        return CandidateOutcome::Nudge(
            "Every variable must have a non-empty subject name. Re-emit the final JSON with subjects filled in.".to_string(),
        );
    }

    let gate = citation::evaluate(&result, &router_output.evidence_policy);
    if !gate.ok {
        if is_last_step {
            return CandidateOutcome::Accept(serde_json::to_string(&result).unwrap_or_default());
        }
        return CandidateOutcome::Nudge(format!(
            "Corroboration check failed: {}. Call more searches to gather additional agreeing sources, then re-emit the final JSON.",
            gate.issues.join("; ")
        ));
    }

    CandidateOutcome::Accept(serde_json::to_string(&result).unwrap_or_default())
}

struct ToolOutcome {
    name: String,
    args: Value,
    success: bool,
    metric: Option<i64>,
    failure_reason: Option<String>,
}

/// Summarises the last 3 successes and last 5 failures across the whole run
/// so far, instructing the model not to repeat failures (spec §4.8 step 3).
fn build_tool_outcomes_message(outcomes: &[ToolOutcome]) -> ChatMessage {
    let successes: Vec<&ToolOutcome> = outcomes.iter().filter(|o| o.success).rev().take(3).collect();
    let failures: Vec<&ToolOutcome> = outcomes.iter().filter(|o| !o.success).rev().take(5).collect();

    let payload = json!({
        "tool_outcomes": {
            "recent_successes": successes.iter().rev().map(|o| json!({
                "tool": o.name, "args": o.args, "metric": o.metric,
            })).collect::<Vec<_>>(),
            "recent_failures": failures.iter().rev().map(|o| json!({
                "tool": o.name, "args": o.args, "reason": o.failure_reason,
            })).collect::<Vec<_>>(),
        },
        "instruction": "Do not repeat the failing calls above. Prefer calls similar in shape to the successes.",
    });

    ChatMessage::User { content: payload.to_string() }
}

fn build_system_prompt(
    input: &AgentLoopInput<'_>,
    intent_result: &IntentResult,
    router_output: &RouterOutput,
    caps: &IntensityCaps,
) -> String {
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let authority_clause = if router_output.evidence_policy.require_authority {
        "at least one source with authority score >= 70 is required per variable."
    } else {
        "no minimum source authority is required."
    };

    format!(
        "You are a research agent enriching structured facts about entities.\n\
Current date: {date}.\n\
You have up to {max_steps} reasoning steps and {max_web} web searches total this run.\n\
Corroboration policy: each variable needs >= {min_corr} agreeing source(s); {authority}\n\
Entity type hint: {entity_type}.\n\
Vocabulary to prefer: {boost}. Vocabulary to avoid: {penalize}.\n\
Detected intent: {intent:?}{target}.\n\
When you have no more tool calls to make, respond with strict JSON only, matching:\n\
{{\"intent\": \"boolean\"|\"specific\"|\"contextual\"|null, \"variables\": [{{\"subject\": {{\"name\": string, \"type\": string, \"canonical_id\": string|null}}, \"name\": string, \"dtype\": \"boolean\"|\"string\"|\"number\"|\"date\"|\"url\"|\"text\", \"value\": any, \"confidence\": number, \"sources\": [{{\"title\": string|null, \"url\": string, \"snippet\": string|null}}]}}], \"notes\": string|null}}",
        date = today,
        max_steps = caps.max_steps,
        max_web = caps.max_web_searches,
        min_corr = router_output.evidence_policy.min_corroboration,
        authority = authority_clause,
        entity_type = router_output.entity_type.clone().unwrap_or_else(|| "unknown".to_string()),
        boost = router_output.vocab_hints.boost.join(", "),
        penalize = router_output.vocab_hints.penalize.join(", "),
        intent = intent_result.intent,
        target = intent_result.target.as_ref().map(|t| format!(" (target: {})", t)).unwrap_or_default(),
    )
}

fn build_intro_message(input: &AgentLoopInput<'_>, intent_result: &IntentResult, trusted_facts: &[FactRow]) -> String {
    let trusted_block: Vec<Value> = trusted_facts
        .iter()
        .map(|f| json!({"name": f.name, "value": f.value, "confidence": f.confidence}))
        .collect();

    json!({
        "query": input.query,
        "entity": input.entity_hint,
        "target": intent_result.target,
        "expected_variables": input.expected_variables.iter().map(|v| json!({
            "name": v.name, "type": v.dtype, "description": v.description,
        })).collect::<Vec<_>>(),
        "trusted_facts": trusted_block,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EvidencePolicy;
    use std::collections::HashMap;

    fn neutral_router() -> RouterOutput {
        RouterOutput {
            entity_type: Some("company".to_string()),
            attr_constraints: HashMap::new(),
            vocab_hints: Default::default(),
            evidence_policy: EvidencePolicy { min_corroboration: 1, require_authority: false, freshness_days: None },
        }
    }

    #[test]
    fn unparseable_candidate_nudges_when_steps_remain() {
        match evaluate_candidate("not json", &neutral_router(), Some("Acme"), false) {
            CandidateOutcome::Nudge(_) => {}
            CandidateOutcome::Accept(_) => panic!("expected a nudge"),
        }
    }

    #[test]
    fn unparseable_candidate_accepted_on_last_step() {
        match evaluate_candidate("not json", &neutral_router(), Some("Acme"), true) {
            CandidateOutcome::Accept(_) => {}
            CandidateOutcome::Nudge(_) => panic!("expected acceptance on last step"),
        }
    }

    #[test]
    fn missing_subject_is_filled_from_entity_hint() {
        let raw = json!({
            "variables": [{
                "subject": {"name": "", "type": ""},
                "name": "ceo_name",
                "dtype": "string",
                "value": "Jane Doe",
                "confidence": 0.9,
                "sources": [
                    {"url": "https://en.wikipedia.org/wiki/Acme"},
                    {"url": "https://www.sec.gov/filing"}
                ]
            }]
        })
        .to_string();

        match evaluate_candidate(&raw, &neutral_router(), Some("Acme Corp"), false) {
            CandidateOutcome::Accept(text) => {
                let result: EnrichmentResult = serde_json::from_str(&text).unwrap();
                assert_eq!(result.variables[0].subject.name, "Acme Corp");
            }
            CandidateOutcome::Nudge(reason) => panic!("expected acceptance, got nudge: {}", reason),
        }
    }

    #[test]
    fn forbidden_variable_is_dropped() {
        let mut router_output = neutral_router();
        router_output.attr_constraints.insert("irrelevant_field".to_string(), AttrConstraint::Forbidden);

        let raw = json!({
            "variables": [{
                "subject": {"name": "Acme Corp", "type": "company"},
                "name": "irrelevant_field",
                "dtype": "string",
                "value": "x",
                "confidence": 0.9,
                "sources": [{"url": "https://en.wikipedia.org/wiki/Acme"}, {"url": "https://www.sec.gov/filing"}]
            }]
        })
        .to_string();

        match evaluate_candidate(&raw, &router_output, Some("Acme Corp"), false) {
            CandidateOutcome::Accept(text) => {
                let result: EnrichmentResult = serde_json::from_str(&text).unwrap();
                assert!(result.variables.is_empty());
            }
            CandidateOutcome::Nudge(reason) => panic!("expected acceptance, got nudge: {}", reason),
        }
    }
}
