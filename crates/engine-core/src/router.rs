//! Inference Router (C6) — a pre-pass producing an entity-type guess,
//! attribute constraints, vocabulary hints, and an evidence policy that
//! shapes both the agent's prompt and the citation gate (spec §4.5).

use crate::models::{AttrConstraint, ChatMessage, EvidencePolicy, RouterOutput, VariableHint, VocabHints};
use crate::reasoner::{Reasoner, ReasonerRequest};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

const SYSTEM_PROMPT: &str = r#"You are a research-planning pre-pass. Given a query, an optional entity hint,
and a list of expected output variables, produce strict JSON only, matching:
{
  "entity_type": string | null,
  "attr_constraints": { "<variable name>": "required" | "allowed" | "forbidden" },
  "vocab_hints": { "boost": [string], "penalize": [string] },
  "evidence_policy": { "min_corroboration": number, "require_authority": boolean, "freshness_days": number | null }
}
min_corroboration must be between 1 and 5. Use "required" for variables the query is clearly asking
for, "forbidden" for variables plainly irrelevant to this entity/query, "allowed" otherwise."#;

pub struct RouterInput<'a> {
    pub query: &'a str,
    pub entity_hint: Option<&'a str>,
    pub expected_variables: &'a [VariableHint],
}

pub async fn run(reasoner: &dyn Reasoner, input: RouterInput<'_>) -> RouterOutput {
    let mut output = match run_via_model(reasoner, &input).await {
        Ok(output) => output,
        Err(e) => {
            debug!("inference router model path failed, using neutral fallback: {}", e);
            neutral_fallback(input.expected_variables)
        }
    };
    complete_and_clamp(&mut output, input.expected_variables);
    output
}

async fn run_via_model(reasoner: &dyn Reasoner, input: &RouterInput<'_>) -> anyhow::Result<RouterOutput> {
    let vars: Vec<&str> = input.expected_variables.iter().map(|v| v.name.as_str()).collect();
    let user_content = json!({
        "query": input.query,
        "entity_hint": input.entity_hint,
        "expected_variables": vars,
    })
    .to_string();

    let request = ReasonerRequest::new(vec![
        ChatMessage::System { content: SYSTEM_PROMPT.to_string() },
        ChatMessage::User { content: user_content },
    ])
    .with_temperature(0.0)
    .with_json_schema(json!({
        "name": "router_output",
        "schema": {
            "type": "object",
            "properties": {
                "entity_type": {"type": ["string", "null"]},
                "attr_constraints": {"type": "object"},
                "vocab_hints": {
                    "type": "object",
                    "properties": {
                        "boost": {"type": "array", "items": {"type": "string"}},
                        "penalize": {"type": "array", "items": {"type": "string"}}
                    }
                },
                "evidence_policy": {
                    "type": "object",
                    "properties": {
                        "min_corroboration": {"type": "number"},
                        "require_authority": {"type": "boolean"},
                        "freshness_days": {"type": ["number", "null"]}
                    }
                }
            }
        }
    }));

    let response = reasoner.complete(request).await?;
    let content = match response {
        ChatMessage::Assistant { content: Some(c), .. } => c,
        _ => anyhow::bail!("inference router received no content"),
    };
    let parsed: RouterOutput = serde_json::from_str(&content)?;
    Ok(parsed)
}

/// Post-parse completion (spec §4.5): every expected variable not otherwise
/// marked receives "allowed"; min_corroboration is clamped into [1,5]; vocab
/// hints are coerced to the two-array shape (already typed, so this is a
/// structural no-op — kept explicit to mirror the listed completion steps).
fn complete_and_clamp(output: &mut RouterOutput, expected_variables: &[VariableHint]) {
    for var in expected_variables {
        output.attr_constraints.entry(var.name.clone()).or_insert(AttrConstraint::Allowed);
    }
    output.evidence_policy.min_corroboration = output.evidence_policy.min_corroboration.clamp(1, 5);
}

pub fn neutral_fallback(expected_variables: &[VariableHint]) -> RouterOutput {
    let mut attr_constraints = HashMap::new();
    for var in expected_variables {
        attr_constraints.insert(var.name.clone(), AttrConstraint::Allowed);
    }
    RouterOutput {
        entity_type: None,
        attr_constraints,
        vocab_hints: VocabHints::default(),
        evidence_policy: EvidencePolicy {
            min_corroboration: 1,
            require_authority: false,
            freshness_days: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_min_corroboration_into_range() {
        let mut output = RouterOutput {
            evidence_policy: EvidencePolicy { min_corroboration: 9, require_authority: false, freshness_days: None },
            ..Default::default()
        };
        complete_and_clamp(&mut output, &[]);
        assert_eq!(output.evidence_policy.min_corroboration, 5);

        let mut output = RouterOutput {
            evidence_policy: EvidencePolicy { min_corroboration: 0, require_authority: false, freshness_days: None },
            ..Default::default()
        };
        complete_and_clamp(&mut output, &[]);
        assert_eq!(output.evidence_policy.min_corroboration, 1);
    }

    #[test]
    fn fills_missing_variables_as_allowed() {
        let mut output = RouterOutput::default();
        let vars = vec![VariableHint { name: "ceo_name".to_string(), dtype: None, description: None }];
        complete_and_clamp(&mut output, &vars);
        assert!(matches!(output.attr_constraints.get("ceo_name"), Some(AttrConstraint::Allowed)));
    }
}
