//! Finalizer & Fact Writer (C10) — turns the agent loop's raw final text
//! into a validated `EnrichmentResult`, overlays trusted facts, and
//! persists every resolved variable (spec §4.9).

use crate::citation;
use crate::fact::WriteFact;
use crate::models::{Dtype, EnrichmentResult, MagicVariable, Source, Subject};
use crate::services::Services;
use serde_json::json;
use std::collections::HashSet;
use tracing::warn;

pub fn finalize(
    services: &Services,
    final_text: &str,
    default_entity_hint: Option<&str>,
    default_entity_type: Option<&str>,
) -> EnrichmentResult {
    let mut result: EnrichmentResult = serde_json::from_str(final_text).unwrap_or_else(|e| {
        warn!("final agent output did not parse as JSON: {}", e);
        EnrichmentResult {
            intent: None,
            variables: Vec::new(),
            notes: Some("failed to parse agent output as JSON".to_string()),
        }
    });

    for variable in result.variables.iter_mut() {
        resolve_subject(services, variable, default_entity_hint, default_entity_type);
        variable.confidence = Some(variable.confidence.unwrap_or(0.5).clamp(0.0, 1.0));
        dedupe_and_sort_sources(variable);
        if variable.observed_at.is_none() {
            variable.observed_at = Some(services.clock.now());
        }
    }

    if result.variables.is_empty() {
        if let Some(hint) = default_entity_hint {
            result.variables.push(synthesize_context_variable(services, hint, default_entity_type, &result.notes));
        }
    }

    overlay_trusted_facts(services, &mut result);
    persist(services, &result);

    result
}

fn resolve_subject(
    services: &Services,
    variable: &mut MagicVariable,
    default_entity_hint: Option<&str>,
    default_entity_type: Option<&str>,
) {
    if variable.subject.name.trim().is_empty() {
        if let Some(hint) = default_entity_hint {
            variable.subject.name = hint.to_string();
        }
    }
    if variable.subject.entity_type.trim().is_empty() {
        variable.subject.entity_type = default_entity_type.unwrap_or("unknown").to_string();
    }
    if variable.subject.name.trim().is_empty() {
        return;
    }
    match services.entities.resolve(&variable.subject.name, &variable.subject.entity_type) {
        Ok(id) => variable.subject.canonical_id = Some(id),
        Err(e) => warn!("failed to resolve subject '{}': {}", variable.subject.name, e),
    }
}

fn dedupe_and_sort_sources(variable: &mut MagicVariable) {
    let mut seen = HashSet::new();
    variable.sources.retain(|s| seen.insert(s.url.clone()));
    variable
        .sources
        .sort_by(|a, b| citation::authority_score(&b.url).cmp(&citation::authority_score(&a.url)));
}

fn synthesize_context_variable(
    services: &Services,
    hint: &str,
    entity_type: Option<&str>,
    notes: &Option<String>,
) -> MagicVariable {
    let entity_type = entity_type.unwrap_or("unknown").to_string();
    let canonical_id = services.entities.resolve(hint, &entity_type).ok();
    MagicVariable {
        subject: Subject { name: hint.to_string(), entity_type, canonical_id },
        name: "context".to_string(),
        dtype: Dtype::Text,
        value: json!(notes.clone().unwrap_or_else(|| "No information gathered.".to_string())),
        confidence: Some(0.5),
        sources: Vec::new(),
        observed_at: Some(services.clock.now()),
    }
}

/// Overwrites a research variable with a matching trusted fact only when the
/// trusted fact's confidence is at least as high, prepending a source that
/// represents the trusted fact (spec §4.9).
fn overlay_trusted_facts(services: &Services, result: &mut EnrichmentResult) {
    for variable in result.variables.iter_mut() {
        let Some(entity_id) = variable.subject.canonical_id.clone() else { continue };
        let trusted = match services.facts.get_fact(&entity_id, &variable.name) {
            Ok(Some(fact)) => fact,
            _ => continue,
        };

        let trusted_confidence = trusted.confidence.unwrap_or(0.5);
        let research_confidence = variable.confidence.unwrap_or(0.5);
        if trusted_confidence < research_confidence {
            continue;
        }

        variable.value = trusted.value.clone();
        variable.confidence = Some(trusted_confidence);
        variable.dtype = trusted.dtype();

        let mut trusted_sources = trusted.sources_vec();
        if trusted_sources.is_empty() {
            trusted_sources.push(Source { title: None, url: "about:trusted-fact".to_string(), snippet: None });
        }
        trusted_sources.append(&mut variable.sources);
        variable.sources = trusted_sources;
    }
}

/// Best-effort: a failed write is logged and otherwise ignored (spec §4.9).
fn persist(services: &Services, result: &EnrichmentResult) {
    for variable in &result.variables {
        if variable.name == "context" {
            continue;
        }
        let Some(entity_id) = &variable.subject.canonical_id else { continue };

        let write = WriteFact {
            entity_id,
            name: &variable.name,
            value: variable.value.clone(),
            dtype: variable.dtype.clone(),
            confidence: variable.confidence,
            sources: variable.sources.clone(),
            notes: None,
            observed_at: variable.observed_at,
        };
        if let Err(e) = services.facts.store_fact(write) {
            warn!("failed to persist fact {}/{}: {}", entity_id, variable.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_and_sort_keeps_highest_authority_first() {
        let mut variable = MagicVariable {
            subject: Subject { name: "Acme".to_string(), entity_type: "company".to_string(), canonical_id: None },
            name: "ceo".to_string(),
            dtype: Dtype::String,
            value: json!("Jane Doe"),
            confidence: Some(0.7),
            sources: vec![
                Source { title: None, url: "https://example.com/a".to_string(), snippet: None },
                Source { title: None, url: "https://www.sec.gov/filing".to_string(), snippet: None },
                Source { title: None, url: "https://example.com/a".to_string(), snippet: None },
            ],
            observed_at: None,
        };
        dedupe_and_sort_sources(&mut variable);
        assert_eq!(variable.sources.len(), 2);
        assert_eq!(variable.sources[0].url, "https://www.sec.gov/filing");
    }
}
