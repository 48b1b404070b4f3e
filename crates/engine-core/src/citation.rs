//! Citation Gate (C8) — evaluates corroboration/authority requirements
//! against a candidate final answer (spec §4.7).

use crate::models::{Dtype, EnrichmentResult, EvidencePolicy};

#[derive(Debug, Clone, Default)]
pub struct GateResult {
    pub ok: bool,
    pub issues: Vec<String>,
}

/// Host-derived authority score in [0,100]. Deliberately duplicated in
/// `engine-tools::latest_finder` — the two components live in different
/// crates and neither should depend on the other to judge host trust.
pub fn authority_score(url: &str) -> u32 {
    let host = url
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("")
        .to_lowercase();

    if host.is_empty() {
        return 0;
    }
    if host.contains("sec.gov") {
        100
    } else if host.contains("wikidata.org") {
        90
    } else if host.contains("wikipedia.org") {
        85
    } else if host.ends_with(".gov") {
        80
    } else if host.ends_with(".edu") {
        75
    } else if ["bloomberg.com", "reuters.com", "ft.com", "nytimes.com", "wsj.com"]
        .iter()
        .any(|d| host.ends_with(d))
    {
        72
    } else if host.starts_with("www.") && !is_blog_platform(&host) {
        65
    } else {
        50
    }
}

fn is_blog_platform(host: &str) -> bool {
    ["medium.com", "substack.com", "blogspot.com", "wordpress.com"]
        .iter()
        .any(|d| host.ends_with(d))
}

fn is_founding_date_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("found") && lower.contains("date")
}

/// Evaluates every variable in a candidate result against the evidence
/// policy. Returns all issues found (not short-circuiting), so the agent
/// loop's nudge message can describe everything wrong at once.
pub fn evaluate(result: &EnrichmentResult, policy: &EvidencePolicy) -> GateResult {
    let mut issues = Vec::new();

    for variable in &result.variables {
        if (variable.sources.len() as u32) < policy.min_corroboration {
            issues.push(format!(
                "{}: has {} source(s), policy requires >= {}",
                variable.name,
                variable.sources.len(),
                policy.min_corroboration
            ));
            continue;
        }

        let requires_corroboration =
            matches!(variable.dtype, Dtype::Date | Dtype::Number | Dtype::String) || is_founding_date_name(&variable.name);
        if requires_corroboration && variable.sources.len() < 2 {
            issues.push(format!("{}: requires >= 2 agreeing sources for this dtype", variable.name));
        }

        if policy.require_authority {
            let has_authoritative = variable.sources.iter().any(|s| authority_score(&s.url) >= 70);
            if !has_authoritative {
                issues.push(format!("{}: policy requires a source with authority >= 70", variable.name));
            }
        }
    }

    GateResult { ok: issues.is_empty(), issues }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MagicVariable, Source, Subject};

    fn variable(name: &str, dtype: Dtype, sources: Vec<&str>) -> MagicVariable {
        MagicVariable {
            subject: Subject { name: "Acme".to_string(), entity_type: "company".to_string(), canonical_id: None },
            name: name.to_string(),
            dtype,
            value: serde_json::json!("x"),
            confidence: Some(0.8),
            sources: sources
                .into_iter()
                .map(|u| Source { title: None, url: u.to_string(), snippet: None })
                .collect(),
            observed_at: None,
        }
    }

    #[test]
    fn authority_scores_known_hosts() {
        assert_eq!(authority_score("https://www.sec.gov/filing"), 100);
        assert_eq!(authority_score("https://en.wikipedia.org/wiki/X"), 85);
        assert_eq!(authority_score("not-a-url"), 0);
    }

    #[test]
    fn date_variable_with_one_source_fails_even_at_min_corroboration_one() {
        let result = EnrichmentResult {
            intent: None,
            variables: vec![variable("founding_date", Dtype::Date, vec!["https://example.com/a"])],
            notes: None,
        };
        let policy = EvidencePolicy { min_corroboration: 1, require_authority: false, freshness_days: None };
        let gate = evaluate(&result, &policy);
        assert!(!gate.ok);
    }

    #[test]
    fn require_authority_fails_when_all_sources_below_threshold() {
        let result = EnrichmentResult {
            intent: None,
            variables: vec![variable("tagline", Dtype::Text, vec!["https://example.com/a", "https://example.com/b"])],
            notes: None,
        };
        let policy = EvidencePolicy { min_corroboration: 1, require_authority: true, freshness_days: None };
        let gate = evaluate(&result, &policy);
        assert!(!gate.ok);
    }

    #[test]
    fn passes_when_corroborated_and_authoritative() {
        let result = EnrichmentResult {
            intent: None,
            variables: vec![variable(
                "ceo_name",
                Dtype::String,
                vec!["https://en.wikipedia.org/wiki/Acme", "https://www.sec.gov/filing"],
            )],
            notes: None,
        };
        let policy = EvidencePolicy { min_corroboration: 2, require_authority: true, freshness_days: None };
        let gate = evaluate(&result, &policy);
        assert!(gate.ok);
    }
}
