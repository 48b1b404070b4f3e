//! Shared data-model types (spec §3). These are plain value types shared
//! across components — not diesel rows (see `schema.rs`/`fact.rs`/`entity.rs`
//! for the persisted shapes).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Boolean,
    Specific,
    Contextual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchIntensity {
    Low,
    Medium,
    High,
}

impl Default for ResearchIntensity {
    fn default() -> Self {
        ResearchIntensity::Medium
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IntensityCaps {
    pub max_steps: u32,
    pub max_web_searches: u32,
}

impl ResearchIntensity {
    pub fn base_caps(self) -> IntensityCaps {
        match self {
            ResearchIntensity::Low => IntensityCaps {
                max_steps: 3,
                max_web_searches: 2,
            },
            ResearchIntensity::Medium => IntensityCaps {
                max_steps: 6,
                max_web_searches: 4,
            },
            ResearchIntensity::High => IntensityCaps {
                max_steps: 10,
                max_web_searches: 8,
            },
        }
    }

    /// Composes the base cap with optional tighter environment overrides
    /// (testable property 9: env wins only if it is tighter).
    pub fn effective_caps(self, env_max_steps: Option<u32>, env_max_web: Option<u32>) -> IntensityCaps {
        let base = self.base_caps();
        IntensityCaps {
            max_steps: env_max_steps.map(|e| e.min(base.max_steps)).unwrap_or(base.max_steps),
            max_web_searches: env_max_web
                .map(|e| e.min(base.max_web_searches))
                .unwrap_or(base.max_web_searches),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Boolean,
    String,
    Number,
    Date,
    Url,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagicVariable {
    pub subject: Subject,
    pub name: String,
    pub dtype: Dtype,
    pub value: serde_json::Value,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnrichmentResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub variables: Vec<MagicVariable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Tagged-variant message, per the design-note redesign: tool-call interop
/// is modelled as an explicit variant rather than left implicit in a
/// provider-specific shape, so the history-trim invariant is testable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default)]
        tool_calls: Vec<ToolCallRecord>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn tool_call_ids(&self) -> Vec<&str> {
        match self {
            ChatMessage::Assistant { tool_calls, .. } => {
                tool_calls.iter().map(|t| t.id.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: uuid::Uuid,
    pub username: String,
    pub text: String,
    pub tags: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrConstraint {
    Required,
    #[default]
    Allowed,
    Forbidden,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidencePolicy {
    pub min_corroboration: u32,
    pub require_authority: bool,
    pub freshness_days: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VocabHints {
    pub boost: Vec<String>,
    pub penalize: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterOutput {
    pub entity_type: Option<String>,
    pub attr_constraints: std::collections::HashMap<String, AttrConstraint>,
    pub vocab_hints: VocabHints,
    pub evidence_policy: EvidencePolicy,
}

/// A caller-supplied hint for an expected output variable (spec §6 request body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableHint {
    pub name: String,
    #[serde(rename = "type", default)]
    pub dtype: Option<Dtype>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Operator/user feedback attached to a request, overlaid as a trusted fact
/// before research begins (§6, §4.2 `set_trusted_fact`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub entity: String,
    pub field: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub source: Option<String>,
}

/// The `POST /api/enrich` request body (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Vec<VariableHint>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(rename = "researchIntensity", default)]
    pub research_intensity: ResearchIntensity,
    #[serde(default)]
    pub corrections: Vec<Correction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins_only_when_tighter() {
        let caps = ResearchIntensity::Medium.effective_caps(Some(2), None);
        assert_eq!(caps.max_steps, 2);

        let caps = ResearchIntensity::Low.effective_caps(Some(10), None);
        assert_eq!(caps.max_steps, 3);
    }
}
