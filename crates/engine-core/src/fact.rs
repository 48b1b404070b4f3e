//! Fact Store (C2) — bitemporal facts keyed by (entity_id, name).

use crate::entity::EntityResolver;
use crate::models::{Dtype, Source};
use crate::schema::facts;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::Value as Json;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FactError {
    #[error("entity must be resolved before writing a trusted fact")]
    EntityNotResolved,
    #[error("entity resolution failed: {0}")]
    Entity(#[from] crate::entity::EntityError),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("lock poisoned")]
    LockPoisoned,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = facts)]
pub struct FactRow {
    pub id: Uuid,
    pub entity_id: String,
    pub name: String,
    pub value: Json,
    pub dtype: String,
    pub confidence: Option<f32>,
    pub sources: Json,
    pub notes: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl FactRow {
    /// Parses the stored `sources` JSON back into typed `Source`s, tolerating
    /// rows written before a field existed by skipping entries that don't parse.
    pub fn sources_vec(&self) -> Vec<Source> {
        self.sources
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| serde_json::from_value::<Source>(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn dtype(&self) -> Dtype {
        match self.dtype.as_str() {
            "boolean" => Dtype::Boolean,
            "number" => Dtype::Number,
            "date" => Dtype::Date,
            "url" => Dtype::Url,
            "text" => Dtype::Text,
            _ => Dtype::String,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = facts)]
struct NewFact<'a> {
    id: Uuid,
    entity_id: &'a str,
    name: &'a str,
    value: Json,
    dtype: &'a str,
    confidence: Option<f32>,
    sources: Json,
    notes: Option<&'a str>,
    observed_at: DateTime<Utc>,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
}

pub struct WriteFact<'a> {
    pub entity_id: &'a str,
    pub name: &'a str,
    pub value: Json,
    pub dtype: Dtype,
    pub confidence: Option<f32>,
    pub sources: Vec<Source>,
    pub notes: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
}

pub struct FactStore {
    conn: Mutex<PgConnection>,
}

impl FactStore {
    pub fn new(database_url: &str) -> Result<Self, FactError> {
        let conn = PgConnection::establish(database_url)
            .map_err(|e| FactError::Database(diesel::result::Error::QueryBuilderError(e.into())))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PgConnection>, FactError> {
        self.conn.lock().map_err(|_| FactError::LockPoisoned)
    }

    /// Close-then-insert inside one transaction, row-locking the current row
    /// first so concurrent writers for the same (entity_id, name) serialize
    /// rather than race. The partial unique index on `facts` is the
    /// storage-layer backstop if this invariant is ever violated.
    pub fn store_fact(&self, fact: WriteFact<'_>) -> Result<Uuid, FactError> {
        let observed_at = fact.observed_at.unwrap_or_else(Utc::now);
        let dtype_str = dtype_to_str(&fact.dtype);
        let sources_json = serde_json::to_value(&fact.sources).unwrap_or_else(|_| serde_json::json!([]));

        let mut conn = self.lock()?;
        let new_id = conn.transaction::<Uuid, diesel::result::Error, _>(|conn| {
            diesel::sql_query(
                "SELECT id FROM facts WHERE entity_id = $1 AND name = $2 AND valid_to IS NULL FOR UPDATE",
            )
            .bind::<diesel::sql_types::Text, _>(fact.entity_id)
            .bind::<diesel::sql_types::Text, _>(fact.name)
            .execute(conn)
            .ok();

            diesel::update(
                facts::table
                    .filter(facts::entity_id.eq(fact.entity_id))
                    .filter(facts::name.eq(fact.name))
                    .filter(facts::valid_to.is_null()),
            )
            .set(facts::valid_to.eq(observed_at))
            .execute(conn)?;

            let id = Uuid::new_v4();
            let new_fact = NewFact {
                id,
                entity_id: fact.entity_id,
                name: fact.name,
                value: fact.value,
                dtype: &dtype_str,
                confidence: fact.confidence,
                sources: sources_json,
                notes: fact.notes.as_deref(),
                observed_at,
                valid_from: observed_at,
                valid_to: None,
            };

            diesel::insert_into(facts::table)
                .values(&new_fact)
                .execute(conn)?;

            Ok(id)
        })?;

        debug!("stored fact {}/{} as {}", fact.entity_id, fact.name, new_id);
        Ok(new_id)
    }

    pub fn get_fact(&self, entity_id: &str, name: &str) -> Result<Option<FactRow>, FactError> {
        let mut conn = self.lock()?;
        let row = facts::table
            .filter(facts::entity_id.eq(entity_id))
            .filter(facts::name.eq(name))
            .filter(facts::valid_to.is_null())
            .select(FactRow::as_select())
            .first(&mut *conn)
            .optional()?;
        Ok(row)
    }

    pub fn get_facts_for_entity(&self, entity_id: &str) -> Result<Vec<FactRow>, FactError> {
        let mut conn = self.lock()?;
        let rows = facts::table
            .filter(facts::entity_id.eq(entity_id))
            .filter(facts::valid_to.is_null())
            .order(facts::name.asc())
            .select(FactRow::as_select())
            .load(&mut *conn)?;
        Ok(rows)
    }

    /// Synonym lookup used on cache misses: normalises `base` and returns
    /// distinct current-row names matching `%normalised%`, excluding the
    /// exact match.
    pub fn find_similar_fact_names(
        &self,
        entity_id: &str,
        base: &str,
        limit: usize,
    ) -> Result<Vec<String>, FactError> {
        let normalised = normalise_name(base);
        let rows = self.get_facts_for_entity(entity_id)?;
        let mut names: Vec<String> = rows
            .into_iter()
            .map(|r| r.name)
            .filter(|n| n != &normalised && normalise_name(n).contains(&normalised))
            .collect();
        names.dedup();
        names.truncate(limit);
        Ok(names)
    }

    /// Sets a user/operator-trusted fact. Confidence monotonically
    /// approaches 1 via `(current + 1.0) / 2`, per design note (b) — never
    /// reaches exactly 1, by design.
    pub fn set_trusted_fact(
        &self,
        resolver: &EntityResolver,
        entity_name: &str,
        field: &str,
        value: Json,
        source: Option<String>,
    ) -> Result<Uuid, FactError> {
        let existing = resolver.try_resolve_existing(entity_name)?;
        let entity_id = existing.ok_or(FactError::EntityNotResolved)?.id;

        let current = self.get_fact(&entity_id, field)?;
        let current_confidence = current.as_ref().and_then(|f| f.confidence).unwrap_or(0.5);
        let new_confidence = (current_confidence + 1.0) / 2.0;

        let dtype = infer_dtype(&value);
        let sources = source
            .map(|url| vec![Source { title: None, url, snippet: None }])
            .unwrap_or_default();

        self.store_fact(WriteFact {
            entity_id: &entity_id,
            name: field,
            value,
            dtype,
            confidence: Some(new_confidence),
            sources,
            notes: None,
            observed_at: None,
        })
    }
}

fn normalise_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

fn dtype_to_str(dtype: &Dtype) -> String {
    match dtype {
        Dtype::Boolean => "boolean",
        Dtype::String => "string",
        Dtype::Number => "number",
        Dtype::Date => "date",
        Dtype::Url => "url",
        Dtype::Text => "text",
    }
    .to_string()
}

fn infer_dtype(value: &Json) -> Dtype {
    match value {
        Json::Bool(_) => Dtype::Boolean,
        Json::Number(_) => Dtype::Number,
        Json::String(s) => {
            if s.starts_with("http://") || s.starts_with("https://") {
                Dtype::Url
            } else {
                Dtype::String
            }
        }
        _ => Dtype::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_dtype_from_value_kind() {
        assert_eq!(infer_dtype(&serde_json::json!(true)), Dtype::Boolean);
        assert_eq!(infer_dtype(&serde_json::json!(42)), Dtype::Number);
        assert_eq!(infer_dtype(&serde_json::json!("https://x.com")), Dtype::Url);
        assert_eq!(infer_dtype(&serde_json::json!("plain")), Dtype::String);
    }

    #[test]
    fn normalise_strips_non_alnum() {
        assert_eq!(normalise_name("CEO Name!"), "ceoname");
    }
}
