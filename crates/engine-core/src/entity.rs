//! Entity Resolver (C1) — maps a (name, type) pair to a canonical entity id.

use crate::schema::entities;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::Value as Json;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum EntityError {
    #[error("entity name must not be empty")]
    EmptyName,
    #[error("entity type must not be empty")]
    EmptyType,
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("lock poisoned")]
    LockPoisoned,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = entities)]
pub struct EntityRow {
    pub id: String,
    pub entity_type: String,
    pub canonical_name: String,
    pub aliases: Json,
    pub external_ids: Json,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = entities)]
struct NewEntity<'a> {
    id: &'a str,
    entity_type: &'a str,
    canonical_name: &'a str,
    aliases: Json,
    external_ids: Json,
}

#[derive(Debug, Clone)]
pub struct EntityMatch {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub score: Option<f32>,
}

pub struct EntityResolver {
    conn: Mutex<PgConnection>,
}

/// Lowercase alnum, collapsing runs of non-alnum characters to a single `_`,
/// trimmed of leading/trailing underscores.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

fn type_prefix(entity_type: &str) -> String {
    match entity_type {
        "company" => "cmp".to_string(),
        "person" => "per".to_string(),
        other => other.chars().take(3).collect(),
    }
}

impl EntityResolver {
    pub fn new(database_url: &str) -> Result<Self, EntityError> {
        let conn = PgConnection::establish(database_url)
            .map_err(|e| EntityError::Database(diesel::result::Error::QueryBuilderError(e.into())))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PgConnection>, EntityError> {
        self.conn.lock().map_err(|_| EntityError::LockPoisoned)
    }

    pub fn resolve(&self, name: &str, entity_type: &str) -> Result<String, EntityError> {
        let name = name.trim();
        let entity_type = entity_type.trim().to_lowercase();
        if name.is_empty() {
            return Err(EntityError::EmptyName);
        }
        if entity_type.is_empty() {
            return Err(EntityError::EmptyType);
        }

        let id = format!("{}_{}", type_prefix(&entity_type), slug(name));
        let mut conn = self.lock()?;

        let existing: Option<EntityRow> = entities::table
            .filter(entities::id.eq(&id))
            .select(EntityRow::as_select())
            .first(&mut *conn)
            .optional()?;
        if existing.is_some() {
            return Ok(id);
        }

        let by_name: Option<EntityRow> = entities::table
            .filter(entities::entity_type.eq(&entity_type))
            .select(EntityRow::as_select())
            .load(&mut *conn)?
            .into_iter()
            .find(|row| row.canonical_name.to_lowercase() == name.to_lowercase());

        if let Some(row) = by_name {
            return Ok(row.id);
        }

        let new_entity = NewEntity {
            id: &id,
            entity_type: &entity_type,
            canonical_name: name,
            aliases: serde_json::json!([]),
            external_ids: serde_json::json!({}),
        };
        diesel::insert_into(entities::table)
            .values(&new_entity)
            .on_conflict(entities::id)
            .do_nothing()
            .execute(&mut *conn)?;

        info!("resolved new entity {} ({}: {})", id, entity_type, name);
        Ok(id)
    }

    pub fn try_resolve_existing(&self, name: &str) -> Result<Option<EntityMatch>, EntityError> {
        let name_lower = name.trim().to_lowercase();
        let mut conn = self.lock()?;
        let rows: Vec<EntityRow> = entities::table.select(EntityRow::as_select()).load(&mut *conn)?;

        for row in rows {
            if row.canonical_name.to_lowercase() == name_lower {
                return Ok(Some(EntityMatch {
                    id: row.id,
                    name: row.canonical_name,
                    entity_type: row.entity_type,
                    score: None,
                }));
            }
            if let Some(aliases) = row.aliases.as_array() {
                if aliases
                    .iter()
                    .filter_map(|a| a.as_str())
                    .any(|a| a.to_lowercase() == name_lower)
                {
                    return Ok(Some(EntityMatch {
                        id: row.id,
                        name: row.canonical_name,
                        entity_type: row.entity_type,
                        score: None,
                    }));
                }
            }
        }
        Ok(None)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<EntityRow>, EntityError> {
        let mut conn = self.lock()?;
        let row = entities::table
            .filter(entities::id.eq(id))
            .select(EntityRow::as_select())
            .first(&mut *conn)
            .optional()?;
        Ok(row)
    }

    /// Trigram similarity via `pg_trgm`'s `%` operator, falling back to a
    /// substring scan when the extension is unavailable (spec §6).
    pub fn search_by_name(&self, query: &str, limit: i64) -> Result<Vec<EntityMatch>, EntityError> {
        let mut conn = self.lock()?;

        let trgm_result: Result<Vec<(String, String, String, f32)>, diesel::result::Error> =
            diesel::sql_query(
                "SELECT id, canonical_name, entity_type, similarity(canonical_name, $1) AS score \
                 FROM entities WHERE canonical_name % $1 AND similarity(canonical_name, $1) > 0.2 \
                 ORDER BY score DESC LIMIT $2",
            )
            .bind::<diesel::sql_types::Text, _>(query)
            .bind::<diesel::sql_types::BigInt, _>(limit)
            .load::<TrgmRow>(&mut *conn)
            .map(|rows| {
                rows.into_iter()
                    .map(|r| (r.id, r.canonical_name, r.entity_type, r.score))
                    .collect()
            });

        match trgm_result {
            Ok(rows) => Ok(rows
                .into_iter()
                .map(|(id, name, entity_type, score)| EntityMatch {
                    id,
                    name,
                    entity_type,
                    score: Some(score),
                })
                .collect()),
            Err(_) => {
                debug!("pg_trgm unavailable, falling back to substring search for '{}'", query);
                let needle = query.to_lowercase();
                let mut rows: Vec<EntityRow> = entities::table
                    .select(EntityRow::as_select())
                    .load(&mut *conn)?
                    .into_iter()
                    .filter(|r| r.canonical_name.to_lowercase().contains(&needle))
                    .collect();
                rows.sort_by_key(|r| r.canonical_name.len());
                rows.truncate(limit.max(0) as usize);
                Ok(rows
                    .into_iter()
                    .map(|r| EntityMatch {
                        id: r.id,
                        name: r.canonical_name,
                        entity_type: r.entity_type,
                        score: None,
                    })
                    .collect())
            }
        }
    }
}

#[derive(diesel::QueryableByName)]
struct TrgmRow {
    #[diesel(sql_type = diesel::sql_types::Text)]
    id: String,
    #[diesel(sql_type = diesel::sql_types::Text)]
    canonical_name: String,
    #[diesel(sql_type = diesel::sql_types::Text)]
    entity_type: String,
    #[diesel(sql_type = diesel::sql_types::Float4)]
    score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_non_alnum_runs() {
        assert_eq!(slug("Artisan AI, Inc."), "artisan_ai_inc");
        assert_eq!(slug("  leading and trailing  "), "leading_and_trailing");
        assert_eq!(slug("Già-è"), "gi");
    }

    #[test]
    fn type_prefix_special_cases() {
        assert_eq!(type_prefix("company"), "cmp");
        assert_eq!(type_prefix("person"), "per");
        assert_eq!(type_prefix("product"), "pro");
    }
}
