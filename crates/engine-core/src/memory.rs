//! Long-Term Memory (C4) — durable per-user bullet-point facts, deduplicated.

use crate::models::MemoryEntry;
use crate::schema::user_memory;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("lock poisoned")]
    LockPoisoned,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = user_memory)]
struct MemoryRow {
    id: Uuid,
    username: String,
    text: String,
    tags: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<MemoryRow> for MemoryEntry {
    fn from(row: MemoryRow) -> Self {
        let tags = row
            .tags
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        MemoryEntry {
            id: row.id,
            username: row.username,
            text: row.text,
            tags,
            created_at: row.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = user_memory)]
struct NewMemory<'a> {
    id: Uuid,
    username: &'a str,
    text: &'a str,
    tags: serde_json::Value,
}

pub struct LongTermMemory {
    conn: Mutex<PgConnection>,
}

const MAX_RETURNED: i64 = 200;

impl LongTermMemory {
    pub fn new(database_url: &str) -> Result<Self, MemoryError> {
        let conn = PgConnection::establish(database_url)
            .map_err(|e| MemoryError::Database(diesel::result::Error::QueryBuilderError(e.into())))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PgConnection>, MemoryError> {
        self.conn.lock().map_err(|_| MemoryError::LockPoisoned)
    }

    /// Upserts on (username, text); on conflict refreshes `created_at` so
    /// repeated observations bubble a memory back to the top of recency.
    pub fn add(&self, username: &str, text: &str, tags: &[String]) -> Result<Uuid, MemoryError> {
        let id = Uuid::new_v4();
        let tags_json = serde_json::to_value(tags).unwrap_or_else(|_| serde_json::json!([]));
        let new_entry = NewMemory {
            id,
            username,
            text,
            tags: tags_json.clone(),
        };

        let mut conn = self.lock()?;
        diesel::insert_into(user_memory::table)
            .values(&new_entry)
            .on_conflict((user_memory::username, user_memory::text))
            .do_update()
            .set((
                user_memory::created_at.eq(diesel::dsl::now),
                user_memory::tags.eq(tags_json),
            ))
            .execute(&mut *conn)?;

        let row: MemoryRow = user_memory::table
            .filter(user_memory::username.eq(username))
            .filter(user_memory::text.eq(text))
            .select(MemoryRow::as_select())
            .first(&mut *conn)?;

        Ok(row.id)
    }

    pub fn get(&self, username: &str) -> Result<Vec<MemoryEntry>, MemoryError> {
        let mut conn = self.lock()?;
        let rows: Vec<MemoryRow> = user_memory::table
            .filter(user_memory::username.eq(username))
            .order(user_memory::created_at.desc())
            .limit(MAX_RETURNED)
            .select(MemoryRow::as_select())
            .load(&mut *conn)?;
        Ok(rows.into_iter().map(MemoryEntry::from).collect())
    }
}
