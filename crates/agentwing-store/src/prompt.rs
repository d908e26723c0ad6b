//! Named prompt storage. The engine reads its agent system prompt from here.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub id: String,
    pub name: String,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct PromptStore {
    db: Database,
}

impl PromptStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetch a prompt, `None` if absent.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<Option<PromptRecord>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT id, name, content, created_at, updated_at FROM prompts WHERE id = ?1",
                    rusqlite::params![id],
                    row_to_prompt,
                );
                match result {
                    Ok(p) => Ok(Some(p)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Create or replace the prompt stored under `id`.
    #[instrument(skip(self, content))]
    pub async fn upsert(&self, id: &str, name: &str, content: &str) -> StoreResult<PromptRecord> {
        if id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("prompt id must not be empty".into()));
        }
        let (id, name, content) = (id.to_string(), name.to_string(), content.to_string());
        let now = Utc::now().timestamp_millis();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO prompts (id, name, content, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?4) \
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, \
                        content = excluded.content, updated_at = excluded.updated_at",
                    rusqlite::params![id, name, content, now],
                )?;
                conn.query_row(
                    "SELECT id, name, content, created_at, updated_at FROM prompts WHERE id = ?1",
                    rusqlite::params![id],
                    row_to_prompt,
                )
                .map_err(StoreError::from)
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> StoreResult<Vec<PromptRecord>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, content, created_at, updated_at FROM prompts ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], row_to_prompt)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                match conn.execute("DELETE FROM prompts WHERE id = ?1", rusqlite::params![id])? {
                    0 => Err(StoreError::NotFound { entity: "prompt", id }),
                    _ => Ok(()),
                }
            })
            .await
    }
}

fn row_to_prompt(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromptRecord> {
    Ok(PromptRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        content: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}
