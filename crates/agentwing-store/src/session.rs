//! Session persistence for chat transcripts.
//!
//! Sessions are created or updated as a whole; messages are append-only and
//! ordered by insertion sequence. Tool calls travel as a JSON array of
//! generic key/value objects so the store never depends on the engine's
//! record types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A persisted conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub title: String,
    /// LLM configuration the session is bound to; `None` means the process
    /// default.
    pub llm_config_id: Option<String>,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub updated_at: i64,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    /// `user`, `assistant` or `system`.
    pub role: String,
    pub content: String,
    /// Tool calls as generic key/value objects, in call order.
    pub tool_calls: Vec<Value>,
    /// Unix milliseconds.
    pub created_at: i64,
}

// ═══════════════════════════════════════════════════════════════════════
//  SessionStore
// ═══════════════════════════════════════════════════════════════════════

/// CRUD over sessions and their messages.
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert the session, or overwrite its title, binding and `updated_at`
    /// if it already exists. `created_at` of an existing row is kept.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub async fn upsert(&self, session: &SessionRecord) -> StoreResult<()> {
        let s = session.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, title, llm_config_id, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(id) DO UPDATE SET \
                        title = excluded.title, \
                        llm_config_id = excluded.llm_config_id, \
                        updated_at = excluded.updated_at",
                    rusqlite::params![s.id, s.title, s.llm_config_id, s.created_at, s.updated_at],
                )?;
                Ok(())
            })
            .await?;
        debug!("session upserted");
        Ok(())
    }

    /// Fetch one session.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<SessionRecord> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "SELECT id, title, llm_config_id, created_at, updated_at \
                     FROM sessions WHERE id = ?1",
                    rusqlite::params![id],
                    row_to_session,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                        entity: "session",
                        id: id.clone(),
                    },
                    other => StoreError::Sqlite(other),
                })
            })
            .await
    }

    /// All sessions, most recently updated first.
    #[instrument(skip(self))]
    pub async fn list(&self) -> StoreResult<Vec<SessionRecord>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, llm_config_id, created_at, updated_at \
                     FROM sessions ORDER BY updated_at DESC, id",
                )?;
                let rows = stmt
                    .query_map([], row_to_session)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Delete a session and, by cascade, its messages.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let affected =
                    conn.execute("DELETE FROM sessions WHERE id = ?1", rusqlite::params![id])?;
                if affected == 0 {
                    return Err(StoreError::NotFound {
                        entity: "session",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Append a message and bump the owning session's `updated_at`.
    ///
    /// Both writes share one transaction.
    #[instrument(skip(self, message), fields(session_id = %message.session_id, message_id = %message.id))]
    pub async fn append_message(&self, message: &MessageRecord) -> StoreResult<()> {
        let m = message.clone();
        let tool_calls = serde_json::to_string(&m.tool_calls)?;
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let touched = tx.execute(
                    "UPDATE sessions SET updated_at = MAX(updated_at, ?2) WHERE id = ?1",
                    rusqlite::params![m.session_id, m.created_at],
                )?;
                if touched == 0 {
                    return Err(StoreError::NotFound {
                        entity: "session",
                        id: m.session_id,
                    });
                }
                tx.execute(
                    "INSERT INTO messages (id, session_id, role, content, tool_calls, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![m.id, m.session_id, m.role, m.content, tool_calls, m.created_at],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        debug!("message appended");
        Ok(())
    }

    /// Messages of a session in append order.
    #[instrument(skip(self))]
    pub async fn messages(&self, session_id: &str) -> StoreResult<Vec<MessageRecord>> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, role, content, tool_calls, created_at \
                     FROM messages WHERE session_id = ?1 ORDER BY seq",
                )?;
                let raw = stmt
                    .query_map(rusqlite::params![session_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                raw.into_iter()
                    .map(|(id, session_id, role, content, tool_calls, created_at)| -> StoreResult<MessageRecord> {
                        Ok(MessageRecord {
                            id,
                            session_id,
                            role,
                            content,
                            tool_calls: serde_json::from_str(&tool_calls)?,
                            created_at,
                        })
                    })
                    .collect()
            })
            .await
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        llm_config_id: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
