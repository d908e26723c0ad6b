//! Persisted LLM provider configurations.
//!
//! At most one active configuration is flagged as the default; the engine
//! resolves its process-wide client from [`LlmConfigStore::default_config`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// One provider/model/credential triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfigRecord {
    pub id: String,
    pub name: String,
    /// Provider key such as `openai`, `anthropic`, `deepseek` or `ollama`.
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    /// Empty means the provider's well-known endpoint.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_true() -> bool {
    true
}

const COLUMNS: &str =
    "id, name, provider, api_key, model, base_url, is_default, is_active, created_at, updated_at";

/// CRUD over `llm_configs`.
#[derive(Clone)]
pub struct LlmConfigStore {
    db: Database,
}

impl LlmConfigStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a configuration. An empty `id` is replaced by a fresh UUID.
    /// If the record is flagged default, every other row loses the flag.
    #[instrument(skip(self, config), fields(provider = %config.provider, model = %config.model))]
    pub async fn create(&self, config: &LlmConfigRecord) -> StoreResult<LlmConfigRecord> {
        let mut c = config.clone();
        if c.id.is_empty() {
            c.id = Uuid::now_v7().to_string();
        }
        let now = Utc::now().timestamp_millis();
        c.created_at = now;
        c.updated_at = now;

        let row = c.clone();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                if row.is_default {
                    tx.execute("UPDATE llm_configs SET is_default = 0", [])?;
                }
                tx.execute(
                    &format!("INSERT INTO llm_configs ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                    rusqlite::params![
                        row.id,
                        row.name,
                        row.provider,
                        row.api_key,
                        row.model,
                        row.base_url,
                        row.is_default,
                        row.is_active,
                        row.created_at,
                        row.updated_at
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        debug!(config_id = %c.id, "llm config created");
        Ok(c)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<LlmConfigRecord> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    &format!("SELECT {COLUMNS} FROM llm_configs WHERE id = ?1"),
                    rusqlite::params![id],
                    row_to_config,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                        entity: "llm config",
                        id: id.clone(),
                    },
                    other => StoreError::Sqlite(other),
                })
            })
            .await
    }

    /// All configurations in creation order.
    #[instrument(skip(self))]
    pub async fn list(&self) -> StoreResult<Vec<LlmConfigRecord>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM llm_configs ORDER BY created_at, id"
                ))?;
                let rows = stmt
                    .query_map([], row_to_config)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Overwrite every mutable field of an existing configuration.
    #[instrument(skip(self, config), fields(config_id = %config.id))]
    pub async fn update(&self, config: &LlmConfigRecord) -> StoreResult<LlmConfigRecord> {
        let mut c = config.clone();
        c.updated_at = Utc::now().timestamp_millis();

        let row = c.clone();
        let created_at = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                if row.is_default {
                    tx.execute(
                        "UPDATE llm_configs SET is_default = 0 WHERE id <> ?1",
                        rusqlite::params![row.id],
                    )?;
                }
                let affected = tx.execute(
                    "UPDATE llm_configs SET name = ?2, provider = ?3, api_key = ?4, model = ?5, \
                     base_url = ?6, is_default = ?7, is_active = ?8, updated_at = ?9 WHERE id = ?1",
                    rusqlite::params![
                        row.id,
                        row.name,
                        row.provider,
                        row.api_key,
                        row.model,
                        row.base_url,
                        row.is_default,
                        row.is_active,
                        row.updated_at
                    ],
                )?;
                if affected == 0 {
                    return Err(StoreError::NotFound {
                        entity: "llm config",
                        id: row.id,
                    });
                }
                let created_at: i64 = tx.query_row(
                    "SELECT created_at FROM llm_configs WHERE id = ?1",
                    rusqlite::params![row.id],
                    |r| r.get(0),
                )?;
                tx.commit()?;
                Ok(created_at)
            })
            .await?;

        c.created_at = created_at;
        Ok(c)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let affected =
                    conn.execute("DELETE FROM llm_configs WHERE id = ?1", rusqlite::params![id])?;
                if affected == 0 {
                    return Err(StoreError::NotFound {
                        entity: "llm config",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Flag `id` as the only default configuration.
    #[instrument(skip(self))]
    pub async fn set_default(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let exists: i64 = tx.query_row(
                    "SELECT count(*) FROM llm_configs WHERE id = ?1",
                    rusqlite::params![id],
                    |r| r.get(0),
                )?;
                if exists == 0 {
                    return Err(StoreError::NotFound {
                        entity: "llm config",
                        id,
                    });
                }
                tx.execute(
                    "UPDATE llm_configs SET is_default = (id = ?1)",
                    rusqlite::params![id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// The active default configuration, otherwise the first active one.
    #[instrument(skip(self))]
    pub async fn default_config(&self) -> StoreResult<Option<LlmConfigRecord>> {
        self.db
            .execute(|conn| {
                let result = conn.query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM llm_configs WHERE is_active = 1 \
                         ORDER BY is_default DESC, created_at, id LIMIT 1"
                    ),
                    [],
                    row_to_config,
                );
                match result {
                    Ok(config) => Ok(Some(config)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }
}

fn row_to_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<LlmConfigRecord> {
    Ok(LlmConfigRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        provider: row.get(2)?,
        api_key: row.get(3)?,
        model: row.get(4)?,
        base_url: row.get(5)?,
        is_default: row.get(6)?,
        is_active: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_store() -> LlmConfigStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        LlmConfigStore::new(db)
    }

    fn config(name: &str, is_default: bool) -> LlmConfigRecord {
        LlmConfigRecord {
            id: String::new(),
            name: name.into(),
            provider: "openai".into(),
            api_key: "sk-test".into(),
            model: "gpt-4o".into(),
            base_url: String::new(),
            is_default,
            is_active: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn create_assigns_id_and_roundtrips() {
        let store = setup_store().await;
        let created = store.create(&config("main", false)).await.unwrap();
        assert!(!created.id.is_empty());

        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn only_one_default_survives() {
        let store = setup_store().await;
        let a = store.create(&config("a", true)).await.unwrap();
        let b = store.create(&config("b", true)).await.unwrap();

        assert!(!store.get(&a.id).await.unwrap().is_default);
        assert!(store.get(&b.id).await.unwrap().is_default);

        store.set_default(&a.id).await.unwrap();
        assert!(store.get(&a.id).await.unwrap().is_default);
        assert!(!store.get(&b.id).await.unwrap().is_default);
    }

    #[tokio::test]
    async fn default_falls_back_to_first_active() {
        let store = setup_store().await;
        assert!(store.default_config().await.unwrap().is_none());

        let mut inactive = config("off", true);
        inactive.is_active = false;
        store.create(&inactive).await.unwrap();
        let first = store.create(&config("first", false)).await.unwrap();
        store.create(&config("second", false)).await.unwrap();

        let chosen = store.default_config().await.unwrap().unwrap();
        assert_eq!(chosen.id, first.id);
    }

    #[tokio::test]
    async fn update_and_delete() {
        let store = setup_store().await;
        let mut c = store.create(&config("x", false)).await.unwrap();
        c.model = "gpt-4o-mini".into();
        let updated = store.update(&c).await.unwrap();
        assert_eq!(updated.created_at, c.created_at);
        assert_eq!(store.get(&c.id).await.unwrap().model, "gpt-4o-mini");

        store.delete(&c.id).await.unwrap();
        assert!(store.get(&c.id).await.unwrap_err().is_not_found());
        assert!(store.set_default(&c.id).await.unwrap_err().is_not_found());
    }
}
