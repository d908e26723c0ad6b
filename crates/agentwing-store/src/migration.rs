//! Versioned, transactional schema migrations.
//!
//! Each [`Migration`] is applied at most once, inside its own transaction,
//! and recorded in the `_migrations` bookkeeping table.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single schema step.
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations in application order. Versions must strictly increase.
pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "sessions and messages",
        sql: "
            CREATE TABLE sessions (
                id            TEXT PRIMARY KEY,
                title         TEXT NOT NULL DEFAULT '',
                llm_config_id TEXT,
                created_at    INTEGER NOT NULL,
                updated_at    INTEGER NOT NULL
            );

            CREATE TABLE messages (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                id         TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role       TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
                content    TEXT NOT NULL,
                tool_calls TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL
            );

            CREATE INDEX idx_messages_session ON messages(session_id, seq);
            CREATE INDEX idx_sessions_updated ON sessions(updated_at DESC);
        ",
    },
    Migration {
        version: 2,
        description: "llm provider configurations",
        sql: "
            CREATE TABLE llm_configs (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                provider   TEXT NOT NULL,
                api_key    TEXT NOT NULL DEFAULT '',
                model      TEXT NOT NULL,
                base_url   TEXT NOT NULL DEFAULT '',
                is_default INTEGER NOT NULL DEFAULT 0,
                is_active  INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        ",
    },
    Migration {
        version: 3,
        description: "named prompts",
        sql: "
            CREATE TABLE prompts (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                content    TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        ",
    },
];

/// Apply every migration newer than the recorded schema version.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );
    for migration in pending {
        apply(conn, migration)?;
    }
    Ok(())
}

/// Highest applied migration version, or `0` for a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let version: Option<u32> =
        conn.query_row("SELECT MAX(version) FROM _migrations", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })
}

fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    let fail = |stage: &str, e: rusqlite::Error| StoreError::Migration {
        version: migration.version,
        message: format!("{stage}: {e}"),
    };

    // `&Connection` cannot open a `Transaction`, so drive it by hand.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| fail("begin", e))?;

    let result = conn
        .execute_batch(migration.sql)
        .map_err(|e| fail("sql", e))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.description,
                    chrono::Utc::now().timestamp()
                ],
            )
            .map(|_| ())
            .map_err(|e| fail("record", e))
        });

    match result {
        Ok(()) => conn
            .execute_batch("COMMIT;")
            .map_err(|e| fail("commit", e)),
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}
