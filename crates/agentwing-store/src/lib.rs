//! # agentwing-store
//!
//! Storage engine for agentwing.
//!
//! Provides SQLite-backed persistence with WAL mode for the chat engine:
//! sessions and their append-only message transcripts, the catalogue of
//! LLM provider configurations, and named system prompts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  SessionStore    (sessions + messages)   │
//! │  LlmConfigStore  (provider configs)      │
//! │  PromptStore     (named prompts)         │
//! ├─────────────────────────────────────────┤
//! │  Database (rusqlite WAL + mmap)          │
//! │  Migrations (versioned, transactional)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use agentwing_store::{Database, SessionStore};
//!
//! let db = Database::open_and_migrate("data/agentwing.db").await?;
//! let sessions = SessionStore::new(db.clone());
//! ```

pub mod db;
pub mod error;
pub mod llm_config;
pub mod migration;
pub mod prompt;
pub mod session;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use llm_config::{LlmConfigRecord, LlmConfigStore};
pub use prompt::{PromptRecord, PromptStore};
pub use session::{MessageRecord, SessionRecord, SessionStore};
