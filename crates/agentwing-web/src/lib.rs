//! Web interface for agentwing.
//!
//! An axum server exposing the session engine over HTTP:
//!
//! - Session CRUD under `/api/sessions`.
//! - `POST /api/sessions/{id}/messages` streams one turn as Server-Sent
//!   Events, one JSON [`StreamChunk`](agentwing_agent::StreamChunk) per
//!   `data:` frame. Dropping the connection cancels the turn.
//! - LLM configuration CRUD plus process-default set/reload under
//!   `/api/llm-configs` and `/api/llm`.
//! - Tool status at `/api/tools/status`.

pub mod api;
pub mod error;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use server::WebServer;
pub use state::AppState;

/// Web server configuration.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// The address to bind the HTTP server to.
    pub bind_addr: String,
    /// The port to listen on.
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 3000,
        }
    }
}
