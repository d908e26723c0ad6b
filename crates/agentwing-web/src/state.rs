//! Shared application state for the web server.
//!
//! [`AppState`] is wrapped in an `Arc` and shared across all request
//! handlers. The engine owns sessions, agent pools and the stores; the
//! handlers only translate HTTP to engine calls.

use std::sync::Arc;
use std::time::Instant;

use agentwing_agent::SessionEngine;

use crate::WebConfig;

/// Shared state accessible from every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// Session engine driving every turn.
    pub engine: Arc<SessionEngine>,

    /// Web server configuration.
    pub config: WebConfig,

    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<SessionEngine>, config: WebConfig) -> Self {
        Self {
            engine,
            config,
            started_at: Instant::now(),
        }
    }
}
