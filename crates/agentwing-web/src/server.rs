//! Router composition and startup.
//!
//! [`WebServer`] registers every route over a shared [`AppState`] and runs
//! the HTTP listener until Ctrl-C.

use std::sync::Arc;

use axum::Router;
use axum::http::Method;
use axum::routing::{get, post, put};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use agentwing_agent::SessionEngine;

use crate::WebConfig;
use crate::api;
use crate::state::AppState;

/// The agentwing web server.
pub struct WebServer {
    config: WebConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: WebConfig, engine: Arc<SessionEngine>) -> Self {
        let state = Arc::new(AppState::new(engine, config.clone()));
        Self { config, state }
    }

    /// Return the `host:port` string this server will bind to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.bind_addr, self.config.port)
    }

    /// The Axum router with all routes registered.
    pub fn router(&self) -> Router {
        router(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until Ctrl-C.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot be bound.
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = self.addr();
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "starting web server");
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        tracing::info!("web server stopped");
        Ok(())
    }
}

/// Build the router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(api::status))
        // Sessions.
        .route(
            "/api/sessions",
            get(api::list_sessions).post(api::create_session),
        )
        .route(
            "/api/sessions/{id}",
            get(api::get_session).delete(api::delete_session),
        )
        .route("/api/sessions/{id}/messages", post(api::send_message))
        .route(
            "/api/sessions/{id}/llm-config",
            put(api::set_session_llm_config),
        )
        // Process-default LLM.
        .route("/api/llm/config", post(api::set_llm_config))
        .route("/api/llm/reload", post(api::reload_llm))
        .route("/api/llm/current", get(api::current_llm))
        // Stored LLM configurations.
        .route(
            "/api/llm-configs",
            get(api::list_llm_configs).post(api::create_llm_config),
        )
        .route(
            "/api/llm-configs/{id}",
            get(api::get_llm_config)
                .put(api::update_llm_config)
                .delete(api::delete_llm_config),
        )
        .route(
            "/api/llm-configs/{id}/default",
            post(api::set_default_llm_config),
        )
        // Tools.
        .route("/api/tools/status", get(api::tool_status))
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
