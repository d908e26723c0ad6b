//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use agentwing_agent::AgentError;
use agentwing_store::StoreError;

/// An error rendered as `{"error": "..."}` with a status code.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match &err {
            AgentError::SessionNotFound { .. } => Self::not_found("error.sessionNotFound"),
            AgentError::Store(StoreError::NotFound {
                entity: "llm config",
                ..
            }) => Self::not_found("error.configNotFound"),
            AgentError::Store(e) if e.is_not_found() => Self::not_found(e.to_string()),
            AgentError::ValidationError { reason } => Self::bad_request(reason.clone()),
            AgentError::MissingApiKey { .. } | AgentError::ConfigError { .. } => {
                Self::bad_request(err.to_string())
            }
            AgentError::LlmUnavailable => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "error.llmUnavailable")
            }
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        AgentError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
