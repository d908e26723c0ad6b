//! REST and SSE route handlers.
//!
//! Handlers translate HTTP into [`SessionEngine`](agentwing_agent::SessionEngine)
//! calls. Errors become `{"error": ...}` bodies through [`ApiError`]; the
//! well-known failures use message keys (`error.sessionNotFound`,
//! `error.messageEmpty`, ...) that a frontend can translate.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use agentwing_agent::{ChatSession, StreamChunk, provider_info};
use agentwing_agent::llm::validate_config;
use agentwing_store::LlmConfigRecord;

use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// Buffered chunks per streaming turn before the engine waits on the client.
const STREAM_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// GET /api/status
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub session_count: usize,
    pub tool_count: usize,
    pub llm: Option<String>,
}

/// Basic liveness and configuration summary.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let llm = state.engine.current_llm().map(|c| provider_info(&c));
    Json(StatusResponse {
        status: if llm.is_some() { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        session_count: state.engine.list_sessions().len(),
        tool_count: state.engine.tools().len(),
        llm,
    })
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Listing entry; the full transcript is only returned by `GET /api/sessions/{id}`.
#[derive(Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub llm_config_id: Option<String>,
    pub message_count: usize,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&ChatSession> for SessionSummary {
    fn from(session: &ChatSession) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title(),
            llm_config_id: session.llm_config_id.clone(),
            message_count: session.messages.len(),
            created_at: session.created_at.to_rfc3339(),
            updated_at: session.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Deserialize, Default)]
pub struct CreateSessionBody {
    /// Empty or missing means the process default.
    #[serde(default)]
    pub llm_config_id: Option<String>,
    /// Caller-chosen id; a fresh UUID when absent.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// POST /api/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateSessionBody>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let session = match body.session_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => {
            state
                .engine
                .create_session_with_id(id, body.llm_config_id)
                .await?
        }
        None => state.engine.create_session(body.llm_config_id).await?,
    };
    Ok((StatusCode::CREATED, Json(json!({ "session": session }))))
}

/// GET /api/sessions
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sessions: Vec<SessionSummary> = state
        .engine
        .list_sessions()
        .iter()
        .map(SessionSummary::from)
        .collect();
    Json(json!({ "count": sessions.len(), "sessions": sessions }))
}

/// GET /api/sessions/{id}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.engine.get_session(&id)?;
    Ok(Json(json!({ "session": session })))
}

/// DELETE /api/sessions/{id}
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.engine.delete_session(&id).await?;
    Ok(Json(json!({ "message": "agent.sessionDeleted" })))
}

#[derive(Deserialize)]
pub struct SessionLlmBody {
    #[serde(default)]
    pub llm_config_id: Option<String>,
}

/// PUT /api/sessions/{id}/llm-config
pub async fn set_session_llm_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SessionLlmBody>,
) -> ApiResult<Json<Value>> {
    let session = state
        .engine
        .set_session_llm_config(&id, body.llm_config_id)
        .await?;
    Ok(Json(json!({ "session": SessionSummary::from(&session) })))
}

// ---------------------------------------------------------------------------
// POST /api/sessions/{id}/messages (SSE)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SendMessageBody {
    pub message: String,
}

/// Stream one turn as Server-Sent Events.
///
/// The turn runs on its own task. Each [`StreamChunk`] becomes one `data:`
/// frame; the stream ends after the terminal `done` or `error` chunk. If the
/// client disconnects, the response stream is dropped and its guard cancels
/// the turn.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<Response> {
    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("error.messageEmpty"));
    }
    state.engine.get_session(&id)?;

    let (tx, rx) = mpsc::channel::<StreamChunk>(STREAM_BUFFER);
    let cancel = CancellationToken::new();
    let engine = Arc::clone(&state.engine);
    let token = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.send_message(&id, &body.message, token, tx).await {
            tracing::debug!(session_id = %id, error = %e, "streamed turn ended with error");
        }
    });

    let guard = cancel.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |chunk| {
        let _live = &guard;
        Ok::<_, Infallible>(sse_event(&chunk))
    });

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    response.headers_mut().insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    Ok(response)
}

fn sse_event(chunk: &StreamChunk) -> Event {
    match serde_json::to_string(chunk) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode stream chunk");
            Event::default().data(json!({ "type": "error", "error": e.to_string() }).to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Process-default LLM
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SetLlmBody {
    pub config_id: String,
}

/// POST /api/llm/config
pub async fn set_llm_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetLlmBody>,
) -> ApiResult<Json<Value>> {
    if body.config_id.trim().is_empty() {
        return Err(ApiError::bad_request("error.configIdEmpty"));
    }
    let record = state.engine.set_llm_config(&body.config_id).await?;
    Ok(Json(json!({
        "message": "agent.llmConfigSet",
        "config": provider_info(&record),
    })))
}

/// POST /api/llm/reload
pub async fn reload_llm(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let record = state.engine.reload_llm().await?;
    Ok(Json(json!({
        "message": "agent.llmConfigReloaded",
        "config": provider_info(&record),
    })))
}

/// GET /api/llm/current
pub async fn current_llm(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.engine.current_llm() {
        Some(record) => Json(json!({
            "configured": true,
            "config": LlmConfigView::from(record),
        })),
        None => Json(json!({ "configured": false })),
    }
}

// ---------------------------------------------------------------------------
// LLM configuration CRUD
// ---------------------------------------------------------------------------

/// A stored configuration with its API key masked.
#[derive(Serialize)]
pub struct LlmConfigView {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    pub is_default: bool,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<LlmConfigRecord> for LlmConfigView {
    fn from(record: LlmConfigRecord) -> Self {
        Self {
            api_key: mask_key(&record.api_key),
            id: record.id,
            name: record.name,
            provider: record.provider,
            model: record.model,
            base_url: record.base_url,
            is_default: record.is_default,
            is_active: record.is_active,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Keep the last four characters of long keys, hide short ones entirely.
pub fn mask_key(key: &str) -> String {
    let count = key.chars().count();
    if count == 0 {
        return String::new();
    }
    if count <= 8 {
        return "****".into();
    }
    let tail: String = key.chars().skip(count - 4).collect();
    format!("****{tail}")
}

#[derive(Deserialize)]
pub struct LlmConfigBody {
    #[serde(default)]
    pub name: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl LlmConfigBody {
    fn into_record(self, id: String) -> LlmConfigRecord {
        let provider = self.provider.trim().to_lowercase();
        let model = self.model.trim().to_owned();
        let name = match self.name.trim() {
            "" => format!("{provider} {model}"),
            name => name.to_owned(),
        };
        LlmConfigRecord {
            id,
            name,
            provider,
            api_key: self.api_key.trim().to_owned(),
            model,
            base_url: self.base_url.trim().to_owned(),
            is_default: self.is_default,
            is_active: self.is_active,
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// GET /api/llm-configs
pub async fn list_llm_configs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let configs: Vec<LlmConfigView> = state
        .engine
        .llm_configs()
        .list()
        .await?
        .into_iter()
        .map(LlmConfigView::from)
        .collect();
    Ok(Json(json!({ "count": configs.len(), "configs": configs })))
}

/// POST /api/llm-configs
pub async fn create_llm_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LlmConfigBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let record = body.into_record(String::new());
    validate_config(&record)?;
    let created = state.engine.llm_configs().create(&record).await?;
    tracing::info!(config_id = %created.id, config = %provider_info(&created), "llm config created");
    refresh_default(&state, created.is_default || state.engine.current_llm().is_none()).await;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "config": LlmConfigView::from(created) })),
    ))
}

/// GET /api/llm-configs/{id}
pub async fn get_llm_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = state.engine.llm_configs().get(&id).await?;
    Ok(Json(json!({ "config": LlmConfigView::from(record) })))
}

/// PUT /api/llm-configs/{id}
///
/// An empty `api_key` keeps the stored key.
pub async fn update_llm_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<LlmConfigBody>,
) -> ApiResult<Json<Value>> {
    let existing = state.engine.llm_configs().get(&id).await?;
    let mut record = body.into_record(id.clone());
    if record.api_key.is_empty() {
        record.api_key = existing.api_key;
    }
    validate_config(&record)?;
    let updated = state.engine.llm_configs().update(&record).await?;
    refresh_default(&state, updated.is_default || is_current(&state, &id)).await;
    Ok(Json(json!({ "config": LlmConfigView::from(updated) })))
}

/// DELETE /api/llm-configs/{id}
pub async fn delete_llm_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let was_current = is_current(&state, &id);
    state.engine.llm_configs().delete(&id).await?;
    refresh_default(&state, was_current).await;
    Ok(Json(json!({ "message": "agent.llmConfigDeleted" })))
}

/// POST /api/llm-configs/{id}/default
pub async fn set_default_llm_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.engine.llm_configs().set_default(&id).await?;
    let record = state.engine.reload_llm().await?;
    Ok(Json(json!({
        "message": "agent.llmConfigSet",
        "config": provider_info(&record),
    })))
}

fn is_current(state: &AppState, id: &str) -> bool {
    state
        .engine
        .current_llm()
        .is_some_and(|current| current.id == id)
}

/// Re-select the process default after a store change that may affect it.
async fn refresh_default(state: &AppState, needed: bool) {
    if !needed {
        return;
    }
    if let Err(e) = state.engine.reload_llm().await {
        tracing::warn!(error = %e, "default LLM not reloaded");
    }
}

// ---------------------------------------------------------------------------
// GET /api/tools/status
// ---------------------------------------------------------------------------

pub async fn tool_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.tool_status())
}
