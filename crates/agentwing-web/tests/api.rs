//! End-to-end tests for the HTTP API.
//!
//! These tests spin up the **real** Axum router on an OS-assigned ephemeral
//! port over an in-memory database and a scripted LLM backend, then make
//! actual HTTP requests via `reqwest`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use agentwing_agent::classifier::EVALUATOR_SYSTEM_PROMPT;
use agentwing_agent::{
    AgentError, BackendFactory, ChatRequest, EngineConfig, LlmBackend, LlmResponse, Result,
    SessionEngine, ToolAdapter, ToolCall, ToolDefinition, ToolRegistry,
};
use agentwing_store::{Database, LlmConfigRecord, LlmConfigStore};
use agentwing_web::{AppState, WebConfig, server};

// ── helpers ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    eval: Mutex<VecDeque<String>>,
    worker: Mutex<VecDeque<LlmResponse>>,
}

#[async_trait]
impl LlmBackend for Script {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn generate_with_tools(&self, request: &ChatRequest) -> Result<LlmResponse> {
        let is_eval = request
            .messages
            .first()
            .is_some_and(|m| m.content == EVALUATOR_SYSTEM_PROMPT);
        if is_eval {
            let raw = self.eval.lock().unwrap().pop_front().unwrap_or_default();
            return Ok(LlmResponse::Text(raw));
        }
        self.worker
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::LlmRequestFailed {
                reason: "worker script exhausted".into(),
            })
    }
}

struct Factory(Arc<Script>);

impl BackendFactory for Factory {
    fn build(&self, _record: &LlmConfigRecord) -> Result<Arc<dyn LlmBackend>> {
        Ok(self.0.clone())
    }
}

struct Weather;

#[async_trait]
impl ToolAdapter for Weather {
    fn adapter_id(&self) -> &str {
        "weather"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "get_weather".into(),
            description: "Current weather for a city".into(),
            input_schema: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        }]
    }

    async fn execute(&self, _tool_name: &str, arguments: Value) -> Result<String> {
        Ok(format!("Sunny in {}", arguments["city"].as_str().unwrap_or("?")))
    }
}

struct TestServer {
    base: String,
    script: Arc<Script>,
    client: reqwest::Client,
    _handle: tokio::task::JoinHandle<()>,
}

/// Bind to 127.0.0.1:0, start the router, return the running server.
async fn start_test_server(with_llm: bool) -> TestServer {
    let db = Database::open_in_memory().expect("open db");
    db.run_migrations().await.expect("migrate");
    if with_llm {
        LlmConfigStore::new(db.clone())
            .create(&LlmConfigRecord {
                id: "cfg-default".into(),
                name: "default".into(),
                provider: "openai".into(),
                api_key: "sk-test-1234567890".into(),
                model: "gpt-4o".into(),
                base_url: String::new(),
                is_default: true,
                is_active: true,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .expect("seed config");
    }

    let script = Arc::new(Script::default());
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(Weather));
    let engine = SessionEngine::new(
        db,
        tools,
        Arc::new(Factory(script.clone())),
        EngineConfig::default(),
    )
    .await
    .expect("engine");
    let state = Arc::new(AppState::new(Arc::new(engine), WebConfig::default()));
    let app = server::router(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to port 0");
    let addr: SocketAddr = listener.local_addr().expect("get local addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    TestServer {
        base: format!("http://127.0.0.1:{}", addr.port()),
        script,
        client: reqwest::Client::new(),
        _handle: handle,
    }
}

impl TestServer {
    async fn create_session(&self) -> String {
        let resp = self
            .client
            .post(format!("{}/api/sessions", self.base))
            .json(&json!({}))
            .send()
            .await
            .expect("request failed");
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.expect("invalid JSON");
        body["session"]["id"].as_str().expect("session id").to_owned()
    }

    /// Send a message and collect every SSE `data:` frame as JSON.
    async fn stream(&self, session_id: &str, message: &str) -> (reqwest::StatusCode, Vec<Value>) {
        let resp = self
            .client
            .post(format!("{}/api/sessions/{session_id}/messages", self.base))
            .json(&json!({ "message": message }))
            .send()
            .await
            .expect("request failed");
        let status = resp.status();
        let body = resp.text().await.expect("read body");
        let frames = body
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| serde_json::from_str(data.trim()).expect("frame is JSON"))
            .collect();
        (status, frames)
    }
}

// ── sessions ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn session_crud_round_trip() {
    let srv = start_test_server(true).await;
    let id = srv.create_session().await;

    let list: Value = srv
        .client
        .get(format!("{}/api/sessions", srv.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);
    assert_eq!(list["sessions"][0]["id"], id.as_str());

    let resp = srv
        .client
        .get(format!("{}/api/sessions/{id}", srv.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let got: Value = resp.json().await.unwrap();
    assert_eq!(got["session"]["messages"], json!([]));

    let resp = srv
        .client
        .delete(format!("{}/api/sessions/{id}", srv.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "agent.sessionDeleted");

    let resp = srv
        .client
        .get(format!("{}/api/sessions/{id}", srv.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "error.sessionNotFound");
}

#[tokio::test]
async fn binding_unknown_config_is_not_found() {
    let srv = start_test_server(true).await;
    let id = srv.create_session().await;
    let resp = srv
        .client
        .put(format!("{}/api/sessions/{id}/llm-config", srv.base))
        .json(&json!({ "llm_config_id": "missing" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "error.configNotFound");
}

// ── streaming ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn direct_answer_streams_message_frames_then_done() {
    let srv = start_test_server(true).await;
    srv.script.eval.lock().unwrap().push_back(
        r#"{"need_tools": false, "complex_mode": "none", "reasoning": "greeting", "direct_response": "Bonjour, je vais vous aider."}"#.into(),
    );
    let id = srv.create_session().await;

    let (status, frames) = srv.stream(&id, "Bonjour").await;
    assert_eq!(status, 200);
    let (last, body) = frames.split_last().expect("frames");
    assert_eq!(last["type"], "done");
    assert!(body.iter().all(|f| f["type"] == "message"));
    let text: String = body
        .iter()
        .map(|f| f["content"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(text, "Bonjour, je vais vous aider.");
    assert_eq!(body[0]["message_id"], last["message_id"]);
}

#[tokio::test]
async fn tool_turn_streams_tool_call_frames() {
    let srv = start_test_server(true).await;
    srv.script.eval.lock().unwrap().push_back(
        r#"{"need_tools": true, "complex_mode": "simple", "reasoning": "weather"}"#.into(),
    );
    {
        let mut worker = srv.script.worker.lock().unwrap();
        worker.push_back(LlmResponse::ToolCalls(vec![ToolCall {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: json!({"city": "Lyon", "instructions": "Checking Lyon"}),
        }]));
        worker.push_back(LlmResponse::Text("Sunny in Lyon.".into()));
    }
    let id = srv.create_session().await;

    let (_, frames) = srv.stream(&id, "Weather in Lyon?").await;
    let types: Vec<&str> = frames.iter().filter_map(|f| f["type"].as_str()).collect();
    assert_eq!(types, ["message", "tool_call", "tool_call", "message", "done"]);
    assert_eq!(frames[1]["tool_call"]["status"], "calling");
    assert_eq!(frames[2]["tool_call"]["status"], "success");
    assert_eq!(frames[2]["tool_call"]["result"], "Sunny in Lyon");
    assert_eq!(frames[2]["tool_call"]["instructions"], "Checking Lyon");
    assert_eq!(frames[2]["tool_call"]["arguments"], json!({"city": "Lyon"}));

    let got: Value = srv
        .client
        .get(format!("{}/api/sessions/{id}", srv.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = got["session"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["content"], "Sunny in Lyon.");
    assert_eq!(messages[1]["tool_calls"][0]["tool_name"], "get_weather");
}

#[tokio::test]
async fn upstream_failure_ends_with_error_frame() {
    let srv = start_test_server(true).await;
    srv.script.eval.lock().unwrap().push_back(
        r#"{"need_tools": true, "complex_mode": "medium", "reasoning": "x"}"#.into(),
    );
    let id = srv.create_session().await;

    let (status, frames) = srv.stream(&id, "do something").await;
    assert_eq!(status, 200);
    let last = frames.last().expect("frames");
    assert_eq!(last["type"], "error");
    assert!(last["error"].as_str().unwrap().contains("worker script exhausted"));
    assert!(frames.iter().all(|f| f["type"] != "done"));
}

#[tokio::test]
async fn empty_message_and_unknown_session_are_rejected() {
    let srv = start_test_server(true).await;
    let id = srv.create_session().await;

    let resp = srv
        .client
        .post(format!("{}/api/sessions/{id}/messages", srv.base))
        .json(&json!({ "message": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "error.messageEmpty");

    let resp = srv
        .client
        .post(format!("{}/api/sessions/nope/messages", srv.base))
        .json(&json!({ "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

// ── LLM configuration ────────────────────────────────────────────────────────

#[tokio::test]
async fn llm_config_lifecycle() {
    let srv = start_test_server(false).await;

    let status: Value = srv
        .client
        .get(format!("{}/api/status", srv.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "degraded");

    let resp = srv
        .client
        .post(format!("{}/api/llm/reload", srv.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    let resp = srv
        .client
        .post(format!("{}/api/llm-configs", srv.base))
        .json(&json!({ "provider": "openai", "model": "" , "api_key": "sk-x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = srv
        .client
        .post(format!("{}/api/llm-configs", srv.base))
        .json(&json!({
            "name": "Local",
            "provider": "ollama",
            "model": "llama3.1"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    let config_id = created["config"]["id"].as_str().unwrap().to_owned();

    // The first config becomes the process default.
    let current: Value = srv
        .client
        .get(format!("{}/api/llm/current", srv.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(current["configured"], true);
    assert_eq!(current["config"]["id"], config_id.as_str());

    let resp = srv
        .client
        .post(format!("{}/api/llm/config", srv.base))
        .json(&json!({ "config_id": config_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "agent.llmConfigSet");
    assert!(body["config"].as_str().unwrap().starts_with("ollama (llama3.1)"));

    let resp = srv
        .client
        .post(format!("{}/api/llm/config", srv.base))
        .json(&json!({ "config_id": "missing" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "error.configNotFound");

    let resp = srv
        .client
        .post(format!("{}/api/llm/reload", srv.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "agent.llmConfigReloaded");
}

#[tokio::test]
async fn config_listing_masks_api_keys() {
    let srv = start_test_server(true).await;
    let list: Value = srv
        .client
        .get(format!("{}/api/llm-configs", srv.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);
    assert_eq!(list["configs"][0]["api_key"], "****7890");

    let resp = srv
        .client
        .put(format!("{}/api/llm-configs/cfg-default", srv.base))
        .json(&json!({ "provider": "openai", "model": "gpt-4o-mini", "is_default": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let updated: Value = resp.json().await.unwrap();
    assert_eq!(updated["config"]["model"], "gpt-4o-mini");
    assert_eq!(updated["config"]["api_key"], "****7890");
}

// ── tools ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn tool_status_reports_registered_tools() {
    let srv = start_test_server(true).await;
    let body: Value = srv
        .client
        .get(format!("{}/api/tools/status", srv.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["tools"], json!(["get_weather"]));
}
