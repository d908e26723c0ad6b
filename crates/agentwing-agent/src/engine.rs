//! The session engine.
//!
//! [`SessionEngine`] owns every chat session, the per-session agent pool and
//! the process-wide default LLM backend. [`SessionEngine::send_message`]
//! runs one user turn end to end: persist the user message, make sure the
//! session's agents exist, classify, drive the chosen path through the
//! reconciler, then persist the assistant message and emit `done`.
//!
//! Persistence is best effort throughout. Store failures are logged and the
//! live stream carries on.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use agentwing_store::{Database, LlmConfigRecord, LlmConfigStore, PromptStore, SessionStore};

use crate::classifier::{EVALUATOR_SYSTEM_PROMPT, Tier};
use crate::conversation::DEFAULT_MEMORY_WINDOW;
use crate::error::{AgentError, Result};
use crate::events::StreamChunk;
use crate::llm::{BackendFactory, LlmBackend, provider_info};
use crate::pool::{AgentInstances, AgentPool};
use crate::reconciler::{Pacing, TurnMachine, TurnPlan, TurnState, emit, execute_turn};
use crate::runtime::Agent;
use crate::session::{ChatMessage, ChatSession, MessageRole};
use crate::tools::ToolRegistry;

/// Prompt-store id of the worker agents' system prompt.
pub const SYSTEM_PROMPT_ID: &str = "system-ai-agent";

/// Used when the prompt store has no system prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant with access to various \
tools. When users ask questions or make requests, you should:\n\n\
1. Analyze if any of your available tools can help answer the question\n\
2. Use the appropriate tools to gather information\n\
3. Provide a comprehensive answer based on the tool results\n\n\
Always prefer using tools over making up information. If you have a tool that can help, use it. \
Respond in the same language as the user's message.";

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub simple_iterations: u32,
    pub medium_iterations: u32,
    pub complex_iterations: u32,
    pub eval_iterations: u32,
    /// Pacing of the direct-response fast path.
    pub pacing: Pacing,
    /// Messages each agent keeps per conversation.
    pub memory_window: usize,
    /// Sessions whose id starts with this are never persisted or listed.
    pub ephemeral_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            simple_iterations: 3,
            medium_iterations: 7,
            complex_iterations: 12,
            eval_iterations: 1,
            pacing: Pacing::default(),
            memory_window: DEFAULT_MEMORY_WINDOW,
            ephemeral_prefix: "ai_control_".into(),
        }
    }
}

impl EngineConfig {
    pub fn iterations(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Simple => self.simple_iterations,
            Tier::Medium => self.medium_iterations,
            Tier::Complex => self.complex_iterations,
            Tier::Eval => self.eval_iterations,
        }
    }
}

/// Registered tools, as reported by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub tools: Vec<String>,
    pub count: usize,
}

struct DefaultLlm {
    record: LlmConfigRecord,
    backend: Arc<dyn LlmBackend>,
}

/// Owns sessions, agent pools and the default LLM.
pub struct SessionEngine {
    sessions: RwLock<HashMap<String, ChatSession>>,
    pool: AgentPool,
    run_locks: RwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
    default_llm: RwLock<Option<DefaultLlm>>,
    tools: Arc<ToolRegistry>,
    factory: Arc<dyn BackendFactory>,
    session_store: SessionStore,
    config_store: LlmConfigStore,
    prompt_store: PromptStore,
    config: EngineConfig,
}

fn poisoned() -> AgentError {
    AgentError::Internal("session engine lock poisoned".into())
}

impl SessionEngine {
    /// Build the engine, load persisted sessions and install the default
    /// LLM if one is configured.
    pub async fn new(
        db: Database,
        tools: ToolRegistry,
        factory: Arc<dyn BackendFactory>,
        config: EngineConfig,
    ) -> Result<Self> {
        let engine = Self {
            sessions: RwLock::new(HashMap::new()),
            pool: AgentPool::new(),
            run_locks: RwLock::new(HashMap::new()),
            default_llm: RwLock::new(None),
            tools: Arc::new(tools),
            factory,
            session_store: SessionStore::new(db.clone()),
            config_store: LlmConfigStore::new(db.clone()),
            prompt_store: PromptStore::new(db),
            config,
        };

        engine.load_sessions().await?;
        match engine.reload_llm().await {
            Ok(record) => tracing::info!(config = %provider_info(&record), "default LLM loaded"),
            Err(e) => tracing::warn!(error = %e, "no default LLM configured yet"),
        }
        Ok(engine)
    }

    async fn load_sessions(&self) -> Result<()> {
        let records = self.session_store.list().await?;
        let mut loaded = HashMap::with_capacity(records.len());
        for record in records {
            let messages = match self.session_store.messages(&record.id).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(session_id = %record.id, error = %e, "failed to load session messages");
                    Vec::new()
                }
            };
            loaded.insert(record.id.clone(), ChatSession::from_record(&record, &messages));
        }
        tracing::info!(count = loaded.len(), "sessions loaded");
        *self.sessions.write().map_err(|_| poisoned())? = loaded;
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &AgentPool {
        &self.pool
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn llm_configs(&self) -> &LlmConfigStore {
        &self.config_store
    }

    pub fn prompts(&self) -> &PromptStore {
        &self.prompt_store
    }

    fn is_ephemeral(&self, session_id: &str) -> bool {
        session_id.starts_with(&self.config.ephemeral_prefix)
    }

    // -- Sessions ----------------------------------------------------------

    /// Create a session bound to `llm_config_id` (`None` or empty: default).
    pub async fn create_session(&self, llm_config_id: Option<String>) -> Result<ChatSession> {
        self.create_session_with_id(uuid::Uuid::now_v7().to_string(), llm_config_id)
            .await
    }

    /// Create a session under a caller-chosen id, or return the existing one.
    /// Ids with the ephemeral prefix stay in memory only.
    pub async fn create_session_with_id(
        &self,
        session_id: String,
        llm_config_id: Option<String>,
    ) -> Result<ChatSession> {
        if session_id.trim().is_empty() {
            return Err(AgentError::ValidationError {
                reason: "session id cannot be empty".into(),
            });
        }
        let session = {
            let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
            if let Some(existing) = sessions.get(&session_id) {
                return Ok(existing.clone());
            }
            let session = ChatSession::new(session_id.clone(), llm_config_id);
            sessions.insert(session_id, session.clone());
            session
        };

        if !self.is_ephemeral(&session.id)
            && let Err(e) = self.session_store.upsert(&session.to_record()).await
        {
            tracing::warn!(session_id = %session.id, error = %e, "failed to persist session");
        }
        tracing::info!(session_id = %session.id, llm_config_id = ?session.llm_config_id, "session created");
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Result<ChatSession> {
        self.sessions
            .read()
            .map_err(|_| poisoned())?
            .get(session_id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound {
                session_id: session_id.to_owned(),
            })
    }

    /// Persistent sessions, most recently updated first.
    pub fn list_sessions(&self) -> Vec<ChatSession> {
        let Ok(sessions) = self.sessions.read() else {
            return Vec::new();
        };
        let mut list: Vec<ChatSession> = sessions
            .values()
            .filter(|s| !self.is_ephemeral(&s.id))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Remove a session with its agents, run lock and stored transcript.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let removed = self
            .sessions
            .write()
            .map_err(|_| poisoned())?
            .remove(session_id);
        if removed.is_none() {
            return Err(AgentError::SessionNotFound {
                session_id: session_id.to_owned(),
            });
        }
        self.pool.invalidate(session_id);
        if let Ok(mut locks) = self.run_locks.write() {
            locks.remove(session_id);
        }

        if !self.is_ephemeral(session_id)
            && let Err(e) = self.session_store.delete(session_id).await
            && !e.is_not_found()
        {
            tracing::warn!(session_id, error = %e, "failed to delete stored session");
        }
        tracing::info!(session_id, "session deleted");
        Ok(())
    }

    /// Rebind a session to another LLM configuration (`None`: default).
    /// Its agents are rebuilt on the next turn.
    pub async fn set_session_llm_config(
        &self,
        session_id: &str,
        llm_config_id: Option<String>,
    ) -> Result<ChatSession> {
        let llm_config_id = llm_config_id.filter(|id| !id.is_empty());
        if let Some(id) = &llm_config_id {
            self.config_store.get(id).await?;
        }
        let session = {
            let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| AgentError::SessionNotFound {
                    session_id: session_id.to_owned(),
                })?;
            session.llm_config_id = llm_config_id;
            session.updated_at = chrono::Utc::now();
            session.clone()
        };
        if !self.is_ephemeral(session_id)
            && let Err(e) = self.session_store.upsert(&session.to_record()).await
        {
            tracing::warn!(session_id, error = %e, "failed to persist session binding");
        }
        Ok(session)
    }

    /// Append to the live session and return a snapshot for persistence.
    /// `None` if the session was deleted mid-turn.
    fn push_message(&self, session_id: &str, message: ChatMessage) -> Result<Option<ChatSession>> {
        let mut sessions = self.sessions.write().map_err(|_| {
            tracing::warn!(session_id, message_id = %message.id, "session lock poisoned, message not kept");
            poisoned()
        })?;
        let Some(session) = sessions.get_mut(session_id) else {
            tracing::warn!(session_id, message_id = %message.id, "session deleted during turn, message not kept");
            return Ok(None);
        };
        session.push(message);
        Ok(Some(session.clone()))
    }

    async fn persist_message(&self, session: &ChatSession, message: &ChatMessage) {
        if self.is_ephemeral(&session.id) {
            return;
        }
        if let Err(e) = self.session_store.upsert(&session.to_record()).await {
            tracing::warn!(session_id = %session.id, error = %e, "failed to persist session");
        }
        if let Err(e) = self
            .session_store
            .append_message(&message.to_record(&session.id))
            .await
        {
            tracing::warn!(
                session_id = %session.id,
                message_id = %message.id,
                error = %e,
                "failed to persist message"
            );
        }
    }

    fn run_lock(&self, session_id: &str) -> Result<Arc<AsyncMutex<()>>> {
        if let Some(lock) = self.run_locks.read().map_err(|_| poisoned())?.get(session_id) {
            return Ok(Arc::clone(lock));
        }
        let mut locks = self.run_locks.write().map_err(|_| poisoned())?;
        Ok(Arc::clone(locks.entry(session_id.to_owned()).or_default()))
    }

    // -- LLM configuration -------------------------------------------------

    /// Install `config_id` as the process default. Cached session pools
    /// keep their agents.
    pub async fn set_llm_config(&self, config_id: &str) -> Result<LlmConfigRecord> {
        let record = self.config_store.get(config_id).await?;
        let backend = self.factory.build(&record)?;
        tracing::info!(config = %provider_info(&record), "default LLM set");
        *self.default_llm.write().map_err(|_| poisoned())? = Some(DefaultLlm {
            record: record.clone(),
            backend,
        });
        Ok(record)
    }

    /// Re-select the default from the store.
    pub async fn reload_llm(&self) -> Result<LlmConfigRecord> {
        let Some(record) = self.config_store.default_config().await? else {
            *self.default_llm.write().map_err(|_| poisoned())? = None;
            return Err(AgentError::LlmUnavailable);
        };
        let backend = self.factory.build(&record)?;
        *self.default_llm.write().map_err(|_| poisoned())? = Some(DefaultLlm {
            record: record.clone(),
            backend,
        });
        Ok(record)
    }

    /// The configuration behind the current default backend.
    pub fn current_llm(&self) -> Option<LlmConfigRecord> {
        self.default_llm
            .read()
            .ok()?
            .as_ref()
            .map(|d| d.record.clone())
    }

    fn default_backend(&self) -> Option<Arc<dyn LlmBackend>> {
        self.default_llm
            .read()
            .ok()?
            .as_ref()
            .map(|d| Arc::clone(&d.backend))
    }

    /// Backend for a session bound to `config_id`, falling back to the
    /// default when the binding cannot be resolved.
    async fn resolve_backend(&self, config_id: Option<&str>) -> Result<Arc<dyn LlmBackend>> {
        if let Some(id) = config_id {
            let built = match self.config_store.get(id).await {
                Ok(record) => self.factory.build(&record),
                Err(e) => Err(e.into()),
            };
            match built {
                Ok(backend) => return Ok(backend),
                Err(e) => {
                    tracing::warn!(llm_config_id = id, error = %e, "session LLM config unavailable, using default");
                }
            }
        }
        self.default_backend().ok_or(AgentError::LlmUnavailable)
    }

    /// The worker system prompt from the prompt store, or the built-in one.
    pub async fn system_prompt(&self) -> String {
        match self.prompt_store.get(SYSTEM_PROMPT_ID).await {
            Ok(Some(p)) if !p.content.trim().is_empty() => p.content,
            Ok(_) => DEFAULT_SYSTEM_PROMPT.to_owned(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read system prompt, using default");
                DEFAULT_SYSTEM_PROMPT.to_owned()
            }
        }
    }

    async fn build_instances(&self, config_id: Option<&str>) -> Result<AgentInstances> {
        let backend = self.resolve_backend(config_id).await?;
        let system_prompt = self.system_prompt().await;

        let worker = |tier: Tier| {
            Arc::new(
                Agent::new(
                    tier.as_str(),
                    Arc::clone(&backend),
                    system_prompt.clone(),
                    self.config.iterations(tier),
                )
                .with_tools(Arc::clone(&self.tools))
                .with_memory_window(self.config.memory_window),
            )
        };
        let eval = Arc::new(
            Agent::new(
                Tier::Eval.as_str(),
                Arc::clone(&backend),
                EVALUATOR_SYSTEM_PROMPT,
                self.config.iterations(Tier::Eval),
            )
            .with_memory_window(self.config.memory_window),
        );

        Ok(AgentInstances {
            simple: worker(Tier::Simple),
            medium: worker(Tier::Medium),
            complex: worker(Tier::Complex),
            eval,
            config_id: config_id.map(str::to_owned),
        })
    }

    /// Make sure the session's four agents exist for its current binding.
    pub async fn ensure_agents(&self, session_id: &str) -> Result<Arc<AgentInstances>> {
        let config_id = self.get_session(session_id)?.llm_config_id;
        self.pool
            .ensure(session_id, config_id.as_deref(), || {
                self.build_instances(config_id.as_deref())
            })
            .await
    }

    pub fn tool_status(&self) -> ToolStatus {
        let tools = self.tools.tool_names();
        ToolStatus {
            count: tools.len(),
            tools,
        }
    }

    // -- Turns -------------------------------------------------------------

    /// Run one user turn, streaming its events into `out`.
    ///
    /// Every failure is also reported to `out` as a terminal `error` chunk.
    /// Turns on the same session run one at a time.
    pub async fn send_message(
        &self,
        session_id: &str,
        text: &str,
        cancel: CancellationToken,
        out: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let result = self.run_turn(session_id, text, &cancel, &out).await;
        if let Err(e) = &result {
            if e.is_cancelled() {
                tracing::info!(session_id, "turn cancelled");
            } else {
                tracing::warn!(session_id, error = %e, "turn failed");
            }
            emit(&out, StreamChunk::error(error_text(e))).await;
        }
        result
    }

    async fn run_turn(
        &self,
        session_id: &str,
        text: &str,
        cancel: &CancellationToken,
        out: &mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        if text.trim().is_empty() {
            return Err(AgentError::ValidationError {
                reason: "message cannot be empty".into(),
            });
        }

        let lock = self.run_lock(session_id)?;
        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            guard = lock.lock() => guard,
        };

        self.get_session(session_id)?;
        let user_message = ChatMessage::new(MessageRole::User, text);
        if let Some(snapshot) = self.push_message(session_id, user_message.clone())? {
            self.persist_message(&snapshot, &user_message).await;
        }

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let instances = self.ensure_agents(session_id).await?;

        let message_id = uuid::Uuid::now_v7().to_string();
        emit(out, StreamChunk::message("", &message_id)).await;

        let mut machine = TurnMachine::new(session_id);
        let plan = TurnPlan {
            session_id,
            user_text: text,
            instances: &instances,
            message_id: &message_id,
            cancel,
            out,
            pacing: self.config.pacing,
        };
        let assistant = execute_turn(&mut machine, plan).await?;

        if cancel.is_cancelled() {
            machine.fail();
            return Err(AgentError::Cancelled);
        }
        if let Some(snapshot) = self.push_message(session_id, assistant.clone())? {
            self.persist_message(&snapshot, &assistant).await;
        }
        machine.transition(TurnState::Done)?;
        emit(out, StreamChunk::done(&message_id)).await;
        tracing::info!(
            session_id,
            message_id = %message_id,
            tool_calls = assistant.tool_calls.len(),
            "turn completed"
        );
        Ok(())
    }
}

/// Text of the terminal error chunk. Upstream run failures pass through
/// verbatim.
fn error_text(err: &AgentError) -> String {
    match err {
        AgentError::AgentRun { reason } => reason.clone(),
        other => other.to_string(),
    }
}
