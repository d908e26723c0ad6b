//! Agent error types.
//!
//! All agent subsystems surface errors through [`AgentError`].  Each variant
//! carries enough context for callers to decide how to handle the failure.

use agentwing_store::StoreError;

/// Unified error type for the agent engine.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- LLM errors ----------------------------------------------------------
    /// An HTTP request to the LLM provider failed.
    #[error("llm request failed: {reason}")]
    LlmRequestFailed { reason: String },

    /// The LLM response could not be parsed into the expected format.
    #[error("llm response parse error: {reason}")]
    LlmParseFailed { reason: String },

    /// The streaming SSE connection was interrupted or produced invalid data.
    #[error("llm stream error: {reason}")]
    LlmStreamError { reason: String },

    /// The API key is missing for a provider that requires one.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    /// No LLM client could be resolved for the request.
    #[error("LLM is not configured, please configure a default LLM first")]
    LlmUnavailable,

    // -- Session / orchestration errors --------------------------------------
    /// The session id does not exist.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// The agent selected for a turn is missing from the session's pool.
    #[error("selected {tier} agent for session {session_id} is not initialized")]
    AgentNotInitialized { session_id: String, tier: String },

    /// The agent is already running this conversation.
    #[error("agent {agent} is already running conversation {conversation_id}")]
    AgentBusy {
        agent: String,
        conversation_id: String,
    },

    /// The agent run failed upstream (LLM or tool) while streaming.
    #[error("agent run failed: {reason}")]
    AgentRun { reason: String },

    /// The caller cancelled the turn.
    #[error("request cancelled")]
    Cancelled,

    /// The reasoning loop ran out of iterations without an answer.
    #[error("agent exceeded max iterations ({max_iterations})")]
    MaxIterationsExceeded { max_iterations: u32 },

    // -- Tool errors ---------------------------------------------------------
    /// A tool call referenced by the LLM does not exist in the registry.
    #[error("unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    /// A tool invocation failed.
    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ToolExecutionFailed { tool_name: String, reason: String },

    /// The remote tool server rejected or failed a JSON-RPC exchange.
    #[error("tool transport error: {reason}")]
    ToolTransport { reason: String },

    // -- Configuration errors ------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// Validation failed for input data.
    #[error("validation error: {reason}")]
    ValidationError { reason: String },

    // -- Serialization / upstream crates -------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error propagated from the store crate.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::LlmRequestFailed {
            reason: err.to_string(),
        }
    }
}

impl AgentError {
    /// `true` when the error is the caller's own cancellation rather than an
    /// upstream failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// `true` for lookups of things that do not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::SessionNotFound { .. } => true,
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}
