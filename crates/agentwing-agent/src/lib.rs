//! Session and agent orchestration engine for agentwing.
//!
//! This crate turns a user message into a streamed, persisted assistant
//! answer. Each session lazily gets a pool of tiered agents; every turn is
//! first classified by a tool-less evaluator and then answered either
//! directly or by the worker tier the classifier picked, with the agent's
//! event stream reconciled into ordered content and tool-call updates.
//!
//! ## Architecture
//!
//! ```text
//!  user text ──> SessionEngine ──> AgentPool (simple | medium | complex | eval)
//!                     │
//!                     ├──> classifier ──> TaskComplexity
//!                     │
//!                     └──> reconciler ──> direct answer ─┐
//!                               │                         ├──> StreamChunk stream
//!                               └──> Agent::run_stream ───┘        + SessionStore
//!                                         │
//!                                  LlmBackend + ToolRegistry
//! ```
//!
//! ## Modules
//!
//! - [`llm`] -- capability interface, provider adapters, streaming.
//! - [`tools`] -- tool registry, `instructions` wrapping, result ledger,
//!   JSON-RPC tool client.
//! - [`runtime`] -- the bounded ReAct loop and its event stream.
//! - [`pool`] -- per-session agent instances.
//! - [`classifier`] -- complexity classification with safe fallbacks.
//! - [`reconciler`] -- turn state machine and event reconciliation.
//! - [`engine`] -- sessions, LLM configuration and turn execution.
//! - [`events`] / [`session`] -- outward stream and transcript types.
//! - [`error`] -- agent error types.

pub mod classifier;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod llm;
pub mod pool;
pub mod reconciler;
pub mod runtime;
pub mod session;
pub mod tools;

pub use classifier::{TaskComplexity, Tier, classify, parse_evaluation};
pub use conversation::ConversationMemory;
pub use engine::{
    DEFAULT_SYSTEM_PROMPT, EngineConfig, SYSTEM_PROMPT_ID, SessionEngine, ToolStatus,
};
pub use error::{AgentError, Result};
pub use events::{StreamChunk, ToolCallRecord, ToolCallStatus};
pub use llm::{
    BackendFactory, ChatRequest, LlmBackend, LlmResponse, Message, ProviderBackendFactory, Role,
    ToolCall, ToolDefinition, provider_info,
};
pub use pool::{AgentInstances, AgentPool};
pub use reconciler::{Pacing, TurnState};
pub use runtime::{Agent, AgentEvent, RunContext, ToolEventStatus};
pub use session::{ChatMessage, ChatSession, MessageRole};
pub use tools::{McpToolAdapter, ToolAdapter, ToolRegistry, ToolResultLedger};
