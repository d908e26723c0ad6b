//! LLM integration layer.
//!
//! - [`types`] -- provider-agnostic messages, tool calls and requests.
//! - [`backend`] -- the [`LlmBackend`] capability trait.
//! - [`anthropic`] / [`openai`] -- provider adapters.
//! - [`provider`] -- endpoint table, validation and the backend factory.
//! - [`streaming`] / [`streaming_openai`] -- SSE decoding.

pub mod anthropic;
pub mod backend;
pub mod openai;
pub mod provider;
pub mod streaming;
pub mod streaming_openai;
pub mod types;

pub use anthropic::AnthropicBackend;
pub use backend::{LlmBackend, TextSink};
pub use openai::OpenAiBackend;
pub use provider::{
    BackendFactory, ProviderBackendFactory, ProviderConfig, provider_base_url, provider_info,
    supports_tool_calling, validate_config,
};
pub use types::{ChatRequest, LlmResponse, Message, Role, ToolCall, ToolDefinition};
