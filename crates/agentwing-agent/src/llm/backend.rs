//! The single capability interface every LLM provider adapter implements.
//!
//! Provider quirks (parameter patching, tool-name sanitising) stay inside the
//! adapters; the orchestration engine only ever sees [`LlmBackend`].

use async_trait::async_trait;

use crate::error::{AgentError, Result};
use crate::llm::types::{ChatRequest, LlmResponse, Message};

/// Callback receiving incremental text while a response streams in.
pub type TextSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Capability interface over one configured provider/model.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Provider key, e.g. `"openai"`.
    fn provider(&self) -> &str;

    /// Model identifier used when a request leaves `model` empty.
    fn model(&self) -> &str;

    /// One model call that may answer with text or tool calls.
    async fn generate_with_tools(&self, request: &ChatRequest) -> Result<LlmResponse>;

    /// Plain text generation without tools.
    async fn generate(&self, messages: Vec<Message>) -> Result<String> {
        match self.generate_with_tools(&ChatRequest::new(messages)).await? {
            LlmResponse::Text(text) => Ok(text),
            LlmResponse::ToolCalls(calls) => Err(AgentError::LlmParseFailed {
                reason: format!(
                    "model requested {} tool call(s) on a tool-less request",
                    calls.len()
                ),
            }),
        }
    }

    /// Whether [`LlmBackend::generate_stream`] delivers text incrementally.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Like [`LlmBackend::generate_with_tools`], forwarding text as it
    /// arrives. The default implementation delivers the whole text at once.
    async fn generate_stream(
        &self,
        request: &ChatRequest,
        on_text: TextSink<'_>,
    ) -> Result<LlmResponse> {
        let response = self.generate_with_tools(request).await?;
        if let LlmResponse::Text(text) = &response
            && !text.is_empty()
        {
            on_text(text);
        }
        Ok(response)
    }
}
