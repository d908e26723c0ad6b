//! Anthropic Messages API adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::llm::backend::{LlmBackend, TextSink};
use crate::llm::provider::ProviderConfig;
use crate::llm::streaming::{AnthropicStreamAccumulator, SseParser, pump_sse_lines};
use crate::llm::types::{ChatRequest, LlmResponse, Message, Role, ToolCall, ToolDefinition};

pub(crate) const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// [`LlmBackend`] speaking the Anthropic Messages API, streaming or not.
#[derive(Debug, Clone)]
pub struct AnthropicBackend {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AgentError::MissingApiKey {
                provider: config.provider.clone(),
            });
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::LlmRequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { config, http })
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        format!("{base}/v1/messages")
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let (system, messages) = messages_to_anthropic(&request.messages);
        let model = if request.model.is_empty() {
            self.config.model.as_str()
        } else {
            request.model.as_str()
        };

        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = request.top_p {
            body["top_p"] = json!(p);
        }
        if !request.tools.is_empty() {
            body["tools"] = tools_to_anthropic(&request.tools);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.config.api_key).map_err(|e| {
                AgentError::LlmRequestFailed {
                    reason: format!("invalid API key header: {e}"),
                }
            })?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let url = self.endpoint();
        tracing::debug!(url = %url, model = %body["model"], provider = "anthropic", "sending LLM request");

        let resp = self.http.post(&url).headers(headers).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::LlmRequestFailed {
                reason: format!("API returned {status}: {text}"),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    fn provider(&self) -> &str {
        &self.config.provider
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate_with_tools(&self, request: &ChatRequest) -> Result<LlmResponse> {
        let resp = self.send(&self.build_body(request, false)).await?;
        let v: Value = resp.json().await.map_err(|e| AgentError::LlmParseFailed {
            reason: format!("invalid JSON response: {e}"),
        })?;
        parse_anthropic_response(&v)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn generate_stream(
        &self,
        request: &ChatRequest,
        on_text: TextSink<'_>,
    ) -> Result<LlmResponse> {
        let resp = self.send(&self.build_body(request, true)).await?;
        let mut parser = SseParser::new();
        let mut acc = AnthropicStreamAccumulator::new();

        pump_sse_lines(resp, |line| {
            if let Some(event) = parser.parse_line(line)?
                && let Some(delta) = acc.apply(event)
            {
                on_text(&delta);
            }
            Ok(acc.is_done())
        })
        .await?;

        acc.into_response()
    }
}

// ---------------------------------------------------------------------------
// Wire format conversion
// ---------------------------------------------------------------------------

/// Anthropic takes the system prompt as a top-level field and tool results
/// as `user` messages with `tool_result` blocks.
fn messages_to_anthropic(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Vec<&str> = Vec::new();
    let mut wire = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => system.push(&msg.content),
            Role::User => wire.push(json!({"role": "user", "content": msg.content})),
            Role::Assistant if msg.tool_calls.is_empty() => {
                wire.push(json!({"role": "assistant", "content": msg.content}));
            }
            Role::Assistant => {
                let text = (!msg.content.is_empty())
                    .then(|| json!({"type": "text", "text": msg.content}));
                let blocks: Vec<Value> = text
                    .into_iter()
                    .chain(msg.tool_calls.iter().map(|tc| {
                        json!({"type": "tool_use", "id": tc.id, "name": tc.name, "input": tc.arguments})
                    }))
                    .collect();
                wire.push(json!({"role": "assistant", "content": blocks}));
            }
            Role::Tool => wire.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id,
                    "content": msg.content,
                }],
            })),
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n"));
    (system, wire)
}

fn tools_to_anthropic(tools: &[ToolDefinition]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.input_schema}))
            .collect(),
    )
}

fn parse_anthropic_response(v: &Value) -> Result<LlmResponse> {
    let blocks = v["content"]
        .as_array()
        .ok_or_else(|| AgentError::LlmParseFailed {
            reason: "missing `content` array in response".into(),
        })?;

    let mut text = String::new();
    let mut calls = Vec::new();
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => calls.push(ToolCall {
                id: block["id"].as_str().unwrap_or_default().to_owned(),
                name: block["name"].as_str().unwrap_or_default().to_owned(),
                arguments: block["input"].clone(),
            }),
            _ => {}
        }
    }

    Ok(if calls.is_empty() {
        LlmResponse::Text(text)
    } else {
        LlmResponse::ToolCalls(calls)
    })
}
