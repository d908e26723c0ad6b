//! OpenAI Chat Completions adapter, used for every OpenAI-compatible
//! provider (OpenAI, DeepSeek, Ollama, Groq, Qwen, ...).
//!
//! DeepSeek rejects tool names outside `^[a-zA-Z0-9_-]+$` and `top_p`
//! values outside `(0, 1)`; both are patched here and nowhere else.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::llm::backend::{LlmBackend, TextSink};
use crate::llm::provider::ProviderConfig;
use crate::llm::streaming::{parse_arguments, pump_sse_lines};
use crate::llm::streaming_openai::OpenAiStreamAccumulator;
use crate::llm::types::{ChatRequest, LlmResponse, Message, Role, ToolCall, ToolDefinition};

/// Sent as the bearer token to local servers that need none.
const PLACEHOLDER_API_KEY: &str = "ollama";

const DEEPSEEK_DEFAULT_TOP_P: f32 = 0.95;

/// [`LlmBackend`] for OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let provider = config.provider.to_lowercase();
        if config.api_key.is_empty() && provider != "ollama" {
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

    fn is_deepseek(&self) -> bool {
        self.config.provider.eq_ignore_ascii_case("deepseek")
    }

    /// Build the request body plus the sanitised→original tool-name map used
    /// to translate tool calls coming back.
    fn build_body(&self, request: &ChatRequest, stream: bool) -> (Value, HashMap<String, String>) {
        let mut names = HashMap::new();
        let mut rename = |name: &str| -> String {
            if !self.is_deepseek() {
                return name.to_owned();
            }
            let clean = clean_tool_name(name);
            if clean != name {
                names.insert(clean.clone(), name.to_owned());
            }
            clean
        };

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| tool_to_openai(t, &rename(&t.name)))
            .collect();
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| message_to_openai(m, &mut rename))
            .collect();

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
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        let top_p = if self.is_deepseek() {
            Some(match request.top_p {
                Some(p) if p > 0.0 && p < 1.0 => p,
                _ => DEEPSEEK_DEFAULT_TOP_P,
            })
        } else {
            request.top_p
        };
        if let Some(p) = top_p {
            body["top_p"] = json!(p);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        if stream {
            body["stream"] = json!(true);
        }
        (body, names)
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let key = if self.config.api_key.is_empty() {
            PLACEHOLDER_API_KEY
        } else {
            self.config.api_key.as_str()
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| {
                AgentError::LlmRequestFailed {
                    reason: format!("invalid authorization header: {e}"),
                }
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        tracing::debug!(url = %url, model = %body["model"], provider = %self.config.provider, "sending LLM request");

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
impl LlmBackend for OpenAiBackend {
    fn provider(&self) -> &str {
        &self.config.provider
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate_with_tools(&self, request: &ChatRequest) -> Result<LlmResponse> {
        let (body, names) = self.build_body(request, false);
        let resp = self.send(&body).await?;
        let v: Value = resp.json().await.map_err(|e| AgentError::LlmParseFailed {
            reason: format!("invalid JSON response: {e}"),
        })?;
        parse_openai_response(&v).map(|r| restore_tool_names(r, &names))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn generate_stream(
        &self,
        request: &ChatRequest,
        on_text: TextSink<'_>,
    ) -> Result<LlmResponse> {
        let (body, names) = self.build_body(request, true);
        let resp = self.send(&body).await?;
        let mut acc = OpenAiStreamAccumulator::new();

        pump_sse_lines(resp, |line| {
            if let Some(delta) = acc.feed_line(line)? {
                on_text(&delta);
            }
            Ok(acc.is_done())
        })
        .await?;

        acc.into_response().map(|r| restore_tool_names(r, &names))
    }
}

// ---------------------------------------------------------------------------
// Tool name sanitising
// ---------------------------------------------------------------------------

/// Replace characters DeepSeek rejects with `_`, and prefix `tool_` when the
/// result does not start with a letter.
pub fn clean_tool_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    match cleaned.chars().next() {
        Some(c) if !c.is_ascii_alphabetic() => format!("tool_{cleaned}"),
        _ => cleaned,
    }
}

fn restore_tool_names(response: LlmResponse, names: &HashMap<String, String>) -> LlmResponse {
    match response {
        LlmResponse::ToolCalls(calls) if !names.is_empty() => LlmResponse::ToolCalls(
            calls
                .into_iter()
                .map(|mut c| {
                    if let Some(original) = names.get(&c.name) {
                        c.name = original.clone();
                    }
                    c
                })
                .collect(),
        ),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Wire format conversion
// ---------------------------------------------------------------------------

fn tool_to_openai(tool: &ToolDefinition, wire_name: &str) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": wire_name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

fn message_to_openai(msg: &Message, rename: &mut impl FnMut(&str) -> String) -> Value {
    match msg.role {
        Role::System => json!({"role": "system", "content": msg.content}),
        Role::User => json!({"role": "user", "content": msg.content}),
        Role::Assistant if msg.tool_calls.is_empty() => {
            json!({"role": "assistant", "content": msg.content})
        }
        Role::Assistant => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {"name": rename(&tc.name), "arguments": tc.arguments.to_string()},
                    })
                })
                .collect();
            let mut m = json!({"role": "assistant", "tool_calls": calls});
            if !msg.content.is_empty() {
                m["content"] = json!(msg.content);
            }
            m
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id,
            "content": msg.content,
        }),
    }
}

fn parse_openai_response(v: &Value) -> Result<LlmResponse> {
    let message = &v["choices"][0]["message"];
    if message.is_null() {
        return Err(AgentError::LlmParseFailed {
            reason: "missing `choices[0].message` in response".into(),
        });
    }

    if let Some(calls) = message["tool_calls"].as_array()
        && !calls.is_empty()
    {
        return calls
            .iter()
            .map(|tc| {
                let name = tc["function"]["name"].as_str().unwrap_or_default();
                Ok(ToolCall {
                    id: tc["id"].as_str().unwrap_or_default().to_owned(),
                    name: name.to_owned(),
                    arguments: parse_arguments(
                        name,
                        tc["function"]["arguments"].as_str().unwrap_or_default(),
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(LlmResponse::ToolCalls);
    }

    Ok(LlmResponse::Text(
        message["content"].as_str().unwrap_or_default().to_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(provider: &str) -> OpenAiBackend {
        OpenAiBackend::new(ProviderConfig {
            provider: provider.into(),
            api_key: "sk-test".into(),
            model: "model-x".into(),
            base_url: "https://api.example.com/v1".into(),
            max_tokens: 1024,
            timeout_secs: 30,
        })
        .unwrap()
    }

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: "d".into(),
            input_schema: json!({"type": "object"}),
        }
    }

    #[test]
    fn clean_tool_name_matches_deepseek_rules() {
        assert_eq!(clean_tool_name("browser.click"), "browser_click");
        assert_eq!(clean_tool_name("1password"), "tool_1password");
        assert_eq!(clean_tool_name("_private"), "tool__private");
        assert_eq!(clean_tool_name("web_search"), "web_search");
    }

    #[test]
    fn deepseek_body_is_patched_and_names_map_back() {
        let b = backend("deepseek");
        let mut request = ChatRequest::new(vec![Message::user("hi")]).with_tools(vec![tool("fs.read")]);
        request.top_p = Some(1.0);

        let (body, names) = b.build_body(&request, false);
        assert_eq!(body["tools"][0]["function"]["name"], "fs_read");
        let top_p = body["top_p"].as_f64().unwrap();
        assert!((top_p - 0.95).abs() < 1e-6);

        let restored = restore_tool_names(
            LlmResponse::ToolCalls(vec![ToolCall {
                id: "c".into(),
                name: "fs_read".into(),
                arguments: json!({}),
            }]),
            &names,
        );
        match restored {
            LlmResponse::ToolCalls(calls) => assert_eq!(calls[0].name, "fs.read"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn other_providers_are_untouched() {
        let b = backend("openai");
        let request = ChatRequest::new(vec![Message::user("hi")]).with_tools(vec![tool("fs.read")]);
        let (body, names) = b.build_body(&request, true);
        assert_eq!(body["tools"][0]["function"]["name"], "fs.read");
        assert!(body.get("top_p").is_none());
        assert_eq!(body["stream"], true);
        assert!(names.is_empty());
    }

    #[test]
    fn ollama_needs_no_key() {
        assert!(
            OpenAiBackend::new(ProviderConfig {
                provider: "ollama".into(),
                api_key: String::new(),
                model: "llama3".into(),
                base_url: "http://localhost:11434/v1".into(),
                max_tokens: 1,
                timeout_secs: 1,
            })
            .is_ok()
        );
        assert!(matches!(
            OpenAiBackend::new(ProviderConfig {
                provider: "groq".into(),
                api_key: String::new(),
                model: "m".into(),
                base_url: "u".into(),
                max_tokens: 1,
                timeout_secs: 1,
            }),
            Err(AgentError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn parses_text_and_tool_call_responses() {
        let text = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(parse_openai_response(&text).unwrap(), LlmResponse::Text("hello".into()));

        let calls = json!({"choices": [{"message": {"tool_calls": [
            {"id": "c1", "function": {"name": "web_search", "arguments": "{\"q\":\"x\"}"}}
        ]}}]});
        match parse_openai_response(&calls).unwrap() {
            LlmResponse::ToolCalls(c) => assert_eq!(c[0].arguments["q"], "x"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parse_openai_response(&json!({"choices": []})).is_err());
    }
}
