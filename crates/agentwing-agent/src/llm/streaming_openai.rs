//! Stream accumulator for OpenAI-compatible Chat Completions.
//!
//! Each `data:` line carries a `choices[0].delta` with either a text fragment
//! or tool-call fragments keyed by `index`; the stream ends with
//! `data: [DONE]`.

use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::streaming::parse_arguments;
use crate::llm::types::{LlmResponse, ToolCall};

/// Folds an OpenAI SSE stream into a final [`LlmResponse`].
#[derive(Debug, Default)]
pub struct OpenAiStreamAccumulator {
    text: String,
    /// Partial tool calls, positioned by the provider's `index`.
    calls: Vec<PartialCall>,
    done: bool,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl OpenAiStreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one SSE line, returning the text delta it carried, if any.
    pub fn feed_line(&mut self, line: &str) -> Result<Option<String>> {
        let Some(data) = line.trim_end().strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(None);
        }
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let v: Value = serde_json::from_str(data).map_err(|e| AgentError::LlmParseFailed {
            reason: format!("invalid JSON in OpenAI SSE data: {e}"),
        })?;

        if let Some(message) = v["error"]["message"].as_str() {
            return Err(AgentError::LlmStreamError {
                reason: message.to_owned(),
            });
        }

        let delta = &v["choices"][0]["delta"];
        for fragment in delta["tool_calls"].as_array().into_iter().flatten() {
            let index = fragment["index"].as_u64().unwrap_or(0) as usize;
            if self.calls.len() <= index {
                self.calls.resize_with(index + 1, PartialCall::default);
            }
            let call = &mut self.calls[index];
            if let Some(id) = fragment["id"].as_str() {
                call.id = id.to_owned();
            }
            if let Some(name) = fragment["function"]["name"].as_str() {
                call.name.push_str(name);
            }
            if let Some(args) = fragment["function"]["arguments"].as_str() {
                call.arguments.push_str(args);
            }
        }

        match delta["content"].as_str() {
            Some(text) if !text.is_empty() => {
                self.text.push_str(text);
                Ok(Some(text.to_owned()))
            }
            _ => Ok(None),
        }
    }

    /// Tool calls win over text, matching the non-streaming behaviour.
    pub fn into_response(self) -> Result<LlmResponse> {
        if self.calls.is_empty() {
            return Ok(LlmResponse::Text(self.text));
        }
        self.calls
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                Ok(ToolCall {
                    arguments: parse_arguments(&c.name, &c.arguments)?,
                    id: if c.id.is_empty() { format!("call_{i}") } else { c.id },
                    name: c.name,
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(LlmResponse::ToolCalls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_deltas_are_returned_and_joined() {
        let mut acc = OpenAiStreamAccumulator::new();
        let a = acc
            .feed_line(r#"data: {"choices":[{"index":0,"delta":{"content":"Hello"}}]}"#)
            .unwrap();
        let b = acc
            .feed_line(r#"data: {"choices":[{"index":0,"delta":{"content":" world"}}]}"#)
            .unwrap();
        assert_eq!((a.as_deref(), b.as_deref()), (Some("Hello"), Some(" world")));
        acc.feed_line("data: [DONE]").unwrap();
        assert!(acc.is_done());
        assert_eq!(acc.into_response().unwrap(), LlmResponse::Text("Hello world".into()));
    }

    #[test]
    fn fragmented_tool_calls_are_reassembled() {
        let mut acc = OpenAiStreamAccumulator::new();
        for line in [
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"browser_navigate","arguments":""}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"url\":"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"web_search","arguments":"{}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"https://x.io\"}"}}]}}]}"#,
            "data: [DONE]",
        ] {
            acc.feed_line(line).unwrap();
        }
        match acc.into_response().unwrap() {
            LlmResponse::ToolCalls(calls) => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].id, "call_a");
                assert_eq!(calls[0].arguments["url"], "https://x.io");
                assert_eq!(calls[1].name, "web_search");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let mut acc = OpenAiStreamAccumulator::new();
        assert!(acc.feed_line("").unwrap().is_none());
        assert!(acc.feed_line(": keepalive").unwrap().is_none());
        assert!(acc.feed_line("event: message").unwrap().is_none());
    }

    #[test]
    fn malformed_and_error_payloads_fail() {
        let mut acc = OpenAiStreamAccumulator::new();
        assert!(acc.feed_line("data: {oops").is_err());
        let err = acc
            .feed_line(r#"data: {"error":{"message":"rate limited"}}"#)
            .unwrap_err();
        assert!(matches!(err, AgentError::LlmStreamError { .. }));
    }
}
