//! Server-sent-event plumbing shared by the provider adapters.
//!
//! [`pump_sse_lines`] turns a streaming `reqwest` body into complete lines.
//! [`SseParser`] and [`AnthropicStreamAccumulator`] decode the Anthropic
//! Messages API event stream on top of it.

use futures::StreamExt;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::types::{LlmResponse, StreamDelta, StreamEvent, ToolCall};

// ---------------------------------------------------------------------------
// Line pump
// ---------------------------------------------------------------------------

/// Feed every complete line of an SSE body to `on_line` until the body ends
/// or `on_line` returns `Ok(true)` (stream finished).
///
/// Bytes are buffered until a newline arrives, so multi-byte UTF-8 characters
/// split across network chunks are reassembled before decoding.
pub async fn pump_sse_lines<F>(resp: reqwest::Response, mut on_line: F) -> Result<()>
where
    F: FnMut(&str) -> Result<bool>,
{
    let mut body = resp.bytes_stream();
    let mut pending: Vec<u8> = Vec::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| AgentError::LlmStreamError {
            reason: format!("stream read error: {e}"),
        })?;
        pending.extend_from_slice(&chunk);

        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = std::str::from_utf8(&raw[..raw.len() - 1]).map_err(|e| {
                AgentError::LlmStreamError {
                    reason: format!("invalid UTF-8 in stream: {e}"),
                }
            })?;
            if on_line(line.trim_end_matches('\r'))? {
                return Ok(());
            }
        }
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        on_line(line.trim_end())?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Anthropic event parser
// ---------------------------------------------------------------------------

/// Stateful parser for `event:` / `data:` line pairs.
#[derive(Debug, Default)]
pub struct SseParser {
    pending_event: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line. Returns an event once a `data:` line completes one.
    pub fn parse_line(&mut self, line: &str) -> Result<Option<StreamEvent>> {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }
        if let Some(kind) = line.strip_prefix("event:") {
            self.pending_event = Some(kind.trim().to_owned());
            return Ok(None);
        }
        let Some(data) = line.strip_prefix("data:") else {
            tracing::trace!(line, "ignoring unrecognised SSE line");
            return Ok(None);
        };
        let data = data.trim();
        let kind = self.pending_event.take().unwrap_or_default();
        decode_anthropic_event(&kind, data)
    }
}

fn decode_anthropic_event(kind: &str, data: &str) -> Result<Option<StreamEvent>> {
    if data == "[DONE]" {
        return Ok(Some(StreamEvent::MessageStop));
    }
    let event = match kind {
        "message_start" => {
            let v = parse_json(data)?;
            StreamEvent::MessageStart {
                message_id: str_field(&v["message"], "id"),
                model: str_field(&v["message"], "model"),
            }
        }
        "content_block_start" => {
            let v = parse_json(data)?;
            let block = &v["content_block"];
            StreamEvent::ContentBlockStart {
                index: index_of(&v),
                content_type: str_field(block, "type"),
                id: block["id"].as_str().map(String::from),
                name: block["name"].as_str().map(String::from),
            }
        }
        "content_block_delta" => {
            let v = parse_json(data)?;
            let delta = &v["delta"];
            let delta = match delta["type"].as_str() {
                Some("text_delta") => StreamDelta::TextDelta(str_field(delta, "text")),
                Some("input_json_delta") => {
                    StreamDelta::InputJsonDelta(str_field(delta, "partial_json"))
                }
                other => {
                    tracing::debug!(delta_type = ?other, "skipping unsupported delta type");
                    return Ok(None);
                }
            };
            StreamEvent::ContentBlockDelta {
                index: index_of(&v),
                delta,
            }
        }
        "content_block_stop" => StreamEvent::ContentBlockStop {
            index: index_of(&parse_json(data)?),
        },
        "message_delta" => StreamEvent::MessageDelta {
            stop_reason: parse_json(data)?["delta"]["stop_reason"]
                .as_str()
                .map(String::from),
        },
        "message_stop" => StreamEvent::MessageStop,
        "ping" => StreamEvent::Ping,
        "error" => {
            let v = parse_json(data)?;
            return Err(AgentError::LlmStreamError {
                reason: v["error"]["message"]
                    .as_str()
                    .unwrap_or("provider reported a stream error")
                    .to_owned(),
            });
        }
        _ => {
            tracing::trace!(kind, "ignoring unknown SSE event type");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

// ---------------------------------------------------------------------------
// Anthropic accumulator
// ---------------------------------------------------------------------------

/// Folds Anthropic stream events into a final [`LlmResponse`].
#[derive(Debug, Default)]
pub struct AnthropicStreamAccumulator {
    text: String,
    /// `(id, name, partial input json)` per tool_use block, in block order.
    tool_blocks: Vec<(String, String, String)>,
    finished: bool,
}

impl AnthropicStreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.finished
    }

    /// Apply one event, returning the text delta it carried, if any.
    pub fn apply(&mut self, event: StreamEvent) -> Option<String> {
        match event {
            StreamEvent::ContentBlockStart {
                content_type, id, name, ..
            } if content_type == "tool_use" => {
                self.tool_blocks.push((
                    id.unwrap_or_default(),
                    name.unwrap_or_default(),
                    String::new(),
                ));
                None
            }
            StreamEvent::ContentBlockDelta {
                delta: StreamDelta::TextDelta(t),
                ..
            } => {
                self.text.push_str(&t);
                Some(t)
            }
            StreamEvent::ContentBlockDelta {
                delta: StreamDelta::InputJsonDelta(j),
                ..
            } => {
                if let Some(block) = self.tool_blocks.last_mut() {
                    block.2.push_str(&j);
                }
                None
            }
            StreamEvent::MessageStop => {
                self.finished = true;
                None
            }
            _ => None,
        }
    }

    pub fn into_response(self) -> Result<LlmResponse> {
        if self.tool_blocks.is_empty() {
            return Ok(LlmResponse::Text(self.text));
        }
        self.tool_blocks
            .into_iter()
            .map(|(id, name, input)| {
                Ok(ToolCall {
                    arguments: parse_arguments(&name, &input)?,
                    id,
                    name,
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(LlmResponse::ToolCalls)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse streamed tool arguments; an empty buffer means `{}`.
pub(crate) fn parse_arguments(tool: &str, raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw).map_err(|e| AgentError::LlmParseFailed {
        reason: format!("invalid JSON arguments for tool `{tool}`: {e}"),
    })
}

fn parse_json(data: &str) -> Result<Value> {
    serde_json::from_str(data).map_err(|e| AgentError::LlmParseFailed {
        reason: format!("invalid JSON in SSE data: {e}"),
    })
}

fn str_field(v: &Value, field: &str) -> String {
    v[field].as_str().unwrap_or_default().to_owned()
}

fn index_of(v: &Value) -> u32 {
    v["index"].as_u64().unwrap_or(0) as u32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut SseParser, acc: &mut AnthropicStreamAccumulator, lines: &[&str]) -> String {
        let mut streamed = String::new();
        for line in lines {
            if let Some(event) = parser.parse_line(line).unwrap() {
                if let Some(t) = acc.apply(event) {
                    streamed.push_str(&t);
                }
            }
        }
        streamed
    }

    #[test]
    fn text_stream_accumulates() {
        let mut parser = SseParser::new();
        let mut acc = AnthropicStreamAccumulator::new();
        let streamed = feed(
            &mut parser,
            &mut acc,
            &[
                "event: message_start",
                r#"data: {"message":{"id":"msg_1","model":"claude"}}"#,
                "",
                "event: content_block_delta",
                r#"data: {"index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
                "event: content_block_delta",
                r#"data: {"index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
                "event: message_stop",
                "data: {}",
            ],
        );
        assert_eq!(streamed, "Hello");
        assert!(acc.is_done());
        assert_eq!(acc.into_response().unwrap(), LlmResponse::Text("Hello".into()));
    }

    #[test]
    fn tool_use_blocks_become_tool_calls() {
        let mut parser = SseParser::new();
        let mut acc = AnthropicStreamAccumulator::new();
        feed(
            &mut parser,
            &mut acc,
            &[
                "event: content_block_start",
                r#"data: {"index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"read_file"}}"#,
                "event: content_block_delta",
                r#"data: {"index":1,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#,
                "event: content_block_delta",
                r#"data: {"index":1,"delta":{"type":"input_json_delta","partial_json":"\"a.txt\"}"}}"#,
            ],
        );
        match acc.into_response().unwrap() {
            LlmResponse::ToolCalls(calls) => {
                assert_eq!(calls[0].id, "toolu_1");
                assert_eq!(calls[0].arguments["path"], "a.txt");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn comments_and_pings_are_harmless() {
        let mut parser = SseParser::new();
        assert!(parser.parse_line(": keepalive").unwrap().is_none());
        assert!(parser.parse_line("event: ping").unwrap().is_none());
        assert_eq!(parser.parse_line("data: {}").unwrap(), Some(StreamEvent::Ping));
    }

    #[test]
    fn error_event_is_surfaced() {
        let mut parser = SseParser::new();
        parser.parse_line("event: error").unwrap();
        let err = parser
            .parse_line(r#"data: {"error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("Overloaded"));
    }

    #[test]
    fn empty_arguments_default_to_object() {
        assert_eq!(parse_arguments("t", "").unwrap(), serde_json::json!({}));
        assert!(parse_arguments("t", "{bad").is_err());
    }
}
