//! JSON-RPC 2.0 client for remote tool servers.
//!
//! [`McpToolAdapter`] lists a server's tools once at connect time and
//! forwards `tools/call` requests, flattening the structured result into the
//! plain text the model consumes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::llm::types::ToolDefinition;
use crate::tools::ToolAdapter;

/// Default timeout for one JSON-RPC exchange.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Browser automation waits on page loads.
const BROWSER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RemoteTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "inputSchema", default)]
    input_schema: Value,
}

/// Adapter exposing a remote JSON-RPC tool server.
pub struct McpToolAdapter {
    id: String,
    endpoint: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    tools: Vec<ToolDefinition>,
}

impl McpToolAdapter {
    /// Connect to `endpoint` and cache its tool list.
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::ToolTransport {
                reason: format!("failed to build http client: {e}"),
            })?;

        let mut adapter = Self {
            id: format!("mcp:{endpoint}"),
            endpoint,
            http,
            next_id: AtomicU64::new(1),
            tools: Vec::new(),
        };

        let listed = adapter
            .rpc("tools/list", json!({}), DEFAULT_TIMEOUT)
            .await?;
        let remote: Vec<RemoteTool> =
            serde_json::from_value(listed.get("tools").cloned().unwrap_or_else(|| json!([])))?;
        adapter.tools = remote
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name,
                description: t.description,
                input_schema: if t.input_schema.is_null() {
                    json!({"type": "object", "properties": {}})
                } else {
                    t.input_schema
                },
            })
            .collect();

        tracing::info!(
            endpoint = %adapter.endpoint,
            tools = adapter.tools.len(),
            "connected to tool server"
        );
        Ok(adapter)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn rpc(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::ToolTransport {
                reason: format!("{method}: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AgentError::ToolTransport {
                reason: format!("{method}: HTTP {status}"),
            });
        }

        let body: JsonRpcResponse = resp.json().await.map_err(|e| AgentError::ToolTransport {
            reason: format!("{method}: invalid response: {e}"),
        })?;

        if let Some(err) = body.error {
            return Err(AgentError::ToolTransport {
                reason: format!("{method}: {} ({})", err.message, err.code),
            });
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}

fn timeout_for(tool_name: &str) -> Duration {
    if tool_name.starts_with("browser_") {
        BROWSER_TIMEOUT
    } else {
        DEFAULT_TIMEOUT
    }
}

/// Flatten a tool result into model-facing text.
///
/// Handles both the standard `content` block list and the `message`/`data`
/// shape returned by the browser executor.
pub fn flatten_tool_result(result: &Value) -> String {
    if let Some(blocks) = result.get("content").and_then(Value::as_array) {
        let text: Vec<&str> = blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();
        if !text.is_empty() {
            return text.join("\n");
        }
    }

    let mut text = result
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    if let Some(data) = result.get("data") {
        let tree = data
            .get("semantic_tree")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty());
        if let Some(tree) = tree {
            text.push_str("\n\nSemantic Tree:\n");
            text.push_str(tree);
        } else if data.as_object().is_some_and(|m| !m.is_empty()) {
            if let Ok(pretty) = serde_json::to_string_pretty(data) {
                text.push_str("\n\nData:\n");
                text.push_str(&pretty);
            }
        }
    }

    if text.is_empty() {
        return result.to_string();
    }
    text
}

fn is_error_result(result: &Value) -> bool {
    result.get("isError").and_then(Value::as_bool) == Some(true)
        || result.get("success").and_then(Value::as_bool) == Some(false)
}

#[async_trait]
impl ToolAdapter for McpToolAdapter {
    fn adapter_id(&self) -> &str {
        &self.id
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.clone()
    }

    async fn execute(&self, tool_name: &str, arguments: Value) -> Result<String> {
        let result = self
            .rpc(
                "tools/call",
                json!({"name": tool_name, "arguments": arguments}),
                timeout_for(tool_name),
            )
            .await?;

        let text = flatten_tool_result(&result);
        if is_error_result(&result) {
            return Err(AgentError::ToolExecutionFailed {
                tool_name: tool_name.to_owned(),
                reason: text,
            });
        }
        Ok(text)
    }
}
