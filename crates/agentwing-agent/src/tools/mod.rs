//! Tool registry and the wrapping contract every tool obeys.
//!
//! Adapters expose raw tool definitions; the [`ToolRegistry`] is what the
//! agent runtime talks to. It injects the `instructions` argument into each
//! schema, strips it again before execution and mirrors every outcome into
//! the turn's [`ToolResultLedger`].

pub mod instructions;
pub mod ledger;
pub mod mcp;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::types::{ToolCall, ToolDefinition};

pub use instructions::{INSTRUCTIONS_KEY, split_instructions, with_instructions};
pub use ledger::ToolResultLedger;
pub use mcp::{McpToolAdapter, flatten_tool_result};

/// Trait for components that can execute tool calls on behalf of an agent.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// The unique identifier for this adapter.
    fn adapter_id(&self) -> &str;

    /// The tool definitions this adapter exposes, without the injected
    /// `instructions` argument.
    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    /// Execute a named tool. `arguments` never contains `instructions`.
    async fn execute(&self, tool_name: &str, arguments: Value) -> Result<String>;
}

/// Outcome of one wrapped invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    /// Justification the model supplied, if any.
    pub instructions: Option<String>,
    /// Result text, or the error text when `is_error` is set.
    pub output: String,
    pub is_error: bool,
}

/// The set of tools bound to worker agents.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    adapters: Vec<Arc<dyn ToolAdapter>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter. Tools whose names are already registered keep their
    /// original owner.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        tracing::info!(
            adapter = adapter.adapter_id(),
            tools = adapter.tool_definitions().len(),
            "tool adapter registered"
        );
        self.adapters.push(adapter);
    }

    /// Definitions as the model sees them, `instructions` included.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut seen = std::collections::HashSet::new();
        self.adapters
            .iter()
            .flat_map(|a| a.tool_definitions())
            .filter(|d| seen.insert(d.name.clone()))
            .map(|d| ToolDefinition {
                input_schema: with_instructions(&d.input_schema),
                ..d
            })
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.definitions().into_iter().map(|d| d.name).collect()
    }

    pub fn len(&self) -> usize {
        self.definitions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(&self, tool_name: &str) -> Option<&Arc<dyn ToolAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.tool_definitions().iter().any(|d| d.name == tool_name))
    }

    /// Run one call through the wrapping contract.
    ///
    /// Tool failures are folded into the outcome (the model gets to see
    /// them); only an unknown tool name is returned as an error. Either way
    /// the text lands in `ledger` under the call id.
    pub async fn invoke(&self, call: &ToolCall, ledger: &ToolResultLedger) -> Result<ToolOutcome> {
        let (instructions, args) = split_instructions(&call.arguments);

        let Some(adapter) = self.find(&call.name) else {
            let err = AgentError::UnknownTool {
                tool_name: call.name.clone(),
            };
            ledger.record(&call.id, format!("Error: {err}"));
            return Err(err);
        };

        tracing::debug!(tool = %call.name, call_id = %call.id, "executing tool");
        match adapter.execute(&call.name, Value::Object(args)).await {
            Ok(output) => {
                ledger.record(&call.id, output.clone());
                Ok(ToolOutcome {
                    instructions,
                    output,
                    is_error: false,
                })
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "tool execution failed");
                let output = format!("Error: {e}");
                ledger.record(&call.id, output.clone());
                Ok(ToolOutcome {
                    instructions,
                    output,
                    is_error: true,
                })
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ToolAdapter for Echo {
        fn adapter_id(&self) -> &str {
            "echo"
        }

        fn tool_definitions(&self) -> Vec<ToolDefinition> {
            vec![
                ToolDefinition {
                    name: "echo".into(),
                    description: "Echo arguments".into(),
                    input_schema: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
                },
                ToolDefinition {
                    name: "fail".into(),
                    description: "Always fails".into(),
                    input_schema: json!({"type": "object"}),
                },
            ]
        }

        async fn execute(&self, tool_name: &str, arguments: Value) -> Result<String> {
            if tool_name == "fail" {
                return Err(AgentError::ToolExecutionFailed {
                    tool_name: tool_name.into(),
                    reason: "boom".into(),
                });
            }
            Ok(arguments.to_string())
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Echo));
        reg
    }

    #[test]
    fn definitions_carry_instructions() {
        let defs = registry().definitions();
        assert_eq!(defs.len(), 2);
        for def in defs {
            assert!(def.input_schema["properties"]["instructions"].is_object());
        }
    }

    #[tokio::test]
    async fn invoke_strips_instructions_and_records() {
        let reg = registry();
        let ledger = ToolResultLedger::new();
        let call = ToolCall {
            id: "c1".into(),
            name: "echo".into(),
            arguments: json!({"instructions": "why", "text": "hi"}),
        };
        let outcome = reg.invoke(&call, &ledger).await.unwrap();
        assert_eq!(outcome.instructions.as_deref(), Some("why"));
        assert_eq!(outcome.output, r#"{"text":"hi"}"#);
        assert!(!outcome.is_error);
        assert_eq!(ledger.take("c1").as_deref(), Some(r#"{"text":"hi"}"#));
    }

    #[tokio::test]
    async fn tool_failure_is_folded_into_outcome() {
        let reg = registry();
        let ledger = ToolResultLedger::new();
        let call = ToolCall {
            id: "c2".into(),
            name: "fail".into(),
            arguments: json!({}),
        };
        let outcome = reg.invoke(&call, &ledger).await.unwrap();
        assert!(outcome.is_error);
        assert!(outcome.output.contains("boom"));
        assert!(ledger.take("c2").unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let reg = registry();
        let ledger = ToolResultLedger::new();
        let call = ToolCall {
            id: "c3".into(),
            name: "missing".into(),
            arguments: json!({}),
        };
        let err = reg.invoke(&call, &ledger).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownTool { .. }));
        assert!(ledger.take("c3").is_some());
    }
}
