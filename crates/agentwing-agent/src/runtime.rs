//! Agent executor runtime.
//!
//! Implements the **Reason + Act** loop that drives one agent. The agent
//! sends the conversation to its [`LlmBackend`]; when the model answers with
//! tool calls, the runtime executes them through the [`ToolRegistry`] and
//! feeds the results back. This continues until the model produces a final
//! text answer or the agent's iteration budget runs out, in which case one
//! last tool-less call asks the model to answer from what it gathered.
//!
//! [`Agent::run`] returns the final string; [`Agent::run_stream`] spawns the
//! loop and reports progress as [`AgentEvent`]s over a channel.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::conversation::{ConversationMemory, DEFAULT_MEMORY_WINDOW};
use crate::error::{AgentError, Result};
use crate::llm::LlmBackend;
use crate::llm::types::{ChatRequest, LlmResponse, Message, ToolCall, ToolDefinition};
use crate::tools::{ToolRegistry, ToolResultLedger, split_instructions};

/// Appended when the iteration budget is exhausted with tools still pending.
const SYNTHESIS_PROMPT: &str = "You have used all available tool-call iterations. \
Based on the tool results above, give your final answer now without calling any more tools.";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Progress of one tool call as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolEventStatus {
    Executing,
    Completed,
    Error,
}

/// One event produced by a streaming agent run.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A fragment of the model's text output.
    Content(String),
    /// Reasoning surfaced while the agent works (tool justifications).
    Thinking(String),
    ToolCallStarted {
        call_id: String,
        name: String,
        arguments: Value,
    },
    /// A tool finished. Any of `result`, `content` and `metadata["result"]`
    /// may carry the output; consumers must not assume which.
    ToolCallResult {
        call_id: String,
        name: String,
        status: ToolEventStatus,
        result: Option<String>,
        content: Option<String>,
        metadata: Map<String, Value>,
    },
    /// The run failed; no further events follow.
    Error(String),
    /// The run completed normally.
    Done,
}

/// Per-run inputs shared with the caller.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Memory key. Worker runs share the session id; classifier runs use an
    /// isolated id.
    pub conversation_id: String,
    pub cancel: CancellationToken,
    /// Receives every tool result of this run keyed by call id.
    pub ledger: ToolResultLedger,
}

impl RunContext {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            cancel: CancellationToken::new(),
            ledger: ToolResultLedger::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_ledger(mut self, ledger: ToolResultLedger) -> Self {
        self.ledger = ledger;
        self
    }
}

/// Optional event channel; `run` executes without one.
struct EventSink(Option<mpsc::UnboundedSender<AgentEvent>>);

impl EventSink {
    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.0 {
            // The receiver may have gone away after a cancellation.
            let _ = tx.send(event);
        }
    }
}

/// Conversation ids with a run in flight.
type ActiveRuns = Arc<Mutex<HashSet<String>>>;

/// Marks a conversation as running until dropped.
struct RunSlot {
    active: ActiveRuns,
    conversation_id: String,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.conversation_id);
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// An LLM-backed executor with a fixed iteration budget.
pub struct Agent {
    name: String,
    backend: Arc<dyn LlmBackend>,
    tools: Option<Arc<ToolRegistry>>,
    system_prompt: String,
    max_iterations: u32,
    memory: ConversationMemory,
    active: ActiveRuns,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("provider", &self.backend.provider())
            .field("model", &self.backend.model())
            .field("has_tools", &self.tools.is_some())
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn LlmBackend>,
        system_prompt: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            tools: None,
            system_prompt: system_prompt.into(),
            max_iterations: max_iterations.max(1),
            memory: ConversationMemory::new(DEFAULT_MEMORY_WINDOW),
            active: ActiveRuns::default(),
        }
    }

    /// Bind a tool set. Agents without one never see tool definitions.
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_memory_window(mut self, window: usize) -> Self {
        self.memory = ConversationMemory::new(window);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn has_tools(&self) -> bool {
        self.tools.is_some()
    }

    pub fn backend(&self) -> &Arc<dyn LlmBackend> {
        &self.backend
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// `true` while a run for `conversation_id` is in flight.
    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(conversation_id)
    }

    /// Claim `conversation_id` for one run. Two runs over the same memory
    /// would interleave their transcripts, so a second claim fails.
    fn claim(&self, conversation_id: &str) -> Result<RunSlot> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(conversation_id.to_owned()) {
            return Err(AgentError::AgentBusy {
                agent: self.name.clone(),
                conversation_id: conversation_id.to_owned(),
            });
        }
        Ok(RunSlot {
            active: Arc::clone(&self.active),
            conversation_id: conversation_id.to_owned(),
        })
    }

    /// Run to completion and return the final answer.
    pub async fn run(&self, conversation_id: &str, input: &str) -> Result<String> {
        let _slot = self.claim(conversation_id)?;
        let ctx = RunContext::new(conversation_id);
        self.react(&ctx, input, &EventSink(None)).await
    }

    /// Start a streaming run.
    ///
    /// Fails without spawning anything if the run cannot start: the context
    /// is already cancelled, the input is blank, or this agent is still
    /// running the same conversation. Otherwise the returned receiver yields
    /// events in production order and closes after a terminal
    /// [`AgentEvent::Done`] or [`AgentEvent::Error`]; a cancelled run closes
    /// without either.
    pub fn run_stream(
        self: &Arc<Self>,
        ctx: RunContext,
        input: impl Into<String>,
    ) -> Result<mpsc::UnboundedReceiver<AgentEvent>> {
        let input = input.into();
        if ctx.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if input.trim().is_empty() {
            return Err(AgentError::ValidationError {
                reason: "agent input must not be empty".into(),
            });
        }

        let slot = self.claim(&ctx.conversation_id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let sink = EventSink(Some(tx));
            let outcome = agent.react(&ctx, &input, &sink).await;
            // Release before the terminal event so a consumer that saw it can
            // start the next run right away.
            drop(slot);
            match outcome {
                Ok(_) => sink.emit(AgentEvent::Done),
                Err(AgentError::Cancelled) => {
                    tracing::debug!(agent = %agent.name, "agent run cancelled");
                }
                Err(e) => {
                    tracing::warn!(agent = %agent.name, error = %e, "agent run failed");
                    sink.emit(AgentEvent::Error(e.to_string()));
                }
            }
        });
        Ok(rx)
    }

    async fn react(&self, ctx: &RunContext, input: &str, sink: &EventSink) -> Result<String> {
        let tools: Vec<ToolDefinition> = self
            .tools
            .as_ref()
            .map(|t| t.definitions())
            .unwrap_or_default();

        let mut transcript = self.memory.history(&ctx.conversation_id);
        let remembered = transcript.len();
        transcript.push(Message::user(input));

        tracing::debug!(
            agent = %self.name,
            conversation = %ctx.conversation_id,
            max_iterations = self.max_iterations,
            tool_count = tools.len(),
            "starting ReAct loop"
        );

        let mut seen_ids = HashSet::new();
        for iteration in 0..self.max_iterations {
            let request = self.request(&transcript, tools.clone());
            match self.call_model(ctx, &request, sink).await? {
                LlmResponse::Text(text) => {
                    tracing::debug!(agent = %self.name, iterations = iteration + 1, "ReAct loop completed");
                    transcript.push(Message::assistant(&text));
                    self.remember(ctx, transcript, remembered);
                    return Ok(text);
                }
                LlmResponse::ToolCalls(calls) => {
                    let calls = identify_calls(calls, &mut seen_ids);
                    tracing::debug!(
                        agent = %self.name,
                        iteration,
                        tools = ?calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
                        "model requested tool calls"
                    );
                    transcript.push(Message::assistant_tool_calls(calls.clone()));
                    for call in &calls {
                        let output = self.execute_call(ctx, call, sink).await?;
                        transcript.push(Message::tool_result(&call.id, output));
                    }
                }
            }
        }

        tracing::info!(
            agent = %self.name,
            max_iterations = self.max_iterations,
            "iteration budget exhausted, requesting final answer"
        );
        transcript.push(Message::user(SYNTHESIS_PROMPT));
        let request = self.request(&transcript, Vec::new());
        match self.call_model(ctx, &request, sink).await? {
            LlmResponse::Text(text) => {
                transcript.pop();
                transcript.push(Message::assistant(&text));
                self.remember(ctx, transcript, remembered);
                Ok(text)
            }
            LlmResponse::ToolCalls(_) => Err(AgentError::MaxIterationsExceeded {
                max_iterations: self.max_iterations,
            }),
        }
    }

    fn request(&self, transcript: &[Message], tools: Vec<ToolDefinition>) -> ChatRequest {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        if !self.system_prompt.is_empty() {
            messages.push(Message::system(&self.system_prompt));
        }
        messages.extend_from_slice(transcript);
        ChatRequest::new(messages).with_tools(tools)
    }

    async fn call_model(
        &self,
        ctx: &RunContext,
        request: &ChatRequest,
        sink: &EventSink,
    ) -> Result<LlmResponse> {
        let mut on_text = |text: &str| sink.emit(AgentEvent::Content(text.to_owned()));
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
            response = self.backend.generate_stream(request, &mut on_text) => response,
        }
    }

    async fn execute_call(
        &self,
        ctx: &RunContext,
        call: &ToolCall,
        sink: &EventSink,
    ) -> Result<String> {
        let (instructions, _) = split_instructions(&call.arguments);
        if let Some(why) = instructions.filter(|s| !s.trim().is_empty()) {
            sink.emit(AgentEvent::Thinking(why));
        }
        sink.emit(AgentEvent::ToolCallStarted {
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let outcome = match &self.tools {
            Some(registry) => tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
                outcome = registry.invoke(call, &ctx.ledger) => outcome,
            },
            None => Err(AgentError::UnknownTool {
                tool_name: call.name.clone(),
            }),
        };

        let (status, output) = match outcome {
            Ok(o) if o.is_error => (ToolEventStatus::Error, o.output),
            Ok(o) => (ToolEventStatus::Completed, o.output),
            Err(e) => {
                let output = format!("Error: {e}");
                ctx.ledger.record(&call.id, output.clone());
                (ToolEventStatus::Error, output)
            }
        };

        sink.emit(AgentEvent::ToolCallResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            status,
            result: Some(output.clone()),
            content: None,
            metadata: Map::new(),
        });
        Ok(output)
    }

    fn remember(&self, ctx: &RunContext, mut transcript: Vec<Message>, remembered: usize) {
        let fresh: Vec<Message> = transcript.drain(remembered..).collect();
        self.memory.append(&ctx.conversation_id, fresh);
    }
}

/// Give every call an id that is unique within the run. Providers may omit
/// ids or restart their numbering each round; events, the result ledger and
/// the transcript are all keyed by the id assigned here.
fn identify_calls(mut calls: Vec<ToolCall>, seen: &mut HashSet<String>) -> Vec<ToolCall> {
    for call in &mut calls {
        if call.id.is_empty() || seen.contains(&call.id) {
            let mut n = seen.len();
            while seen.contains(&format!("call_{n}")) {
                n += 1;
            }
            call.id = format!("call_{n}");
        }
        seen.insert(call.id.clone());
    }
    calls
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolAdapter;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records every request.
    struct Scripted {
        responses: Mutex<VecDeque<LlmResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl Scripted {
        fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmBackend for Scripted {
        fn provider(&self) -> &str {
            "scripted"
        }
        fn model(&self) -> &str {
            "scripted-1"
        }
        async fn generate_with_tools(&self, request: &ChatRequest) -> Result<LlmResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AgentError::LlmRequestFailed {
                    reason: "script exhausted".into(),
                })
        }
    }

    struct Clock;

    #[async_trait]
    impl ToolAdapter for Clock {
        fn adapter_id(&self) -> &str {
            "clock"
        }
        fn tool_definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition {
                name: "now".into(),
                description: "Current time".into(),
                input_schema: json!({"type": "object"}),
            }]
        }
        async fn execute(&self, _tool_name: &str, _arguments: Value) -> Result<String> {
            Ok("12:00".into())
        }
    }

    fn tool_call(id: &str) -> LlmResponse {
        LlmResponse::ToolCalls(vec![ToolCall {
            id: id.into(),
            name: "now".into(),
            arguments: json!({"instructions": "Using now to read the clock"}),
        }])
    }

    fn agent_with(backend: Arc<Scripted>, budget: u32) -> Arc<Agent> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Clock));
        Arc::new(Agent::new("simple", backend, "be brief", budget).with_tools(Arc::new(registry)))
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn run_returns_text_and_remembers() {
        let backend = Scripted::new(vec![
            LlmResponse::Text("first".into()),
            LlmResponse::Text("second".into()),
        ]);
        let agent = Agent::new("eval", backend.clone(), "sys", 1);
        assert_eq!(agent.run("conv", "a").await.unwrap(), "first");
        assert_eq!(agent.run("conv", "b").await.unwrap(), "second");

        let requests = backend.requests.lock().unwrap();
        // system + user(a) + assistant(first) + user(b)
        assert_eq!(requests[1].messages.len(), 4);
        assert!(requests[1].tools.is_empty());
        assert_eq!(agent.memory().len("conv"), 4);
    }

    #[tokio::test]
    async fn stream_reports_tool_round_trip_in_order() {
        let backend = Scripted::new(vec![tool_call("c1"), LlmResponse::Text("It is noon".into())]);
        let agent = agent_with(backend.clone(), 3);
        let ctx = RunContext::new("s1");
        let ledger = ctx.ledger.clone();
        let events = collect(agent.run_stream(ctx, "time?").unwrap()).await;

        assert_eq!(
            events,
            vec![
                AgentEvent::Thinking("Using now to read the clock".into()),
                AgentEvent::ToolCallStarted {
                    call_id: "c1".into(),
                    name: "now".into(),
                    arguments: json!({"instructions": "Using now to read the clock"}),
                },
                AgentEvent::ToolCallResult {
                    call_id: "c1".into(),
                    name: "now".into(),
                    status: ToolEventStatus::Completed,
                    result: Some("12:00".into()),
                    content: None,
                    metadata: Map::new(),
                },
                AgentEvent::Content("It is noon".into()),
                AgentEvent::Done,
            ]
        );
        assert_eq!(ledger.take("c1").as_deref(), Some("12:00"));

        let requests = backend.requests.lock().unwrap();
        assert!(requests[0].tools[0].input_schema["properties"]["instructions"].is_object());
        assert_eq!(requests[1].messages.last().unwrap().content, "12:00");
    }

    #[tokio::test]
    async fn exhausted_budget_asks_for_final_answer_without_tools() {
        let backend = Scripted::new(vec![tool_call("c1"), LlmResponse::Text("done".into())]);
        let agent = agent_with(backend.clone(), 1);
        let answer = agent.run("s", "loop").await.unwrap();
        assert_eq!(answer, "done");

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].tools.is_empty());
        assert_eq!(requests[1].messages.last().unwrap().content, SYNTHESIS_PROMPT);
    }

    #[tokio::test]
    async fn exhausted_budget_with_more_tool_calls_fails() {
        let backend = Scripted::new(vec![tool_call("c1"), tool_call("c2")]);
        let agent = agent_with(backend, 1);
        let err = agent.run("s", "loop").await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::MaxIterationsExceeded { max_iterations: 1 }
        ));
    }

    #[tokio::test]
    async fn backend_failure_becomes_error_event() {
        let backend = Scripted::new(vec![]);
        let agent = agent_with(backend, 3);
        let events = collect(agent.run_stream(RunContext::new("s"), "hi").unwrap()).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AgentEvent::Error(msg) if msg.contains("script exhausted")));
    }

    #[tokio::test]
    async fn calls_without_ids_get_distinct_ids() {
        let backend = Scripted::new(vec![
            LlmResponse::ToolCalls(vec![
                ToolCall { id: String::new(), name: "now".into(), arguments: json!({}) },
                ToolCall { id: String::new(), name: "now".into(), arguments: json!({}) },
            ]),
            tool_call("call_0"),
            LlmResponse::Text("noon".into()),
        ]);
        let agent = agent_with(backend.clone(), 3);
        let ctx = RunContext::new("s");
        let ledger = ctx.ledger.clone();
        let events = collect(agent.run_stream(ctx, "time?").unwrap()).await;

        let started: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolCallStarted { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        let finished: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolCallResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["call_0", "call_1", "call_2"]);
        assert_eq!(finished, started);
        for id in &started {
            assert_eq!(ledger.take(id).as_deref(), Some("12:00"));
        }

        // The transcript pairs each result with the id its call was given.
        let requests = backend.requests.lock().unwrap();
        let second = &requests[1].messages;
        let assistant = second.iter().find(|m| !m.tool_calls.is_empty()).unwrap();
        let ids: Vec<&str> = assistant.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["call_0", "call_1"]);
        let results: Vec<&str> = second
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(results, ids);
    }

    #[tokio::test]
    async fn one_run_per_conversation_at_a_time() {
        let backend = Scripted::new(vec![
            LlmResponse::Text("first".into()),
            LlmResponse::Text("other".into()),
            LlmResponse::Text("second".into()),
        ]);
        let agent = agent_with(backend, 3);

        let first = agent.run_stream(RunContext::new("s"), "a").unwrap();
        assert!(agent.is_running("s"));
        let err = agent.run_stream(RunContext::new("s"), "b").unwrap_err();
        assert!(matches!(err, AgentError::AgentBusy { ref conversation_id, .. } if conversation_id == "s"));
        assert!(matches!(agent.run("s", "b").await, Err(AgentError::AgentBusy { .. })));

        // Other conversations are unaffected.
        let other = agent.run_stream(RunContext::new("t"), "c").unwrap();
        assert_eq!(collect(first).await.last(), Some(&AgentEvent::Done));
        assert_eq!(collect(other).await.last(), Some(&AgentEvent::Done));
        assert!(!agent.is_running("s"));

        let again = collect(agent.run_stream(RunContext::new("s"), "b").unwrap()).await;
        assert!(again.contains(&AgentEvent::Content("second".into())));
    }

    #[tokio::test]
    async fn run_stream_refuses_to_start() {
        let agent = agent_with(Scripted::new(vec![]), 3);
        let ctx = RunContext::new("s");
        ctx.cancel.cancel();
        assert!(agent.run_stream(ctx, "hi").unwrap_err().is_cancelled());
        assert!(agent.run_stream(RunContext::new("s"), "  ").is_err());
    }
}
