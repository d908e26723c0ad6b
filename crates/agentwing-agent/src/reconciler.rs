//! Streaming reconciliation of one user turn.
//!
//! A turn moves through a small state machine:
//!
//! ```text
//! Idle -> Evaluating -> DirectAnswering --------------------> Finalizing -> Done
//!                    \              \ (escalate)            /
//!                     `---------------> ToolAgentRunning --'
//!
//! any non-terminal state -> Errored
//! ```
//!
//! While an agent runs, its [`AgentEvent`]s are folded into the in-flight
//! assistant message and forwarded as [`StreamChunk`]s in the order they
//! arrive. Tool calls live in a [`ToolCallArena`] indexed by call id, and a
//! result event that arrives without its text is completed from the
//! fallback chain in [`resolve_result`].

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::classifier::{TaskComplexity, Tier, classify};
use crate::error::{AgentError, Result};
use crate::events::{StreamChunk, ToolCallRecord, ToolCallStatus};
use crate::pool::AgentInstances;
use crate::runtime::{AgentEvent, RunContext, ToolEventStatus};
use crate::session::{ChatMessage, MessageRole};
use crate::tools::ToolResultLedger;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Where a turn currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Evaluating,
    DirectAnswering,
    ToolAgentRunning,
    Finalizing,
    Done,
    Errored,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored)
    }

    fn allows(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (s, Errored) => !s.is_terminal(),
            (Idle, Evaluating)
            | (Evaluating, DirectAnswering | ToolAgentRunning)
            | (DirectAnswering, ToolAgentRunning | Finalizing)
            | (ToolAgentRunning, Finalizing)
            | (Finalizing, Done) => true,
            _ => false,
        }
    }
}

/// Tracks and validates the state of one turn.
#[derive(Debug)]
pub struct TurnMachine {
    session_id: String,
    state: TurnState,
}

impl TurnMachine {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: TurnState::Idle,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn transition(&mut self, next: TurnState) -> Result<()> {
        if !self.state.allows(next) {
            return Err(AgentError::Internal(format!(
                "invalid turn transition {:?} -> {next:?}",
                self.state
            )));
        }
        tracing::debug!(session_id = %self.session_id, from = ?self.state, to = ?next, "turn transition");
        self.state = next;
        Ok(())
    }

    /// Move to [`TurnState::Errored`] unless already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = TurnState::Errored;
        }
    }
}

// ---------------------------------------------------------------------------
// Tool-call arena
// ---------------------------------------------------------------------------

/// The tool calls of one assistant message, in first-seen order.
#[derive(Debug, Default)]
pub struct ToolCallArena {
    records: Vec<ToolCallRecord>,
    index: HashMap<String, usize>,
}

impl ToolCallArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map an event's call id to a record key. An empty id on a start opens a
    /// fresh `call_N` record; an empty id on a result attaches to the latest
    /// unfinished record of the same tool.
    fn key(&self, call_id: &str, tool_name: &str, opening: bool) -> String {
        if !call_id.is_empty() {
            return call_id.to_owned();
        }
        if !opening
            && let Some(open) = self
                .records
                .iter()
                .rev()
                .find(|r| r.tool_name == tool_name && !r.status.is_terminal())
        {
            return open.call_id.clone();
        }
        let mut n = self.records.len();
        while self.index.contains_key(&format!("call_{n}")) {
            n += 1;
        }
        format!("call_{n}")
    }

    fn slot(&mut self, key: String, tool_name: &str, arguments: &Value) -> usize {
        if let Some(&i) = self.index.get(&key) {
            return i;
        }
        self.records
            .push(ToolCallRecord::started(key.clone(), tool_name, arguments));
        self.index.insert(key, self.records.len() - 1);
        self.records.len() - 1
    }

    /// Register a started call. A repeated id updates the existing record.
    pub fn start(&mut self, call_id: &str, tool_name: &str, arguments: &Value) -> &ToolCallRecord {
        let key = self.key(call_id, tool_name, true);
        let known = self.index.contains_key(&key);
        let i = self.slot(key, tool_name, arguments);
        if known {
            let fresh = ToolCallRecord::started(call_id, tool_name, arguments);
            let record = &mut self.records[i];
            if !fresh.arguments.is_empty() {
                record.arguments = fresh.arguments;
            }
            if !fresh.instructions.is_empty() {
                record.instructions = fresh.instructions;
            }
        }
        &self.records[i]
    }

    /// Apply a result. A result for an unseen id creates its record first.
    pub fn finish(
        &mut self,
        call_id: &str,
        tool_name: &str,
        status: ToolCallStatus,
        result: String,
    ) -> &ToolCallRecord {
        let key = self.key(call_id, tool_name, false);
        let i = self.slot(key, tool_name, &Value::Null);
        let record = &mut self.records[i];
        if record.advance(status) && !result.is_empty() {
            record.result = result;
        }
        &self.records[i]
    }

    pub fn records(&self) -> &[ToolCallRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<ToolCallRecord> {
        self.records
    }
}

/// Pick a tool result from the first source that has one: the event's
/// `result`, its `content`, `metadata["result"]`, then the turn's ledger.
pub fn resolve_result(
    call_id: &str,
    result: Option<&str>,
    content: Option<&str>,
    metadata: &Map<String, Value>,
    ledger: &ToolResultLedger,
) -> String {
    let from_metadata = metadata.get("result").and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    });

    [result.map(str::to_owned), content.map(str::to_owned), from_metadata]
        .into_iter()
        .flatten()
        .find(|s| !s.is_empty())
        .or_else(|| ledger.take(call_id))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Event reconciliation
// ---------------------------------------------------------------------------

/// The assistant message being assembled during a turn.
#[derive(Debug)]
pub struct AssistantDraft {
    message: ChatMessage,
    arena: ToolCallArena,
}

impl AssistantDraft {
    pub fn new(message_id: impl Into<String>) -> Self {
        let mut message = ChatMessage::new(MessageRole::Assistant, "");
        message.id = message_id.into();
        Self {
            message,
            arena: ToolCallArena::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn content(&self) -> &str {
        &self.message.content
    }

    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        self.arena.records()
    }

    /// Freeze into the completed message.
    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            tool_calls: self.arena.into_records(),
            ..self.message
        }
    }
}

pub(crate) async fn emit(out: &mpsc::Sender<StreamChunk>, chunk: StreamChunk) {
    if out.send(chunk).await.is_err() {
        tracing::debug!("stream receiver dropped, chunk discarded");
    }
}

/// Fold an agent run's events into `draft`, forwarding each as it arrives.
///
/// Returns once the event channel closes. An [`AgentEvent::Error`] aborts
/// with [`AgentError::AgentRun`]; cancellation aborts with
/// [`AgentError::Cancelled`] without draining the remaining events.
pub async fn reconcile(
    events: &mut mpsc::UnboundedReceiver<AgentEvent>,
    draft: &mut AssistantDraft,
    ledger: &ToolResultLedger,
    cancel: &CancellationToken,
    out: &mpsc::Sender<StreamChunk>,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            event = events.recv() => event,
        };
        let Some(event) = event else {
            return Ok(());
        };

        match event {
            AgentEvent::Content(text) => {
                draft.message.content.push_str(&text);
                emit(out, StreamChunk::message(text, &draft.message.id)).await;
            }
            AgentEvent::ToolCallStarted {
                call_id,
                name,
                arguments,
            } => {
                tracing::debug!(tool = %name, call_id = %call_id, "tool call started");
                let record = draft.arena.start(&call_id, &name, &arguments).clone();
                emit(out, StreamChunk::tool_call(record, &draft.message.id)).await;
            }
            AgentEvent::ToolCallResult {
                call_id,
                name,
                status,
                result,
                content,
                metadata,
            } => {
                let status = match status {
                    ToolEventStatus::Executing => ToolCallStatus::Calling,
                    ToolEventStatus::Completed => ToolCallStatus::Success,
                    ToolEventStatus::Error => ToolCallStatus::Error,
                };
                let text = if status.is_terminal() {
                    resolve_result(&call_id, result.as_deref(), content.as_deref(), &metadata, ledger)
                } else {
                    String::new()
                };
                tracing::debug!(tool = %name, call_id = %call_id, %status, "tool call result");
                let record = draft.arena.finish(&call_id, &name, status, text).clone();
                emit(out, StreamChunk::tool_call(record, &draft.message.id)).await;
            }
            AgentEvent::Thinking(text) => {
                tracing::debug!(thinking = %text, "agent thinking");
            }
            AgentEvent::Error(reason) => {
                return Err(AgentError::AgentRun { reason });
            }
            AgentEvent::Done => {
                tracing::debug!(message_id = %draft.message.id, "agent run completed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Turn driver
// ---------------------------------------------------------------------------

/// Pacing of the direct-response fast path.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// Characters per message chunk.
    pub chunk_chars: usize,
    pub delay: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            chunk_chars: 20,
            delay: Duration::from_millis(10),
        }
    }
}

/// Everything one turn needs.
pub struct TurnPlan<'a> {
    pub session_id: &'a str,
    pub user_text: &'a str,
    pub instances: &'a AgentInstances,
    pub message_id: &'a str,
    pub cancel: &'a CancellationToken,
    pub out: &'a mpsc::Sender<StreamChunk>,
    pub pacing: Pacing,
}

enum PathOutcome {
    Finished,
    /// The direct path could not start; run the tool path instead.
    Escalate,
}

/// Drive a turn from classification to a completed assistant message.
///
/// On success the machine is left in [`TurnState::Finalizing`]; the caller
/// persists the message and emits `done`. On failure it is `Errored`.
pub async fn execute_turn(machine: &mut TurnMachine, plan: TurnPlan<'_>) -> Result<ChatMessage> {
    let result = drive(machine, &plan).await;
    if result.is_err() {
        machine.fail();
    }
    result
}

async fn drive(machine: &mut TurnMachine, plan: &TurnPlan<'_>) -> Result<ChatMessage> {
    machine.transition(TurnState::Evaluating)?;
    let complexity = tokio::select! {
        biased;
        _ = plan.cancel.cancelled() => return Err(AgentError::Cancelled),
        c = classify(&plan.instances.eval, plan.session_id, plan.user_text) => c,
    };

    let mut draft = AssistantDraft::new(plan.message_id);
    let ledger = ToolResultLedger::new();

    let mut tier = complexity.tier();
    if !complexity.need_tools {
        machine.transition(TurnState::DirectAnswering)?;
        match direct_answer(plan, &complexity, &mut draft, &ledger).await? {
            PathOutcome::Finished => {
                machine.transition(TurnState::Finalizing)?;
                return Ok(draft.into_message());
            }
            PathOutcome::Escalate => {
                // The simple agent just refused to start.
                if tier == Tier::Simple {
                    tier = Tier::Medium;
                }
                tracing::info!(session_id = plan.session_id, %tier, "direct response unavailable, escalating to tool agent");
            }
        }
    }

    machine.transition(TurnState::ToolAgentRunning)?;
    let agent = plan.instances.get(tier);
    tracing::info!(
        session_id = plan.session_id,
        %tier,
        max_iterations = agent.max_iterations(),
        reasoning = %complexity.reasoning,
        "running tool agent"
    );

    let mut events = agent.run_stream(run_context(plan, &ledger), plan.user_text)?;
    reconcile(&mut events, &mut draft, &ledger, plan.cancel, plan.out).await?;

    machine.transition(TurnState::Finalizing)?;
    Ok(draft.into_message())
}

fn run_context(plan: &TurnPlan<'_>, ledger: &ToolResultLedger) -> RunContext {
    RunContext::new(plan.session_id)
        .with_cancel(plan.cancel.clone())
        .with_ledger(ledger.clone())
}

async fn direct_answer(
    plan: &TurnPlan<'_>,
    complexity: &TaskComplexity,
    draft: &mut AssistantDraft,
    ledger: &ToolResultLedger,
) -> Result<PathOutcome> {
    if let Some(text) = complexity.direct_response() {
        tracing::info!(session_id = plan.session_id, chars = text.chars().count(), "using direct response from evaluation");
        let chars: Vec<char> = text.chars().collect();
        for piece in chars.chunks(plan.pacing.chunk_chars.max(1)) {
            let piece: String = piece.iter().collect();
            draft.message.content.push_str(&piece);
            emit(plan.out, StreamChunk::message(piece, &draft.message.id)).await;
            tokio::select! {
                biased;
                _ = plan.cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(plan.pacing.delay) => {}
            }
        }
        return Ok(PathOutcome::Finished);
    }

    tracing::warn!(session_id = plan.session_id, "no direct response in evaluation, using simple agent");
    let simple = plan.instances.get(Tier::Simple);
    match simple.run_stream(run_context(plan, ledger), plan.user_text) {
        Ok(mut events) => {
            reconcile(&mut events, draft, ledger, plan.cancel, plan.out).await?;
            Ok(PathOutcome::Finished)
        }
        Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
        Err(e) => {
            tracing::warn!(session_id = plan.session_id, error = %e, "direct response failed to start");
            Ok(PathOutcome::Escalate)
        }
    }
}
