//! Complexity classification.
//!
//! Every user turn is first shown to the session's tool-less evaluator
//! agent, which answers with a small JSON verdict: does the request need
//! tools, and if so, which worker tier should run it. Misbehaving models
//! never fail a turn; every failure mode degrades to "answer directly".

use serde::Deserialize;

use crate::runtime::Agent;

/// System prompt of the evaluator agent.
pub const EVALUATOR_SYSTEM_PROMPT: &str = "You are a task evaluation assistant. Your ONLY job is \
to analyze user requests and classify them. DO NOT call any tools, DO NOT perform any actions, \
ONLY return the evaluation JSON.";

/// Agent tier. Worker tiers differ only by iteration budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Simple,
    Medium,
    Complex,
    Eval,
}

impl Tier {
    pub const WORKERS: [Tier; 3] = [Tier::Simple, Tier::Medium, Tier::Complex];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
            Self::Eval => "eval",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The evaluator's verdict for one user message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TaskComplexity {
    pub need_tools: bool,
    /// `simple`, `medium`, `complex` or `none`.
    pub complex_mode: String,
    pub reasoning: String,
    pub confidence: String,
    /// User-facing explanation in the user's language.
    pub explanation: String,
    /// Ready-made answer when no tools are needed.
    pub direct_response: Option<String>,
}

impl TaskComplexity {
    /// The safe default: no tools, answer directly. `reasoning` is for the
    /// logs; `explanation` is shown to the user.
    pub fn fallback(reasoning: &str, explanation: &str) -> Self {
        Self {
            need_tools: false,
            complex_mode: "none".into(),
            reasoning: reasoning.into(),
            confidence: "low".into(),
            explanation: explanation.into(),
            direct_response: None,
        }
    }

    /// Worker tier for `complex_mode`; unknown labels run as simple.
    pub fn tier(&self) -> Tier {
        match self.complex_mode.trim().to_ascii_lowercase().as_str() {
            "medium" => Tier::Medium,
            "complex" => Tier::Complex,
            _ => Tier::Simple,
        }
    }

    /// The direct answer, if one was supplied and is not blank.
    pub fn direct_response(&self) -> Option<&str> {
        self.direct_response
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }
}

/// Conversation id the evaluator runs under, distinct from the session's.
pub fn evaluation_conversation_id(session_id: &str) -> String {
    format!("{session_id}_eval")
}

/// The fixed classification prompt wrapped around the user's text.
pub fn build_evaluation_prompt(user_message: &str) -> String {
    format!(
        r#"Analyze the following user request and determine:
1. Does it need to use tools (browser automation, web search, calculations, etc.)?
2. If yes, estimate the number of tool calls and classify complexity

User request: "{user_message}"

**STEP 1: Determine if tools are needed**

NO TOOLS NEEDED (need_tools: false):
- Greetings, casual chat, small talk
- General knowledge questions that LLM can answer directly
- Asking for explanations, definitions, or advice
- Examples:
  * "Hi" / "Hello" → Just greeting
  * "What is AI?" → LLM knowledge
  * "How do I learn programming?" → LLM advice
  * "Tell me a joke" → LLM generation
  * "What's the capital of France?" → LLM knowledge

TOOLS NEEDED (need_tools: true):
- Real-time information (weather, news, stock prices)
- Web browsing, clicking, form filling
- Searching the web
- Calculations, data processing
- Examples:
  * "Search for today's trending GitHub repositories" → need web_search
  * "Open a search engine and search for AI news" → need browser automation
  * "What's the weather now?" → need real-time data

**STEP 2: If tools needed, classify complexity**

**SIMPLE (1-3 tool calls):**
- Single tool call tasks
- Direct web searches or calculations

**MEDIUM (4-7 tool calls):**
- Browser automation with multiple steps
- Examples:
  * "Open a site, search for 'AI news', click first result" → 4-5 calls
  * "Fill a simple form and submit" → 4-6 calls

**COMPLEX (8+ tool calls):**
- Multi-page workflows with data processing
- Examples:
  * "Compare prices across 3 sites" → 12+ calls
  * "Automate complete registration flow" → 10+ calls

Response format (JSON only, no explanation, no markdown):
{{
  "need_tools": true/false,
  "complex_mode": "simple/medium/complex",
  "reasoning": "Brief explanation",
  "confidence": "high/medium/low",
  "explanation": "Short user-friendly explanation in same language as user",
  "direct_response": "REQUIRED if need_tools is false: Complete answer"
}}

**IMPORTANT:**
- If need_tools is false:
  * Set complex_mode to "none"
  * YOU MUST include "direct_response" with the complete answer
  * The "direct_response" should be natural and in the same language as user

- If need_tools is true:
  * Set complex_mode appropriately (simple/medium/complex)
  * DO NOT include "direct_response""#
    )
}

/// Interpret the evaluator's raw answer. Never fails.
pub fn parse_evaluation(raw: &str) -> TaskComplexity {
    let cleaned = raw.trim().replace("```json", "").replace("```", "");
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        tracing::warn!("empty evaluation response, defaulting to direct response");
        return TaskComplexity::fallback(
            "Empty response, defaulting to direct response",
            "Evaluation result was empty, answering directly",
        );
    }

    let parsed: TaskComplexity = match serde_json::from_str(cleaned) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(error = %e, response = %cleaned, "failed to parse evaluation response");
            return TaskComplexity::fallback(
                "Failed to parse evaluation result",
                "Evaluation result could not be parsed, answering directly",
            );
        }
    };

    if parsed.complex_mode.trim().is_empty() && parsed.reasoning.trim().is_empty() {
        tracing::warn!(response = %cleaned, "evaluation response ignored the requested format");
        return TaskComplexity::fallback(
            "LLM returned invalid format",
            "Evaluation returned an unexpected format, answering directly",
        );
    }
    parsed
}

/// Classify `user_message` with the session's evaluator.
pub async fn classify(evaluator: &Agent, session_id: &str, user_message: &str) -> TaskComplexity {
    let prompt = build_evaluation_prompt(user_message);
    let conversation = evaluation_conversation_id(session_id);

    let complexity = match evaluator.run(&conversation, &prompt).await {
        Ok(raw) => parse_evaluation(&raw),
        Err(e) => {
            tracing::warn!(session_id, error = %e, "task evaluation failed, defaulting to direct response");
            TaskComplexity::fallback(
                "Evaluation failed, defaulting to direct response",
                "Evaluation failed, answering directly",
            )
        }
    };

    tracing::info!(
        session_id,
        need_tools = complexity.need_tools,
        complex_mode = %complexity.complex_mode,
        confidence = %complexity.confidence,
        "task evaluated"
    );
    complexity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_responses_fall_back() {
        for raw in [
            "",
            "   ",
            "```json\n```",
            "not json at all",
            "{\"need_tools\": tru",
            "[1, 2, 3]",
            "{}",
            "{\"need_tools\": true}",
            "{\"confidence\": \"high\", \"explanation\": \"x\"}",
        ] {
            let c = parse_evaluation(raw);
            assert!(!c.need_tools, "{raw:?}");
            assert_eq!(c.complex_mode, "none", "{raw:?}");
            assert_eq!(c.confidence, "low", "{raw:?}");
        }
    }

    #[test]
    fn fallback_reasons_are_distinct() {
        assert_eq!(
            parse_evaluation("").reasoning,
            "Empty response, defaulting to direct response"
        );
        assert_eq!(
            parse_evaluation("nope").reasoning,
            "Failed to parse evaluation result"
        );
        assert_eq!(parse_evaluation("{}").reasoning, "LLM returned invalid format");

        let explanations: Vec<String> = ["", "nope", "{}"]
            .into_iter()
            .map(|raw| parse_evaluation(raw).explanation)
            .collect();
        assert!(explanations.iter().all(|e| e.ends_with("answering directly")));
        assert_ne!(explanations[0], explanations[1]);
        assert_ne!(explanations[1], explanations[2]);
    }

    #[test]
    fn fenced_json_is_accepted() {
        let raw = "```json\n{\"need_tools\": true, \"complex_mode\": \"medium\", \"reasoning\": \"form\"}\n```";
        let c = parse_evaluation(raw);
        assert!(c.need_tools);
        assert_eq!(c.tier(), Tier::Medium);
        assert!(c.direct_response().is_none());
    }

    #[test]
    fn tier_mapping_defaults_to_simple() {
        let mut c = TaskComplexity::fallback("x", "y");
        for (mode, tier) in [
            ("simple", Tier::Simple),
            ("medium", Tier::Medium),
            ("complex", Tier::Complex),
            ("COMPLEX", Tier::Complex),
            ("none", Tier::Simple),
            ("extreme", Tier::Simple),
            ("", Tier::Simple),
        ] {
            c.complex_mode = mode.into();
            assert_eq!(c.tier(), tier, "{mode}");
        }
    }

    #[test]
    fn blank_direct_response_is_ignored() {
        let c = parse_evaluation(
            r#"{"need_tools": false, "complex_mode": "none", "reasoning": "chat", "direct_response": "  "}"#,
        );
        assert!(c.direct_response().is_none());
    }

    #[test]
    fn prompt_embeds_message() {
        let prompt = build_evaluation_prompt("Bonjour");
        assert!(prompt.contains("User request: \"Bonjour\""));
        assert!(prompt.contains("\"direct_response\""));
        assert_eq!(evaluation_conversation_id("abc"), "abc_eval");
    }

    struct Unreachable;

    #[async_trait::async_trait]
    impl crate::llm::LlmBackend for Unreachable {
        fn provider(&self) -> &str {
            "down"
        }
        fn model(&self) -> &str {
            "down-1"
        }
        async fn generate_with_tools(
            &self,
            _request: &crate::llm::types::ChatRequest,
        ) -> crate::error::Result<crate::llm::types::LlmResponse> {
            Err(crate::error::AgentError::LlmRequestFailed {
                reason: "connection refused".into(),
            })
        }
    }

    #[tokio::test]
    async fn evaluator_failure_explains_the_fallback() {
        let evaluator = Agent::new("eval", std::sync::Arc::new(Unreachable), EVALUATOR_SYSTEM_PROMPT, 1);
        let c = classify(&evaluator, "s1", "hello").await;
        assert!(!c.need_tools);
        assert_eq!(c.reasoning, "Evaluation failed, defaulting to direct response");
        assert_eq!(c.explanation, "Evaluation failed, answering directly");
    }
}
