//! Provider catalogue: endpoints, validation, capability hints, and the
//! factory that turns a stored configuration into an [`LlmBackend`].

use std::sync::Arc;

use agentwing_store::LlmConfigRecord;

use crate::error::{AgentError, Result};
use crate::llm::anthropic::{ANTHROPIC_BASE_URL, AnthropicBackend};
use crate::llm::backend::LlmBackend;
use crate::llm::openai::OpenAiBackend;

/// Default request timeout for model calls.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Default `max_tokens` per response.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Well-known OpenAI-compatible endpoints by provider key.
const BASE_URLS: &[(&str, &str)] = &[
    ("openai", "https://api.openai.com/v1"),
    ("gemini", "https://generativelanguage.googleapis.com/v1beta/openai"),
    ("mistral", "https://api.mistral.ai/v1"),
    ("deepseek", "https://api.deepseek.com"),
    ("groq", "https://api.groq.com/openai/v1"),
    ("cohere", "https://api.cohere.ai/v1"),
    ("xai", "https://api.x.ai/v1"),
    ("together", "https://api.together.xyz/v1"),
    ("novita", "https://api.novita.ai/v3/openai"),
    ("openrouter", "https://openrouter.ai/api/v1"),
    ("qwen", "https://dashscope.aliyuncs.com/compatible-mode/v1"),
    ("siliconflow", "https://api.siliconflow.cn/v1"),
    ("doubao", "https://ark.cn-beijing.volces.com/api/v3"),
    ("chatglm", "https://open.bigmodel.cn/api/paas/v4"),
    ("moonshot", "https://api.moonshot.cn/v1"),
    ("baichuan", "https://api.baichuan-ai.com/v1"),
    ("minimax", "https://api.minimax.chat/v1"),
    ("yi", "https://api.lingyiwanwu.com/v1"),
    ("stepfun", "https://api.stepfun.com/v1"),
    ("ollama", "http://localhost:11434/v1"),
];

/// Model-name keywords known to support tool calling, per provider.
/// Providers missing from this table are assumed capable.
const TOOL_CAPABLE_MODELS: &[(&str, &[&str])] = &[
    ("openai", &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-4", "gpt-3.5-turbo"]),
    ("anthropic", &["claude-3-5-sonnet", "claude-3-5-haiku", "claude-3-opus", "claude-3-sonnet", "claude-3-haiku", "claude-sonnet-4", "claude-opus-4"]),
    ("claude", &["claude-3-5-sonnet", "claude-3-5-haiku", "claude-3-opus", "claude-3-sonnet", "claude-sonnet-4"]),
    ("gemini", &["gemini-2", "gemini-1.5-pro", "gemini-1.5-flash"]),
    ("mistral", &["mistral-large", "mistral-medium", "mistral-small"]),
    ("deepseek", &["deepseek-chat", "deepseek-reasoner", "deepseek-v3"]),
    ("qwen", &["qwen-max", "qwen-plus", "qwen-turbo", "qwen2.5"]),
    ("chatglm", &["glm-4-plus", "glm-4-air", "glm-4"]),
    ("moonshot", &["moonshot-v1"]),
    ("yi", &["yi-lightning", "yi-large"]),
    ("siliconflow", &["qwen2.5", "qwen/qwen", "deepseek-v3", "deepseek-ai/deepseek", "llama-3.3", "llama-3.1", "meta-llama/llama", "yi-lightning", "01-ai/yi"]),
    ("ollama", &["qwen2.5", "qwen2", "qwen", "llama3.3", "llama3.2", "llama3.1", "llama3", "llama-3", "mistral", "mixtral", "deepseek-r1", "deepseek-v3", "deepseek-coder", "yi-coder", "phi3", "phi4", "gemma2", "gemma", "command-r"]),
];

// ---------------------------------------------------------------------------
// Provider config
// ---------------------------------------------------------------------------

/// Resolved connection settings handed to an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub provider: String,
    pub api_key: String,
    pub model: String,
    /// Fully resolved endpoint root.
    pub base_url: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl ProviderConfig {
    /// Resolve a stored configuration, filling in the provider's endpoint.
    pub fn from_record(record: &LlmConfigRecord) -> Self {
        let provider = record.provider.to_lowercase();
        let base_url = if is_anthropic(&provider) && record.base_url.is_empty() {
            ANTHROPIC_BASE_URL.to_owned()
        } else {
            provider_base_url(&provider, &record.base_url).unwrap_or_else(|| {
                provider_base_url("openai", "").unwrap_or_default()
            })
        };
        Self {
            provider,
            api_key: record.api_key.clone(),
            model: record.model.clone(),
            base_url,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

fn is_anthropic(provider: &str) -> bool {
    matches!(provider, "anthropic" | "claude")
}

/// The endpoint for `provider`; a non-empty `custom` URL always wins.
pub fn provider_base_url(provider: &str, custom: &str) -> Option<String> {
    if !custom.is_empty() {
        return Some(custom.to_owned());
    }
    let provider = provider.to_lowercase();
    BASE_URLS
        .iter()
        .find(|(p, _)| *p == provider)
        .map(|(_, url)| (*url).to_owned())
}

/// Reject configurations that cannot possibly work.
pub fn validate_config(record: &LlmConfigRecord) -> Result<()> {
    let invalid = |reason: &str| AgentError::ValidationError {
        reason: reason.to_owned(),
    };
    if record.provider.trim().is_empty() {
        return Err(invalid("provider cannot be empty"));
    }
    if !record.provider.eq_ignore_ascii_case("ollama") && record.api_key.is_empty() {
        return Err(invalid("api_key cannot be empty"));
    }
    if record.model.trim().is_empty() {
        return Err(invalid("model cannot be empty"));
    }
    Ok(())
}

/// `"provider (model) @ base_url"`, for logs and API responses.
pub fn provider_info(record: &LlmConfigRecord) -> String {
    let mut info = format!("{} ({})", record.provider, record.model);
    let provider = record.provider.to_lowercase();
    let url = if is_anthropic(&provider) && record.base_url.is_empty() {
        Some(ANTHROPIC_BASE_URL.to_owned())
    } else {
        provider_base_url(&provider, &record.base_url)
    };
    if let Some(url) = url {
        info.push_str(" @ ");
        info.push_str(&url);
    }
    info
}

/// Best-effort guess whether `model` can call tools.
pub fn supports_tool_calling(provider: &str, model: &str) -> bool {
    let provider = provider.to_lowercase();
    let model = model.to_lowercase();
    match TOOL_CAPABLE_MODELS.iter().find(|(p, _)| *p == provider) {
        Some((_, keywords)) => keywords.iter().any(|k| model.contains(k)),
        None => true,
    }
}

// ---------------------------------------------------------------------------
// Backend factory
// ---------------------------------------------------------------------------

/// Builds a live backend from a stored configuration.
pub trait BackendFactory: Send + Sync {
    fn build(&self, record: &LlmConfigRecord) -> Result<Arc<dyn LlmBackend>>;
}

/// Production factory: Anthropic for `anthropic`/`claude`, the
/// OpenAI-compatible adapter for everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProviderBackendFactory;

impl BackendFactory for ProviderBackendFactory {
    fn build(&self, record: &LlmConfigRecord) -> Result<Arc<dyn LlmBackend>> {
        validate_config(record)?;
        if !supports_tool_calling(&record.provider, &record.model) {
            tracing::warn!(
                provider = %record.provider,
                model = %record.model,
                "model may not support tool calling; tool-driven turns can fail"
            );
        }

        let config = ProviderConfig::from_record(record);
        let backend: Arc<dyn LlmBackend> = if is_anthropic(&config.provider) {
            Arc::new(AnthropicBackend::new(config)?)
        } else {
            Arc::new(OpenAiBackend::new(config)?)
        };
        tracing::info!(config = %provider_info(record), "LLM backend built");
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provider: &str, key: &str, model: &str, base_url: &str) -> LlmConfigRecord {
        LlmConfigRecord {
            id: "cfg".into(),
            name: "n".into(),
            provider: provider.into(),
            api_key: key.into(),
            model: model.into(),
            base_url: base_url.into(),
            is_default: true,
            is_active: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn custom_base_url_wins() {
        assert_eq!(
            provider_base_url("deepseek", "https://proxy.local").as_deref(),
            Some("https://proxy.local")
        );
        assert_eq!(
            provider_base_url("DeepSeek", "").as_deref(),
            Some("https://api.deepseek.com")
        );
        assert!(provider_base_url("unknown", "").is_none());
    }

    #[test]
    fn validation_rules() {
        assert!(validate_config(&record("openai", "k", "gpt-4o", "")).is_ok());
        assert!(validate_config(&record("ollama", "", "llama3", "")).is_ok());
        assert!(validate_config(&record("", "k", "m", "")).is_err());
        assert!(validate_config(&record("openai", "", "gpt-4o", "")).is_err());
        assert!(validate_config(&record("openai", "k", " ", "")).is_err());
    }

    #[test]
    fn provider_info_formats() {
        assert_eq!(
            provider_info(&record("openai", "k", "gpt-4o", "")),
            "openai (gpt-4o) @ https://api.openai.com/v1"
        );
        assert_eq!(
            provider_info(&record("anthropic", "k", "claude-sonnet-4", "")),
            "anthropic (claude-sonnet-4) @ https://api.anthropic.com"
        );
        assert_eq!(provider_info(&record("custom", "k", "m", "")), "custom (m)");
    }

    #[test]
    fn tool_calling_table() {
        assert!(supports_tool_calling("openai", "gpt-4o-2024-08-06"));
        assert!(!supports_tool_calling("openai", "text-davinci-003"));
        assert!(supports_tool_calling("ollama", "qwen2.5:7b"));
        assert!(supports_tool_calling("somewhere-new", "anything"));
    }

    #[test]
    fn factory_picks_adapter_by_provider() {
        let factory = ProviderBackendFactory;
        let anthropic = factory
            .build(&record("claude", "k", "claude-sonnet-4", ""))
            .unwrap();
        assert_eq!(anthropic.provider(), "claude");
        assert!(anthropic.supports_streaming());

        let local = factory.build(&record("ollama", "", "llama3", "")).unwrap();
        assert_eq!(local.model(), "llama3");
        assert!(factory.build(&record("openai", "", "gpt-4o", "")).is_err());
    }

    #[test]
    fn unknown_providers_fall_back_to_openai_endpoint() {
        let cfg = ProviderConfig::from_record(&record("vllm", "k", "m", ""));
        assert_eq!(cfg.base_url, "https://api.openai.com/v1");
    }
}
