//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization, environment variable utilities and the
//! first-run LLM bootstrap.

use agentwing_store::{LlmConfigRecord, LlmConfigStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Read an environment variable, treating empty values as unset.
pub fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Build an LLM configuration from `AGENTWING_LLM_*` variables.
///
/// Provider and model are required; everything else is optional.
pub fn llm_config_from_env(lookup: impl Fn(&str) -> Option<String>) -> Option<LlmConfigRecord> {
    let provider = lookup("AGENTWING_LLM_PROVIDER")?.trim().to_lowercase();
    let model = lookup("AGENTWING_LLM_MODEL")?.trim().to_owned();
    Some(LlmConfigRecord {
        id: String::new(),
        name: format!("{provider} {model} (env)"),
        provider,
        api_key: lookup("AGENTWING_LLM_API_KEY").unwrap_or_default(),
        model,
        base_url: lookup("AGENTWING_LLM_BASE_URL").unwrap_or_default(),
        is_default: true,
        is_active: true,
        created_at: 0,
        updated_at: 0,
    })
}

/// Store the environment-provided LLM configuration when the database has
/// none. Returns the stored record, if any.
pub async fn bootstrap_llm_config(
    store: &LlmConfigStore,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Option<LlmConfigRecord>> {
    if !store.list().await?.is_empty() {
        return Ok(None);
    }
    let Some(record) = llm_config_from_env(lookup) else {
        return Ok(None);
    };
    agentwing_agent::llm::validate_config(&record)?;
    let created = store.create(&record).await?;
    info!(
        config_id = %created.id,
        config = %agentwing_agent::provider_info(&created),
        "bootstrapped LLM configuration from environment"
    );
    Ok(Some(created))
}

/// Split a comma separated endpoint list, dropping blanks.
pub fn split_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
