//! CLI entry point for agentwing.
//!
//! This binary provides the `agentwing` command with subcommands for serving
//! the HTTP API, checking status and managing stored LLM configurations.

mod cli;
mod helpers;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use agentwing_agent::{
    EngineConfig, McpToolAdapter, ProviderBackendFactory, SYSTEM_PROMPT_ID, SessionEngine,
    ToolRegistry, provider_info,
};
use agentwing_store::{Database, LlmConfigRecord, LlmConfigStore, PromptStore, SessionStore};
use agentwing_web::{WebConfig, WebServer};

use crate::cli::{AddConfig, Cli, Commands, ConfigAction};
use crate::helpers::{bootstrap_llm_config, env_non_empty, init_tracing, split_endpoints};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Best effort: a missing .env is normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, port } => cmd_serve(&cli.db, bind, port).await,
        Commands::Status => cmd_status(&cli.db).await,
        Commands::Config { action } => cmd_config(&cli.db, action).await,
    }
}

/// Open the database, creating its parent directory on first use.
async fn open_db(path: &Path) -> Result<Database> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Database::open_and_migrate(path.to_path_buf())
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

async fn cmd_serve(db_path: &Path, bind: String, port: u16) -> Result<()> {
    init_tracing("info");
    info!("starting agentwing");

    let db = open_db(db_path).await?;
    info!(path = %db_path.display(), "store initialized");

    bootstrap_llm_config(&LlmConfigStore::new(db.clone()), env_non_empty)
        .await
        .context("invalid AGENTWING_LLM_* configuration")?;

    let tools = connect_tools().await;
    info!(tools = tools.len(), "tool registry ready");

    let engine = SessionEngine::new(
        db,
        tools,
        Arc::new(ProviderBackendFactory),
        EngineConfig::default(),
    )
    .await
    .context("failed to start session engine")?;

    let server = WebServer::new(WebConfig { bind_addr: bind, port }, Arc::new(engine));
    server
        .start()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("web server failed")?;

    info!("shutting down");
    Ok(())
}

/// Register every tool server listed in `AGENTWING_MCP_URL`. Unreachable
/// servers are skipped.
async fn connect_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let Some(raw) = env_non_empty("AGENTWING_MCP_URL") else {
        return registry;
    };
    for endpoint in split_endpoints(&raw) {
        match McpToolAdapter::connect(endpoint.as_str()).await {
            Ok(adapter) => registry.register(Arc::new(adapter)),
            Err(e) => warn!(endpoint = %endpoint, error = %e, "tool server unavailable, skipping"),
        }
    }
    registry
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(db_path: &Path) -> Result<()> {
    init_tracing("warn");

    println!();
    println!("  agentwing Status");
    println!("  ================");
    println!();

    if !db_path.exists() {
        println!("  Database:         NOT INITIALIZED ({})", db_path.display());
        println!("                    run `agentwing serve` to create it");
        println!();
        return Ok(());
    }
    let db = open_db(db_path).await?;
    println!("  Database:         OK ({})", db_path.display());

    let sessions = SessionStore::new(db.clone()).list().await?;
    println!("  Sessions:         {}", sessions.len());

    match LlmConfigStore::new(db.clone()).default_config().await? {
        Some(config) => println!("  Default LLM:      {}", provider_info(&config)),
        None => println!("  Default LLM:      NOT CONFIGURED (see `agentwing config add`)"),
    }

    let prompt = PromptStore::new(db).get(SYSTEM_PROMPT_ID).await?;
    println!(
        "  System prompt:    {}",
        if prompt.is_some() { "custom" } else { "built-in" }
    );

    match env_non_empty("AGENTWING_MCP_URL") {
        Some(raw) => println!("  Tool servers:     {}", split_endpoints(&raw).join(", ")),
        None => println!("  Tool servers:     none"),
    }

    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: config
// ---------------------------------------------------------------------------

async fn cmd_config(db_path: &Path, action: ConfigAction) -> Result<()> {
    init_tracing("warn");
    let db = open_db(db_path).await?;
    let store = LlmConfigStore::new(db.clone());

    match action {
        ConfigAction::List => {
            let configs = store.list().await?;
            if configs.is_empty() {
                println!("No LLM configurations stored.");
            }
            for c in configs {
                let flags = match (c.is_default, c.is_active) {
                    (true, _) => " [default]",
                    (false, false) => " [inactive]",
                    _ => "",
                };
                println!("{}  {}  {}{flags}", c.id, c.name, provider_info(&c));
            }
        }
        ConfigAction::Add(add) => {
            let record = record_from_args(add);
            agentwing_agent::llm::validate_config(&record)?;
            let created = store.create(&record).await?;
            println!("Stored {} ({})", created.id, provider_info(&created));
        }
        ConfigAction::Remove { id } => {
            store
                .delete(&id)
                .await
                .with_context(|| format!("cannot remove {id}"))?;
            println!("Removed {id}");
        }
        ConfigAction::Default { id } => {
            store
                .set_default(&id)
                .await
                .with_context(|| format!("cannot make {id} the default"))?;
            println!("{id} is now the default");
        }
        ConfigAction::Prompt { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            anyhow::ensure!(!content.trim().is_empty(), "prompt file is empty");
            PromptStore::new(db)
                .upsert(SYSTEM_PROMPT_ID, "System prompt", &content)
                .await?;
            println!("System prompt updated ({} chars)", content.chars().count());
        }
    }
    Ok(())
}

fn record_from_args(add: AddConfig) -> LlmConfigRecord {
    let provider = add.provider.trim().to_lowercase();
    let model = add.model.trim().to_owned();
    LlmConfigRecord {
        id: String::new(),
        name: add.name.unwrap_or_else(|| format!("{provider} {model}")),
        provider,
        api_key: add.api_key,
        model,
        base_url: add.base_url,
        is_default: add.default,
        is_active: true,
        created_at: 0,
        updated_at: 0,
    }
}
