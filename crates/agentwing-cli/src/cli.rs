//! CLI argument definitions for agentwing.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// agentwing -- a tiered LLM agent server.
#[derive(Parser)]
#[command(
    name = "agentwing",
    version,
    about = "agentwing -- tiered LLM agent server",
    long_about = "Routes each chat turn through a complexity classifier to a direct answer \
                  or a tool-using agent, and streams the result over HTTP."
)]
pub struct Cli {
    /// SQLite database path.
    #[arg(long, global = true, env = "AGENTWING_DB", default_value = "data/agentwing.db")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server.
    Serve {
        /// Address to bind the HTTP server to.
        #[arg(long, env = "AGENTWING_BIND", default_value = "127.0.0.1")]
        bind: String,

        /// Port to listen on.
        #[arg(long, short, env = "AGENTWING_PORT", default_value_t = 3000)]
        port: u16,
    },

    /// Show current system status.
    Status,

    /// Manage stored LLM configurations and the system prompt.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Actions for managing LLM configurations.
#[derive(Subcommand)]
pub enum ConfigAction {
    /// List stored configurations.
    List,
    /// Store a new configuration.
    Add(AddConfig),
    /// Delete a configuration by id.
    Remove {
        /// The configuration id.
        id: String,
    },
    /// Make a configuration the default.
    Default {
        /// The configuration id.
        id: String,
    },
    /// Replace the worker system prompt with the contents of a file.
    Prompt {
        /// File holding the prompt text.
        file: PathBuf,
    },
}

#[derive(Args)]
pub struct AddConfig {
    /// Provider name (openai, anthropic, deepseek, ollama, ...).
    #[arg(long)]
    pub provider: String,

    /// Model identifier.
    #[arg(long)]
    pub model: String,

    /// API key; not needed for ollama.
    #[arg(long, env = "AGENTWING_LLM_API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,

    /// Override the provider's base URL.
    #[arg(long, default_value = "")]
    pub base_url: String,

    /// Display name.
    #[arg(long)]
    pub name: Option<String>,

    /// Make this the default configuration.
    #[arg(long)]
    pub default: bool,
}
