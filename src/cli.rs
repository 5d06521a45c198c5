use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::ClientConfig;
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "aiaio")]
#[command(version)]
#[command(about = "Terminal client for a self-hosted aiaio chat server")]
pub struct Args {
    /// TOML config file (base_url, reconnect_delay_ms, ...)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Server base URL; overrides the config file and AIAIO_URL
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Disable coloured output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Send a prompt and stream the reply (Ctrl-C stops generation)
    Chat {
        /// Prompt text
        prompt: String,

        /// Continue an existing conversation instead of starting one
        #[arg(long, short)]
        conversation: Option<String>,

        /// File to attach (repeatable)
        #[arg(long = "attach", short = 'a')]
        attachments: Vec<PathBuf>,

        /// System prompt for this request
        #[arg(long)]
        system: Option<String>,
    },
    /// Stream a new version of an assistant message
    Regenerate {
        conversation: String,
        message: String,

        #[arg(long)]
        system: Option<String>,
    },
    /// List conversations, newest first
    List {
        /// Only conversations of this project
        #[arg(long)]
        project: Option<String>,
    },
    /// Print a conversation's messages
    Show { conversation: String },
    /// Delete a conversation
    Delete { conversation: String },
    /// Set a conversation's title
    Rename { conversation: String, title: String },
    /// Replace a message's content
    Edit { message: String, content: String },
    /// Print live updates as they arrive
    Watch,
    /// List system prompts
    Prompts,
    /// List configured providers
    Providers,
    /// Print the server version
    Version,
}

/// Layer the effective config: file (or defaults), then environment, then
/// the `--url` flag.
pub fn resolve_config(args: &Args, env: impl Fn(&str) -> Option<String>) -> Result<ClientConfig> {
    let base = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    let cfg = base.with_env_from(env)?;
    match &args.url {
        Some(url) => ClientConfig {
            base_url: ClientConfig::new(url.as_str()).base_url,
            ..cfg
        }
        .with_env_from(|_| None),
        None => Ok(cfg),
    }
}
