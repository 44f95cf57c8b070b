//! # tidings
//!
//! CLI for inspecting and exercising a local tidings message store.
//!
//! ## Commands
//!
//! - `topics`: List topics with their watermarks and queue sizes
//! - `history`: Show cached messages of a topic
//! - `queued`: Show messages waiting to be transmitted
//! - `draft`: Save a draft
//! - `recover`: Requeue messages left in flight by a crash
//! - `send`: Queue a message, or deliver it to a loopback server with `--mock`
//!
//! ## Example
//!
//! ```bash
//! # Queue two messages while offline
//! tidings send grp1 "Hello"
//! tidings send grp1 "Are you there?"
//!
//! # Inspect the queue
//! tidings queued grp1
//!
//! # Flush everything through the loopback server
//! tidings send grp1 "Back online" --mock
//! tidings history grp1
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tidings_sync_types::TopicName;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{draft, history, queued, recover, send, topics};
use config::CliConfig;

/// CLI for inspecting and exercising a local tidings message store.
#[derive(Parser, Debug)]
#[command(name = "tidings")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory holding the message database
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List known topics
    Topics,

    /// Show cached history of a topic
    History {
        /// Topic name
        topic: String,

        /// Maximum number of messages to show
        #[arg(long, short, default_value = "20")]
        limit: u64,
    },

    /// Show messages waiting to be transmitted
    Queued {
        /// Topic name
        topic: String,
    },

    /// Save a draft
    Draft {
        /// Topic name
        topic: String,

        /// Message text
        text: String,
    },

    /// Requeue messages left in flight and detach all topics
    Recover,

    /// Send a message
    Send {
        /// Topic name
        topic: String,

        /// Message text
        text: String,

        /// Deliver through a local loopback server instead of only queueing
        #[arg(long)]
        mock: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;
    config::set_dir_permissions_0700(&data_dir).await?;

    let config = CliConfig::load(cli.config.as_deref(), &data_dir)?;

    match cli.command {
        Commands::Topics => {
            topics::run(&config).await?;
        }
        Commands::History { topic, limit } => {
            history::run(&config, &TopicName::new(topic), limit).await?;
        }
        Commands::Queued { topic } => {
            queued::run(&config, &TopicName::new(topic)).await?;
        }
        Commands::Draft { topic, text } => {
            draft::run(&config, &TopicName::new(topic), &text).await?;
        }
        Commands::Recover => {
            recover::run(&config).await?;
        }
        Commands::Send { topic, text, mock } => {
            send::run(&config, &TopicName::new(topic), &text, mock).await?;
        }
    }

    Ok(())
}

/// Get the default data directory for the CLI.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("chat", "tidings", "tidings")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_send_with_mock() {
        let cli = Cli::parse_from([
            "tidings", "--data-dir", "/tmp/t", "send", "grp1", "hi", "--mock",
        ]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/t")));
        assert!(matches!(
            cli.command,
            Commands::Send { ref topic, mock: true, .. } if topic == "grp1"
        ));
    }
}
