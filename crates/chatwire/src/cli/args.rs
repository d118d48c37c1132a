use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stream chat responses, checkpoint them, and inspect what was saved.
#[derive(Parser)]
#[command(version, about, long_about = None, author)]
pub struct Cli {
    /// Path to the config file (defaults to ~/.config/chatwire/config.toml)
    #[arg(long, env = "CHATWIRE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Path to the checkpoint database (defaults to ~/.chatwire/checkpoints.db)
    #[arg(long, env = "CHATWIRE_SESSION_DB", global = true)]
    pub session_db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Feed a recorded event-stream capture through the pipeline
    Replay {
        /// File holding the raw response body
        file: PathBuf,

        /// Deliver the body in chunks of this many bytes (default: all at once)
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Stream a live response from an endpoint. Ctrl-C aborts the session.
    Connect {
        /// Endpoint to POST the chat request to
        #[arg(long)]
        url: String,

        /// JSON request body
        #[arg(long, default_value = "{}")]
        body: String,

        /// User the request is admitted under (falls back to an anonymous key)
        #[arg(long)]
        user: Option<String>,

        /// Extra request header as NAME=VALUE (repeatable)
        #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
    /// Inspect persisted checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum CheckpointCommands {
    /// List the most recently updated checkpoints
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show one checkpoint in full
    Show {
        /// Session ID
        session_id: String,
    },
    /// Delete a checkpoint
    Delete {
        /// Session ID
        session_id: String,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}
