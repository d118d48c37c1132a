use async_trait::async_trait;
use chrono::Local;
use eyre::{Result, eyre};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use super::Command;
use crate::cli::CheckpointCommands;
use chatwire_core::{Checkpoint, CheckpointStore, ChatwireConfig, SessionId};

pub struct CheckpointCommand {
    pub command: CheckpointCommands,
    pub config: ChatwireConfig,
    pub session_db: Option<PathBuf>,
}

#[async_trait]
impl Command for CheckpointCommand {
    async fn execute(&self) -> Result<()> {
        let store = crate::open_checkpoint_store(&self.config, self.session_db.as_ref()).await?;
        let mut stdout = std::io::stdout();

        match &self.command {
            CheckpointCommands::List { limit } => {
                let checkpoints = store
                    .list(Some(*limit))
                    .await
                    .map_err(|e| eyre!("Failed to list checkpoints: {}", e))?;
                write_table(&mut stdout, &checkpoints)?;
            }
            CheckpointCommands::Show { session_id } => {
                let session_id = parse_session_id(session_id)?;
                let checkpoint = store
                    .load(session_id)
                    .await
                    .map_err(|e| eyre!("Failed to load checkpoint: {}", e))?
                    .ok_or_else(|| eyre!("No checkpoint for session {}", session_id))?;
                write_detail(&mut stdout, &checkpoint)?;
            }
            CheckpointCommands::Delete { session_id } => {
                let session_id = parse_session_id(session_id)?;
                let deleted = store
                    .delete(session_id)
                    .await
                    .map_err(|e| eyre!("Failed to delete checkpoint: {}", e))?;
                if deleted {
                    writeln!(stdout, "Deleted checkpoint for session {session_id}")?;
                } else {
                    eyre::bail!("No checkpoint for session {}", session_id);
                }
            }
        }

        Ok(())
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId> {
    SessionId::from_str(raw).map_err(|e| eyre!("Invalid session ID '{}': {}", raw, e))
}

fn preview(text: &str, width: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= width {
        return single_line;
    }
    let truncated: String = single_line.chars().take(width.saturating_sub(3)).collect();
    format!("{truncated}...")
}

fn write_table<W: Write>(out: &mut W, checkpoints: &[Checkpoint]) -> Result<()> {
    if checkpoints.is_empty() {
        writeln!(out, "No checkpoints found.")?;
        return Ok(());
    }

    writeln!(out, "Checkpoints:")?;
    writeln!(
        out,
        "{:<36} {:<10} {:<8} {:<20} {:<40}",
        "Session", "Status", "Rev", "Updated", "Text"
    )?;
    writeln!(out, "{}", "-".repeat(118))?;

    for checkpoint in checkpoints {
        writeln!(
            out,
            "{:<36} {:<10} {:<8} {:<20} {:<40}",
            checkpoint.session_id,
            checkpoint.status,
            checkpoint.revision,
            checkpoint
                .updated_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S"),
            preview(&checkpoint.text, 40),
        )?;
    }

    Ok(())
}

fn write_detail<W: Write>(out: &mut W, checkpoint: &Checkpoint) -> Result<()> {
    writeln!(out, "Session:  {}", checkpoint.session_id)?;
    writeln!(out, "Status:   {}", checkpoint.status)?;
    writeln!(out, "Revision: {}", checkpoint.revision)?;
    writeln!(
        out,
        "Updated:  {}",
        checkpoint
            .updated_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
    )?;
    writeln!(out)?;
    writeln!(out, "{}", checkpoint.text)?;
    Ok(())
}
