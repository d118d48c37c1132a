use clap::Parser;
use eyre::Result;

use chatwire::cli::{Cli, Commands, config};
use chatwire::commands::{
    Command, checkpoint::CheckpointCommand, connect::ConnectCommand, replay::ReplayCommand,
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    config::load_env()?;

    // Level configured via RUST_LOG
    chatwire_core::utils::tracing::init_tracing()?;

    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Replay { file, chunk_size } => {
            let command = ReplayCommand {
                file,
                chunk_size,
                config,
                session_db: cli.session_db,
            };
            command.execute().await
        }
        Commands::Connect {
            url,
            body,
            user,
            headers,
        } => {
            let command = ConnectCommand {
                url,
                body,
                user,
                headers,
                config,
                session_db: cli.session_db,
            };
            command.execute().await
        }
        Commands::Checkpoint { command } => {
            let command = CheckpointCommand {
                command,
                config,
                session_db: cli.session_db,
            };
            command.execute().await
        }
    }
}
