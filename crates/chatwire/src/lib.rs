pub mod cli;
pub mod commands;
pub mod render;

use eyre::{Result, eyre};
use std::path::PathBuf;
use std::sync::Arc;

use chatwire_core::{
    ChatStreamService, ChatwireConfig, InMemoryAdmissionLimiter, PersistConfig, Persister,
    SqliteCheckpointStore,
};

/// Open the checkpoint database at `session_db`, or the configured default.
pub async fn open_checkpoint_store(
    config: &ChatwireConfig,
    session_db: Option<&PathBuf>,
) -> Result<Arc<SqliteCheckpointStore>> {
    let db_path = match session_db {
        Some(path) => path.clone(),
        None => config.persist.resolved_database_path()?,
    };

    let store = SqliteCheckpointStore::new(&db_path)
        .await
        .map_err(|e| eyre!("Failed to open checkpoint database {}: {}", db_path.display(), e))?;

    Ok(Arc::new(store))
}

/// Wire a service to an in-process limiter and the SQLite checkpoint store.
pub async fn create_service(
    config: ChatwireConfig,
    session_db: Option<&PathBuf>,
) -> Result<ChatStreamService> {
    let store = open_checkpoint_store(&config, session_db).await?;
    let persister = Persister::spawn(store, PersistConfig::from(&config.persist));
    let limiter = Arc::new(InMemoryAdmissionLimiter::new());

    Ok(ChatStreamService::new(limiter, persister, config))
}
