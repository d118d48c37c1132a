use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Row,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
        SqliteSynchronous,
    },
};
use std::path::Path;
use std::str::FromStr;

use super::{Checkpoint, CheckpointStore, StoreError};
use crate::session::{SessionId, SessionStatus};

/// Checkpoint store backed by a single SQLite table.
///
/// The revision guard lives inside the upsert statement itself, so two
/// writers racing on the same session can never move a row backwards.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub async fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::connection(format!("Failed to create directory: {e}")))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| StoreError::connection(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::connection(format!("Failed to connect to SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::connection(format!("Invalid SQLite path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // Every connection to `:memory:` is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::connection(format!("Failed to connect to SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                session_id TEXT PRIMARY KEY,
                revision INTEGER NOT NULL,
                text TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration {
            message: format!("Failed to create checkpoints table: {e}"),
        })?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_checkpoints_updated_at
            ON checkpoints(updated_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration {
            message: format!("Failed to create index: {e}"),
        })?;

        Ok(())
    }

    fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint, StoreError> {
        let session_id: String = row
            .try_get("session_id")
            .map_err(|e| StoreError::database(format!("Missing session_id: {e}")))?;
        let revision: i64 = row
            .try_get("revision")
            .map_err(|e| StoreError::database(format!("Missing revision: {e}")))?;
        let text: String = row
            .try_get("text")
            .map_err(|e| StoreError::database(format!("Missing text: {e}")))?;
        let status: String = row
            .try_get("status")
            .map_err(|e| StoreError::database(format!("Missing status: {e}")))?;
        let updated_at: DateTime<Utc> = row
            .try_get("updated_at")
            .map_err(|e| StoreError::database(format!("Missing updated_at: {e}")))?;

        Ok(Checkpoint {
            session_id: SessionId::from_str(&session_id)
                .map_err(|e| StoreError::serialization(format!("Invalid session ID: {e}")))?,
            revision: revision as u64,
            text,
            status: SessionStatus::from_str(&status)
                .map_err(|e| StoreError::serialization(format!("Invalid status '{status}': {e}")))?,
            updated_at,
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn upsert(&self, checkpoint: &Checkpoint) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints (session_id, revision, text, status, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(session_id) DO UPDATE SET
                revision = excluded.revision,
                text = excluded.text,
                status = excluded.status,
                updated_at = excluded.updated_at
            WHERE excluded.revision > checkpoints.revision
              AND checkpoints.status IN ('pending', 'streaming')
            "#,
        )
        .bind(checkpoint.session_id.to_string())
        .bind(checkpoint.revision as i64)
        .bind(&checkpoint.text)
        .bind(checkpoint.status.to_string())
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to write checkpoint: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn load(&self, session_id: SessionId) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT session_id, revision, text, status, updated_at
            FROM checkpoints
            WHERE session_id = ?1
            "#,
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to load checkpoint: {e}")))?;

        row.as_ref().map(Self::checkpoint_from_row).transpose()
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<Checkpoint>, StoreError> {
        let limit = limit.map_or(-1, |l| l as i64);
        let rows = sqlx::query(
            r#"
            SELECT session_id, revision, text, status, updated_at
            FROM checkpoints
            ORDER BY updated_at DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to list checkpoints: {e}")))?;

        rows.iter().map(Self::checkpoint_from_row).collect()
    }

    async fn delete(&self, session_id: SessionId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE session_id = ?1")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to delete checkpoint: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}
