// Durable checkpoints of in-flight sessions.
//
// Sessions never touch storage. They hand snapshots to the `Persister`
// task, which throttles and writes them through a `CheckpointStore`.

mod persister;
mod sqlite;

pub use persister::{CheckpointRequest, CheckpointSender, PersistConfig, Persister, PersisterHandle};
pub use sqlite::SqliteCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::session::{SessionId, SessionSnapshot, SessionStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("In-memory store lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl StoreError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn lock_poisoned(message: impl Into<String>) -> Self {
        Self::LockPoisoned {
            message: message.into(),
        }
    }
}

/// Latest durable state of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: SessionId,
    pub revision: u64,
    pub text: String,
    pub status: SessionStatus,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            revision: snapshot.revision,
            text: snapshot.text.clone(),
            status: snapshot.status,
            updated_at: Utc::now(),
        }
    }

    /// Whether `self` may replace `stored`.
    ///
    /// Only strictly newer revisions are accepted, and a finalized
    /// (terminal) checkpoint is never replaced.
    pub fn supersedes(&self, stored: &Checkpoint) -> bool {
        self.revision > stored.revision && !stored.status.is_terminal()
    }
}

/// Storage for the one current checkpoint per session.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the checkpoint for its session.
    ///
    /// Returns `Ok(false)` without touching storage when the stored row is
    /// at the same or a newer revision, or already finalized.
    async fn upsert(&self, checkpoint: &Checkpoint) -> Result<bool, StoreError>;

    async fn load(&self, session_id: SessionId) -> Result<Option<Checkpoint>, StoreError>;

    /// Most recently updated checkpoints first.
    async fn list(&self, limit: Option<usize>) -> Result<Vec<Checkpoint>, StoreError>;

    async fn delete(&self, session_id: SessionId) -> Result<bool, StoreError>;
}

pub struct InMemoryCheckpointStore {
    checkpoints: std::sync::RwLock<HashMap<SessionId, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: std::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn upsert(&self, checkpoint: &Checkpoint) -> Result<bool, StoreError> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|_| StoreError::lock_poisoned("checkpoints"))?;

        if let Some(stored) = checkpoints.get(&checkpoint.session_id)
            && !checkpoint.supersedes(stored)
        {
            return Ok(false);
        }
        checkpoints.insert(checkpoint.session_id, checkpoint.clone());
        Ok(true)
    }

    async fn load(&self, session_id: SessionId) -> Result<Option<Checkpoint>, StoreError> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|_| StoreError::lock_poisoned("checkpoints"))?;
        Ok(checkpoints.get(&session_id).cloned())
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<Checkpoint>, StoreError> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|_| StoreError::lock_poisoned("checkpoints"))?;
        let mut all: Vec<Checkpoint> = checkpoints.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            all.truncate(limit);
        }
        Ok(all)
    }

    async fn delete(&self, session_id: SessionId) -> Result<bool, StoreError> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|_| StoreError::lock_poisoned("checkpoints"))?;
        Ok(checkpoints.remove(&session_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn checkpoint(
        session_id: SessionId,
        revision: u64,
        text: &str,
        status: SessionStatus,
    ) -> Checkpoint {
        Checkpoint {
            session_id,
            revision,
            text: text.to_string(),
            status,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_same_revision_twice_is_idempotent() {
        let store = InMemoryCheckpointStore::new();
        let id = SessionId::new();
        let first = checkpoint(id, 3, "Hel", SessionStatus::Streaming);

        assert!(store.upsert(&first).await.unwrap());
        let again = Checkpoint {
            text: "something else".to_string(),
            ..first.clone()
        };
        assert!(!store.upsert(&again).await.unwrap());

        assert_eq!(store.load(id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_lower_revision_is_ignored() {
        let store = InMemoryCheckpointStore::new();
        let id = SessionId::new();

        store
            .upsert(&checkpoint(id, 5, "Hello", SessionStatus::Streaming))
            .await
            .unwrap();
        let stale = checkpoint(id, 4, "Hell", SessionStatus::Streaming);

        assert!(!store.upsert(&stale).await.unwrap());
        let stored = store.load(id).await.unwrap().unwrap();
        assert_eq!(stored.text, "Hello");
        assert_eq!(stored.revision, 5);
    }

    #[tokio::test]
    async fn test_finalized_checkpoint_is_immutable() {
        let store = InMemoryCheckpointStore::new();
        let id = SessionId::new();

        store
            .upsert(&checkpoint(id, 4, "Done", SessionStatus::Completed))
            .await
            .unwrap();

        assert!(
            !store
                .upsert(&checkpoint(id, 9, "Done and more", SessionStatus::Streaming))
                .await
                .unwrap()
        );
        assert_eq!(
            store.load(id).await.unwrap().unwrap().status,
            SessionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_sessions_do_not_interfere() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let ids: Vec<SessionId> = (0..8).map(|_| SessionId::new()).collect();

        let mut tasks = Vec::new();
        for id in ids.clone() {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for revision in (1..=20).rev() {
                    let text = "x".repeat(revision as usize);
                    store
                        .upsert(&checkpoint(id, revision, &text, SessionStatus::Streaming))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for id in ids {
            let stored = store.load(id).await.unwrap().unwrap();
            assert_eq!(stored.revision, 20);
            assert_eq!(stored.text.len(), 20);
        }
        assert_eq!(store.list(Some(3)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryCheckpointStore::new();
        let id = SessionId::new();
        store
            .upsert(&checkpoint(id, 1, "", SessionStatus::Streaming))
            .await
            .unwrap();

        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
        assert!(store.load(id).await.unwrap().is_none());
    }
}
