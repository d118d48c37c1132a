use futures_core::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ChatwireConfig;
use crate::decoder::decode_frames;
use crate::error::{Error, Result};
use crate::limiter::{AdmissionDecision, AdmissionLimiter, spawn_sweeper};
use crate::persist::PersisterHandle;
use crate::session::{SessionHandle, SessionId, SessionOptions, spawn_session};
use crate::transport::{StreamRequest, open_stream};

/// Entry point for opening chat streams.
///
/// Built once at startup from an explicit limiter and persister, then shared
/// with whatever accepts chat requests.
pub struct ChatStreamService {
    limiter: Arc<dyn AdmissionLimiter>,
    persister: PersisterHandle,
    config: ChatwireConfig,
    sweeper_token: CancellationToken,
    sweeper: JoinHandle<()>,
}

impl ChatStreamService {
    pub fn new(
        limiter: Arc<dyn AdmissionLimiter>,
        persister: PersisterHandle,
        config: ChatwireConfig,
    ) -> Self {
        let sweeper_token = CancellationToken::new();
        let sweeper = spawn_sweeper(
            limiter.clone(),
            Duration::from_millis(config.admission.sweep_interval_ms),
            sweeper_token.clone(),
        );

        Self {
            limiter,
            persister,
            config,
            sweeper_token,
            sweeper,
        }
    }

    pub fn config(&self) -> &ChatwireConfig {
        &self.config
    }

    /// Count a request under `key` against the configured quota.
    pub async fn admit(&self, key: &str) -> Result<AdmissionDecision> {
        let decision = self
            .limiter
            .check(
                key,
                self.config.admission.limit,
                Duration::from_millis(self.config.admission.window_ms),
            )
            .await;

        if decision.allowed {
            Ok(decision)
        } else {
            Err(Error::AdmissionDenied {
                key: key.to_string(),
                limit: decision.limit,
                reset_at: decision.reset_at,
            })
        }
    }

    /// Admit `key`, then start a session over `byte_stream`.
    pub async fn open<S, E>(&self, key: &str, byte_stream: S) -> Result<SessionHandle>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        self.admit(key).await?;
        Ok(self.open_unchecked(byte_stream))
    }

    /// Start a session without consulting the limiter.
    pub fn open_unchecked<S, E>(&self, byte_stream: S) -> SessionHandle
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let frames = decode_frames(byte_stream, self.config.stream.max_record_bytes);
        let handle = spawn_session(
            SessionId::new(),
            frames,
            SessionOptions::from(&self.config.stream),
            Some(self.persister.sender()),
        );
        debug!(target: "chatwire::service", session_id = %handle.session_id(), "Session opened");
        handle
    }

    /// Admit `key`, open `request` upstream and stream its response.
    ///
    /// Nothing is sent upstream when admission is denied.
    pub async fn connect(
        &self,
        key: &str,
        client: &reqwest::Client,
        request: &StreamRequest,
    ) -> Result<SessionHandle> {
        self.admit(key).await?;
        let body = open_stream(client, request).await?;
        Ok(self.open_unchecked(body))
    }

    /// Stop the sweeper and flush outstanding checkpoints.
    ///
    /// Sessions still running keep going, but their later checkpoints are
    /// dropped.
    pub async fn shutdown(self) {
        self.sweeper_token.cancel();
        if let Err(e) = self.sweeper.await {
            error!(target: "chatwire::service", "Admission sweeper failed: {}", e);
        }
        self.persister.shutdown().await;
        info!(target: "chatwire::service", "Chat stream service stopped");
    }
}
