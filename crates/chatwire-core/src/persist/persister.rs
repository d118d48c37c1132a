use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span};

use super::{Checkpoint, CheckpointStore};
use crate::config::PersistSettings;
use crate::session::SessionId;

#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Minimum spacing between two non-final writes for the same session.
    pub checkpoint_interval: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self::from(&PersistSettings::default())
    }
}

impl From<&PersistSettings> for PersistConfig {
    fn from(settings: &PersistSettings) -> Self {
        Self {
            checkpoint_interval: Duration::from_millis(settings.checkpoint_interval_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub checkpoint: Checkpoint,
    /// Final checkpoints skip throttling and are written at once.
    pub is_final: bool,
}

/// Fire-and-forget handle sessions use to hand checkpoints to the persister.
#[derive(Debug, Clone)]
pub struct CheckpointSender {
    tx: mpsc::UnboundedSender<CheckpointRequest>,
}

impl CheckpointSender {
    pub fn send(&self, checkpoint: Checkpoint, is_final: bool) {
        let session_id = checkpoint.session_id;
        if self
            .tx
            .send(CheckpointRequest {
                checkpoint,
                is_final,
            })
            .is_err()
        {
            debug!(
                target: "chatwire::persist",
                session_id = %session_id,
                "Persister is gone, dropping checkpoint"
            );
        }
    }
}

struct Throttle {
    last_write: Instant,
    pending: Option<Checkpoint>,
}

/// Background writer of session checkpoints.
///
/// The first checkpoint of a session is written immediately. Later ones are
/// spaced at least `checkpoint_interval` apart; anything arriving in between
/// is coalesced so only the newest revision is written when the interval
/// elapses. Storage failures are logged and never reach the session.
pub struct Persister {
    store: Arc<dyn CheckpointStore>,
    interval: Duration,
    sessions: HashMap<SessionId, Throttle>,
}

pub struct PersisterHandle {
    tx: CheckpointSender,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl PersisterHandle {
    pub fn sender(&self) -> CheckpointSender {
        self.tx.clone()
    }

    /// Stop the persister after writing every checkpoint it has received.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        drop(self.tx);
        if let Err(e) = self.task.await {
            error!(target: "chatwire::persist", "Persister task failed: {}", e);
        }
    }
}

impl Persister {
    pub fn spawn(store: Arc<dyn CheckpointStore>, config: PersistConfig) -> PersisterHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let persister = Self {
            store,
            interval: config.checkpoint_interval,
            sessions: HashMap::new(),
        };

        let task = tokio::spawn(
            persister
                .run(rx, shutdown.clone())
                .instrument(info_span!("persister")),
        );

        PersisterHandle {
            tx: CheckpointSender { tx },
            shutdown,
            task,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<CheckpointRequest>,
        shutdown: CancellationToken,
    ) {
        loop {
            let deadline = self.next_deadline();
            let flush_timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                () = flush_timer => self.flush_due().await,
            }
        }

        while let Ok(request) = rx.try_recv() {
            self.handle(request).await;
        }
        self.flush_all().await;
        debug!(target: "chatwire::persist", "Persister stopped");
    }

    async fn handle(&mut self, request: CheckpointRequest) {
        let CheckpointRequest {
            checkpoint,
            is_final,
        } = request;
        let session_id = checkpoint.session_id;

        if is_final {
            self.sessions.remove(&session_id);
            self.write(&checkpoint).await;
            return;
        }

        let now = Instant::now();
        let write_now = match self.sessions.get_mut(&session_id) {
            None => true,
            Some(throttle) if now >= throttle.last_write + self.interval => true,
            Some(throttle) => {
                let newer = throttle
                    .pending
                    .as_ref()
                    .is_none_or(|pending| checkpoint.revision > pending.revision);
                if newer {
                    throttle.pending = Some(checkpoint.clone());
                }
                false
            }
        };

        if write_now {
            self.sessions.insert(
                session_id,
                Throttle {
                    last_write: now,
                    pending: None,
                },
            );
            self.write(&checkpoint).await;
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter(|throttle| throttle.pending.is_some())
            .map(|throttle| throttle.last_write + self.interval)
            .min()
    }

    async fn flush_due(&mut self) {
        let now = Instant::now();
        let interval = self.interval;
        let mut due = Vec::new();

        self.sessions.retain(|_, throttle| {
            if now < throttle.last_write + interval {
                return true;
            }
            match throttle.pending.take() {
                Some(checkpoint) => {
                    due.push(checkpoint);
                    throttle.last_write = now;
                    true
                }
                // Idle past the interval; the next checkpoint is written at once anyway.
                None => false,
            }
        });

        for checkpoint in due {
            self.write(&checkpoint).await;
        }
    }

    async fn flush_all(&mut self) {
        let pending: Vec<Checkpoint> = self
            .sessions
            .drain()
            .filter_map(|(_, throttle)| throttle.pending)
            .collect();
        for checkpoint in pending {
            self.write(&checkpoint).await;
        }
    }

    async fn write(&self, checkpoint: &Checkpoint) {
        match self.store.upsert(checkpoint).await {
            Ok(true) => debug!(
                target: "chatwire::persist",
                session_id = %checkpoint.session_id,
                revision = checkpoint.revision,
                status = %checkpoint.status,
                "Checkpoint written"
            ),
            Ok(false) => debug!(
                target: "chatwire::persist",
                session_id = %checkpoint.session_id,
                revision = checkpoint.revision,
                "Stale checkpoint skipped"
            ),
            Err(e) => error!(
                target: "chatwire::persist",
                session_id = %checkpoint.session_id,
                revision = checkpoint.revision,
                "Failed to write checkpoint: {}",
                e
            ),
        }
    }
}
