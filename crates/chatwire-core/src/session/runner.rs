use futures_util::StreamExt;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use super::notification::{ErrorKind, Notification};
use super::state::{SessionSnapshot, StreamSession};
use super::types::SessionId;
use crate::config::StreamConfig;
use crate::decoder::{DecodeError, FrameStream};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::persist::{Checkpoint, CheckpointSender};

const CLOSED_BEFORE_COMPLETION: &str = "Connection closed before the response completed";

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Longest gap allowed between two frames before the session errors.
    pub idle_timeout: Duration,
    pub notification_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for SessionOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            notification_capacity: config.notification_capacity.max(1),
        }
    }
}

/// Caller-side view of a running session.
///
/// Notifications arrive on a bounded channel in frame order; the latest
/// snapshot can be polled at any time through [`SessionHandle::state`].
/// A caller that only polls never holds the session up: whatever the channel
/// cannot take is queued, with consecutive deltas merged into one.
pub struct SessionHandle {
    session_id: SessionId,
    token: CancellationToken,
    notifications: mpsc::Receiver<Notification>,
    state: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<SessionSnapshot>,
}

impl SessionHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Ask the session to stop. The session ends `aborted` unless a terminal
    /// frame got there first.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Next notification, or `None` once the session has finished and every
    /// notification has been delivered.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }

    /// Hand the notifications over as a `Stream`, e.g. to forward them to a
    /// client. The session keeps running detached; cancel it through a token
    /// taken beforehand.
    pub fn into_notification_stream(self) -> ReceiverStream<Notification> {
        ReceiverStream::new(self.notifications)
    }

    pub fn state(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Wait for the session to finish and return its final state.
    ///
    /// Undelivered notifications are discarded, so drain [`recv`] first if
    /// they matter.
    ///
    /// [`recv`]: SessionHandle::recv
    pub async fn join(self) -> Result<SessionSnapshot> {
        drop(self.notifications);
        self.task
            .await
            .map_err(|e| Error::SessionTask(e.to_string()))
    }
}

/// Spawn a task folding `frames` into a new session.
pub fn spawn_session(
    session_id: SessionId,
    frames: FrameStream,
    options: SessionOptions,
    checkpoints: Option<CheckpointSender>,
) -> SessionHandle {
    let session = StreamSession::new(session_id);
    let token = CancellationToken::new();
    let (notify_tx, notify_rx) = mpsc::channel(options.notification_capacity.max(1));
    let (state_tx, state_rx) = watch::channel(session.snapshot());

    let runner = SessionRunner {
        session,
        idle_timeout: options.idle_timeout,
        token: token.clone(),
        notify_tx,
        backlog: VecDeque::new(),
        subscribed: true,
        state_tx,
        checkpoints,
        checkpointed_revision: None,
    };
    let span = info_span!("stream_session", session_id = %session_id);
    let task = tokio::spawn(runner.run(frames).instrument(span));

    SessionHandle {
        session_id,
        token,
        notifications: notify_rx,
        state: state_rx,
        task,
    }
}

enum Step {
    Frame(Frame),
    DecodeFailed(DecodeError),
    Closed,
    IdleTimeout,
    Cancelled,
}

struct SessionRunner {
    session: StreamSession,
    idle_timeout: Duration,
    token: CancellationToken,
    notify_tx: mpsc::Sender<Notification>,
    /// Notifications the channel had no room for, oldest first.
    backlog: VecDeque<Notification>,
    subscribed: bool,
    state_tx: watch::Sender<SessionSnapshot>,
    checkpoints: Option<CheckpointSender>,
    checkpointed_revision: Option<u64>,
}

impl SessionRunner {
    async fn run(mut self, mut frames: FrameStream) -> SessionSnapshot {
        debug!(target: "chatwire::session", "Session started");
        let initial = self.session.snapshot();
        self.checkpoint(&initial);

        let mut idle_deadline = Instant::now() + self.idle_timeout;
        let terminal = loop {
            let step = tokio::select! {
                biased;
                () = self.token.cancelled() => Step::Cancelled,
                permit = self.notify_tx.reserve(), if !self.backlog.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(notification) = self.backlog.pop_front() {
                                permit.send(notification);
                            }
                        }
                        Err(_) => {
                            self.backlog.clear();
                            self.subscribed = false;
                        }
                    }
                    continue;
                }
                next = tokio::time::timeout_at(idle_deadline, frames.next()) => match next {
                    Err(_) => Step::IdleTimeout,
                    Ok(None) => Step::Closed,
                    Ok(Some(Ok(frame))) => Step::Frame(frame),
                    Ok(Some(Err(e))) => Step::DecodeFailed(e),
                },
            };
            idle_deadline = Instant::now() + self.idle_timeout;

            let notifications = match step {
                Step::Frame(frame) => self.session.apply(frame),
                Step::DecodeFailed(e) => {
                    let kind = if e.is_transport() {
                        ErrorKind::Transport
                    } else {
                        ErrorKind::Decoder
                    };
                    self.session.fail(kind, e.to_string())
                }
                Step::Closed => self
                    .session
                    .fail(ErrorKind::Transport, CLOSED_BEFORE_COMPLETION),
                Step::IdleTimeout => self.session.fail(
                    ErrorKind::Timeout,
                    format!(
                        "No data received for {} ms",
                        self.idle_timeout.as_millis()
                    ),
                ),
                Step::Cancelled => self.session.abort(),
            };

            if self.session.is_terminal() {
                break notifications;
            }
            self.publish(notifications);
        };

        // Stop reading and let go of the connection before the final flush.
        drop(frames);
        self.publish(terminal);

        let snapshot = self.session.snapshot();
        debug!(
            target: "chatwire::session",
            status = %snapshot.status,
            revision = snapshot.revision,
            text_len = snapshot.text.len(),
            "Session finished"
        );

        // The outcome is already visible through the snapshot and the final
        // checkpoint; the task only lingers to hand over what is queued.
        while let Some(notification) = self.backlog.pop_front() {
            if self.notify_tx.send(notification).await.is_err() {
                break;
            }
        }
        snapshot
    }

    /// Queue `notifications` and publish the resulting snapshot.
    ///
    /// Never waits on the caller: the loop keeps reading frames and honouring
    /// cancellation whether or not anyone drains the channel.
    fn publish(&mut self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.enqueue(notification);
        }

        let snapshot = self.session.snapshot();
        self.checkpoint(&snapshot);
        self.state_tx.send_replace(snapshot);
    }

    fn enqueue(&mut self, notification: Notification) {
        if !self.subscribed {
            return;
        }

        let notification = if self.backlog.is_empty() {
            match self.notify_tx.try_send(notification) {
                Ok(()) => return,
                Err(TrySendError::Closed(_)) => {
                    self.subscribed = false;
                    return;
                }
                Err(TrySendError::Full(notification)) => notification,
            }
        } else {
            notification
        };

        // Back-to-back deltas collapse into one so a stalled reader costs
        // no more than the text itself.
        if let (
            Some(Notification::Delta {
                text_so_far,
                fragment,
            }),
            Notification::Delta {
                text_so_far: latest,
                fragment: next,
            },
        ) = (self.backlog.back_mut(), &notification)
        {
            text_so_far.clone_from(latest);
            fragment.push_str(next);
            return;
        }
        self.backlog.push_back(notification);
    }

    fn checkpoint(&mut self, snapshot: &SessionSnapshot) {
        if self.checkpointed_revision == Some(snapshot.revision) {
            return;
        }
        self.checkpointed_revision = Some(snapshot.revision);
        if let Some(checkpoints) = &self.checkpoints {
            checkpoints.send(
                Checkpoint::from_snapshot(snapshot),
                snapshot.status.is_terminal(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_frames;
    use crate::persist::{CheckpointStore, InMemoryCheckpointStore, PersistConfig, Persister};
    use crate::session::SessionStatus;
    use futures_util::stream;
    use std::sync::Arc;
    use tokio_util::bytes::Bytes;

    fn wire(frames: &[Frame]) -> String {
        frames.iter().map(|f| f.to_sse().unwrap()).collect()
    }

    fn body(parts: Vec<String>) -> FrameStream {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> =
            parts.into_iter().map(|p| Ok(Bytes::from(p))).collect();
        decode_frames(stream::iter(chunks), 1024 * 1024)
    }

    async fn drain(handle: &mut SessionHandle) -> Vec<Notification> {
        let mut seen = Vec::new();
        while let Some(n) = handle.recv().await {
            seen.push(n);
        }
        seen
    }

    #[tokio::test]
    async fn test_end_to_end_completion_is_checkpointed() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let persister = Persister::spawn(store.clone(), PersistConfig::default());
        let frames = body(vec![wire(&[
            Frame::status("thinking"),
            Frame::content("Hel"),
            Frame::content("lo"),
            Frame::done(Some("Hello".to_string()), Some(120)),
        ])]);

        let mut handle = spawn_session(
            SessionId::new(),
            frames,
            SessionOptions::default(),
            Some(persister.sender()),
        );
        let session_id = handle.session_id();
        let seen = drain(&mut handle).await;
        let snapshot = handle.join().await.unwrap();
        persister.shutdown().await;

        assert_eq!(
            seen,
            vec![
                Notification::Start,
                Notification::Status {
                    message: "thinking".to_string()
                },
                Notification::Delta {
                    text_so_far: "Hel".to_string(),
                    fragment: "Hel".to_string()
                },
                Notification::Delta {
                    text_so_far: "Hello".to_string(),
                    fragment: "lo".to_string()
                },
                Notification::Complete {
                    final_text: "Hello".to_string(),
                    latency_ms: Some(120)
                },
            ]
        );
        assert_eq!(snapshot.status, SessionStatus::Completed);

        let checkpoint = store.load(session_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.text, "Hello");
        assert_eq!(checkpoint.status, SessionStatus::Completed);
        assert_eq!(checkpoint.revision, snapshot.revision);
    }

    #[tokio::test]
    async fn test_connection_closed_without_done_errors_and_keeps_text() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let persister = Persister::spawn(store.clone(), PersistConfig::default());
        let frames = body(vec![wire(&[Frame::content("Buy")])]);

        let mut handle = spawn_session(
            SessionId::new(),
            frames,
            SessionOptions::default(),
            Some(persister.sender()),
        );
        let session_id = handle.session_id();
        let seen = drain(&mut handle).await;
        let snapshot = handle.join().await.unwrap();
        persister.shutdown().await;

        assert_eq!(
            seen.last(),
            Some(&Notification::Error {
                kind: ErrorKind::Transport,
                message: CLOSED_BEFORE_COMPLETION.to_string()
            })
        );
        assert_eq!(snapshot.status, SessionStatus::Errored);
        assert_eq!(snapshot.text, "Buy");

        let checkpoint = store.load(session_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.text, "Buy");
        assert_eq!(checkpoint.status, SessionStatus::Errored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_times_out() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from(wire(&[Frame::content("Still")])))];
        let frames = decode_frames(stream::iter(chunks).chain(stream::pending()), 1024);
        let options = SessionOptions {
            idle_timeout: Duration::from_secs(5),
            notification_capacity: 8,
        };

        let mut handle = spawn_session(SessionId::new(), frames, options, None);
        let seen = drain(&mut handle).await;
        let snapshot = handle.join().await.unwrap();

        assert!(matches!(
            seen.last(),
            Some(Notification::Error {
                kind: ErrorKind::Timeout,
                ..
            })
        ));
        assert_eq!(snapshot.status, SessionStatus::Errored);
        assert_eq!(snapshot.text, "Still");
    }

    #[tokio::test]
    async fn test_cancel_aborts_and_writes_final_checkpoint() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let persister = Persister::spawn(store.clone(), PersistConfig::default());
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from(wire(&[Frame::content("Half")])))];
        let frames = decode_frames(stream::iter(chunks).chain(stream::pending()), 1024);

        let mut handle = spawn_session(
            SessionId::new(),
            frames,
            SessionOptions::default(),
            Some(persister.sender()),
        );
        let session_id = handle.session_id();

        assert_eq!(handle.recv().await, Some(Notification::Start));
        assert!(matches!(
            handle.recv().await,
            Some(Notification::Delta { .. })
        ));
        handle.cancel();

        let seen = drain(&mut handle).await;
        let snapshot = handle.join().await.unwrap();
        persister.shutdown().await;

        assert_eq!(
            seen,
            vec![Notification::Abort {
                partial_text: "Half".to_string()
            }]
        );
        assert_eq!(snapshot.status, SessionStatus::Aborted);

        let checkpoint = store.load(session_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.status, SessionStatus::Aborted);
        assert_eq!(checkpoint.text, "Half");
    }

    #[tokio::test]
    async fn test_protocol_error_frame_ends_session() {
        let frames = body(vec![wire(&[
            Frame::content("Sorry"),
            Frame::error("model overloaded"),
            Frame::content(" ignored"),
        ])]);

        let mut handle = spawn_session(SessionId::new(), frames, SessionOptions::default(), None);
        let seen = drain(&mut handle).await;
        let snapshot = handle.join().await.unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(snapshot.text, "Sorry");
        assert_eq!(
            snapshot.error.map(|e| (e.kind, e.message)),
            Some((ErrorKind::Protocol, "model overloaded".to_string()))
        );
    }

    #[tokio::test]
    async fn test_notifications_as_stream() {
        let frames = body(vec![wire(&[Frame::content("x"), Frame::done(None, None)])]);
        let handle = spawn_session(SessionId::new(), frames, SessionOptions::default(), None);
        let state = handle.state();

        let seen: Vec<Notification> = handle.into_notification_stream().collect().await;

        assert_eq!(seen.len(), 3);
        assert!(seen[2].is_terminal());
        assert_eq!(state.borrow().status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_session_completes_when_caller_stops_listening() {
        let frames = body(vec![wire(&[
            Frame::content("a"),
            Frame::content("b"),
            Frame::done(None, None),
        ])]);
        let options = SessionOptions {
            idle_timeout: Duration::from_secs(5),
            notification_capacity: 1,
        };

        let handle = spawn_session(SessionId::new(), frames, options, None);
        let mut state = handle.state();
        let snapshot = handle.join().await.unwrap();

        assert_eq!(snapshot.status, SessionStatus::Completed);
        assert_eq!(snapshot.text, "ab");
        assert_eq!(state.borrow_and_update().status, SessionStatus::Completed);
    }

    fn digits(count: usize) -> Vec<Frame> {
        (0..count)
            .map(|i| Frame::content((i % 10).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_polling_caller_sees_completion_without_draining() {
        let mut frames = digits(100);
        frames.push(Frame::done(None, None));
        let options = SessionOptions {
            idle_timeout: Duration::from_secs(30),
            notification_capacity: 4,
        };

        let mut handle = spawn_session(SessionId::new(), body(vec![wire(&frames)]), options, None);
        let mut state = handle.state();
        let finished = tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| s.status.is_terminal()),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();

        assert_eq!(finished.status, SessionStatus::Completed);
        assert_eq!(finished.text, "0123456789".repeat(10));

        // A late reader still gets every notification, in order.
        let seen = drain(&mut handle).await;
        let text: String = seen
            .iter()
            .filter_map(|n| match n {
                Notification::Delta { fragment, .. } => Some(fragment.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(seen.first(), Some(&Notification::Start));
        assert_eq!(text, finished.text);
        assert!(matches!(seen.last(), Some(Notification::Complete { .. })));
        assert_eq!(handle.join().await.unwrap().status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_without_draining_aborts_and_checkpoints() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let persister = Persister::spawn(store.clone(), PersistConfig::default());
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from(wire(&digits(20))))];
        let frames = decode_frames(stream::iter(chunks).chain(stream::pending()), 1024);
        let options = SessionOptions {
            idle_timeout: Duration::from_secs(30),
            notification_capacity: 4,
        };

        let handle = spawn_session(
            SessionId::new(),
            frames,
            options,
            Some(persister.sender()),
        );
        let session_id = handle.session_id();
        let mut state = handle.state();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.text.len() == 20))
            .await
            .unwrap()
            .unwrap();

        handle.cancel();
        let aborted = tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| s.status.is_terminal()),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(aborted.status, SessionStatus::Aborted);

        drop(handle);
        persister.shutdown().await;

        let checkpoint = store.load(session_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.status, SessionStatus::Aborted);
        assert_eq!(checkpoint.text, "01234567890123456789");
    }

    #[tokio::test]
    async fn test_pending_session_is_checkpointed_at_start() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let persister = Persister::spawn(store.clone(), PersistConfig::default());
        let frames = decode_frames(
            stream::pending::<std::result::Result<Bytes, std::io::Error>>(),
            1024,
        );

        let handle = spawn_session(
            SessionId::new(),
            frames,
            SessionOptions::default(),
            Some(persister.sender()),
        );
        let session_id = handle.session_id();

        let initial = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(checkpoint) = store.load(session_id).await.unwrap() {
                    break checkpoint;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(initial.status, SessionStatus::Pending);
        assert_eq!(initial.revision, 0);
        assert!(initial.text.is_empty());

        handle.cancel();
        handle.join().await.unwrap();
        persister.shutdown().await;
        assert_eq!(
            store.load(session_id).await.unwrap().unwrap().status,
            SessionStatus::Aborted
        );
    }
}
