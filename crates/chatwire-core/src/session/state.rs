use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::notification::{ErrorKind, Notification};
use super::types::{SessionId, SessionStatus};
use crate::frame::{Frame, FrameKind};

const DEFAULT_PROTOCOL_ERROR: &str = "The assistant reported an error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Read model of a session, published to pollers and the persister.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub revision: u64,
    pub status: SessionStatus,
    pub text: String,
    pub attachments: Vec<Value>,
    pub activity: Option<String>,
    pub error: Option<SessionError>,
    pub latency_ms: Option<u64>,
    pub diagnostics: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Accumulator for one streamed assistant turn.
///
/// `accumulated_text` is exactly the in-order concatenation of every
/// `content` delta applied so far. Once the status is terminal nothing
/// mutates the text, attachments or status again.
///
/// `revision` goes up by one for every status transition and every text or
/// attachment mutation; status labels alone do not move it.
#[derive(Debug, Clone)]
pub struct StreamSession {
    session_id: SessionId,
    accumulated_text: String,
    attachments: Vec<Value>,
    status: SessionStatus,
    activity: Option<String>,
    error: Option<SessionError>,
    latency_ms: Option<u64>,
    revision: u64,
    diagnostics: Vec<String>,
    started_at: DateTime<Utc>,
    last_event_at: Option<DateTime<Utc>>,
}

impl StreamSession {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            accumulated_text: String::new(),
            attachments: Vec::new(),
            status: SessionStatus::Pending,
            activity: None,
            error: None,
            latency_ms: None,
            revision: 0,
            diagnostics: Vec::new(),
            started_at: Utc::now(),
            last_event_at: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn attachments(&self) -> &[Value] {
        &self.attachments
    }

    pub fn activity(&self) -> Option<&str> {
        self.activity.as_deref()
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fold one frame into the session.
    ///
    /// Returns the notifications the frame produced, in order. A frame that
    /// arrives after the session reached a terminal state produces nothing.
    pub fn apply(&mut self, frame: Frame) -> Vec<Notification> {
        if self.is_terminal() {
            debug!(
                target: "chatwire::session",
                session_id = %self.session_id,
                kind = %frame.kind,
                status = %self.status,
                "Ignoring frame for finished session"
            );
            return Vec::new();
        }

        let mut notifications = Vec::new();
        self.last_event_at = Some(Utc::now());

        if self.status == SessionStatus::Pending {
            self.transition(SessionStatus::Streaming);
            notifications.push(Notification::Start);
        }

        match frame.kind {
            FrameKind::Status => {
                if let Some(message) = frame.message {
                    self.activity = Some(message.clone());
                    notifications.push(Notification::Status { message });
                }
            }
            FrameKind::Content => {
                if let Some(fragment) = frame.delta.filter(|d| !d.is_empty()) {
                    self.accumulated_text.push_str(&fragment);
                    self.revision += 1;
                    notifications.push(Notification::Delta {
                        text_so_far: self.accumulated_text.clone(),
                        fragment,
                    });
                }
            }
            FrameKind::Attachments => {
                if let Some(payload) = frame.attachment {
                    self.attachments.push(payload.clone());
                    self.revision += 1;
                    notifications.push(Notification::Attachment { payload });
                }
            }
            FrameKind::Done => {
                if let Some(full_response) = frame.full_response {
                    self.reconcile(&full_response);
                }
                self.latency_ms = frame.latency_ms;
                self.activity = None;
                self.transition(SessionStatus::Completed);
                notifications.push(Notification::Complete {
                    final_text: self.accumulated_text.clone(),
                    latency_ms: self.latency_ms,
                });
            }
            FrameKind::Error => {
                let message = frame
                    .message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_PROTOCOL_ERROR.to_string());
                notifications.extend(self.fail(ErrorKind::Protocol, message));
            }
        }

        notifications
    }

    /// Move to `errored` from any non-terminal state. Text accumulated so
    /// far is kept.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) -> Vec<Notification> {
        if self.is_terminal() {
            return Vec::new();
        }
        let message = message.into();
        self.activity = None;
        self.error = Some(SessionError {
            kind,
            message: message.clone(),
        });
        self.transition(SessionStatus::Errored);
        vec![Notification::Error { kind, message }]
    }

    /// Move to `aborted` from any non-terminal state, keeping partial text.
    pub fn abort(&mut self) -> Vec<Notification> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.activity = None;
        self.transition(SessionStatus::Aborted);
        vec![Notification::Abort {
            partial_text: self.accumulated_text.clone(),
        }]
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            revision: self.revision,
            status: self.status,
            text: self.accumulated_text.clone(),
            attachments: self.attachments.clone(),
            activity: self.activity.clone(),
            error: self.error.clone(),
            latency_ms: self.latency_ms,
            diagnostics: self.diagnostics.clone(),
            started_at: self.started_at,
            last_event_at: self.last_event_at,
        }
    }

    fn transition(&mut self, next: SessionStatus) {
        debug!(
            target: "chatwire::session",
            session_id = %self.session_id,
            from = %self.status,
            to = %next,
            "Session transition"
        );
        self.status = next;
        self.revision += 1;
    }

    // Deltas are the source of truth; the final full text is only a
    // consistency check.
    fn reconcile(&mut self, full_response: &str) {
        if full_response == self.accumulated_text {
            return;
        }
        let diagnostic = format!(
            "final response mismatch: accumulated {} bytes, server reported {} bytes",
            self.accumulated_text.len(),
            full_response.len()
        );
        warn!(
            target: "chatwire::session",
            session_id = %self.session_id,
            accumulated_len = self.accumulated_text.len(),
            reported_len = full_response.len(),
            "Accumulated text differs from final response; keeping accumulated text"
        );
        self.diagnostics.push(diagnostic);
    }
}
