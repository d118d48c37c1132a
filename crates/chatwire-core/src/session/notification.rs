use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

/// Why a session ended in `errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// The far end sent an explicit `error` frame.
    Protocol,
    /// The connection failed or closed before a terminal frame.
    Transport,
    /// No frame arrived within the idle bound.
    Timeout,
    /// The decoder gave up on the byte stream.
    Decoder,
}

/// One lifecycle notification, delivered in frame-arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Start,
    Status {
        message: String,
    },
    Delta {
        text_so_far: String,
        fragment: String,
    },
    Attachment {
        payload: Value,
    },
    Complete {
        final_text: String,
        latency_ms: Option<u64>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Abort {
        partial_text: String,
    },
}

impl Notification {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Error { .. } | Self::Abort { .. }
        )
    }
}
