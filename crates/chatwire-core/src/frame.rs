use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FrameKind {
    Status,
    Content,
    Attachments,
    Done,
    Error,
}

/// One decoded unit of the server-push wire format.
///
/// Serialization always uses the canonical field names. Deserialization goes
/// through [`WireFrame`], which also accepts the legacy spellings some
/// backends still send alongside (or instead of) the canonical ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireFrame")]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(rename = "data", skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: FrameKind,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    attachments: Option<Value>,
    #[serde(default)]
    full_response: Option<String>,
    #[serde(default, rename = "fullResponse")]
    full_response_camel: Option<String>,
    #[serde(default)]
    latency_ms: Option<f64>,
    #[serde(default, rename = "latencyMs")]
    latency_ms_camel: Option<f64>,
}

impl From<WireFrame> for Frame {
    fn from(wire: WireFrame) -> Self {
        // Canonical spelling wins when a backend sends both.
        let latency = wire
            .latency_ms
            .or(wire.latency_ms_camel)
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| ms.round() as u64);

        Self {
            kind: wire.kind,
            message: wire.message,
            delta: wire.delta.or(wire.content),
            attachment: wire.data.or(wire.attachments).filter(|v| !v.is_null()),
            full_response: wire.full_response.or(wire.full_response_camel),
            latency_ms: latency,
        }
    }
}

impl Frame {
    fn bare(kind: FrameKind) -> Self {
        Self {
            kind,
            message: None,
            delta: None,
            attachment: None,
            full_response: None,
            latency_ms: None,
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(FrameKind::Status)
        }
    }

    pub fn content(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            ..Self::bare(FrameKind::Content)
        }
    }

    pub fn attachments(payload: Value) -> Self {
        Self {
            attachment: Some(payload),
            ..Self::bare(FrameKind::Attachments)
        }
    }

    pub fn done(full_response: Option<String>, latency_ms: Option<u64>) -> Self {
        Self {
            full_response,
            latency_ms,
            ..Self::bare(FrameKind::Done)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(FrameKind::Error)
        }
    }

    /// Parse the JSON payload of a `data:` line.
    pub fn parse(payload: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Render this frame as one complete wire record, terminator included.
    pub fn to_sse(&self) -> Result<String, FrameError> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, FrameKind::Done | FrameKind::Error)
    }
}
