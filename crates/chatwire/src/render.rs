use std::io::{self, Write};

use chatwire_core::Notification;

/// Write one notification as terminal output.
///
/// Text deltas are written inline as they arrive; everything else goes on a
/// line of its own.
pub fn render_notification<W: Write>(out: &mut W, notification: &Notification) -> io::Result<()> {
    match notification {
        Notification::Start => {}
        Notification::Status { message } => writeln!(out, "[{message}]")?,
        Notification::Delta { fragment, .. } => write!(out, "{fragment}")?,
        Notification::Attachment { payload } => writeln!(out, "\n[attachment] {payload}")?,
        Notification::Complete { latency_ms, .. } => match latency_ms {
            Some(ms) => writeln!(out, "\n[completed in {ms} ms]")?,
            None => writeln!(out, "\n[completed]")?,
        },
        Notification::Error { kind, message } => writeln!(out, "\n[{kind} error] {message}")?,
        Notification::Abort { .. } => writeln!(out, "\n[aborted]")?,
    }
    out.flush()
}
