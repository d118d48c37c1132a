// Frame decoding for the server-push wire format.
//
// `FrameDecoder` is the synchronous, push-based core: bytes in, frames out,
// with any incomplete trailing record held back until the next chunk.
// `decode_frames` wraps it as a lazy async stream over a connection body.

mod buffer;
mod stream;

pub use buffer::{DEFAULT_MAX_RECORD_BYTES, DecoderStats, FrameDecoder};
pub use stream::{FrameStream, decode_frames};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Record exceeded {limit} bytes without a terminator ({buffered} bytes buffered)")]
    RecordTooLarge { limit: usize, buffered: usize },

    #[error("Transport error: {details}")]
    Transport { details: String },
}

impl DecodeError {
    pub fn transport(details: impl Into<String>) -> Self {
        Self::Transport {
            details: details.into(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}
