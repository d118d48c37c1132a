use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::decoder::DecodeError;
use crate::frame::FrameError;
use crate::persist::StoreError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Admission denied for {key}: limit of {limit} reached, window resets at {reset_at}")]
    AdmissionDenied {
        key: String,
        limit: u32,
        reset_at: DateTime<Utc>,
    },
    #[error("Session task failed: {0}")]
    SessionTask(String),
}
