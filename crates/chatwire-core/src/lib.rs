// Streaming response pipeline: frame decoding, session state, checkpointing
// and admission control. Rendering and transport policy live with the caller.

pub mod config;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod limiter;
pub mod persist;
pub mod service;
pub mod session;
pub mod transport;
pub mod utils;

pub use config::ChatwireConfig;
pub use decoder::{DecodeError, FrameDecoder, FrameStream, decode_frames};
pub use error::{Error, Result};
pub use frame::{Frame, FrameError, FrameKind};
pub use limiter::{AdmissionDecision, AdmissionLimiter, InMemoryAdmissionLimiter, admission_key};
pub use persist::{
    Checkpoint, CheckpointSender, CheckpointStore, InMemoryCheckpointStore, PersistConfig,
    Persister, PersisterHandle, SqliteCheckpointStore, StoreError,
};
pub use service::ChatStreamService;
pub use session::{
    ErrorKind, Notification, SessionHandle, SessionId, SessionOptions, SessionSnapshot,
    SessionStatus, StreamSession, spawn_session,
};
pub use transport::{StreamRequest, TransportError, open_stream};
