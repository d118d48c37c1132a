mod notification;
mod runner;
mod state;
mod types;

pub use notification::{ErrorKind, Notification};
pub use runner::{SessionHandle, SessionOptions, spawn_session};
pub use state::{SessionError, SessionSnapshot, StreamSession};
pub use types::{SessionId, SessionStatus};
