use thiserror::Error;

use crate::ipc::{IpcError, ManagerState};
use crate::worker::{PushError, WorkerError};

/// Result type for daemon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up or running the daemon
#[derive(Error, Debug)]
pub enum Error {
    #[error("already initialized")]
    AlreadyInitialized,

    #[error("not initialized")]
    NotInitialized,

    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ManagerState,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session {0:#06x} already has a request in flight")]
    SessionInUse(u16),

    #[error("no free session ids")]
    SessionsExhausted,

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Push(#[from] PushError),
}
