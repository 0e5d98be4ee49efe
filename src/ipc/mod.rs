//! Control channel between the management process and the daemon
//!
//! Framed binary messages travel over a Unix domain socket. Inbound frames
//! are read and dispatched on the caller's thread by [`IpcManager::run_loop`];
//! outbound frames are queued through an [`Outbox`] and written, in order, by
//! a single worker thread.
//!
//! # Example
//!
//! ```rust,ignore
//! use wifid::ipc::{CommandRouter, MessageType};
//!
//! let mut router = CommandRouter::new()
//!     .register(MessageType::LOAD_DRIVER, |_request| Ok(Vec::new()));
//!
//! daemon.start(&mut router)?;
//! ```

mod manager;
mod protocol;
mod router;
mod socket;
mod transport;

pub use manager::{Dispatcher, Inbound, IpcManager, LoopExit, ManagerState, Outbox, PendingRequest};
pub use protocol::{
    Category, Envelope, FrameDecoder, HEADER_LEN, IpcError, MAX_BODY_LEN, MAX_FRAME_LEN, Message,
    MessageHeader, MessageType, Notification, Request, Response, Status,
};
pub use router::CommandRouter;
pub use socket::SocketTransport;
pub use transport::{Transport, WaitStatus, write_all};
