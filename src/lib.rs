//! wifid - control-channel daemon for the wifi driver stack
//!
//! A management process talks to the daemon over a single Unix domain socket
//! in the Linux abstract namespace. Every message is a fixed 8-byte header
//! followed by a body; requests carry a session id that the matching response
//! echoes back.
//!
//! - [`ipc`]: wire protocol, socket transport, read loop and outbound path
//! - [`MessageQueueWorker`]: the single thread that performs every write
//! - [`Daemon`]: ties a [`DaemonConfig`] to a running channel
//!
//! # Example
//!
//! ```rust,ignore
//! use wifid::{Daemon, DaemonConfig};
//! use wifid::ipc::{CommandRouter, MessageType};
//!
//! fn run() -> wifid::Result<()> {
//!     let config = DaemonConfig::builder()
//!         .listen(true)
//!         .socket_name("wifid")
//!         .build()?;
//!
//!     let daemon = Daemon::new();
//!     daemon.initialize(&config)?;
//!
//!     let mut router = CommandRouter::new()
//!         .register(MessageType::LOAD_DRIVER, |_request| Ok(Vec::new()));
//!     daemon.start(&mut router)?;
//!     daemon.shutdown();
//!     Ok(())
//! }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("wifid requires Linux abstract-namespace Unix sockets");

mod config;
mod daemon;
mod error;
pub mod ipc;
mod sync;
mod worker;

pub use config::{
    DEFAULT_DRAIN_TIMEOUT, DEFAULT_FRAME_TIMEOUT, DEFAULT_SOCKET_NAME, DaemonConfig,
    DaemonConfigBuilder, MAX_SOCKET_NAME_LEN, SocketKind, SocketRole, validate_socket_name,
};
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use worker::{MessageConsumer, MessageQueueWorker, PushError, QueueHandle, WorkerError};
