//! Transport abstraction over a byte-oriented control channel

use std::time::Duration;

use crate::ipc::protocol::IpcError;

/// Outcome of [`Transport::wait_for_data`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// At least one byte can be read without blocking
    Ready,
    /// The peer hung up
    Disconnected,
    /// The timeout elapsed with nothing to read
    TimedOut,
}

/// A bidirectional channel to the single management peer
///
/// All methods take `&self`: the reader thread waits and reads while the
/// worker thread writes, each on its own direction of the channel.
pub trait Transport: Send + Sync {
    /// Establish the channel (listen and accept one peer, or connect)
    fn open(&self) -> Result<(), IpcError>;

    /// Read at most `buf.len()` bytes; `Ok(0)` means the peer disconnected
    fn read(&self, buf: &mut [u8]) -> Result<usize, IpcError>;

    /// Write up to `buf.len()` bytes, returning how many were written
    ///
    /// Short counts are legal. Use [`write_all`] to send a whole frame.
    fn write(&self, buf: &[u8]) -> Result<usize, IpcError>;

    /// Release the channel. Calling this again is a no-op.
    ///
    /// A thread parked in [`open`](Transport::open) or
    /// [`wait_for_data`](Transport::wait_for_data) wakes with
    /// [`IpcError::Closed`].
    fn close(&self) -> Result<(), IpcError>;

    /// Block until data is readable, the peer hangs up, or `timeout` expires
    fn wait_for_data(&self, timeout: Option<Duration>) -> Result<WaitStatus, IpcError>;

    fn is_connected(&self) -> bool;
}

/// Write all of `bytes`, retrying short writes and interruptions
pub fn write_all(transport: &dyn Transport, bytes: &[u8]) -> Result<(), IpcError> {
    let mut offset = 0;
    while offset < bytes.len() {
        match transport.write(&bytes[offset..]) {
            Ok(0) => return Err(IpcError::Disconnected),
            Ok(written) => offset += written,
            Err(e) if e.is_recoverable() => {
                tracing::trace!(error = %e, offset, "retrying interrupted write");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
