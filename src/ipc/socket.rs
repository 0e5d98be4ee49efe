//! Unix domain socket transport
//!
//! Sockets live in the Linux abstract namespace, so no filesystem entry is
//! created or cleaned up. Each socket is paired with two pollers, one per
//! direction: readers and blocked writers park on them instead of spinning,
//! and [`SocketTransport::close`] notifies both so a parked reader, a writer
//! stuck behind a peer that stopped reading, or a pending accept wakes up.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket::{
    self, AddressFamily, Backlog, MsgFlags, Shutdown, SockFlag, SockType, UnixAddr,
};
use polling::{Event, Events, Poller};

use crate::config::{DaemonConfig, SocketKind, SocketRole};
use crate::ipc::protocol::IpcError;
use crate::ipc::transport::{Transport, WaitStatus};
use crate::sync::lock;

const SOCKET_KEY: usize = 0;

impl From<Errno> for IpcError {
    fn from(errno: Errno) -> Self {
        IpcError::Io(errno.into())
    }
}

impl From<SocketKind> for SockType {
    fn from(kind: SocketKind) -> Self {
        match kind {
            SocketKind::SeqPacket => SockType::SeqPacket,
            SocketKind::Stream => SockType::Stream,
        }
    }
}

/// A socket plus the pollers used to park on it
struct Watched {
    fd: OwnedFd,
    poller: Poller,
    write_poller: Poller,
    closed: AtomicBool,
}

fn wait_on(poller: &Poller, timeout: Option<Duration>) -> Result<(), IpcError> {
    let mut events = Events::new();
    match poller.wait(&mut events, timeout) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl Watched {
    fn new(fd: OwnedFd) -> Result<Self, IpcError> {
        let poller = Poller::new()?;
        let write_poller = Poller::new()?;
        // SAFETY: the descriptor is owned by the returned value and is removed
        // from both pollers in `Drop`, before `fd` itself is closed.
        unsafe {
            poller.add(&fd, Event::none(SOCKET_KEY))?;
            write_poller.add(&fd, Event::none(SOCKET_KEY))?;
        }
        Ok(Self {
            fd,
            poller,
            write_poller,
            closed: AtomicBool::new(false),
        })
    }

    /// Sleep until the socket is readable, `close` is called, or `timeout` passes
    fn park(&self, timeout: Option<Duration>) -> Result<(), IpcError> {
        self.poller.modify(&self.fd, Event::readable(SOCKET_KEY))?;
        wait_on(&self.poller, timeout)
    }

    /// Sleep until the socket has send-buffer room or `close` is called
    fn park_writable(&self) -> Result<(), IpcError> {
        self.write_poller.modify(&self.fd, Event::writable(SOCKET_KEY))?;
        wait_on(&self.write_poller, None)
    }

    /// Whether the peer has shut down its end
    fn hung_up(&self) -> Result<bool, IpcError> {
        // nix has no POLLRDHUP flag and its `revents()` rejects unknown bits,
        // so poll through libc directly
        use nix::libc;
        let mut fds = [libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLRDHUP,
            revents: 0,
        }];
        // SAFETY: `fds` is a valid, initialized array of the length passed in
        Errno::result(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0) })?;
        Ok(fds[0].revents & (libc::POLLRDHUP | libc::POLLHUP) != 0)
    }

    /// Look at the receive queue without consuming anything
    ///
    /// On a seqpacket socket a zero-length read is either an empty record or
    /// end of stream; only the latter is a hang-up.
    fn peek(&self, kind: SocketKind) -> Result<Peek, IpcError> {
        let mut byte = [0u8; 1];
        loop {
            match socket::recv(
                self.fd.as_raw_fd(),
                &mut byte,
                MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT,
            ) {
                Ok(0) if kind == SocketKind::SeqPacket && !self.hung_up()? => {
                    return Ok(Peek::EmptyRecord);
                }
                Ok(0) => return Ok(Peek::HangUp),
                Ok(_) => return Ok(Peek::Data),
                Err(Errno::EAGAIN) => return Ok(Peek::Empty),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => return Ok(Peek::HangUp),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Consume one record without blocking, whatever it holds
    fn discard_record(&self) -> Result<(), IpcError> {
        let mut scratch = [0u8; 1];
        match socket::recv(self.fd.as_raw_fd(), &mut scratch, MsgFlags::MSG_DONTWAIT) {
            Ok(_) | Err(Errno::EAGAIN | Errno::EINTR) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = socket::shutdown(self.fd.as_raw_fd(), Shutdown::Both) {
            if e != Errno::ENOTCONN {
                tracing::debug!(error = %e, "socket shutdown failed");
            }
        }
        for poller in [&self.poller, &self.write_poller] {
            if let Err(e) = poller.notify() {
                tracing::warn!(error = %e, "failed to wake socket poller");
            }
        }
    }
}

impl Drop for Watched {
    fn drop(&mut self) {
        let _ = self.poller.delete(&self.fd);
        let _ = self.write_poller.delete(&self.fd);
    }
}

enum Peek {
    Data,
    /// A zero-length seqpacket record from a live peer
    EmptyRecord,
    Empty,
    HangUp,
}

/// Control channel over an abstract-namespace Unix domain socket
///
/// In [`SocketRole::Listen`] the transport binds its name, accepts a single
/// peer, then closes the listening socket. In [`SocketRole::Connect`] it
/// dials a name bound by the peer.
pub struct SocketTransport {
    role: SocketRole,
    kind: SocketKind,
    name: String,
    listener: Mutex<Option<Arc<Watched>>>,
    connection: Mutex<Option<Arc<Watched>>>,
    closed: AtomicBool,
}

impl SocketTransport {
    pub fn new(role: SocketRole, kind: SocketKind, name: impl Into<String>) -> Self {
        Self {
            role,
            kind,
            name: name.into(),
            listener: Mutex::new(None),
            connection: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(config.role(), config.kind(), config.socket_name())
    }

    /// Wrap a socket that is already connected, e.g. one end of a `socketpair`
    pub fn from_connected(fd: OwnedFd, kind: SocketKind) -> Result<Self, IpcError> {
        let transport = Self::new(SocketRole::Connect, kind, String::new());
        *lock(&transport.connection) = Some(Arc::new(Watched::new(fd)?));
        Ok(transport)
    }

    pub fn role(&self) -> SocketRole {
        self.role
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> Result<UnixAddr, IpcError> {
        UnixAddr::new_abstract(self.name.as_bytes())
            .map_err(|e| IpcError::InvalidAddress(format!("{:?}: {e}", self.name)))
    }

    fn new_socket(&self, extra: SockFlag) -> Result<OwnedFd, IpcError> {
        let fd = socket::socket(
            AddressFamily::Unix,
            self.kind.into(),
            SockFlag::SOCK_CLOEXEC | extra,
            None,
        )?;
        Ok(fd)
    }

    fn connect_peer(&self, addr: &UnixAddr) -> Result<OwnedFd, IpcError> {
        let fd = self.new_socket(SockFlag::empty())?;
        socket::connect(fd.as_raw_fd(), addr)?;
        Ok(fd)
    }

    fn accept_peer(&self, addr: &UnixAddr) -> Result<OwnedFd, IpcError> {
        // Non-blocking so the accept loop can park on the poller instead
        let fd = self.new_socket(SockFlag::SOCK_NONBLOCK)?;
        socket::bind(fd.as_raw_fd(), addr)?;
        socket::listen(&fd, Backlog::new(1)?)?;

        let listener = Arc::new(Watched::new(fd)?);
        *lock(&self.listener) = Some(Arc::clone(&listener));
        tracing::info!(name = %self.name, "waiting for peer to connect");

        let result = self.accept_one(&listener);
        lock(&self.listener).take();
        result
    }

    fn accept_one(&self, listener: &Watched) -> Result<OwnedFd, IpcError> {
        loop {
            if self.closed.load(Ordering::Acquire) || listener.is_closed() {
                return Err(IpcError::Closed);
            }
            match socket::accept4(listener.fd.as_raw_fd(), SockFlag::SOCK_CLOEXEC) {
                // SAFETY: accept4 handed us a fresh descriptor that nothing else owns
                Ok(raw) => return Ok(unsafe { OwnedFd::from_raw_fd(raw) }),
                Err(Errno::EAGAIN | Errno::EINTR | Errno::ECONNABORTED) => listener.park(None)?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn connection(&self) -> Result<Arc<Watched>, IpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IpcError::Closed);
        }
        lock(&self.connection)
            .clone()
            .ok_or(IpcError::NotConnected)
    }
}

impl Transport for SocketTransport {
    fn open(&self) -> Result<(), IpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IpcError::Closed);
        }
        if lock(&self.connection).is_some() {
            return Ok(());
        }

        let addr = self.address()?;
        let fd = match self.role {
            SocketRole::Listen => self.accept_peer(&addr)?,
            SocketRole::Connect => self.connect_peer(&addr)?,
        };

        let connection = Arc::new(Watched::new(fd)?);
        *lock(&self.connection) = Some(Arc::clone(&connection));

        // close() may have run while we were accepting or connecting
        if self.closed.load(Ordering::Acquire) {
            lock(&self.connection).take();
            connection.close();
            return Err(IpcError::Closed);
        }

        tracing::info!(
            name = %self.name,
            role = ?self.role,
            kind = ?self.kind,
            "control channel open"
        );
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, IpcError> {
        let connection = self.connection()?;
        loop {
            match socket::recv(connection.fd.as_raw_fd(), buf, MsgFlags::empty()) {
                Ok(0) if connection.is_closed() => return Err(IpcError::Closed),
                Ok(0) if self.kind == SocketKind::SeqPacket && !connection.hung_up()? => {
                    tracing::warn!(name = %self.name, "discarding empty record");
                    return Err(IpcError::Io(io::ErrorKind::WouldBlock.into()));
                }
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, IpcError> {
        let connection = self.connection()?;
        loop {
            match socket::send(
                connection.fd.as_raw_fd(),
                buf,
                MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT,
            ) {
                Ok(n) => return Ok(n),
                Err(Errno::EAGAIN) if connection.is_closed() => return Err(IpcError::Closed),
                Err(Errno::EAGAIN) => connection.park_writable()?,
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE | Errno::ECONNRESET) if connection.is_closed() => {
                    return Err(IpcError::Closed);
                }
                Err(Errno::EPIPE | Errno::ECONNRESET) => return Err(IpcError::Disconnected),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&self) -> Result<(), IpcError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(listener) = lock(&self.listener).take() {
            listener.close();
        }
        if let Some(connection) = lock(&self.connection).take() {
            connection.close();
        }
        tracing::debug!(name = %self.name, "control channel closed");
        Ok(())
    }

    fn wait_for_data(&self, timeout: Option<Duration>) -> Result<WaitStatus, IpcError> {
        let connection = self.connection()?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if connection.is_closed() {
                return Err(IpcError::Closed);
            }
            match connection.peek(self.kind)? {
                Peek::Data => return Ok(WaitStatus::Ready),
                Peek::EmptyRecord => {
                    tracing::warn!(name = %self.name, "discarding empty record");
                    connection.discard_record()?;
                    continue;
                }
                Peek::HangUp if connection.is_closed() => return Err(IpcError::Closed),
                Peek::HangUp => return Ok(WaitStatus::Disconnected),
                Peek::Empty => {}
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitStatus::TimedOut);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            connection.park(remaining)?;
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && lock(&self.connection)
                .as_ref()
                .is_some_and(|connection| !connection.is_closed())
    }
}
