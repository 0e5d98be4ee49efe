use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::ipc::{Dispatcher, IpcManager, LoopExit, Outbox, SocketTransport};
use crate::sync::lock;
use crate::worker::MessageQueueWorker;

/// Top-level lifecycle of the control daemon
///
/// Owns one [`IpcManager`] at a time. [`start`](Daemon::start) blocks the
/// calling thread in the read loop; [`shutdown`](Daemon::shutdown) may be
/// called from any other thread to end it.
///
/// # Example
///
/// ```rust,ignore
/// let daemon = Arc::new(Daemon::new());
/// daemon.initialize(&DaemonConfig::default())?;
///
/// let mut router = CommandRouter::new();
/// daemon.start(&mut router)?;
/// daemon.shutdown();
/// ```
pub struct Daemon {
    inner: Mutex<Option<Arc<IpcManager>>>,
}

impl Daemon {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Option<Arc<IpcManager>>> {
        lock(&self.inner)
    }

    fn manager(&self) -> Result<Arc<IpcManager>> {
        self.inner().clone().ok_or(Error::NotInitialized)
    }

    /// Build the socket transport and outbound worker described by `config`
    ///
    /// The socket is not opened here; that happens when the read loop
    /// starts.
    pub fn initialize(&self, config: &DaemonConfig) -> Result<()> {
        let mut inner = self.inner();
        if inner.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let transport = Arc::new(SocketTransport::from_config(config));
        let manager = Arc::new(
            IpcManager::with_frame_timeout(config.frame_timeout())
                .with_drain_timeout(config.drain_timeout()),
        );

        let mut worker = MessageQueueWorker::new(manager.consumer());
        worker.initialize()?;
        manager.initialize(transport, worker)?;

        tracing::info!(
            socket = config.socket_name(),
            role = ?config.role(),
            kind = ?config.kind(),
            "daemon initialized"
        );
        *inner = Some(manager);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner().is_some()
    }

    /// Run the read loop on the calling thread until the peer disconnects or
    /// the daemon is shut down
    pub fn start(&self, dispatcher: &mut dyn Dispatcher) -> Result<LoopExit> {
        let manager = self.manager()?;
        tracing::info!("daemon started");
        manager.run_loop(dispatcher)
    }

    /// Handle for sending requests and notifications to the peer
    pub fn outbox(&self) -> Result<Outbox> {
        self.manager()?.outbox()
    }

    /// Tear everything down; does nothing if not initialized
    pub fn shutdown(&self) {
        let Some(manager) = self.inner().take() else {
            return;
        };
        if let Err(e) = manager.shutdown() {
            tracing::warn!(error = %e, "IPC manager shutdown failed");
        }
        tracing::info!("daemon shut down");
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SocketKind, SocketRole};
    use crate::ipc::{
        CommandRouter, FrameDecoder, Inbound, MAX_FRAME_LEN, MessageType, Request, Response, Status,
        Transport, WaitStatus,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!(
            "wifid-daemon-test-{tag}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn config(role: SocketRole, name: &str) -> DaemonConfig {
        DaemonConfig::builder()
            .role(role)
            .kind(SocketKind::SeqPacket)
            .socket_name(name)
            .build()
            .unwrap()
    }

    /// Dial `name` until the daemon is listening
    fn connect_peer(name: &str) -> SocketTransport {
        let peer = SocketTransport::new(SocketRole::Connect, SocketKind::SeqPacket, name);
        for _ in 0..200 {
            if peer.open().is_ok() {
                return peer;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("daemon never started listening on {name}");
    }

    fn receive(peer: &SocketTransport, decoder: &mut FrameDecoder) -> Response {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        loop {
            if let Some(message) = decoder.next_frame().unwrap() {
                return Response::try_from(message).unwrap();
            }
            let status = peer.wait_for_data(Some(Duration::from_secs(5))).unwrap();
            assert_eq!(status, WaitStatus::Ready);
            let read = peer.read(&mut buf).unwrap();
            decoder.extend(&buf[..read]);
        }
    }

    #[test]
    fn test_start_before_initialize_fails() {
        let daemon = Daemon::new();
        let mut router = CommandRouter::new();

        assert!(matches!(daemon.start(&mut router), Err(Error::NotInitialized)));
        assert!(matches!(daemon.outbox(), Err(Error::NotInitialized)));
        daemon.shutdown();
    }

    #[test]
    fn test_double_initialize_fails() {
        let daemon = Daemon::new();
        let config = config(SocketRole::Listen, &unique_name("double"));

        daemon.initialize(&config).unwrap();
        assert!(matches!(
            daemon.initialize(&config),
            Err(Error::AlreadyInitialized)
        ));

        daemon.shutdown();
        daemon.shutdown();
        assert!(!daemon.is_initialized());

        // A fresh cycle works after shutdown
        daemon.initialize(&config).unwrap();
        assert!(daemon.is_initialized());
    }

    #[test]
    fn test_router_answers_peer_requests() {
        let name = unique_name("router");
        let daemon = Arc::new(Daemon::new());
        daemon.initialize(&config(SocketRole::Listen, &name)).unwrap();

        let runner = {
            let daemon = Arc::clone(&daemon);
            thread::spawn(move || {
                let mut router = CommandRouter::new();
                daemon.start(&mut router)
            })
        };

        let peer = connect_peer(&name);
        let mut decoder = FrameDecoder::new();

        let version = Request::new(MessageType::VERSION, 0x11, &[]).unwrap();
        crate::ipc::write_all(&peer, version.as_message().as_bytes()).unwrap();
        let response = receive(&peer, &mut decoder);
        assert_eq!(response.session(), 0x11);
        assert_eq!(response.status(), Status::OK);
        assert_eq!(response.payload(), env!("CARGO_PKG_VERSION").as_bytes());

        let unknown = Request::new(MessageType::LOAD_DRIVER, 0x12, &[]).unwrap();
        crate::ipc::write_all(&peer, unknown.as_message().as_bytes()).unwrap();
        let response = receive(&peer, &mut decoder);
        assert_eq!(response.session(), 0x12);
        assert_eq!(response.message_type(), MessageType::LOAD_DRIVER);
        assert_eq!(response.status(), Status::ERROR);

        peer.close().unwrap();
        assert_eq!(runner.join().unwrap().unwrap(), LoopExit::Disconnected);
        daemon.shutdown();
    }

    #[test]
    fn test_shutdown_stops_running_daemon() {
        let name = unique_name("stop");
        let daemon = Arc::new(Daemon::new());
        daemon.initialize(&config(SocketRole::Listen, &name)).unwrap();

        let runner = {
            let daemon = Arc::clone(&daemon);
            thread::spawn(move || daemon.start(&mut |_: Inbound, _: &Outbox| {}))
        };

        // Still waiting for a peer; shutdown must wake the pending accept
        thread::sleep(Duration::from_millis(50));
        daemon.shutdown();

        assert_eq!(runner.join().unwrap().unwrap(), LoopExit::ShutDown);
        assert!(!daemon.is_initialized());
    }

    #[test]
    fn test_outbox_reaches_peer() {
        let name = unique_name("outbox");
        let daemon = Arc::new(Daemon::new());
        daemon.initialize(&config(SocketRole::Listen, &name)).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let runner = {
            let daemon = Arc::clone(&daemon);
            thread::spawn(move || {
                daemon.start(&mut move |inbound: Inbound, _: &Outbox| {
                    if let Inbound::Response { request, response } = inbound {
                        tx.send((request.session, response.status())).unwrap();
                    }
                })
            })
        };

        let peer = connect_peer(&name);
        let outbox = daemon.outbox().unwrap();
        let session = outbox
            .send_request(MessageType::START_SUPPLICANT, b"wlan0")
            .unwrap();

        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let mut decoder = FrameDecoder::new();
        let request = loop {
            if let Some(message) = decoder.next_frame().unwrap() {
                break Request::try_from(message).unwrap();
            }
            peer.wait_for_data(Some(Duration::from_secs(5))).unwrap();
            let read = peer.read(&mut buf).unwrap();
            decoder.extend(&buf[..read]);
        };
        assert_eq!(request.session(), session);
        assert_eq!(request.payload(), b"wlan0");

        let reply = Response::reply_to(&request, Status::OK, &[]).unwrap();
        crate::ipc::write_all(&peer, reply.as_message().as_bytes()).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            (session, Status::OK)
        );

        daemon.shutdown();
        assert_eq!(runner.join().unwrap().unwrap(), LoopExit::ShutDown);
    }
}
