//! IPC manager: the inbound read loop and the outbound write path
//!
//! The reader role ([`IpcManager::run_loop`]) runs on whichever thread calls
//! it and is the only reader of the transport. The writer role is the
//! [`MessageConsumer`] returned by [`IpcManager::consumer`], driven by the
//! outbound queue worker, and is the only writer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::{DEFAULT_DRAIN_TIMEOUT, DEFAULT_FRAME_TIMEOUT};
use crate::error::{Error, Result};
use crate::ipc::protocol::{
    Envelope, FrameDecoder, IpcError, MAX_FRAME_LEN, Message, MessageType, Notification, Request,
    Response, Status,
};
use crate::ipc::transport::{Transport, WaitStatus, write_all};
use crate::sync::lock;
use crate::worker::{MessageConsumer, MessageQueueWorker, QueueHandle};

/// Lifecycle of an [`IpcManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Ready,
    Running,
    /// The peer went away; only `shutdown` is left to do
    Closed,
}

/// Why [`IpcManager::run_loop`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The peer hung up
    Disconnected,
    /// The transport was closed locally by `shutdown`
    ShutDown,
}

/// An outbound request still waiting for its response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub session: u16,
    pub message_type: MessageType,
    pub sent_at: Instant,
}

/// A fully framed inbound message, classified for dispatch
#[derive(Debug)]
pub enum Inbound {
    /// A command from the peer; answer it through the [`Outbox`]
    Request(Request),
    /// The peer's answer to one of our requests
    Response {
        request: PendingRequest,
        response: Response,
    },
    Notification(Notification),
}

impl Inbound {
    /// The raw frame as received
    pub fn as_message(&self) -> &Message {
        match self {
            Inbound::Request(request) => request.as_message(),
            Inbound::Response { response, .. } => response.as_message(),
            Inbound::Notification(notification) => notification.as_message(),
        }
    }
}

/// Receives every inbound message on the reader thread
pub trait Dispatcher {
    fn dispatch(&mut self, inbound: Inbound, outbox: &Outbox);
}

impl<F: FnMut(Inbound, &Outbox)> Dispatcher for F {
    fn dispatch(&mut self, inbound: Inbound, outbox: &Outbox) {
        self(inbound, outbox)
    }
}

/// Outstanding requests keyed by session id
#[derive(Debug, Default)]
struct SessionTable {
    next: u16,
    pending: HashMap<u16, PendingRequest>,
}

impl SessionTable {
    fn allocate(&mut self, message_type: MessageType) -> Option<u16> {
        for _ in 0..=u16::MAX {
            let session = self.next;
            self.next = self.next.wrapping_add(1);
            if self.insert(session, message_type) {
                return Some(session);
            }
        }
        None
    }

    fn insert(&mut self, session: u16, message_type: MessageType) -> bool {
        if self.pending.contains_key(&session) {
            return false;
        }
        self.pending.insert(
            session,
            PendingRequest {
                session,
                message_type,
                sent_at: Instant::now(),
            },
        );
        true
    }

    fn complete(&mut self, session: u16) -> Option<PendingRequest> {
        self.pending.remove(&session)
    }
}

/// State shared by the reader, the writer and every [`Outbox`]
struct Shared {
    state: Mutex<ManagerState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    sessions: Mutex<SessionTable>,
    frame_timeout: Duration,
}

impl Shared {
    fn transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.transport).clone()
    }
}

impl MessageConsumer for Shared {
    fn consume_message(&self, message: Message) {
        let header = message.header();
        let Some(transport) = self.transport() else {
            tracing::debug!(
                message_type = %header.message_type,
                "dropping outbound message: no transport"
            );
            return;
        };

        match write_all(transport.as_ref(), message.as_bytes()) {
            Ok(()) => tracing::trace!(
                message_type = %header.message_type,
                len = message.len(),
                "message sent"
            ),
            Err(IpcError::Closed) => tracing::debug!(
                message_type = %header.message_type,
                "dropping outbound message: transport closed"
            ),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    message_type = %header.message_type,
                    "failed to send message"
                );
                // A request that never left cannot be answered
                if let Ok(request) = Request::try_from(message) {
                    lock(&self.sessions).complete(request.session());
                }
            }
        }
    }
}

/// Cloneable handle for submitting outbound messages
#[derive(Clone)]
pub struct Outbox {
    queue: QueueHandle,
    shared: Arc<Shared>,
}

impl Outbox {
    /// Queue a raw message for sending
    pub fn push(&self, message: Message) -> Result<()> {
        self.queue.push_message(message)?;
        Ok(())
    }

    /// Send a request under a freshly allocated session id
    pub fn send_request(&self, message_type: MessageType, payload: &[u8]) -> Result<u16> {
        let session = lock(&self.shared.sessions)
            .allocate(message_type)
            .ok_or(Error::SessionsExhausted)?;
        self.submit_request(message_type, session, payload)?;
        Ok(session)
    }

    /// Send a request under a caller-chosen session id
    pub fn send_request_as(
        &self,
        message_type: MessageType,
        session: u16,
        payload: &[u8],
    ) -> Result<()> {
        if !lock(&self.shared.sessions).insert(session, message_type) {
            return Err(Error::SessionInUse(session));
        }
        self.submit_request(message_type, session, payload)
    }

    fn submit_request(
        &self,
        message_type: MessageType,
        session: u16,
        payload: &[u8],
    ) -> Result<()> {
        let submitted = Request::new(message_type, session, payload)
            .map_err(Error::from)
            .and_then(|request| self.push(request.into_message()));
        if submitted.is_err() {
            lock(&self.shared.sessions).complete(session);
        } else {
            tracing::debug!(session, %message_type, "request queued");
        }
        submitted
    }

    /// Answer `request`, echoing its type and session id
    pub fn send_response(&self, request: &Request, status: Status, payload: &[u8]) -> Result<()> {
        let response = Response::reply_to(request, status, payload)?;
        self.push(response.into_message())
    }

    pub fn send_notification(&self, message_type: MessageType, payload: &[u8]) -> Result<()> {
        let notification = Notification::new(message_type, payload)?;
        self.push(notification.into_message())
    }

    /// Requests sent but not yet answered
    pub fn pending_requests(&self) -> usize {
        lock(&self.shared.sessions).pending.len()
    }
}

/// Owns the transport and the outbound worker for one control channel
pub struct IpcManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<MessageQueueWorker>>,
    drain_timeout: Duration,
}

impl IpcManager {
    pub fn new() -> Self {
        Self::with_frame_timeout(DEFAULT_FRAME_TIMEOUT)
    }

    /// A manager that gives up on a partial frame after `frame_timeout`
    pub fn with_frame_timeout(frame_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ManagerState::Uninitialized),
                transport: Mutex::new(None),
                sessions: Mutex::new(SessionTable::default()),
                frame_timeout,
            }),
            worker: Mutex::new(None),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// How long `shutdown` waits for queued messages to be written before it
    /// closes the transport under the worker
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// The writer role, to be handed to the [`MessageQueueWorker`]
    pub fn consumer(&self) -> Arc<dyn MessageConsumer> {
        self.shared.clone()
    }

    pub fn state(&self) -> ManagerState {
        *lock(&self.shared.state)
    }

    /// Wire in the transport and the (already started) worker
    pub fn initialize(
        &self,
        transport: Arc<dyn Transport>,
        worker: MessageQueueWorker,
    ) -> Result<()> {
        let mut state = lock(&self.shared.state);
        if *state != ManagerState::Uninitialized {
            return Err(Error::AlreadyInitialized);
        }

        *lock(&self.shared.transport) = Some(transport);
        *lock(&self.worker) = Some(worker);
        *state = ManagerState::Ready;
        tracing::debug!("IPC manager initialized");
        Ok(())
    }

    /// Handle for submitting outbound messages
    pub fn outbox(&self) -> Result<Outbox> {
        let queue = lock(&self.worker)
            .as_ref()
            .map(MessageQueueWorker::handle)
            .ok_or(Error::NotInitialized)?;
        Ok(Outbox {
            queue,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Run the reader role on the calling thread until the channel ends
    ///
    /// Opens the transport first if it is not connected yet. Returns when
    /// the peer disconnects or [`shutdown`](Self::shutdown) closes the
    /// transport; fatal transport errors are returned as `Err`.
    pub fn run_loop(&self, dispatcher: &mut dyn Dispatcher) -> Result<LoopExit> {
        let outbox = self.outbox()?;
        let transport = {
            let mut state = lock(&self.shared.state);
            match *state {
                ManagerState::Ready => {}
                ManagerState::Uninitialized => return Err(Error::NotInitialized),
                other => {
                    return Err(Error::InvalidState {
                        operation: "run the read loop",
                        state: other,
                    })
                }
            }
            let transport = self.shared.transport().ok_or(Error::NotInitialized)?;
            *state = ManagerState::Running;
            transport
        };

        let result = self.read_frames(transport.as_ref(), dispatcher, &outbox);

        let mut state = lock(&self.shared.state);
        if *state == ManagerState::Running {
            *state = ManagerState::Closed;
        }
        match &result {
            Ok(exit) => tracing::info!(?exit, "read loop finished"),
            Err(e) => tracing::error!(error = %e, "read loop failed"),
        }
        result
    }

    fn read_frames(
        &self,
        transport: &dyn Transport,
        dispatcher: &mut dyn Dispatcher,
        outbox: &Outbox,
    ) -> Result<LoopExit> {
        if !transport.is_connected() {
            match transport.open() {
                Ok(()) => {}
                Err(IpcError::Closed) => return Ok(LoopExit::ShutDown),
                Err(e) => return Err(e.into()),
            }
        }

        let frame_timeout = self.shared.frame_timeout;
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; MAX_FRAME_LEN];

        loop {
            let timeout = match decoder.partial_since() {
                Some(since) => {
                    let elapsed = since.elapsed();
                    if elapsed >= frame_timeout {
                        return Err(decoder.timeout_error(elapsed).into());
                    }
                    Some(frame_timeout - elapsed)
                }
                None => None,
            };

            match transport.wait_for_data(timeout) {
                Ok(WaitStatus::Ready) => {}
                Ok(WaitStatus::TimedOut) => continue,
                Ok(WaitStatus::Disconnected) => return Ok(LoopExit::Disconnected),
                Err(IpcError::Closed) => return Ok(LoopExit::ShutDown),
                Err(e) if e.is_recoverable() => continue,
                Err(e) => return Err(e.into()),
            }

            let read = match transport.read(&mut buf) {
                Ok(0) => return Ok(LoopExit::Disconnected),
                Ok(read) => read,
                Err(IpcError::Closed) => return Ok(LoopExit::ShutDown),
                Err(e) if e.is_recoverable() => continue,
                Err(e) => return Err(e.into()),
            };

            decoder.extend(&buf[..read]);
            while let Some(message) = decoder.next_frame()? {
                self.dispatch(message, dispatcher, outbox);
            }
        }
    }

    fn dispatch(&self, message: Message, dispatcher: &mut dyn Dispatcher, outbox: &Outbox) {
        let inbound = match Envelope::try_from(message) {
            Ok(Envelope::Request(request)) => {
                tracing::debug!(
                    session = request.session(),
                    message_type = %request.message_type(),
                    "request received"
                );
                Inbound::Request(request)
            }
            Ok(Envelope::Response(response)) => {
                let session = response.session();
                let Some(request) = lock(&self.shared.sessions).complete(session) else {
                    tracing::warn!(session, "discarding response for unknown session");
                    return;
                };
                if request.message_type != response.message_type() {
                    tracing::warn!(
                        session,
                        expected = %request.message_type,
                        actual = %response.message_type(),
                        "response type differs from request"
                    );
                }
                tracing::debug!(
                    session,
                    status = %response.status(),
                    elapsed = ?request.sent_at.elapsed(),
                    "response paired"
                );
                Inbound::Response { request, response }
            }
            Ok(Envelope::Notification(notification)) => Inbound::Notification(notification),
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed frame");
                return;
            }
        };

        dispatcher.dispatch(inbound, outbox);
    }

    /// Stop the worker, close the transport and return to `Uninitialized`
    ///
    /// Messages queued before this call are written if the peer takes them
    /// within the drain timeout; after that the transport is closed anyway and
    /// the rest are dropped. The transport is always closed before the worker
    /// thread is joined. Closing wakes a reader blocked in `run_loop`, which
    /// then returns [`LoopExit::ShutDown`].
    pub fn shutdown(&self) -> Result<()> {
        {
            let state = lock(&self.shared.state);
            if *state == ManagerState::Uninitialized {
                return Err(Error::NotInitialized);
            }
        }

        let worker = lock(&self.worker).take();
        if let Some(worker) = &worker {
            worker.stop();
            if !worker.wait_drained(self.drain_timeout) {
                tracing::warn!(
                    timeout = ?self.drain_timeout,
                    "peer is not reading; abandoning queued messages"
                );
            }
        }

        // Closing wakes the reader and any write still parked on the socket
        let transport = lock(&self.shared.transport).take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close() {
                tracing::warn!(error = %e, "failed to close transport");
            }
        }

        if let Some(mut worker) = worker {
            worker.shutdown();
        }

        lock(&self.shared.sessions).pending.clear();
        *lock(&self.shared.state) = ManagerState::Uninitialized;
        tracing::debug!("IPC manager shut down");
        Ok(())
    }
}

impl Default for IpcManager {
    fn default() -> Self {
        Self::new()
    }
}
