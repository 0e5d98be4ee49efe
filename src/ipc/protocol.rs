//! Wire protocol types for the control channel
//!
//! Wire format (all integers in network byte order):
//! ```text
//! Header:
//!   [2 bytes: category (u16 BE)]
//!   [2 bytes: message type (u16 BE)]
//!   [4 bytes: length of everything after the header (u32 BE)]
//!
//! Request:
//!   [header][2 bytes: session id][payload]
//!
//! Response:
//!   [header][2 bytes: session id][2 bytes: status][payload]
//!
//! Notification:
//!   [header][payload]
//! ```

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Size of the fixed message header
pub const HEADER_LEN: usize = 8;

/// Largest body a single frame may declare
pub const MAX_BODY_LEN: usize = 16 * 1024;

/// Largest complete frame (header + body)
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_BODY_LEN;

const SESSION_LEN: usize = 2;
const STATUS_LEN: usize = 2;

/// Errors that can occur on the control channel
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("peer disconnected")]
    Disconnected,

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport is closed")]
    Closed,

    #[error("invalid socket name: {0}")]
    InvalidAddress(String),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("frame body of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error("incomplete frame: {received} of {expected} bytes received within {elapsed:?}")]
    FrameTimeout {
        expected: usize,
        received: usize,
        elapsed: Duration,
    },

    #[error("handler error: {0}")]
    Handler(String),
}

impl IpcError {
    /// Whether the failed operation may simply be retried
    pub fn is_recoverable(&self) -> bool {
        match self {
            IpcError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Protocol-level class of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Category {
    Request = 0,
    Response = 1,
    Notification = 2,
}

impl TryFrom<u16> for Category {
    type Error = IpcError;

    fn try_from(value: u16) -> Result<Self, IpcError> {
        match value {
            0 => Ok(Category::Request),
            1 => Ok(Category::Response),
            2 => Ok(Category::Notification),
            other => Err(IpcError::InvalidProtocol(format!(
                "unknown message category {other}"
            ))),
        }
    }
}

/// Command domain of a message
///
/// Open set: values without a name are carried through unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(pub u16);

impl MessageType {
    pub const VERSION: Self = Self(0);
    pub const LOAD_DRIVER: Self = Self(1);
    pub const UNLOAD_DRIVER: Self = Self(2);
    pub const START_SUPPLICANT: Self = Self(3);
    pub const STOP_SUPPLICANT: Self = Self(4);
    pub const CONNECT_TO_SUPPLICANT: Self = Self(5);
    pub const CLOSE_SUPPLICANT_CONNECTION: Self = Self(6);
    pub const COMMAND: Self = Self(7);
    pub const CONNECT_TO_HOSTAPD: Self = Self(8);
    pub const CLOSE_HOSTAPD_CONNECTION: Self = Self(9);
    pub const HOSTAPD_GET_STATIONS: Self = Self(10);
    pub const HOSTAPD_COMMAND: Self = Self(11);

    const NAMES: [&'static str; 12] = [
        "VERSION",
        "LOAD_DRIVER",
        "UNLOAD_DRIVER",
        "START_SUPPLICANT",
        "STOP_SUPPLICANT",
        "CONNECT_TO_SUPPLICANT",
        "CLOSE_SUPPLICANT_CONNECTION",
        "COMMAND",
        "CONNECT_TO_HOSTAPD",
        "CLOSE_HOSTAPD_CONNECTION",
        "HOSTAPD_GET_STATIONS",
        "HOSTAPD_COMMAND",
    ];

    /// Symbolic name, if this is a known type
    pub fn name(self) -> Option<&'static str> {
        Self::NAMES.get(usize::from(self.0)).copied()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "UNKNOWN({})", self.0),
        }
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Accepts `load-driver`, `LOAD_DRIVER` or a bare number
impl FromStr for MessageType {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, IpcError> {
        if let Ok(raw) = s.parse::<u16>() {
            return Ok(Self(raw));
        }
        let wanted = s.replace('-', "_").to_ascii_uppercase();
        Self::NAMES
            .iter()
            .position(|name| *name == wanted)
            .map(|index| Self(index as u16))
            .ok_or_else(|| IpcError::InvalidProtocol(format!("unknown message type: {s}")))
    }
}

/// Result code carried by a response
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const OK: Self = Self(0);
    pub const ERROR: Self = Self(1);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OK => f.write_str("OK"),
            Self::ERROR => f.write_str("ERROR"),
            Self(other) => write!(f, "STATUS({other})"),
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Fixed-layout header that starts every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Raw category; validated when the frame is classified
    pub category: u16,
    pub message_type: MessageType,
    /// Number of bytes following the header
    pub length: u32,
}

impl MessageHeader {
    /// Parse a header from the first [`HEADER_LEN`] bytes of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self, IpcError> {
        if data.len() < HEADER_LEN {
            return Err(IpcError::InvalidProtocol(format!(
                "truncated header: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            category: u16::from_be_bytes([data[0], data[1]]),
            message_type: MessageType(u16::from_be_bytes([data[2], data[3]])),
            length: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.category.to_be_bytes());
        buf[2..4].copy_from_slice(&self.message_type.0.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Total size of the frame this header announces
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.length as usize
    }
}

/// One complete, uniquely owned frame
///
/// Not `Clone`: a message has exactly one owner as it moves from its
/// producer through the outbound queue to the writer.
#[derive(PartialEq, Eq)]
pub struct Message {
    frame: Vec<u8>,
}

impl Message {
    /// Take ownership of a raw frame, validating its header
    pub fn from_frame(frame: Vec<u8>) -> Result<Self, IpcError> {
        let header = MessageHeader::from_bytes(&frame)?;
        if header.frame_len() != frame.len() {
            return Err(IpcError::InvalidProtocol(format!(
                "header declares {} body bytes, frame carries {}",
                header.length,
                frame.len() - HEADER_LEN
            )));
        }
        Ok(Self { frame })
    }

    fn build(
        category: Category,
        message_type: MessageType,
        prefix: &[u8],
        payload: &[u8],
    ) -> Result<Self, IpcError> {
        let body_len = prefix.len() + payload.len();
        if body_len > MAX_BODY_LEN {
            return Err(IpcError::FrameTooLarge(body_len));
        }

        let header = MessageHeader {
            category: category as u16,
            message_type,
            length: body_len as u32,
        };
        let mut frame = Vec::with_capacity(HEADER_LEN + body_len);
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(prefix);
        frame.extend_from_slice(payload);

        Ok(Self { frame })
    }

    pub fn header(&self) -> MessageHeader {
        // Invariant: every Message holds at least a full header
        MessageHeader {
            category: u16::from_be_bytes([self.frame[0], self.frame[1]]),
            message_type: MessageType(u16::from_be_bytes([self.frame[2], self.frame[3]])),
            length: (self.frame.len() - HEADER_LEN) as u32,
        }
    }

    /// Everything after the header
    pub fn body(&self) -> &[u8] {
        &self.frame[HEADER_LEN..]
    }

    /// The full frame as sent on the wire
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.frame
    }

    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        f.debug_struct("Message")
            .field("category", &header.category)
            .field("type", &header.message_type)
            .field("length", &header.length)
            .finish()
    }
}

fn read_u16(body: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([body[offset], body[offset + 1]])
}

fn expect_category(message: &Message, expected: Category) -> Result<(), IpcError> {
    let actual = Category::try_from(message.header().category)?;
    if actual != expected {
        return Err(IpcError::InvalidProtocol(format!(
            "expected {expected:?} frame, got {actual:?}"
        )));
    }
    Ok(())
}

/// A request frame: header, session id, payload
#[derive(Debug, PartialEq, Eq)]
pub struct Request {
    message: Message,
}

impl Request {
    pub fn new(message_type: MessageType, session: u16, payload: &[u8]) -> Result<Self, IpcError> {
        let message = Message::build(
            Category::Request,
            message_type,
            &session.to_be_bytes(),
            payload,
        )?;
        Ok(Self { message })
    }

    pub fn message_type(&self) -> MessageType {
        self.message.header().message_type
    }

    pub fn session(&self) -> u16 {
        read_u16(self.message.body(), 0)
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.body()[SESSION_LEN..]
    }

    pub fn as_message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

impl TryFrom<Message> for Request {
    type Error = IpcError;

    fn try_from(message: Message) -> Result<Self, IpcError> {
        expect_category(&message, Category::Request)?;
        if message.body().len() < SESSION_LEN {
            return Err(IpcError::InvalidProtocol(
                "request too short for a session id".to_string(),
            ));
        }
        Ok(Self { message })
    }
}

/// A response frame: header, session id, status, payload
#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    message: Message,
}

impl Response {
    pub fn new(
        message_type: MessageType,
        session: u16,
        status: Status,
        payload: &[u8],
    ) -> Result<Self, IpcError> {
        let mut prefix = [0u8; SESSION_LEN + STATUS_LEN];
        prefix[..2].copy_from_slice(&session.to_be_bytes());
        prefix[2..].copy_from_slice(&status.0.to_be_bytes());
        let message = Message::build(Category::Response, message_type, &prefix, payload)?;
        Ok(Self { message })
    }

    /// Build the response to `request`, echoing its type and session
    pub fn reply_to(request: &Request, status: Status, payload: &[u8]) -> Result<Self, IpcError> {
        Self::new(request.message_type(), request.session(), status, payload)
    }

    pub fn message_type(&self) -> MessageType {
        self.message.header().message_type
    }

    pub fn session(&self) -> u16 {
        read_u16(self.message.body(), 0)
    }

    pub fn status(&self) -> Status {
        Status(read_u16(self.message.body(), SESSION_LEN))
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.body()[SESSION_LEN + STATUS_LEN..]
    }

    pub fn as_message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

impl TryFrom<Message> for Response {
    type Error = IpcError;

    fn try_from(message: Message) -> Result<Self, IpcError> {
        expect_category(&message, Category::Response)?;
        if message.body().len() < SESSION_LEN + STATUS_LEN {
            return Err(IpcError::InvalidProtocol(
                "response too short for session id and status".to_string(),
            ));
        }
        Ok(Self { message })
    }
}

/// An unsolicited notification frame
#[derive(Debug, PartialEq, Eq)]
pub struct Notification {
    message: Message,
}

impl Notification {
    pub fn new(message_type: MessageType, payload: &[u8]) -> Result<Self, IpcError> {
        let message = Message::build(Category::Notification, message_type, &[], payload)?;
        Ok(Self { message })
    }

    pub fn message_type(&self) -> MessageType {
        self.message.header().message_type
    }

    pub fn payload(&self) -> &[u8] {
        self.message.body()
    }

    pub fn as_message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

impl TryFrom<Message> for Notification {
    type Error = IpcError;

    fn try_from(message: Message) -> Result<Self, IpcError> {
        expect_category(&message, Category::Notification)?;
        Ok(Self { message })
    }
}

/// A frame classified by its category
#[derive(Debug, PartialEq, Eq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl TryFrom<Message> for Envelope {
    type Error = IpcError;

    fn try_from(message: Message) -> Result<Self, IpcError> {
        match Category::try_from(message.header().category)? {
            Category::Request => Request::try_from(message).map(Envelope::Request),
            Category::Response => Response::try_from(message).map(Envelope::Response),
            Category::Notification => Notification::try_from(message).map(Envelope::Notification),
        }
    }
}

/// Reassembles frames from arbitrarily sized reads
///
/// Bytes belonging to a frame whose declared length is not yet satisfied
/// are held back; they are never reinterpreted as the start of a new header.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    partial_since: Option<Instant>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.buf.is_empty() {
            self.partial_since = Some(Instant::now());
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one has fully arrived
    ///
    /// A header declaring more than [`MAX_BODY_LEN`] is fatal: the stream
    /// cannot be resynchronised past it.
    pub fn next_frame(&mut self) -> Result<Option<Message>, IpcError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = MessageHeader::from_bytes(&self.buf)?;
        if header.length as usize > MAX_BODY_LEN {
            return Err(IpcError::FrameTooLarge(header.length as usize));
        }

        let frame_len = header.frame_len();
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let rest = self.buf.split_off(frame_len);
        let frame = std::mem::replace(&mut self.buf, rest);
        self.partial_since = if self.buf.is_empty() {
            None
        } else {
            Some(Instant::now())
        };

        Message::from_frame(frame).map(Some)
    }

    /// Bytes buffered towards the next frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Full size of the pending frame, once its header has arrived
    pub fn expected(&self) -> Option<usize> {
        MessageHeader::from_bytes(&self.buf)
            .ok()
            .map(|header| header.frame_len())
    }

    /// When the first byte of the pending partial frame arrived
    pub fn partial_since(&self) -> Option<Instant> {
        self.partial_since
    }

    /// Error describing the partial frame that failed to complete in time
    pub fn timeout_error(&self, elapsed: Duration) -> IpcError {
        IpcError::FrameTimeout {
            expected: self.expected().unwrap_or(HEADER_LEN),
            received: self.pending(),
            elapsed,
        }
    }
}
