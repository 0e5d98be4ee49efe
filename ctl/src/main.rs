//! CLI tool playing the management side of the wifid control channel
//!
//! Usage:
//!   wifid-ctl version
//!   wifid-ctl load-driver --session 0x11
//!   wifid-ctl command "SCAN" --socket wifid --connect
//!
//! By default the tool binds the socket and waits for the daemon to connect,
//! which matches the daemon's default connect role. `--timeout` covers both
//! that wait and the wait for the response.

use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use wifid::ipc::{
    Envelope, FrameDecoder, MAX_FRAME_LEN, MessageType, Request, Response, SocketTransport,
    Transport, WaitStatus, write_all,
};
use wifid::{DEFAULT_SOCKET_NAME, SocketKind, SocketRole};

/// CLI tool for sending requests over the wifid control channel
#[derive(Parser)]
#[command(name = "wifid-ctl")]
#[command(about = "Send a control request to wifid")]
struct Cli {
    /// Message type: a name such as `load-driver` or a number
    message_type: MessageType,

    /// Payload sent after the session id, as UTF-8 text
    #[arg(default_value = "")]
    payload: String,

    /// Abstract socket name
    #[arg(short, long, env = "WIFID_SOCKET", default_value = DEFAULT_SOCKET_NAME)]
    socket: String,

    /// Session id for the request (decimal or 0x-prefixed hex)
    #[arg(long, default_value = "1", value_parser = parse_session)]
    session: u16,

    /// Connect to a listening daemon instead of waiting for it
    #[arg(long)]
    connect: bool,

    /// Use SOCK_STREAM instead of SOCK_SEQPACKET
    #[arg(long)]
    stream: bool,

    /// Seconds to wait for the daemon to connect and respond
    #[arg(long, default_value = "10")]
    timeout: u64,
}

fn parse_session(value: &str) -> Result<u16, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid session id {value:?}: {e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let role = if cli.connect {
        SocketRole::Connect
    } else {
        SocketRole::Listen
    };
    let kind = if cli.stream {
        SocketKind::Stream
    } else {
        SocketKind::SeqPacket
    };
    let transport = SocketTransport::new(role, kind, cli.socket.as_str());

    let result = send_request(
        &transport,
        cli.message_type,
        cli.session,
        cli.payload.as_bytes(),
        Duration::from_secs(cli.timeout),
    );
    let _ = transport.close();

    match result {
        Ok(response) => {
            println!(
                "{} {}: {}",
                response.message_type(),
                response.status(),
                String::from_utf8_lossy(response.payload())
            );
            if response.status().is_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn send_request(
    transport: &dyn Transport,
    message_type: MessageType,
    session: u16,
    payload: &[u8],
    timeout: Duration,
) -> Result<Response, String> {
    let deadline = Instant::now() + timeout;
    open_within(transport, timeout)?;

    let request = Request::new(message_type, session, payload)
        .map_err(|e| format!("failed to build request: {e}"))?;
    write_all(transport, request.as_message().as_bytes())
        .map_err(|e| format!("failed to send request: {e}"))?;

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; MAX_FRAME_LEN];

    loop {
        while let Some(message) = decoder
            .next_frame()
            .map_err(|e| format!("invalid frame: {e}"))?
        {
            match Envelope::try_from(message) {
                Ok(Envelope::Response(response)) if response.session() == session => {
                    return Ok(response);
                }
                Ok(Envelope::Notification(notification)) => println!(
                    "notification {}: {}",
                    notification.message_type(),
                    String::from_utf8_lossy(notification.payload())
                ),
                Ok(other) => eprintln!("ignoring {other:?}"),
                Err(e) => eprintln!("ignoring malformed frame: {e}"),
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(format!("no response within {}s", timeout.as_secs()));
        }
        match transport.wait_for_data(Some(remaining)) {
            Ok(WaitStatus::Ready) => {}
            Ok(WaitStatus::TimedOut) => continue,
            Ok(WaitStatus::Disconnected) => return Err("daemon disconnected".to_string()),
            Err(e) => return Err(format!("failed to wait for response: {e}")),
        }

        let read = match transport.read(&mut buf) {
            Ok(read) => read,
            Err(e) if e.is_recoverable() => continue,
            Err(e) => return Err(format!("failed to read response: {e}")),
        };
        if read == 0 {
            return Err("daemon disconnected".to_string());
        }
        decoder.extend(&buf[..read]);
    }
}

/// Open the channel, giving up after `timeout`
///
/// In the listen role this is the wait for the daemon to connect. On expiry
/// the transport is closed, which wakes the pending accept.
fn open_within(transport: &dyn Transport, timeout: Duration) -> Result<(), String> {
    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        scope.spawn(move || {
            let _ = tx.send(transport.open());
        });
        match rx.recv_timeout(timeout) {
            Ok(opened) => opened.map_err(|e| format!("failed to open control channel: {e}")),
            Err(_) => {
                let _ = transport.close();
                Err(format!("no peer connected within {}s", timeout.as_secs()))
            }
        }
    })
}
