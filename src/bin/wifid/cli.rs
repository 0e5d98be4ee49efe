use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "wifid")]
#[command(version)]
#[command(about = "Control-channel daemon for the wifi driver stack")]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long, env = "WIFID_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Abstract socket name (without the leading NUL)
    #[arg(short, long, env = "WIFID_SOCKET")]
    pub socket: Option<String>,

    // === Socket role ===
    /// Bind the socket and wait for the management process to connect
    #[arg(long, overrides_with = "connect")]
    pub listen: bool,

    /// Connect to a socket bound by the management process (default)
    #[arg(long, hide = true)]
    pub connect: bool,

    // === Socket kind ===
    /// Use SOCK_STREAM instead of SOCK_SEQPACKET
    #[arg(long, overrides_with = "seq_packet")]
    pub stream: bool,

    #[arg(long, hide = true)]
    pub seq_packet: bool,

    /// Give up on a partially received frame after this many milliseconds
    #[arg(long, value_name = "MS")]
    pub frame_timeout_ms: Option<u64>,

    /// On shutdown, wait at most this many milliseconds for queued messages
    #[arg(long, value_name = "MS")]
    pub drain_timeout_ms: Option<u64>,
}

impl Cli {
    /// `Some(true)` for `--listen`, `Some(false)` for `--connect`
    pub fn listen(&self) -> Option<bool> {
        flag(self.listen, self.connect)
    }

    /// `Some(false)` for `--stream`, `Some(true)` for `--seq-packet`
    pub fn seq_packet(&self) -> Option<bool> {
        flag(self.seq_packet, self.stream)
    }
}

fn flag(yes: bool, no: bool) -> Option<bool> {
    match (yes, no) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}
