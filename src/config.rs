use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default abstract socket name
pub const DEFAULT_SOCKET_NAME: &str = "wifid";

/// How long a partially received frame may wait for its remaining bytes
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for queued messages to reach the peer
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// `sun_path` is 108 bytes and the leading NUL marks the abstract namespace
pub const MAX_SOCKET_NAME_LEN: usize = 107;

/// Which side of the channel this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SocketRole {
    /// Bind the name and accept exactly one peer
    Listen,
    /// Dial a name some other process has bound
    #[default]
    Connect,
}

/// Socket semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SocketKind {
    /// `SOCK_SEQPACKET`: message boundaries are preserved
    #[default]
    SeqPacket,
    /// `SOCK_STREAM`: frames are delimited by header length only
    Stream,
}

/// Daemon configuration, fixed once the daemon is initialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    role: SocketRole,
    kind: SocketKind,
    socket_name: String,
    frame_timeout: Duration,
    drain_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            role: SocketRole::default(),
            kind: SocketKind::default(),
            socket_name: DEFAULT_SOCKET_NAME.to_string(),
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl DaemonConfig {
    /// Create a new builder for DaemonConfig
    pub fn builder() -> DaemonConfigBuilder {
        DaemonConfigBuilder::default()
    }

    pub fn role(&self) -> SocketRole {
        self.role
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    pub fn frame_timeout(&self) -> Duration {
        self.frame_timeout
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn use_listen_socket(&self) -> bool {
        self.role == SocketRole::Listen
    }

    pub fn use_seq_packet(&self) -> bool {
        self.kind == SocketKind::SeqPacket
    }
}

/// Builder for DaemonConfig
#[derive(Debug, Default)]
pub struct DaemonConfigBuilder {
    inner: DaemonConfig,
}

impl DaemonConfigBuilder {
    pub fn role(mut self, role: SocketRole) -> Self {
        self.inner.role = role;
        self
    }

    /// Shorthand for `role(SocketRole::Listen)` / `role(SocketRole::Connect)`
    pub fn listen(self, listen: bool) -> Self {
        self.role(if listen {
            SocketRole::Listen
        } else {
            SocketRole::Connect
        })
    }

    pub fn kind(mut self, kind: SocketKind) -> Self {
        self.inner.kind = kind;
        self
    }

    /// Shorthand for `kind(SocketKind::SeqPacket)` / `kind(SocketKind::Stream)`
    pub fn seq_packet(self, seq_packet: bool) -> Self {
        self.kind(if seq_packet {
            SocketKind::SeqPacket
        } else {
            SocketKind::Stream
        })
    }

    pub fn socket_name(mut self, name: impl Into<String>) -> Self {
        self.inner.socket_name = name.into();
        self
    }

    pub fn frame_timeout(mut self, timeout: Duration) -> Self {
        self.inner.frame_timeout = timeout;
        self
    }

    /// Upper bound on flushing queued messages during shutdown; zero drops
    /// them immediately
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.inner.drain_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<DaemonConfig> {
        validate_socket_name(&self.inner.socket_name)?;
        if self.inner.frame_timeout.is_zero() {
            return Err(Error::Config("frame timeout must be non-zero".to_string()));
        }
        Ok(self.inner)
    }
}

/// Check that `name` fits an abstract-namespace socket address
pub fn validate_socket_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("socket name must not be empty".to_string()));
    }
    if name.len() > MAX_SOCKET_NAME_LEN {
        return Err(Error::Config(format!(
            "socket name is {} bytes, at most {MAX_SOCKET_NAME_LEN} allowed",
            name.len()
        )));
    }
    if name.contains('\0') {
        return Err(Error::Config(
            "socket name must not contain NUL bytes".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::builder().build().unwrap();
        assert_eq!(config.role(), SocketRole::Connect);
        assert_eq!(config.kind(), SocketKind::SeqPacket);
        assert_eq!(config.socket_name(), DEFAULT_SOCKET_NAME);
        assert_eq!(config.frame_timeout(), DEFAULT_FRAME_TIMEOUT);
        assert_eq!(config.drain_timeout(), DEFAULT_DRAIN_TIMEOUT);
    }

    #[test]
    fn test_option_shorthands() {
        let config = DaemonConfig::builder()
            .listen(true)
            .seq_packet(false)
            .socket_name("test")
            .build()
            .unwrap();
        assert!(config.use_listen_socket());
        assert!(!config.use_seq_packet());
        assert_eq!(config.kind(), SocketKind::Stream);
        assert_eq!(config.socket_name(), "test");
    }

    #[test]
    fn test_invalid_socket_names() {
        assert!(DaemonConfig::builder().socket_name("").build().is_err());
        assert!(DaemonConfig::builder().socket_name("a\0b").build().is_err());
        assert!(
            DaemonConfig::builder()
                .socket_name("x".repeat(MAX_SOCKET_NAME_LEN + 1))
                .build()
                .is_err()
        );
        assert!(
            DaemonConfig::builder()
                .socket_name("x".repeat(MAX_SOCKET_NAME_LEN))
                .build()
                .is_ok()
        );
    }

    #[test]
    fn test_zero_frame_timeout_rejected() {
        let result = DaemonConfig::builder()
            .frame_timeout(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
