use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use wifid::{DaemonConfig, SocketKind, SocketRole};

use crate::cli::Cli;

/// TOML config file structure
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Abstract socket name
    pub socket: Option<String>,
    /// "listen" or "connect"
    pub role: Option<SocketRole>,
    /// "seq-packet" or "stream"
    pub kind: Option<SocketKind>,
    pub frame_timeout_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
}

/// Load config from file
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let config: FileConfig = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?;
            Ok(config)
        }
        None => Ok(FileConfig::default()),
    }
}

/// Merge file config with CLI args (CLI takes precedence)
pub fn merge_config(file: FileConfig, cli: &Cli) -> Result<DaemonConfig> {
    let mut builder = DaemonConfig::builder();

    if let Some(role) = file.role {
        builder = builder.role(role);
    }
    if let Some(listen) = cli.listen() {
        builder = builder.listen(listen);
    }

    if let Some(kind) = file.kind {
        builder = builder.kind(kind);
    }
    if let Some(seq_packet) = cli.seq_packet() {
        builder = builder.seq_packet(seq_packet);
    }

    if let Some(socket) = cli.socket.clone().or(file.socket) {
        builder = builder.socket_name(socket);
    }

    if let Some(ms) = cli.frame_timeout_ms.or(file.frame_timeout_ms) {
        builder = builder.frame_timeout(Duration::from_millis(ms));
    }

    if let Some(ms) = cli.drain_timeout_ms.or(file.drain_timeout_ms) {
        builder = builder.drain_timeout(Duration::from_millis(ms));
    }

    builder.build().context("invalid daemon configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("wifid").chain(args.iter().copied())).unwrap()
    }

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let config = merge_config(load_config(None).unwrap(), &cli(&[])).unwrap();
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn test_file_values_apply() {
        let file = write_config(
            r#"
socket = "wifi-ctl"
role = "listen"
kind = "stream"
frame_timeout_ms = 250
drain_timeout_ms = 100
"#,
        );
        let file_config = load_config(Some(file.path())).unwrap();
        let config = merge_config(file_config, &cli(&[])).unwrap();

        assert_eq!(config.socket_name(), "wifi-ctl");
        assert_eq!(config.role(), SocketRole::Listen);
        assert_eq!(config.kind(), SocketKind::Stream);
        assert_eq!(config.frame_timeout(), Duration::from_millis(250));
        assert_eq!(config.drain_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = write_config(
            r#"
socket = "from-file"
role = "listen"
kind = "stream"
"#,
        );
        let file_config = load_config(Some(file.path())).unwrap();
        let config = merge_config(
            file_config,
            &cli(&["--socket", "from-cli", "--connect", "--seq-packet"]),
        )
        .unwrap();

        assert_eq!(config.socket_name(), "from-cli");
        assert_eq!(config.role(), SocketRole::Connect);
        assert_eq!(config.kind(), SocketKind::SeqPacket);
    }

    #[test]
    fn test_last_role_flag_wins() {
        let config = merge_config(FileConfig::default(), &cli(&["--connect", "--listen"])).unwrap();
        assert_eq!(config.role(), SocketRole::Listen);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let file = write_config("network = \"allow\"\n");
        assert!(load_config(Some(file.path())).is_err());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(merge_config(FileConfig::default(), &cli(&["--frame-timeout-ms", "0"])).is_err());
        assert!(merge_config(FileConfig::default(), &cli(&["--socket", ""])).is_err());
        assert!(load_config(Some(Path::new("/nonexistent/wifid.toml"))).is_err());
    }
}
