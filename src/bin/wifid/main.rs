use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use wifid::Daemon;
use wifid::ipc::{CommandRouter, LoopExit};

mod cli;
mod config;

use cli::Cli;
use config::{load_config, merge_config};

type CliResult<T> = anyhow::Result<T>;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "wifid=debug" } else { "wifid=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "wifid exiting");
            eprintln!("error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> CliResult<()> {
    let file_config = load_config(cli.config.as_deref())?;
    let config = merge_config(file_config, &cli)?;

    let daemon = Arc::new(Daemon::new());
    daemon
        .initialize(&config)
        .context("failed to initialize daemon")?;
    install_signal_handler(Arc::clone(&daemon))?;

    let mut router = CommandRouter::new().on_notification(|notification| {
        tracing::info!(
            message_type = %notification.message_type(),
            len = notification.payload().len(),
            "notification from peer"
        );
    });

    let exit = daemon.start(&mut router).context("control channel failed");
    daemon.shutdown();

    match exit? {
        LoopExit::Disconnected => tracing::info!("peer disconnected, exiting"),
        LoopExit::ShutDown => tracing::info!("shut down by signal"),
    }
    Ok(())
}

/// Shut the daemon down on SIGINT or SIGTERM, which unblocks the read loop
fn install_signal_handler(daemon: Arc<Daemon>) -> CliResult<()> {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("failed to install signal handlers")?;
    thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                tracing::info!(signal, "received signal, shutting down");
                daemon.shutdown();
            }
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}
