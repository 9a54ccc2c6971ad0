//! installd - privileged install back-end daemon
//!
//! Runs as root in the live/install environment and performs disk,
//! filesystem, bootloader and account provisioning on behalf of the
//! front-end sitting at the machine.

use anyhow::{bail, Result};
use clap::Parser;
use installd::config::Config;
use installd::live::KernelCommandLine;
use nix::unistd::Uid;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "installd", version, about = "Privileged OS install back-end")]
struct Args {
    /// Config file (default: /etc/installer/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control socket path, overriding the config
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Run even when the kernel command line does not mark a live or install boot
    #[arg(long)]
    skip_mode_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };
    if let Some(socket) = &args.socket {
        config.daemon.socket_path = socket.to_string_lossy().to_string();
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level)),
        )
        .init();

    info!("installd v{} starting", env!("CARGO_PKG_VERSION"));

    if !Uid::effective().is_root() {
        bail!("installd must run as root");
    }

    if args.skip_mode_check {
        warn!("Boot mode check disabled");
    } else {
        let cmdline = KernelCommandLine::load(&config.daemon.cmdline_path)?;
        match cmdline.find_marker(&config.daemon.live_mode_markers) {
            Some(marker) => info!("Boot mode: {}", marker),
            None => bail!(
                "not booted in live or install mode (none of {} on the kernel command line); \
                 use --skip-mode-check to override",
                config.daemon.live_mode_markers.join(", ")
            ),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    });

    installd::run(config, shutdown_rx).await?;
    info!("installd stopped");
    Ok(())
}
