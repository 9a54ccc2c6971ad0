//! installd - privileged install back-end
//!
//! Owns the single install session, runs the stage pipeline and serves the
//! control/event protocol on a local Unix socket. Front-ends come and go;
//! the session and its stages keep running.

pub mod auth;
pub mod config;
pub mod disk;
pub mod history;
pub mod live;
pub mod orchestrator;
pub mod registry;
pub mod rpc_server;
pub mod stage;
pub mod validate;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use auth::{AuthorizationGuard, LogindSeat};
use config::Config;
use disk::DiskProbe;
use history::HistoryLog;
use orchestrator::{Orchestrator, OrchestratorSettings};
use registry::SessionRegistry;
use rpc_server::ServerContext;
use stage::StageCatalog;
use validate::SystemValidator;

/// Build every component from `config` and serve until `shutdown` is set.
/// An active session is abandoned on the way out.
pub async fn run(config: Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    let catalog =
        StageCatalog::from_config(&config.stages).context("Invalid [[stages]] configuration")?;
    info!(
        "Install pipeline: {}",
        catalog
            .stages()
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    let disks = DiskProbe::new(&config.install.sys_block_dir, &config.install.dev_dir);
    let validator = Arc::new(SystemValidator::new(
        disks.clone(),
        &config.install.mounts_path,
        config.install.min_passphrase_len,
    ));
    let history = config
        .history
        .enabled
        .then(|| HistoryLog::new(&config.history.path));
    if let Some(history) = &history {
        info!("Recording install history to {}", history.path().display());
    }

    let registry = SessionRegistry::new();
    let settings = OrchestratorSettings {
        abort_grace: config.daemon.abort_grace(),
        install: config.install.clone(),
        ..OrchestratorSettings::default()
    };
    let (orchestrator, engine) =
        Orchestrator::spawn(catalog, validator, registry.clone(), history, settings);

    let guard = AuthorizationGuard::new(
        Arc::new(LogindSeat::new(config.seat_state_file())),
        config.auth.allowed_uids.clone(),
        config.auth.allow_unauthorized_reads,
    );
    let ctx = Arc::new(ServerContext::new(
        orchestrator.clone(),
        registry,
        guard,
        disks,
        config.daemon.queue_capacity,
    ));

    let socket_path = Path::new(&config.daemon.socket_path);
    let listener = rpc_server::bind(socket_path).await?;
    let served = rpc_server::serve(listener, ctx, shutdown).await;

    orchestrator.shutdown().await;
    let _ = engine.await;
    let _ = tokio::fs::remove_file(socket_path).await;
    served
}
