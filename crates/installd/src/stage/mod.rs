//! Stage executor abstraction.
//!
//! Production code uses [`command::CommandStage`], which runs the commands
//! configured for a stage. Tests use [`scripted::ScriptedStage`] with
//! pre-configured behaviors.

pub mod catalog;
pub mod command;
pub mod scripted;

use async_trait::async_trait;
use installer_common::{InstallConfig, StageError};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::InstallSection;

pub use catalog::{StageCatalog, StageTemplate};

/// How one stage attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    Failed(StageError),
    Cancelled,
}

/// Parameters every stage of a session sees.
#[derive(Debug, Clone)]
pub struct StageParams {
    pub config: InstallConfig,
    pub install: InstallSection,
}

/// Messages from running stage tasks back to the orchestrator.
#[derive(Debug)]
pub enum StageReport {
    Progress {
        position: usize,
        attempt: u32,
        percent: Option<u8>,
        text: Option<String>,
    },
    Finished {
        position: usize,
        attempt: u32,
        outcome: StageOutcome,
    },
}

/// Sender half of a stage's cancel signal.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Cancel signal passed into an executor.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

/// Progress sink for one stage attempt.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    position: usize,
    attempt: u32,
    tx: mpsc::UnboundedSender<StageReport>,
}

impl ProgressReporter {
    pub fn new(position: usize, attempt: u32, tx: mpsc::UnboundedSender<StageReport>) -> Self {
        Self {
            position,
            attempt,
            tx,
        }
    }

    pub fn report(&self, percent: Option<u8>, text: Option<String>) {
        // The orchestrator is gone during shutdown; progress is best-effort.
        let _ = self.tx.send(StageReport::Progress {
            position: self.position,
            attempt: self.attempt,
            percent: percent.map(|p| p.min(100)),
            text,
        });
    }
}

/// Everything an executor gets for one attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub stage: String,
    pub position: usize,
    pub attempt: u32,
    pub params: Arc<StageParams>,
    pub cancel: CancelSignal,
    pub progress: ProgressReporter,
}

/// Runs one privileged stage.
///
/// Implementations must observe `cancel` promptly and be safe to invoke
/// again after a failed or cancelled attempt. The orchestrator never runs
/// an executor concurrently with itself.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, ctx: StageContext) -> StageOutcome;
}
