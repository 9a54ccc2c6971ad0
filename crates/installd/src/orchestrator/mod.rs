//! Install orchestrator.
//!
//! A single task owns the session state machine. Connections talk to it
//! through an [`Orchestrator`] handle: every command goes through the
//! mailbox and gets its reply on a oneshot channel, so session mutations
//! and event generation are serialized.

mod engine;
pub mod machine;

use installer_common::{Command, InstallError, ResponseData, SessionSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::InstallSection;
use crate::history::HistoryLog;
use crate::registry::{ClientConnection, Outbox, SessionRegistry};
use crate::stage::StageCatalog;
use crate::validate::ConfigValidator;

pub use machine::{InstallSession, SUMMARY_ABANDONED, SUMMARY_ABORTED, SUMMARY_SUCCEEDED};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// How long a cancelled stage may run before it is force-terminated
    pub abort_grace: Duration,
    pub mailbox_capacity: usize,
    pub install: InstallSection,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            abort_grace: Duration::from_secs(15),
            mailbox_capacity: 64,
            install: InstallSection::default(),
        }
    }
}

enum Message {
    Command {
        command: Command,
        reply: oneshot::Sender<Result<ResponseData, InstallError>>,
    },
    Attach {
        connection: ClientConnection,
        outbox: Outbox,
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the orchestrator task. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    tx: mpsc::Sender<Message>,
}

fn stopped() -> InstallError {
    InstallError::Internal("orchestrator is not running".to_string())
}

impl Orchestrator {
    /// Start the orchestrator task.
    pub fn spawn(
        catalog: StageCatalog,
        validator: Arc<dyn ConfigValidator>,
        registry: SessionRegistry,
        history: Option<HistoryLog>,
        settings: OrchestratorSettings,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.mailbox_capacity.max(1));
        let engine = engine::Engine::new(catalog, validator, registry, history, settings);
        let handle = tokio::spawn(engine.run(rx));
        (Self { tx }, handle)
    }

    /// Run a session command. `ListDisks` and `Ping` are answered by the
    /// transport and are rejected here.
    pub async fn execute(&self, command: Command) -> Result<ResponseData, InstallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Command { command, reply })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, InstallError> {
        match self.execute(Command::GetStatus).await? {
            ResponseData::Status(snapshot) => Ok(snapshot),
            other => Err(InstallError::Internal(format!(
                "unexpected reply to GetStatus: {:?}",
                other
            ))),
        }
    }

    /// Queue the Welcome frame on `outbox` and subscribe it to events, with
    /// no event generated in between.
    pub async fn attach(
        &self,
        connection: ClientConnection,
        outbox: Outbox,
    ) -> Result<SessionSnapshot, InstallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Attach {
                connection,
                outbox,
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Abandon any active session and stop the task. Returns once the
    /// running stage has stopped or been terminated.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Message::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}
