//! Orchestrator task: drives the state machine from commands and stage
//! reports, runs stage tasks and publishes events.

use chrono::Utc;
use installer_common::ipc::MAX_SNAPSHOT_BYTES;
use installer_common::{
    Command, Event, EventEnvelope, InstallConfig, InstallError, ResponseData, ServerMessage,
    SessionSnapshot, StageError, Welcome, PROTOCOL_VERSION, VERSION,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::machine::{Effect, Machine, Transition, SUMMARY_ABANDONED};
use super::{Message, OrchestratorSettings};
use crate::history::HistoryLog;
use crate::registry::{ClientConnection, Outbox, SessionRegistry};
use crate::stage::{
    cancel_pair, CancelHandle, ProgressReporter, StageCatalog, StageContext, StageOutcome,
    StageParams, StageReport,
};
use crate::validate::ConfigValidator;

struct RunningStage {
    position: usize,
    attempt: u32,
    cancel: CancelHandle,
    abort: AbortHandle,
}

pub(super) struct Engine {
    machine: Machine,
    catalog: StageCatalog,
    validator: Arc<dyn ConfigValidator>,
    registry: SessionRegistry,
    history: Option<HistoryLog>,
    settings: OrchestratorSettings,
    params: Option<Arc<StageParams>>,
    running: Option<RunningStage>,
    abort_deadline: Option<Instant>,
    seq: u64,
    report_tx: mpsc::UnboundedSender<StageReport>,
    report_rx: Option<mpsc::UnboundedReceiver<StageReport>>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Engine {
    pub(super) fn new(
        catalog: StageCatalog,
        validator: Arc<dyn ConfigValidator>,
        registry: SessionRegistry,
        history: Option<HistoryLog>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        Self {
            machine: Machine::new(&catalog),
            catalog,
            validator,
            registry,
            history,
            settings,
            params: None,
            running: None,
            abort_deadline: None,
            seq: 0,
            report_tx,
            report_rx: Some(report_rx),
        }
    }

    pub(super) async fn run(mut self, mut inbox: mpsc::Receiver<Message>) {
        let Some(mut reports) = self.report_rx.take() else {
            return;
        };
        info!(stages = self.catalog.len(), "Orchestrator started");

        loop {
            let deadline = self.abort_deadline;
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(Message::Command { command, reply }) => {
                        let result = self.handle_command(command).await;
                        let _ = reply.send(result);
                    }
                    Some(Message::Attach { connection, outbox, reply }) => {
                        let snapshot = self.attach(connection, outbox).await;
                        let _ = reply.send(snapshot);
                    }
                    Some(Message::Shutdown { reply }) => {
                        self.shutdown(&mut reports).await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown(&mut reports).await;
                        break;
                    }
                },
                Some(report) = reports.recv() => self.on_report(report).await,
                _ = sleep_until(deadline) => self.on_abort_deadline().await,
            }
        }
        info!("Orchestrator stopped");
    }

    async fn handle_command(&mut self, command: Command) -> Result<ResponseData, InstallError> {
        let name = command.name();
        let now = Utc::now();
        let transition = match command {
            Command::StartInstall(config) => self.start(config),
            Command::Begin => self.machine.begin(now),
            Command::Retry => self.machine.retry(now),
            Command::Skip => self.machine.skip(now),
            Command::Abort => self.machine.abort(now),
            Command::ResetSession => self.machine.reset().map(|t| {
                self.params = None;
                t
            }),
            Command::GetStatus => return Ok(ResponseData::Status(self.snapshot())),
            Command::ListDisks | Command::Ping => {
                return Err(InstallError::Internal(format!(
                    "{} is not a session command",
                    name
                )))
            }
        };

        match transition {
            Ok(transition) => {
                info!(command = name, state = %self.machine.state(), "Command accepted");
                self.apply(transition).await;
                Ok(ResponseData::Ack)
            }
            Err(e) if e.is_precondition() => {
                info!(command = name, state = %self.machine.state(), "Command rejected: {}", e);
                Err(e)
            }
            Err(e) => {
                warn!(command = name, state = %self.machine.state(), "Command failed: {}", e);
                Err(e)
            }
        }
    }

    fn start(&mut self, config: InstallConfig) -> Result<Transition, InstallError> {
        self.machine.check_can_start()?;

        let mut problems = self.validator.validate(&config);
        problems.extend(self.catalog.check_selection(&config.skip_stages));
        let params = Arc::new(StageParams {
            config: config.clone(),
            install: self.settings.install.clone(),
        });

        let transition = self.machine.start(config, problems, Utc::now())?;
        self.params = Some(params);
        if let Some(session) = self.machine.session() {
            info!(
                session = %session.id,
                target = %session.config.target_disk,
                "Install session created"
            );
        }
        Ok(transition)
    }

    fn snapshot(&self) -> SessionSnapshot {
        self.machine.snapshot(self.seq).fit(MAX_SNAPSHOT_BYTES)
    }

    async fn attach(&mut self, connection: ClientConnection, outbox: Outbox) -> SessionSnapshot {
        let snapshot = self.snapshot();
        let welcome = Welcome {
            protocol_version: PROTOCOL_VERSION,
            daemon_version: VERSION.to_string(),
            connection_id: connection.id,
            authorized: connection.verdict.allowed,
            reason: connection.verdict.reason.clone(),
            snapshot: Some(snapshot.clone()),
        };
        if outbox.try_send(ServerMessage::Welcome(welcome)).is_err() {
            warn!(conn = connection.id, "Connection went away before attach");
            return snapshot;
        }
        self.registry.attach(connection, outbox).await;
        snapshot
    }

    async fn on_report(&mut self, report: StageReport) {
        let transition = match report {
            StageReport::Progress {
                position,
                attempt,
                percent,
                text,
            } => self.machine.progress(position, attempt, percent, text),
            StageReport::Finished {
                position,
                attempt,
                outcome,
            } => {
                if self
                    .running
                    .as_ref()
                    .is_some_and(|r| r.position == position && r.attempt == attempt)
                {
                    self.running = None;
                }
                match &outcome {
                    StageOutcome::Succeeded => info!(position, attempt, "Stage succeeded"),
                    StageOutcome::Failed(e) => warn!(position, attempt, "Stage failed: {}", e),
                    StageOutcome::Cancelled => info!(position, attempt, "Stage cancelled"),
                }
                self.machine
                    .stage_finished(position, attempt, outcome, Utc::now())
            }
        };
        self.apply(transition).await;
    }

    async fn on_abort_deadline(&mut self) {
        self.abort_deadline = None;
        let reason = format!(
            "stage did not stop within {:?} of the abort request and was terminated",
            self.settings.abort_grace
        );
        let transition = self.machine.force_abort(&reason, Utc::now());
        self.apply(transition).await;
    }

    async fn apply(&mut self, transition: Transition) {
        for event in transition.events {
            self.publish(event).await;
        }
        for effect in transition.effects {
            match effect {
                Effect::Launch { position, attempt } => self.launch(position, attempt),
                Effect::Cancel => {
                    if let Some(running) = &self.running {
                        info!(
                            position = running.position,
                            grace_secs = self.settings.abort_grace.as_secs(),
                            "Cancelling running stage"
                        );
                        running.cancel.cancel();
                        self.abort_deadline = Some(Instant::now() + self.settings.abort_grace);
                    }
                }
                Effect::Terminate => {
                    self.abort_deadline = None;
                    if let Some(running) = self.running.take() {
                        warn!(
                            position = running.position,
                            attempt = running.attempt,
                            "Stage ignored cancellation; terminating it"
                        );
                        running.abort.abort();
                    }
                }
                Effect::Finished(outcome) => {
                    self.abort_deadline = None;
                    info!(outcome = %outcome, "Installation finished");
                }
            }
        }
    }

    fn launch(&mut self, position: usize, attempt: u32) {
        let (Some(template), Some(params)) =
            (self.catalog.stages().get(position), self.params.clone())
        else {
            error!(position, "Cannot launch stage: no such stage or session");
            let _ = self.report_tx.send(StageReport::Finished {
                position,
                attempt,
                outcome: StageOutcome::Failed(StageError::new("stage could not be started")),
            });
            return;
        };

        let (cancel, signal) = cancel_pair();
        let ctx = StageContext {
            stage: template.name.clone(),
            position,
            attempt,
            params,
            cancel: signal,
            progress: ProgressReporter::new(position, attempt, self.report_tx.clone()),
        };
        info!(stage = %template.name, position, attempt, "Starting stage");

        let executor = Arc::clone(&template.executor);
        let task = tokio::spawn(async move { executor.execute(ctx).await });
        let abort = task.abort_handle();

        let tx = self.report_tx.clone();
        let name = template.name.clone();
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => StageOutcome::Cancelled,
                Err(e) => {
                    error!(stage = %name, "Stage task panicked: {}", e);
                    StageOutcome::Failed(
                        StageError::new(format!("stage '{}' crashed", name))
                            .with_detail(e.to_string()),
                    )
                }
            };
            let _ = tx.send(StageReport::Finished {
                position,
                attempt,
                outcome,
            });
        });

        self.running = Some(RunningStage {
            position,
            attempt,
            cancel,
            abort,
        });
    }

    async fn publish(&mut self, event: Event) {
        self.seq += 1;
        let envelope = EventEnvelope {
            seq: self.seq,
            session_id: self.machine.session_id(),
            timestamp: Utc::now(),
            event,
        };
        debug!(seq = envelope.seq, event = envelope.event.name(), "Publishing event");

        if let Some(history) = &self.history {
            history.record(&envelope).await;
        }
        self.registry.broadcast(&envelope).await;
    }

    /// Abandon the session. A running stage gets the abort grace period to
    /// stop before it is terminated.
    async fn shutdown(&mut self, reports: &mut mpsc::UnboundedReceiver<StageReport>) {
        match self.machine.abort_with(SUMMARY_ABANDONED, Utc::now()) {
            Ok(transition) => {
                warn!(state = %self.machine.state(), "Abandoning install session");
                self.apply(transition).await;
            }
            Err(_) => debug!("No active session at shutdown"),
        }

        while self.running.is_some() {
            let deadline = self.abort_deadline;
            tokio::select! {
                Some(report) = reports.recv() => self.on_report(report).await,
                _ = sleep_until(deadline) => self.on_abort_deadline().await,
            }
        }
    }
}
