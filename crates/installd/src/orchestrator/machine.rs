//! Install session state machine.
//!
//! Pure state: every operation takes the current time where it needs one and
//! returns the events to publish plus the effects the engine must carry out.
//! Nothing here spawns tasks or touches the filesystem.

use chrono::{DateTime, Utc};
use installer_common::session::truncate_text;
use installer_common::{
    Event, InstallConfig, InstallError, InstallState, SessionSnapshot, SessionView, StageError,
    StageProgressView, StageResult, StageStatus, StageView, TerminalOutcome,
};
use uuid::Uuid;

use crate::stage::{StageCatalog, StageOutcome};

pub const SUMMARY_SUCCEEDED: &str = "Installation completed successfully";
pub const SUMMARY_ABORTED: &str = "Installation aborted by user";
pub const SUMMARY_ABANDONED: &str = "installation abandoned: daemon shutting down";

/// Longest progress text passed on to clients, in bytes.
pub const MAX_PROGRESS_TEXT_BYTES: usize = 512;

/// Static properties of a stage within one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub position: usize,
    pub skippable: bool,
    pub retryable: bool,
    /// False when the user put the stage on the skip list.
    pub selected: bool,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Run the stage at `position` as attempt `attempt`.
    Launch { position: usize, attempt: u32 },
    /// Signal the running stage to stop and start the abort grace timer.
    Cancel,
    /// Kill the running stage task.
    Terminate,
    /// The session reached a terminal state.
    Finished(TerminalOutcome),
}

#[derive(Debug, Default, PartialEq)]
pub struct Transition {
    pub events: Vec<Event>,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn event(&mut self, event: Event) {
        self.events.push(event);
    }

    fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }
}

#[derive(Debug, Clone)]
pub struct InstallSession {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub state: InstallState,
    pub config: InstallConfig,
    pub stages: Vec<StageSpec>,
    pub current: Option<usize>,
    pub results: Vec<StageResult>,
    pub progress: Option<StageProgressView>,
    pub paused_error: Option<StageError>,
    pub abort_requested: bool,
    abort_summary: Option<String>,
    pub outcome: Option<TerminalOutcome>,
    pub summary: Option<String>,
}

impl InstallSession {
    fn attempts(&self, position: usize) -> u32 {
        self.results
            .iter()
            .filter(|r| r.position == position)
            .count() as u32
    }

    fn latest(&self, position: usize) -> Option<&StageResult> {
        self.results.iter().rev().find(|r| r.position == position)
    }

    /// The in-flight attempt at `position`, if it is `attempt`.
    fn running_attempt(&mut self, position: usize, attempt: u32) -> Option<&mut StageResult> {
        self.results.iter_mut().rev().find(|r| {
            r.position == position && r.attempt == attempt && r.status == StageStatus::Running
        })
    }

    fn view(&self) -> SessionView {
        let stages = self
            .stages
            .iter()
            .map(|spec| StageView {
                name: spec.name.clone(),
                position: spec.position,
                skippable: spec.skippable,
                retryable: spec.retryable,
                status: self
                    .latest(spec.position)
                    .map(|r| r.status)
                    .unwrap_or(StageStatus::Pending),
                attempts: self.attempts(spec.position),
            })
            .collect();

        SessionView {
            id: self.id,
            created_at: self.created_at,
            state: self.state,
            config: self.config.summary(),
            stages,
            current_stage: self.current,
            results: self
                .results
                .iter()
                .map(|result| {
                    let mut result = result.clone();
                    let superseded = self
                        .latest(result.position)
                        .is_some_and(|latest| latest.attempt != result.attempt);
                    if let Some(error) = result.error.as_mut().filter(|_| superseded) {
                        error.detail = None;
                    }
                    result
                })
                .collect(),
            progress: self.progress.clone(),
            paused_error: self.paused_error.clone(),
            abort_requested: self.abort_requested,
            outcome: self.outcome,
            summary: self.summary.clone(),
        }
    }
}

/// Owner of the zero-or-one install session.
#[derive(Debug)]
pub struct Machine {
    stages: Vec<StageSpec>,
    session: Option<InstallSession>,
}

impl Machine {
    pub fn new(catalog: &StageCatalog) -> Self {
        let stages = catalog
            .stages()
            .iter()
            .enumerate()
            .map(|(position, template)| StageSpec {
                name: template.name.clone(),
                position,
                skippable: template.skippable,
                retryable: template.retryable,
                selected: true,
            })
            .collect();
        Self {
            stages,
            session: None,
        }
    }

    pub fn state(&self) -> InstallState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(InstallState::Idle)
    }

    pub fn session(&self) -> Option<&InstallSession> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn snapshot(&self, last_event_seq: u64) -> SessionSnapshot {
        match &self.session {
            Some(session) => SessionSnapshot {
                state: session.state,
                session: Some(session.view()),
                last_event_seq,
            },
            None => SessionSnapshot::idle(last_event_seq),
        }
    }

    /// Preconditions of `StartInstall` that do not depend on the config.
    pub fn check_can_start(&self) -> Result<(), InstallError> {
        match self.state() {
            InstallState::Idle => Ok(()),
            state if state.is_terminal() => Err(InstallError::SessionAlreadyTerminal),
            state => Err(InstallError::SessionActive { state }),
        }
    }

    /// Create a session. `problems` are the validation findings for `config`.
    pub fn start(
        &mut self,
        config: InstallConfig,
        problems: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Transition, InstallError> {
        self.check_can_start()?;
        if !problems.is_empty() {
            return Err(InstallError::InvalidConfig { problems });
        }

        let stages = self
            .stages
            .iter()
            .map(|spec| StageSpec {
                selected: !config.skip_stages.contains(&spec.name),
                ..spec.clone()
            })
            .collect();
        let auto_begin = config.auto_begin;

        self.session = Some(InstallSession {
            id: Uuid::new_v4(),
            created_at: now,
            state: InstallState::Configuring,
            config,
            stages,
            current: None,
            results: Vec::new(),
            progress: None,
            paused_error: None,
            abort_requested: false,
            abort_summary: None,
            outcome: None,
            summary: None,
        });

        let mut t = Transition::default();
        t.event(Event::SessionStateChanged {
            state: InstallState::Configuring,
        });
        if auto_begin {
            let begun = self.begin(now)?;
            t.events.extend(begun.events);
            t.effects.extend(begun.effects);
        }
        Ok(t)
    }

    pub fn begin(&mut self, now: DateTime<Utc>) -> Result<Transition, InstallError> {
        let state = self.state();
        let Some(session) = self.session.as_mut().filter(|_| state == InstallState::Configuring)
        else {
            return Err(InstallError::NotConfiguring { state });
        };

        session.state = InstallState::Running;
        let mut t = Transition::default();
        t.event(Event::SessionStateChanged {
            state: InstallState::Running,
        });
        advance(session, 0, now, &mut t);
        Ok(t)
    }

    pub fn retry(&mut self, now: DateTime<Utc>) -> Result<Transition, InstallError> {
        let session = self.paused_session()?;
        let Some(position) = session.current else {
            return Err(InstallError::Internal("paused without a current stage".to_string()));
        };

        session.state = InstallState::Running;
        session.paused_error = None;
        let mut t = Transition::default();
        t.event(Event::SessionStateChanged {
            state: InstallState::Running,
        });
        launch(session, position, now, &mut t);
        Ok(t)
    }

    pub fn skip(&mut self, now: DateTime<Utc>) -> Result<Transition, InstallError> {
        let session = self.paused_session()?;
        let Some(position) = session.current else {
            return Err(InstallError::Internal("paused without a current stage".to_string()));
        };
        let spec = session.stages[position].clone();
        if !spec.skippable {
            return Err(InstallError::StageNotSkippable { stage: spec.name });
        }

        session.state = InstallState::Running;
        session.paused_error = None;
        let mut t = Transition::default();
        t.event(Event::SessionStateChanged {
            state: InstallState::Running,
        });
        record_skipped(session, position, now, &mut t);
        advance(session, position + 1, now, &mut t);
        Ok(t)
    }

    /// User abort.
    pub fn abort(&mut self, now: DateTime<Utc>) -> Result<Transition, InstallError> {
        self.abort_with(SUMMARY_ABORTED, now)
    }

    /// Abort with a specific summary. A running stage is cancelled first and
    /// the session ends once it reports back or is terminated.
    pub fn abort_with(
        &mut self,
        summary: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, InstallError> {
        let Some(session) = self.session.as_mut() else {
            return Err(InstallError::NoActiveSession);
        };

        let mut t = Transition::default();
        match session.state {
            InstallState::Idle => return Err(InstallError::NoActiveSession),
            state if state.is_terminal() => return Err(InstallError::SessionAlreadyTerminal),
            InstallState::Running if session.abort_requested => {}
            InstallState::Running => {
                session.abort_requested = true;
                session.abort_summary = Some(summary.to_string());
                t.effect(Effect::Cancel);
            }
            _ => {
                session.abort_requested = true;
                finish(session, TerminalOutcome::Aborted, summary.to_string(), &mut t);
            }
        }
        Ok(t)
    }

    /// The running stage ignored its cancel signal for the whole grace
    /// period. Record it as cancelled, end the session and kill the task.
    pub fn force_abort(&mut self, reason: &str, now: DateTime<Utc>) -> Transition {
        let mut t = Transition::default();
        let Some(session) = self.session.as_mut() else {
            return t;
        };
        if session.state != InstallState::Running || !session.abort_requested {
            return t;
        }

        if let Some(position) = session.current {
            let stage = session.stages[position].name.clone();
            if let Some(result) = session
                .results
                .iter_mut()
                .rev()
                .find(|r| r.position == position && r.status == StageStatus::Running)
            {
                let error = StageError::new(reason);
                result.status = StageStatus::Cancelled;
                result.error = Some(error.clone());
                result.finished_at = Some(now);
                t.event(Event::StageCompleted {
                    stage,
                    position,
                    attempt: result.attempt,
                    outcome: StageStatus::Cancelled,
                    error: Some(error),
                });
            }
        }
        t.effect(Effect::Terminate);
        let summary = session
            .abort_summary
            .clone()
            .unwrap_or_else(|| SUMMARY_ABORTED.to_string());
        finish(session, TerminalOutcome::Aborted, summary, &mut t);
        t
    }

    /// Discard a finished session.
    pub fn reset(&mut self) -> Result<Transition, InstallError> {
        let mut t = Transition::default();
        match self.state() {
            InstallState::Idle => Ok(t),
            state if state.is_terminal() => {
                self.session = None;
                t.event(Event::SessionStateChanged {
                    state: InstallState::Idle,
                });
                Ok(t)
            }
            state => Err(InstallError::SessionActive { state }),
        }
    }

    pub fn progress(
        &mut self,
        position: usize,
        attempt: u32,
        percent: Option<u8>,
        text: Option<String>,
    ) -> Transition {
        let mut t = Transition::default();
        let Some(session) = self.session.as_mut() else {
            return t;
        };
        if session.state != InstallState::Running
            || session.running_attempt(position, attempt).is_none()
        {
            return t;
        }

        let text = text.map(|text| truncate_text(text, MAX_PROGRESS_TEXT_BYTES));
        session.progress = Some(StageProgressView {
            percent,
            text: text.clone(),
        });
        t.event(Event::StageProgress {
            stage: session.stages[position].name.clone(),
            percent,
            text,
        });
        t
    }

    /// A stage task reported back. Reports for anything other than the
    /// in-flight attempt are stale and ignored.
    pub fn stage_finished(
        &mut self,
        position: usize,
        attempt: u32,
        outcome: StageOutcome,
        now: DateTime<Utc>,
    ) -> Transition {
        let mut t = Transition::default();
        let Some(session) = self.session.as_mut() else {
            return t;
        };
        if session.state != InstallState::Running {
            return t;
        }
        let Some(spec) = session.stages.get(position) else {
            return t;
        };
        let stage = spec.name.clone();
        let retryable = spec.retryable;
        let Some(result) = session.running_attempt(position, attempt) else {
            return t;
        };

        let (status, error) = match &outcome {
            StageOutcome::Succeeded => (StageStatus::Succeeded, None),
            StageOutcome::Failed(error) => (StageStatus::Failed, Some(error.clone().bounded())),
            StageOutcome::Cancelled => (
                StageStatus::Cancelled,
                Some(StageError::new("stage stopped before completing")),
            ),
        };
        result.status = status;
        result.error = error.clone();
        result.finished_at = Some(now);
        session.progress = None;
        t.event(Event::StageCompleted {
            stage: stage.clone(),
            position,
            attempt,
            outcome: status,
            error: error.clone(),
        });

        if session.abort_requested {
            let summary = session
                .abort_summary
                .clone()
                .unwrap_or_else(|| SUMMARY_ABORTED.to_string());
            finish(session, TerminalOutcome::Aborted, summary, &mut t);
            return t;
        }

        match (status, error) {
            (StageStatus::Succeeded, _) => advance(session, position + 1, now, &mut t),
            (_, Some(error)) if retryable => {
                session.state = InstallState::StagePaused;
                session.paused_error = Some(error);
                t.event(Event::SessionStateChanged {
                    state: InstallState::StagePaused,
                });
            }
            (_, error) => {
                let reason = error
                    .map(|e| e.summary)
                    .unwrap_or_else(|| "unknown error".to_string());
                finish(
                    session,
                    TerminalOutcome::Failed,
                    format!("Stage '{}' failed: {}", stage, reason),
                    &mut t,
                );
            }
        }
        t
    }
}

impl Machine {
    fn paused_session(&mut self) -> Result<&mut InstallSession, InstallError> {
        let state = self.state();
        self.session
            .as_mut()
            .filter(|_| state == InstallState::StagePaused)
            .ok_or(InstallError::NotInRetryableState { state })
    }
}

/// Run the first selected stage at or after `from`, skipping deselected
/// ones, or finish the session when none is left.
fn advance(session: &mut InstallSession, from: usize, now: DateTime<Utc>, t: &mut Transition) {
    for position in from..session.stages.len() {
        if session.stages[position].selected {
            launch(session, position, now, t);
            return;
        }
        record_skipped(session, position, now, t);
    }
    session.current = None;
    finish(
        session,
        TerminalOutcome::Succeeded,
        SUMMARY_SUCCEEDED.to_string(),
        t,
    );
}

fn launch(session: &mut InstallSession, position: usize, now: DateTime<Utc>, t: &mut Transition) {
    let attempt = session.attempts(position) + 1;
    let stage = session.stages[position].name.clone();
    session.current = Some(position);
    session.progress = None;
    session.results.push(StageResult {
        stage: stage.clone(),
        position,
        attempt,
        status: StageStatus::Running,
        error: None,
        started_at: Some(now),
        finished_at: None,
    });
    t.event(Event::StageStarted {
        stage,
        position,
        attempt,
    });
    t.effect(Effect::Launch { position, attempt });
}

fn record_skipped(
    session: &mut InstallSession,
    position: usize,
    now: DateTime<Utc>,
    t: &mut Transition,
) {
    let attempt = session.attempts(position) + 1;
    let stage = session.stages[position].name.clone();
    session.results.push(StageResult {
        stage: stage.clone(),
        position,
        attempt,
        status: StageStatus::Skipped,
        error: None,
        started_at: None,
        finished_at: Some(now),
    });
    t.event(Event::StageCompleted {
        stage,
        position,
        attempt,
        outcome: StageStatus::Skipped,
        error: None,
    });
}

fn finish(
    session: &mut InstallSession,
    outcome: TerminalOutcome,
    summary: String,
    t: &mut Transition,
) {
    session.state = outcome.state();
    session.outcome = Some(outcome);
    session.summary = Some(summary.clone());
    session.progress = None;
    t.event(Event::SessionStateChanged {
        state: outcome.state(),
    });
    t.event(Event::InstallFinished { outcome, summary });
    t.effect(Effect::Finished(outcome));
}
