//! Install session model as seen by clients.
//!
//! The daemon owns the live session; these are the read-only views it hands
//! out in snapshots and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::config::InstallSummary;

/// Top-level state of the installer.
///
/// ```text
/// Idle --StartInstall--> Configuring --Begin--> Running
/// Running --stage ok--> Running | Succeeded
/// Running --stage failed--> StagePaused (retryable) | Failed
/// StagePaused --Retry/Skip--> Running
/// any non-terminal --Abort--> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Idle,
    Configuring,
    Running,
    StagePaused,
    Succeeded,
    Failed,
    Aborted,
}

impl InstallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstallState::Succeeded | InstallState::Failed | InstallState::Aborted
        )
    }

    /// A session exists and has not reached a terminal state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InstallState::Configuring | InstallState::Running | InstallState::StagePaused
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallState::Idle => "idle",
            InstallState::Configuring => "configuring",
            InstallState::Running => "running",
            InstallState::StagePaused => "stage_paused",
            InstallState::Succeeded => "succeeded",
            InstallState::Failed => "failed",
            InstallState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a finished session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    Succeeded,
    Failed,
    Aborted,
}

impl TerminalOutcome {
    pub fn state(&self) -> InstallState {
        match self {
            TerminalOutcome::Succeeded => InstallState::Succeeded,
            TerminalOutcome::Failed => InstallState::Failed,
            TerminalOutcome::Aborted => InstallState::Aborted,
        }
    }
}

impl fmt::Display for TerminalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state().as_str())
    }
}

/// Status of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure description attached to a stage attempt.
///
/// `summary` is always human-readable; `detail` carries raw diagnostics such
/// as the tail of a command's stderr.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StageError {
    /// Longest `summary` kept, in bytes. Longer summaries keep their start.
    pub const MAX_SUMMARY_BYTES: usize = 1024;
    /// Longest `detail` kept, in bytes. Longer details keep their end, where
    /// the actual error usually is.
    pub const MAX_DETAIL_BYTES: usize = 4096;

    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: truncate_text(summary.into(), Self::MAX_SUMMARY_BYTES),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(keep_tail(detail.into(), Self::MAX_DETAIL_BYTES));
        self
    }

    /// Apply the size limits to an error whose fields were set directly.
    pub fn bounded(self) -> Self {
        Self {
            summary: truncate_text(self.summary, Self::MAX_SUMMARY_BYTES),
            detail: self
                .detail
                .map(|detail| keep_tail(detail, Self::MAX_DETAIL_BYTES)),
        }
    }
}

/// Cut `text` to at most `max_bytes` on a char boundary, marking the cut.
pub fn truncate_text(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{} [truncated]", &text[..end])
}

fn keep_tail(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[{} bytes truncated]\n{}", start, &text[start..])
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary)
    }
}

/// One attempt of one stage. Attempts are appended, never rewritten once
/// finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub position: usize,
    pub attempt: u32,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Latest progress report of the running stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgressView {
    pub percent: Option<u8>,
    pub text: Option<String>,
}

/// Static description of a stage plus its current status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageView {
    pub name: String,
    pub position: usize,
    pub skippable: bool,
    pub retryable: bool,
    pub status: StageStatus,
    pub attempts: u32,
}

/// Full view of the current (or last finished) session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub state: InstallState,
    pub config: InstallSummary,
    pub stages: Vec<StageView>,
    pub current_stage: Option<usize>,
    pub results: Vec<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<StageProgressView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_error: Option<StageError>,
    pub abort_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TerminalOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Response to `GetStatus` and the payload a (re)attaching client starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: InstallState,
    pub session: Option<SessionView>,
    /// Sequence number of the last event generated before this snapshot.
    pub last_event_seq: u64,
}

impl SessionSnapshot {
    pub fn idle(last_event_seq: u64) -> Self {
        Self {
            state: InstallState::Idle,
            session: None,
            last_event_seq,
        }
    }

    /// Shrink the snapshot until its JSON form is at most `max_bytes`.
    ///
    /// Error details go first, then every attempt but the latest of each
    /// stage. `StageView::attempts` keeps the real attempt count.
    pub fn fit(mut self, max_bytes: usize) -> Self {
        if self.encoded_len() <= max_bytes {
            return self;
        }
        let Some(view) = self.session.as_mut() else {
            return self;
        };

        for result in &mut view.results {
            if let Some(error) = result.error.as_mut() {
                error.detail = None;
            }
        }
        if let Some(error) = view.paused_error.as_mut() {
            error.detail = None;
        }
        if self.encoded_len() <= max_bytes {
            return self;
        }

        if let Some(view) = self.session.as_mut() {
            let mut seen = HashSet::new();
            let mut latest: Vec<StageResult> = view
                .results
                .drain(..)
                .rev()
                .filter(|r| seen.insert(r.position))
                .collect();
            latest.reverse();
            view.results = latest;
        }
        self
    }

    fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(usize::MAX, |bytes| bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_and_active_partition_states() {
        let all = [
            InstallState::Idle,
            InstallState::Configuring,
            InstallState::Running,
            InstallState::StagePaused,
            InstallState::Succeeded,
            InstallState::Failed,
            InstallState::Aborted,
        ];
        for state in all {
            assert!(
                !(state.is_terminal() && state.is_active()),
                "{} cannot be both terminal and active",
                state
            );
        }
        assert!(!InstallState::Idle.is_terminal());
        assert!(!InstallState::Idle.is_active());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&InstallState::StagePaused).unwrap();
        assert_eq!(json, "\"stage_paused\"");
        assert_eq!(InstallState::StagePaused.to_string(), "stage_paused");
    }

    #[test]
    fn test_detail_keeps_tail_on_char_boundary() {
        let detail = format!("{}{}", "é".repeat(StageError::MAX_DETAIL_BYTES), "mkfs: device busy");
        let error = StageError::new("format failed").with_detail(detail);

        let kept = error.detail.unwrap();
        assert!(kept.starts_with('['));
        assert!(kept.contains("bytes truncated"));
        assert!(kept.ends_with("mkfs: device busy"));
        assert!(kept.len() < StageError::MAX_DETAIL_BYTES + 64);
    }

    #[test]
    fn test_short_detail_is_untouched() {
        let error = StageError::new("x").with_detail("exit status 1");
        assert_eq!(error.detail.as_deref(), Some("exit status 1"));
    }

    #[test]
    fn test_bounded_clips_directly_built_error() {
        let error = StageError {
            summary: "s".repeat(5000),
            detail: Some("d".repeat(70_000)),
        }
        .bounded();
        assert!(error.summary.len() <= StageError::MAX_SUMMARY_BYTES + 16);
        assert!(error.summary.ends_with("[truncated]"));
        assert!(error.detail.unwrap().len() <= StageError::MAX_DETAIL_BYTES + 32);
    }

    fn failed_attempt(attempt: u32, detail: &str) -> StageResult {
        StageResult {
            stage: "format".to_string(),
            position: 0,
            attempt,
            status: StageStatus::Failed,
            error: Some(StageError::new("mkfs failed").with_detail(detail)),
            started_at: None,
            finished_at: None,
        }
    }

    fn paused_snapshot(results: Vec<StageResult>) -> SessionSnapshot {
        SessionSnapshot {
            state: InstallState::StagePaused,
            session: Some(SessionView {
                id: Uuid::nil(),
                created_at: Utc::now(),
                state: InstallState::StagePaused,
                config: InstallSummary {
                    target_disk: "/dev/vda".to_string(),
                    hostname: "citadel".to_string(),
                    locale: "en_US.UTF-8".to_string(),
                    timezone: "UTC".to_string(),
                    username: "user".to_string(),
                    skip_stages: vec![],
                },
                stages: vec![],
                current_stage: Some(0),
                results,
                progress: None,
                paused_error: None,
                abort_requested: false,
                outcome: None,
                summary: None,
            }),
            last_event_seq: 9,
        }
    }

    #[test]
    fn test_fit_leaves_small_snapshot_alone() {
        let snapshot = paused_snapshot(vec![failed_attempt(1, "exit status 1")]);
        assert_eq!(snapshot.clone().fit(64 * 1024), snapshot);
    }

    #[test]
    fn test_fit_drops_details_then_old_attempts() {
        let detail = "x".repeat(StageError::MAX_DETAIL_BYTES);
        let results: Vec<StageResult> = (1..=40).map(|n| failed_attempt(n, &detail)).collect();
        let snapshot = paused_snapshot(results);
        assert!(snapshot.encoded_len() > 64 * 1024);

        let fitted = snapshot.fit(2 * 1024);
        assert!(fitted.encoded_len() <= 2 * 1024);
        let view = fitted.session.unwrap();
        assert_eq!(view.results.len(), 1);
        assert_eq!(view.results[0].attempt, 40);
        assert!(view.results[0].error.as_ref().unwrap().detail.is_none());
    }

    #[test]
    fn test_outcome_maps_to_state() {
        assert_eq!(TerminalOutcome::Aborted.state(), InstallState::Aborted);
        assert_eq!(TerminalOutcome::Succeeded.to_string(), "succeeded");
    }
}
