//! Install history log
//!
//! Finished stage attempts and session outcomes are appended to a JSON-lines
//! file for post-mortem diagnostics. The log is write-only from the daemon's
//! point of view: nothing is recovered from it on the next boot.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use installer_common::{Event, EventEnvelope, StageError, StageStatus, TerminalOutcome};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{create_dir_all, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

/// One line of the history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: DateTime<Utc>,
    pub seq: u64,
    pub session_id: Option<Uuid>,
    #[serde(flatten)]
    pub record: HistoryRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum HistoryRecord {
    Stage {
        stage: String,
        position: usize,
        attempt: u32,
        outcome: StageStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<StageError>,
    },
    Session {
        outcome: TerminalOutcome,
        summary: String,
    },
}

impl HistoryEntry {
    /// History line for an event, if the event is one that gets recorded.
    pub fn from_envelope(envelope: &EventEnvelope) -> Option<Self> {
        let record = match &envelope.event {
            Event::StageCompleted {
                stage,
                position,
                attempt,
                outcome,
                error,
            } => HistoryRecord::Stage {
                stage: stage.clone(),
                position: *position,
                attempt: *attempt,
                outcome: *outcome,
                error: error.clone(),
            },
            Event::InstallFinished { outcome, summary } => HistoryRecord::Session {
                outcome: *outcome,
                summary: summary.clone(),
            },
            _ => return None,
        };
        Some(Self {
            ts: envelope.timestamp,
            seq: envelope.seq,
            session_id: envelope.session_id,
            record,
        })
    }
}

/// Append-only JSONL writer.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the event if it is a stage result or session outcome. A failed
    /// write is logged and otherwise ignored; it never stalls the install.
    pub async fn record(&self, envelope: &EventEnvelope) {
        let Some(entry) = HistoryEntry::from_envelope(envelope) else {
            return;
        };
        if let Err(e) = self.append(&entry).await {
            warn!("Failed to write install history: {:#}", e);
        }
    }

    pub async fn append(&self, entry: &HistoryEntry) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            create_dir_all(dir)
                .await
                .context("Failed to create history directory")?;
        }

        let json = serde_json::to_string(entry)? + "\n";
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        file.write_all(json.as_bytes())
            .await
            .context("Failed to write history entry")?;
        file.sync_all().await.context("Failed to sync history")?;
        Ok(())
    }

    /// Read every entry back. Unparseable lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<HistoryEntry>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use installer_common::InstallState;

    fn envelope(seq: u64, event: Event) -> EventEnvelope {
        EventEnvelope {
            seq,
            session_id: Some(Uuid::new_v4()),
            timestamp: Utc::now(),
            event,
        }
    }

    #[tokio::test]
    async fn test_records_results_and_outcomes_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::new(dir.path().join("log/history.jsonl"));

        log.record(&envelope(
            1,
            Event::SessionStateChanged {
                state: InstallState::Running,
            },
        ))
        .await;
        log.record(&envelope(
            2,
            Event::StageCompleted {
                stage: "partition".to_string(),
                position: 0,
                attempt: 1,
                outcome: StageStatus::Failed,
                error: Some(StageError::new("parted exited with status 1")),
            },
        ))
        .await;
        log.record(&envelope(
            3,
            Event::InstallFinished {
                outcome: TerminalOutcome::Aborted,
                summary: "Installation aborted by user".to_string(),
            },
        ))
        .await;

        let entries = log.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 2);
        assert!(matches!(
            entries[0].record,
            HistoryRecord::Stage {
                outcome: StageStatus::Failed,
                ..
            }
        ));
        assert!(matches!(
            entries[1].record,
            HistoryRecord::Session {
                outcome: TerminalOutcome::Aborted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unwritable_path_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let log = HistoryLog::new(blocker.join("history.jsonl"));
        log.record(&envelope(
            1,
            Event::InstallFinished {
                outcome: TerminalOutcome::Succeeded,
                summary: "done".to_string(),
            },
        ))
        .await;
        assert!(log.read_all().await.is_err());
    }
}
