//! Error taxonomy shared by the daemon and its clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::InstallState;

/// Errors returned by the installer daemon in response to a command.
///
/// Precondition errors (`SessionActive`, `NotInRetryableState`, ...) never
/// change daemon state. The `Display` text is meant for direct display.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum InstallError {
    #[error("Permission denied: {reason}")]
    Forbidden { reason: String },

    #[error("Invalid install configuration: {}", problems.join("; "))]
    InvalidConfig { problems: Vec<String> },

    #[error("The previous installation has finished. Reset the session before starting again.")]
    SessionAlreadyTerminal,

    #[error("An installation is already in progress ({state})")]
    SessionActive { state: InstallState },

    #[error("Nothing to retry or skip while the installer is {state}")]
    NotInRetryableState { state: InstallState },

    #[error("The installer is not waiting to begin ({state})")]
    NotConfiguring { state: InstallState },

    #[error("Stage '{stage}' cannot be skipped")]
    StageNotSkippable { stage: String },

    #[error("No installation session is active")]
    NoActiveSession,

    #[error("Stage '{stage}' failed: {summary}")]
    StageExecution { stage: String, summary: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl InstallError {
    pub fn code(&self) -> i32 {
        match self {
            InstallError::Forbidden { .. } => -32010,
            InstallError::InvalidConfig { .. } => -32602,
            InstallError::SessionAlreadyTerminal => -32020,
            InstallError::SessionActive { .. } => -32021,
            InstallError::NotInRetryableState { .. } => -32022,
            InstallError::NotConfiguring { .. } => -32023,
            InstallError::StageNotSkippable { .. } => -32024,
            InstallError::NoActiveSession => -32025,
            InstallError::StageExecution { .. } => -32030,
            InstallError::Transport(_) => -32700,
            InstallError::Internal(_) => -32603,
        }
    }

    pub fn invalid_config(problem: impl Into<String>) -> Self {
        InstallError::InvalidConfig {
            problems: vec![problem.into()],
        }
    }

    /// True for errors caused by the session being in the wrong state.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            InstallError::SessionAlreadyTerminal
                | InstallError::SessionActive { .. }
                | InstallError::NotInRetryableState { .. }
                | InstallError::NotConfiguring { .. }
                | InstallError::StageNotSkippable { .. }
                | InstallError::NoActiveSession
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_distinct() {
        let errors = vec![
            InstallError::Forbidden {
                reason: "x".to_string(),
            },
            InstallError::invalid_config("bad"),
            InstallError::SessionAlreadyTerminal,
            InstallError::SessionActive {
                state: InstallState::Running,
            },
            InstallError::NotInRetryableState {
                state: InstallState::Idle,
            },
            InstallError::NotConfiguring {
                state: InstallState::Idle,
            },
            InstallError::StageNotSkippable {
                stage: "partition".to_string(),
            },
            InstallError::NoActiveSession,
            InstallError::StageExecution {
                stage: "format".to_string(),
                summary: "boom".to_string(),
            },
            InstallError::Transport("eof".to_string()),
            InstallError::Internal("bug".to_string()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_invalid_config_message_joins_problems() {
        let err = InstallError::InvalidConfig {
            problems: vec!["disk missing".to_string(), "bad locale".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Invalid install configuration: disk missing; bad locale"
        );
    }

    #[test]
    fn test_precondition_classification() {
        assert!(InstallError::NoActiveSession.is_precondition());
        assert!(InstallError::SessionActive {
            state: InstallState::Running
        }
        .is_precondition());
        assert!(!InstallError::invalid_config("bad locale").is_precondition());
        assert!(!InstallError::Internal("orchestrator stopped".to_string()).is_precondition());
        assert!(!InstallError::Forbidden {
            reason: "x".to_string()
        }
        .is_precondition());
    }

    #[test]
    fn test_serialized_shape() {
        let err = InstallError::NotInRetryableState {
            state: InstallState::Running,
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "not_in_retryable_state");
        assert_eq!(json["detail"]["state"], "running");

        let unit = serde_json::to_value(InstallError::NoActiveSession).unwrap();
        assert_eq!(unit["code"], "no_active_session");
    }
}
