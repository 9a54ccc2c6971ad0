//! IPC protocol between `installd` and its clients.
//!
//! Frames are single-line JSON documents terminated by `\n`. Clients send
//! [`Request`]s; the daemon sends [`ServerMessage`]s, which are either the
//! one-time [`Welcome`], a [`Response`] to a request, or a broadcast
//! [`EventEnvelope`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::InstallConfig;
use crate::disk::DiskInfo;
use crate::error::InstallError;
use crate::session::{InstallState, SessionSnapshot, StageError, StageStatus, TerminalOutcome};

/// Bumped on incompatible frame changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Largest snapshot the daemon puts in a frame. The rest of the frame is
/// the Welcome or Response around it.
pub const MAX_SNAPSHOT_BYTES: usize = MAX_FRAME_BYTES - 4 * 1024;

/// IPC request from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Commands a front-end may issue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Command {
    /// Create a session from the given parameters
    StartInstall(InstallConfig),

    /// Start running stages of a configured session
    Begin,

    /// Re-run the stage the session is paused on
    Retry,

    /// Skip the stage the session is paused on (skippable stages only)
    Skip,

    /// Abort the active session
    Abort,

    /// Discard a finished session so a new one can start
    ResetSession,

    /// Current session snapshot
    GetStatus,

    /// Candidate target disks
    ListDisks,

    /// Health check
    Ping,
}

impl Command {
    /// Whether the command can change session state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Command::StartInstall(_)
                | Command::Begin
                | Command::Retry
                | Command::Skip
                | Command::Abort
                | Command::ResetSession
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::StartInstall(_) => "StartInstall",
            Command::Begin => "Begin",
            Command::Retry => "Retry",
            Command::Skip => "Skip",
            Command::Abort => "Abort",
            Command::ResetSession => "ResetSession",
            Command::GetStatus => "GetStatus",
            Command::ListDisks => "ListDisks",
            Command::Ping => "Ping",
        }
    }
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ResponseData {
    /// Command accepted
    Ack,

    /// Reply to `Ping`
    Pong,

    /// Session snapshot
    Status(SessionSnapshot),

    /// Disk list
    Disks(Vec<DiskInfo>),
}

/// IPC response from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, InstallError>,
}

/// First frame on every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    pub protocol_version: u32,
    pub daemon_version: String,
    pub connection_id: u64,
    pub authorized: bool,
    pub reason: String,
    /// Present when the connection is attached to the event stream.
    pub snapshot: Option<SessionSnapshot>,
}

/// Events broadcast to every attached connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StageStarted {
        stage: String,
        position: usize,
        attempt: u32,
    },
    StageProgress {
        stage: String,
        percent: Option<u8>,
        text: Option<String>,
    },
    StageCompleted {
        stage: String,
        position: usize,
        attempt: u32,
        outcome: StageStatus,
        error: Option<StageError>,
    },
    SessionStateChanged {
        state: InstallState,
    },
    InstallFinished {
        outcome: TerminalOutcome,
        summary: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::StageStarted { .. } => "StageStarted",
            Event::StageProgress { .. } => "StageProgress",
            Event::StageCompleted { .. } => "StageCompleted",
            Event::SessionStateChanged { .. } => "SessionStateChanged",
            Event::InstallFinished { .. } => "InstallFinished",
        }
    }
}

/// An event stamped with its position in the daemon's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub session_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

/// Frames sent by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome(Welcome),
    Response(Response),
    Event(EventEnvelope),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize a value as one newline-terminated frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    let mut bytes = serde_json::to_vec(value)?;
    if bytes.len() >= MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            size: bytes.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one frame. Trailing whitespace (including the newline) is ignored.
pub fn decode_frame<T: DeserializeOwned>(line: &[u8]) -> Result<T, FrameError> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            size: line.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    Ok(serde_json::from_slice(line.trim_ascii_end())?)
}
