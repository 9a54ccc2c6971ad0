//! Shared types for the Citadel installer back-end and its front-ends.
//!
//! Everything that crosses the socket between `installd` and a client lives
//! here: the command/event protocol, the session snapshot model and the error
//! taxonomy.

pub mod config;
pub mod disk;
pub mod error;
pub mod ipc;
pub mod session;

pub use config::{InstallConfig, InstallSummary, Secret};
pub use disk::DiskInfo;
pub use error::InstallError;
pub use ipc::{
    Command, Event, EventEnvelope, Request, Response, ResponseData, ServerMessage, Welcome,
    PROTOCOL_VERSION,
};
pub use session::{
    InstallState, SessionSnapshot, SessionView, StageError, StageProgressView, StageResult,
    StageStatus, StageView, TerminalOutcome,
};

/// Version string shared by daemon and client builds.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default location of the daemon control socket.
pub const DEFAULT_SOCKET_PATH: &str = "/run/installer/installer.sock";
