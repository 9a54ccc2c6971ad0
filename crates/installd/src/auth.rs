//! Authorization guard for control socket connections.
//!
//! A connection may drive the installer when its peer uid owns the active
//! session on the configured seat (the person sitting at the machine), or
//! is explicitly trusted in `[auth] allowed_uids`. Everything else is denied
//! for mutating commands; read access for denied peers is a single switch.

use installer_common::InstallError;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixStream;

/// Kernel-reported identity of the process on the other end of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

impl PeerIdentity {
    /// Read SO_PEERCRED from a connected stream.
    pub fn from_stream(stream: &UnixStream) -> std::io::Result<Self> {
        let cred = stream.peer_cred()?;
        Ok(Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: String,
}

impl Verdict {
    fn allow(reason: String) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// Source of the uid owning the local graphical/console session.
pub trait SeatOwner: Send + Sync {
    fn active_uid(&self) -> Option<u32>;
}

/// logind seat state file, e.g. `/run/systemd/seats/seat0`.
///
/// The file is re-read on every call: the active session changes on VT
/// switches and logouts.
pub struct LogindSeat {
    state_file: PathBuf,
}

impl LogindSeat {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
        }
    }
}

impl SeatOwner for LogindSeat {
    fn active_uid(&self) -> Option<u32> {
        let content = fs::read_to_string(&self.state_file).ok()?;
        parse_active_uid(&content)
    }
}

fn parse_active_uid(content: &str) -> Option<u32> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("ACTIVE_UID="))
        .and_then(|uid| uid.trim().parse().ok())
}

/// Fixed seat owner, for tests and seatless machines.
pub struct StaticSeat(pub Option<u32>);

impl SeatOwner for StaticSeat {
    fn active_uid(&self) -> Option<u32> {
        self.0
    }
}

/// Stateless policy check. Verdicts are computed at attach and again before
/// every command, so a seat change takes effect on the next request.
pub struct AuthorizationGuard {
    seat: Arc<dyn SeatOwner>,
    allowed_uids: Vec<u32>,
    allow_unauthorized_reads: bool,
}

impl AuthorizationGuard {
    pub fn new(
        seat: Arc<dyn SeatOwner>,
        allowed_uids: Vec<u32>,
        allow_unauthorized_reads: bool,
    ) -> Self {
        Self {
            seat,
            allowed_uids,
            allow_unauthorized_reads,
        }
    }

    pub fn authorize(&self, identity: &PeerIdentity) -> Verdict {
        if self.allowed_uids.contains(&identity.uid) {
            return Verdict::allow(format!("uid {} is trusted", identity.uid));
        }
        match self.seat.active_uid() {
            Some(owner) if owner == identity.uid => {
                Verdict::allow(format!("uid {} owns the active seat session", identity.uid))
            }
            Some(_) => Verdict::deny(format!(
                "uid {} does not own the active seat session",
                identity.uid
            )),
            None => Verdict::deny(format!(
                "no active seat session; uid {} is not trusted",
                identity.uid
            )),
        }
    }

    /// Whether a connection with this verdict receives snapshots and events.
    pub fn may_observe(&self, verdict: &Verdict) -> bool {
        verdict.allowed || self.allow_unauthorized_reads
    }

    /// Gate one command.
    pub fn check(&self, verdict: &Verdict, mutating: bool) -> Result<(), InstallError> {
        if verdict.allowed || (!mutating && self.allow_unauthorized_reads) {
            Ok(())
        } else {
            Err(InstallError::Forbidden {
                reason: verdict.reason.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(uid: u32) -> PeerIdentity {
        PeerIdentity {
            uid,
            gid: uid,
            pid: Some(4242),
        }
    }

    fn guard(seat: Option<u32>, reads: bool) -> AuthorizationGuard {
        AuthorizationGuard::new(Arc::new(StaticSeat(seat)), vec![0], reads)
    }

    #[test]
    fn test_seat_owner_is_allowed() {
        let verdict = guard(Some(1000), false).authorize(&peer(1000));
        assert!(verdict.allowed);
    }

    #[test]
    fn test_root_is_trusted_without_seat() {
        assert!(guard(None, false).authorize(&peer(0)).allowed);
    }

    #[test]
    fn test_other_user_is_denied() {
        let guard = guard(Some(1000), false);
        let verdict = guard.authorize(&peer(1001));
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("1001"));

        let err = guard.check(&verdict, true).unwrap_err();
        assert!(matches!(err, InstallError::Forbidden { .. }));
        assert!(guard.check(&verdict, false).is_err());
        assert!(!guard.may_observe(&verdict));
    }

    #[test]
    fn test_read_switch_never_allows_mutation() {
        let guard = guard(Some(1000), true);
        let verdict = guard.authorize(&peer(1001));
        assert!(guard.check(&verdict, false).is_ok());
        assert!(guard.check(&verdict, true).is_err());
        assert!(guard.may_observe(&verdict));
    }

    #[test]
    fn test_logind_seat_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seat0");
        std::fs::write(
            &path,
            "# This is private data. Do not parse.\nIS_SEAT0=1\nACTIVE=c2\nACTIVE_UID=1000\nSESSIONS=c2\n",
        )
        .unwrap();
        assert_eq!(LogindSeat::new(&path).active_uid(), Some(1000));
        assert_eq!(LogindSeat::new(dir.path().join("seat1")).active_uid(), None);
    }

    #[test]
    fn test_seat_without_active_session() {
        assert_eq!(parse_active_uid("IS_SEAT0=1\nCAN_GRAPHICAL=1\n"), None);
    }
}
