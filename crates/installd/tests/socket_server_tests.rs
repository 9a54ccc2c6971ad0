//! Protocol behavior over a real Unix socket.

use async_trait::async_trait;
use installd::auth::{AuthorizationGuard, SeatOwner, StaticSeat};
use installd::disk::DiskProbe;
use installd::orchestrator::{Orchestrator, OrchestratorSettings};
use installd::registry::SessionRegistry;
use installd::rpc_server::{self, ServerContext};
use installd::stage::scripted::{Behavior, ScriptedStage};
use installd::stage::{
    StageCatalog, StageContext, StageExecutor, StageOutcome, StageTemplate,
};
use installer_common::ipc::{decode_frame, encode_frame};
use installer_common::{
    Command, Event, InstallConfig, InstallError, InstallState, Request, ResponseData, Secret,
    ServerMessage, StageError, Welcome,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(5);

struct Daemon {
    _dir: TempDir,
    socket: PathBuf,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    async fn start(seat_owner: Option<u32>, allow_unauthorized_reads: bool) -> Self {
        Self::start_with(
            Arc::new(StaticSeat(seat_owner)),
            allow_unauthorized_reads,
            Arc::new(ScriptedStage::new(vec![], Behavior::WaitForCancel)),
        )
        .await
    }

    async fn start_with(
        seat: Arc<dyn SeatOwner>,
        allow_unauthorized_reads: bool,
        stage: Arc<dyn StageExecutor>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sys_block = dir.path().join("sys/block");
        std::fs::create_dir_all(&sys_block).unwrap();

        let catalog = StageCatalog::new(vec![StageTemplate::new("partition", stage)]).unwrap();
        let registry = SessionRegistry::new();
        let (orchestrator, _engine) = Orchestrator::spawn(
            catalog,
            Arc::new(|_: &InstallConfig| Vec::<String>::new()),
            registry.clone(),
            None,
            OrchestratorSettings::default(),
        );
        let guard = AuthorizationGuard::new(seat, vec![], allow_unauthorized_reads);
        let ctx = Arc::new(ServerContext::new(
            orchestrator,
            registry,
            guard,
            DiskProbe::new(&sys_block, dir.path().join("dev")),
            16,
        ));

        let socket = dir.path().join("run/installer.sock");
        let listener = rpc_server::bind(&socket).await.unwrap();
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(rpc_server::serve(listener, ctx, rx));

        Self {
            _dir: dir,
            socket,
            shutdown,
        }
    }

    async fn connect(&self) -> (Welcome, Client) {
        let stream = UnixStream::connect(&self.socket).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Client {
            reader: BufReader::new(reader),
            writer,
            next_id: 1,
        };
        match client.read().await {
            ServerMessage::Welcome(welcome) => (welcome, client),
            other => panic!("expected Welcome first, got {:?}", other),
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl Client {
    async fn read(&mut self) -> ServerMessage {
        let mut line = String::new();
        let n = tokio::time::timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for frame")
            .unwrap();
        assert!(n > 0, "daemon closed the connection");
        decode_frame(line.as_bytes()).unwrap()
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Send a command and wait for its response, skipping events.
    async fn call(&mut self, command: Command) -> Result<ResponseData, InstallError> {
        let id = self.next_id;
        self.next_id += 1;
        let frame = encode_frame(&Request { id, command }).unwrap();
        self.send_raw(&frame).await;
        loop {
            if let ServerMessage::Response(response) = self.read().await {
                assert_eq!(response.id, id);
                return response.result;
            }
        }
    }

    async fn state(&mut self) -> InstallState {
        match self.call(Command::GetStatus).await {
            Ok(ResponseData::Status(snapshot)) => snapshot.state,
            other => panic!("unexpected status reply {:?}", other),
        }
    }
}

fn config() -> InstallConfig {
    InstallConfig {
        target_disk: "/dev/vda".to_string(),
        hostname: "citadel".to_string(),
        locale: "en_US.UTF-8".to_string(),
        timezone: "UTC".to_string(),
        username: "user".to_string(),
        account_passphrase: Secret::new("account-pass"),
        disk_passphrase: Secret::new("disk-pass"),
        skip_stages: vec![],
        auto_begin: true,
    }
}

/// Fails with the kind of stderr a tool redrawing progress with `\r`
/// leaves behind: one enormous line.
struct NoisyFailure;

#[async_trait]
impl StageExecutor for NoisyFailure {
    async fn execute(&self, _ctx: StageContext) -> StageOutcome {
        let stderr = format!("{}Caution: invalid partition table", "\r 42%".repeat(20_000));
        StageOutcome::Failed(StageError::new("sgdisk exited with status 4").with_detail(stderr))
    }
}

/// Seat whose active user can change while the daemon runs.
struct SwitchableSeat(Mutex<Option<u32>>);

impl SeatOwner for SwitchableSeat {
    fn active_uid(&self) -> Option<u32> {
        *self.0.lock().unwrap()
    }
}

fn own_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

/// A uid that is not ours, so the seat check fails.
fn other_uid() -> u32 {
    own_uid().wrapping_add(4242)
}

#[tokio::test]
async fn test_welcome_carries_snapshot() {
    let daemon = Daemon::start(Some(own_uid()), false).await;
    let (welcome, mut client) = daemon.connect().await;

    assert!(welcome.authorized);
    assert_eq!(welcome.protocol_version, installer_common::PROTOCOL_VERSION);
    let snapshot = welcome.snapshot.unwrap();
    assert_eq!(snapshot.state, InstallState::Idle);
    assert_eq!(client.call(Command::Ping).await, Ok(ResponseData::Pong));
}

#[tokio::test]
async fn test_list_disks_on_empty_machine() {
    let daemon = Daemon::start(Some(own_uid()), false).await;
    let (_, mut client) = daemon.connect().await;
    assert_eq!(
        client.call(Command::ListDisks).await,
        Ok(ResponseData::Disks(vec![]))
    );
}

#[tokio::test]
async fn test_socket_is_world_connectable() {
    use std::os::unix::fs::PermissionsExt;

    let daemon = Daemon::start(None, false).await;
    let mode = std::fs::metadata(&daemon.socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o666);
}

#[tokio::test]
async fn test_unauthorized_start_is_forbidden() {
    let daemon = Daemon::start(Some(other_uid()), true).await;
    let (welcome, mut client) = daemon.connect().await;
    assert!(!welcome.authorized);
    assert!(welcome.snapshot.is_some());

    let err = client
        .call(Command::StartInstall(config()))
        .await
        .unwrap_err();
    assert!(matches!(err, InstallError::Forbidden { .. }));
    assert_eq!(client.state().await, InstallState::Idle);
}

#[tokio::test]
async fn test_unauthorized_without_reads_gets_nothing() {
    let daemon = Daemon::start(None, false).await;
    let (welcome, mut client) = daemon.connect().await;
    assert!(!welcome.authorized);
    assert!(welcome.snapshot.is_none());

    assert_eq!(client.call(Command::Ping).await, Ok(ResponseData::Pong));
    assert!(matches!(
        client.call(Command::GetStatus).await,
        Err(InstallError::Forbidden { .. })
    ));
}

#[tokio::test]
async fn test_malformed_frame_gets_transport_error() {
    let daemon = Daemon::start(Some(own_uid()), false).await;
    let (_, mut client) = daemon.connect().await;

    client.send_raw(b"{not json\n").await;
    match client.read().await {
        ServerMessage::Response(response) => {
            assert_eq!(response.id, 0);
            assert!(matches!(response.result, Err(InstallError::Transport(_))));
        }
        other => panic!("unexpected frame {:?}", other),
    }

    // The connection survives a bad frame
    assert_eq!(client.call(Command::Ping).await, Ok(ResponseData::Pong));
}

#[tokio::test]
async fn test_events_reach_every_client() {
    let daemon = Daemon::start(Some(own_uid()), false).await;
    let (_, mut driver) = daemon.connect().await;
    let (_, mut watcher) = daemon.connect().await;

    assert_eq!(
        driver.call(Command::StartInstall(config())).await,
        Ok(ResponseData::Ack)
    );

    let mut seen = Vec::new();
    while seen.len() < 3 {
        if let ServerMessage::Event(envelope) = watcher.read().await {
            seen.push(envelope);
        }
    }
    assert_eq!(
        seen[0].event,
        Event::SessionStateChanged {
            state: InstallState::Configuring
        }
    );
    assert_eq!(
        seen[2].event,
        Event::StageStarted {
            stage: "partition".to_string(),
            position: 0,
            attempt: 1,
        }
    );

    // A late client starts from the snapshot
    let (welcome, _) = daemon.connect().await;
    let snapshot = welcome.snapshot.unwrap();
    assert_eq!(snapshot.state, InstallState::Running);
    assert_eq!(snapshot.last_event_seq, seen[2].seq);
}

#[tokio::test]
async fn test_huge_stage_error_keeps_clients_in_sync() {
    let daemon = Daemon::start_with(
        Arc::new(StaticSeat(Some(own_uid()))),
        false,
        Arc::new(NoisyFailure),
    )
    .await;
    let (_, mut driver) = daemon.connect().await;

    assert_eq!(
        driver.call(Command::StartInstall(config())).await,
        Ok(ResponseData::Ack)
    );

    // Every event arrives, in order, including the failed stage
    let mut seen = Vec::new();
    while !matches!(
        seen.last(),
        Some(Event::SessionStateChanged {
            state: InstallState::StagePaused
        })
    ) {
        if let ServerMessage::Event(envelope) = driver.read().await {
            assert_eq!(envelope.seq, seen.len() as u64 + 1);
            seen.push(envelope.event);
        }
    }
    let Some(Event::StageCompleted {
        error: Some(error), ..
    }) = seen.iter().find(|e| matches!(e, Event::StageCompleted { .. }))
    else {
        panic!("no StageCompleted in {:?}", seen);
    };
    let detail = error.detail.as_deref().unwrap();
    assert!(detail.len() <= StageError::MAX_DETAIL_BYTES + 32);
    assert!(detail.ends_with("Caution: invalid partition table"));

    // Status still answers and a reopened front-end still attaches
    assert_eq!(driver.state().await, InstallState::StagePaused);
    let (welcome, mut reopened) = daemon.connect().await;
    let snapshot = welcome.snapshot.unwrap();
    assert_eq!(snapshot.state, InstallState::StagePaused);
    assert_eq!(snapshot.last_event_seq, seen.len() as u64);

    // Retrying repeatedly never grows the snapshot past a frame
    for _ in 0..5 {
        assert_eq!(reopened.call(Command::Retry).await, Ok(ResponseData::Ack));
        while reopened.state().await != InstallState::StagePaused {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    let (welcome, _) = daemon.connect().await;
    let view = welcome.snapshot.unwrap().session.unwrap();
    assert_eq!(view.stages[0].attempts, 6);
}

#[tokio::test]
async fn test_connection_attaches_once_peer_is_allowed() {
    let seat = Arc::new(SwitchableSeat(Mutex::new(None)));
    let daemon = Daemon::start_with(
        seat.clone(),
        false,
        Arc::new(ScriptedStage::new(vec![], Behavior::WaitForCancel)),
    )
    .await;
    let (welcome, mut client) = daemon.connect().await;
    assert!(!welcome.authorized);
    assert!(welcome.snapshot.is_none());

    // The seat owner logs in on the same connection
    *seat.0.lock().unwrap() = Some(own_uid());
    client
        .send_raw(
            &encode_frame(&Request {
                id: 1,
                command: Command::StartInstall(config()),
            })
            .unwrap(),
        )
        .await;

    match client.read().await {
        ServerMessage::Welcome(welcome) => {
            assert!(welcome.authorized);
            assert_eq!(welcome.snapshot.unwrap().state, InstallState::Idle);
        }
        other => panic!("expected a fresh Welcome, got {:?}", other),
    }

    let mut response = None;
    let mut events = Vec::new();
    while events.len() < 3 {
        match client.read().await {
            ServerMessage::Response(r) => response = Some(r),
            ServerMessage::Event(envelope) => events.push(envelope.seq),
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(events, vec![1, 2, 3]);
    if response.is_none() {
        if let ServerMessage::Response(r) = client.read().await {
            response = Some(r);
        }
    }
    assert_eq!(response.unwrap().result, Ok(ResponseData::Ack));
}
