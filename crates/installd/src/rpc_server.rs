//! RPC Server - Unix socket server for front-end connections

use anyhow::{Context, Result};
use chrono::Utc;
use installer_common::ipc::{decode_frame, encode_frame, FrameError, MAX_FRAME_BYTES};
use installer_common::{
    Command, InstallError, Request, Response, ResponseData, ServerMessage, Welcome,
    PROTOCOL_VERSION, VERSION,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthorizationGuard, PeerIdentity, Verdict};
use crate::disk::DiskProbe;
use crate::orchestrator::Orchestrator;
use crate::registry::{ClientConnection, Evictor, Outbox, SessionRegistry};

/// Shared state for every connection
pub struct ServerContext {
    pub orchestrator: Orchestrator,
    pub registry: SessionRegistry,
    pub guard: AuthorizationGuard,
    pub disks: DiskProbe,
    pub queue_capacity: usize,
    next_id: AtomicU64,
}

impl ServerContext {
    pub fn new(
        orchestrator: Orchestrator,
        registry: SessionRegistry,
        guard: AuthorizationGuard,
        disks: DiskProbe,
        queue_capacity: usize,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            guard,
            disks,
            queue_capacity,
            next_id: AtomicU64::new(1),
        }
    }
}

/// Bind the control socket, replacing a stale one.
pub async fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(socket_dir) = socket_path.parent() {
        tokio::fs::create_dir_all(socket_dir)
            .await
            .context("Failed to create socket directory")?;
    }

    // Remove old socket if it exists
    let _ = tokio::fs::remove_file(socket_path).await;

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;

    // Any local user may connect; the guard decides what they may do
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))
            .context("Failed to set socket permissions")?;
    }

    info!("RPC server listening on {}", socket_path.display());
    Ok(listener)
}

/// Accept connections until `shutdown` flips to true.
pub async fn serve(
    listener: UnixListener,
    ctx: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, ctx).await {
                            error!("Connection handler error: {:#}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("RPC server stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(stream: UnixStream, ctx: Arc<ServerContext>) -> Result<()> {
    let identity = PeerIdentity::from_stream(&stream).context("Failed to read peer credentials")?;
    let id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
    let verdict = ctx.guard.authorize(&identity);
    info!(
        conn = id,
        uid = identity.uid,
        pid = ?identity.pid,
        authorized = verdict.allowed,
        "Client connected: {}",
        verdict.reason
    );

    let (reader, writer) = stream.into_split();
    let (outbox, queue) = Outbox::channel(ctx.queue_capacity);
    let writer = tokio::spawn(writer_loop(writer, queue, outbox.evictor(), id));

    let link = Link {
        id,
        identity,
        outbox,
    };
    let attached = ctx.guard.may_observe(&verdict);
    if attached {
        link.attach(verdict, &ctx).await?;
    } else {
        link.outbox
            .send(ServerMessage::Welcome(Welcome {
                protocol_version: PROTOCOL_VERSION,
                daemon_version: VERSION.to_string(),
                connection_id: id,
                authorized: false,
                reason: verdict.reason.clone(),
                snapshot: None,
            }))
            .await;
    }

    let result = read_loop(reader, &link, attached, &ctx).await;

    ctx.registry.detach(id).await;
    if link.outbox.is_evicted() {
        writer.abort();
    }
    info!(conn = id, "Client disconnected");
    result
}

/// One accepted connection.
struct Link {
    id: u64,
    identity: PeerIdentity,
    outbox: Outbox,
}

impl Link {
    /// Subscribe to events. The orchestrator queues a Welcome with the
    /// current snapshot ahead of the first event.
    async fn attach(&self, verdict: Verdict, ctx: &ServerContext) -> Result<()> {
        let connection = ClientConnection {
            id: self.id,
            identity: self.identity,
            verdict,
            attached_at: Utc::now(),
        };
        ctx.orchestrator
            .attach(connection, self.outbox.clone())
            .await
            .context("Failed to attach connection")?;
        Ok(())
    }
}

async fn read_loop(
    reader: OwnedReadHalf,
    link: &Link,
    mut attached: bool,
    ctx: &ServerContext,
) -> Result<()> {
    let id = link.id;
    let outbox = &link.outbox;
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_FRAME_BYTES as u64 + 1);
        let bytes_read = tokio::select! {
            read = limited.read_until(b'\n', &mut line) => read.context("Failed to read from socket")?,
            _ = outbox.evicted() => {
                warn!(conn = id, "Closing evicted connection");
                return Ok(());
            }
        };

        if bytes_read == 0 {
            // Connection closed
            return Ok(());
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let request: Request = match decode_frame(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(conn = id, "Invalid request: {}", e);
                let oversized = matches!(e, FrameError::TooLarge { .. });
                let response = Response {
                    id: 0,
                    result: Err(InstallError::Transport(e.to_string())),
                };
                outbox.send(ServerMessage::Response(response)).await;
                if oversized {
                    // The rest of the frame is still in the stream
                    return Ok(());
                }
                continue;
            }
        };

        // A peer denied at connect time is attached once it is allowed,
        // with a fresh Welcome ahead of the response.
        if !attached {
            let verdict = ctx.guard.authorize(&link.identity);
            if ctx.guard.may_observe(&verdict) {
                info!(conn = id, "Attaching connection: {}", verdict.reason);
                link.attach(verdict, ctx).await?;
                attached = true;
            }
        }

        let response = dispatch(request, &link.identity, id, ctx).await;
        if !outbox.send(ServerMessage::Response(response)).await {
            return Ok(());
        }
    }
}

/// Handle a single request. The peer is re-authorized every time.
async fn dispatch(
    request: Request,
    identity: &PeerIdentity,
    id: u64,
    ctx: &ServerContext,
) -> Response {
    let command = request.command;
    debug!(conn = id, request = request.id, command = command.name(), "Request");

    let verdict: Verdict = ctx.guard.authorize(identity);
    let permitted = match command {
        Command::Ping => Ok(()),
        _ => ctx.guard.check(&verdict, command.is_mutating()),
    };
    if let Err(e) = permitted {
        warn!(
            conn = id,
            uid = identity.uid,
            command = command.name(),
            "Rejected: {}",
            verdict.reason
        );
        return Response {
            id: request.id,
            result: Err(e),
        };
    }

    let result = match command {
        Command::Ping => Ok(ResponseData::Pong),
        Command::ListDisks => ctx
            .disks
            .list()
            .map(ResponseData::Disks)
            .map_err(|e| InstallError::Internal(format!("{:#}", e))),
        command => ctx.orchestrator.execute(command).await,
    };

    Response {
        id: request.id,
        result,
    }
}

/// Sole writer of the socket: drains the connection's outbox in order.
/// A frame that cannot be encoded evicts the connection.
async fn writer_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<ServerMessage>,
    evictor: Evictor,
    id: u64,
) {
    while let Some(message) = queue.recv().await {
        let frame = match encode_frame(&message) {
            Ok(frame) => frame,
            Err(e) => {
                error!(conn = id, "Failed to encode frame, closing connection: {}", e);
                evictor.evict();
                break;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            debug!(conn = id, "Write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use installer_common::{Event, EventEnvelope};
    use std::time::Duration;

    #[tokio::test]
    async fn test_unencodable_frame_closes_connection() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let (_, writer) = ours.into_split();
        let (outbox, queue) = Outbox::channel(4);
        let task = tokio::spawn(writer_loop(writer, queue, outbox.evictor(), 1));

        let oversized = ServerMessage::Event(EventEnvelope {
            seq: 1,
            session_id: None,
            timestamp: Utc::now(),
            event: Event::StageProgress {
                stage: "install-packages".to_string(),
                percent: None,
                text: Some("#".repeat(MAX_FRAME_BYTES)),
            },
        });
        assert!(outbox.send(oversized).await);

        tokio::time::timeout(Duration::from_secs(5), outbox.evicted())
            .await
            .unwrap();
        task.await.unwrap();

        let mut line = String::new();
        let mut reader = BufReader::new(theirs);
        assert_eq!(reader.read_line(&mut line).await.unwrap(), 0);
    }
}
