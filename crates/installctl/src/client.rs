//! Client - Unix socket client for the installd control protocol

use installer_common::ipc::{decode_frame, encode_frame, FrameError};
use installer_common::{
    Command, DiskInfo, EventEnvelope, InstallError, Request, ResponseData, ServerMessage,
    SessionSnapshot, Welcome, DEFAULT_SOCKET_PATH, PROTOCOL_VERSION,
};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

/// Environment variable overriding the socket path
pub const SOCKET_ENV: &str = "INSTALLER_SOCKET";

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to installd at {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("connection to installd lost: {0}")]
    Transport(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Remote(#[from] InstallError),
}

impl From<FrameError> for ClientError {
    fn from(e: FrameError) -> Self {
        ClientError::Protocol(e.to_string())
    }
}

impl ClientError {
    /// Errors a reconnect may cure.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Connect { .. } | ClientError::Transport(_))
    }

    /// Suggestion to print under the error, if there is one
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ClientError::Connect { source, .. } => match source.kind() {
                io::ErrorKind::NotFound => {
                    Some("Is installd running? Try: systemctl status installd")
                }
                io::ErrorKind::PermissionDenied => {
                    Some("The control socket should be mode 0666; check how installd was started")
                }
                io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut => {
                    Some("The socket exists but installd is not accepting connections")
                }
                _ => None,
            },
            ClientError::Remote(InstallError::Forbidden { .. }) => {
                Some("Only the user logged in at the machine's seat may control the installer")
            }
            _ => None,
        }
    }
}

fn timed_out(what: &str) -> ClientError {
    ClientError::Transport(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
}

/// Pick the socket path: explicit flag, then `$INSTALLER_SOCKET`, then the
/// default.
pub fn resolve_socket_path(explicit: Option<&str>, env: Option<String>) -> String {
    if let Some(path) = explicit {
        return path.to_string();
    }
    match env {
        Some(path) if !path.is_empty() => path,
        _ => DEFAULT_SOCKET_PATH.to_string(),
    }
}

pub fn discover_socket_path(explicit: Option<&str>) -> String {
    resolve_socket_path(explicit, std::env::var(SOCKET_ENV).ok())
}

/// One connection to installd.
///
/// Events that arrive while a call waits for its response are queued and
/// handed out by [`InstallClient::next_event`] in order.
pub struct InstallClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    welcome: Welcome,
    next_id: u64,
    pending: VecDeque<EventEnvelope>,
}

impl InstallClient {
    /// Connect once and read the Welcome frame.
    pub async fn connect(path: &str) -> Result<Self, ClientError> {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(path)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    path: path.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ClientError::Connect {
                    path: path.to_string(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
                })
            }
        };

        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let first = tokio::time::timeout(CALL_TIMEOUT, read_message(&mut reader))
            .await
            .map_err(|_| timed_out("installd sent no Welcome"))??;

        let welcome = match first {
            ServerMessage::Welcome(welcome) => welcome,
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected Welcome, got {}",
                    frame_kind(&other)
                )))
            }
        };
        check_protocol(&welcome)?;

        Ok(Self {
            reader,
            writer,
            welcome,
            next_id: 1,
            pending: VecDeque::new(),
        })
    }

    /// Connect with retry and exponential backoff. Only transport failures
    /// are retried.
    pub async fn connect_with_retry(path: &str, attempts: u32) -> Result<Self, ClientError> {
        let mut delay = Duration::from_millis(50);
        let mut attempt = 1;
        loop {
            match Self::connect(path).await {
                Ok(client) => return Ok(client),
                Err(e) if e.is_transport() && attempt < attempts => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(500));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn welcome(&self) -> &Welcome {
        &self.welcome
    }

    /// Send a command and wait for its response
    pub async fn call(&mut self, command: Command) -> Result<ResponseData, ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        let frame = encode_frame(&Request { id, command })?;
        self.writer.write_all(&frame).await?;

        tokio::time::timeout(CALL_TIMEOUT, self.await_response(id))
            .await
            .map_err(|_| timed_out("installd did not answer"))?
    }

    async fn await_response(&mut self, id: u64) -> Result<ResponseData, ClientError> {
        loop {
            match read_message(&mut self.reader).await? {
                ServerMessage::Response(response) if response.id == id => {
                    return Ok(response.result?);
                }
                ServerMessage::Response(response) => {
                    // id 0 answers a frame installd could not parse
                    return match response.result {
                        Err(e) if response.id == 0 => Err(ClientError::Remote(e)),
                        _ => Err(ClientError::Protocol(format!(
                            "response to unknown request {}",
                            response.id
                        ))),
                    };
                }
                ServerMessage::Event(envelope) => self.pending.push_back(envelope),
                ServerMessage::Welcome(welcome) => self.rewelcome(welcome)?,
            }
        }
    }

    /// Next event, queued or from the socket.
    pub async fn next_event(&mut self) -> Result<EventEnvelope, ClientError> {
        if let Some(envelope) = self.pending.pop_front() {
            return Ok(envelope);
        }
        loop {
            match read_message(&mut self.reader).await? {
                ServerMessage::Event(envelope) => return Ok(envelope),
                ServerMessage::Response(_) => continue,
                ServerMessage::Welcome(welcome) => self.rewelcome(welcome)?,
            }
        }
    }

    /// installd sends a second Welcome when a connection it refused to
    /// attach becomes authorized. Events follow it from then on.
    fn rewelcome(&mut self, welcome: Welcome) -> Result<(), ClientError> {
        check_protocol(&welcome)?;
        self.welcome = welcome;
        Ok(())
    }

    /// Issue a command that answers with a plain Ack
    pub async fn send(&mut self, command: Command) -> Result<(), ClientError> {
        match self.call(command).await? {
            ResponseData::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&mut self) -> Result<SessionSnapshot, ClientError> {
        match self.call(Command::GetStatus).await? {
            ResponseData::Status(snapshot) => Ok(snapshot),
            other => Err(unexpected(other)),
        }
    }

    pub async fn disks(&mut self) -> Result<Vec<DiskInfo>, ClientError> {
        match self.call(Command::ListDisks).await? {
            ResponseData::Disks(disks) => Ok(disks),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        match self.call(Command::Ping).await? {
            ResponseData::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn check_protocol(welcome: &Welcome) -> Result<(), ClientError> {
    if welcome.protocol_version != PROTOCOL_VERSION {
        return Err(ClientError::Protocol(format!(
            "installd speaks protocol {}, this client speaks {}",
            welcome.protocol_version, PROTOCOL_VERSION
        )));
    }
    Ok(())
}

fn unexpected(data: ResponseData) -> ClientError {
    ClientError::Protocol(format!("unexpected response {:?}", data))
}

fn frame_kind(message: &ServerMessage) -> &'static str {
    match message {
        ServerMessage::Welcome(_) => "Welcome",
        ServerMessage::Response(_) => "Response",
        ServerMessage::Event(_) => "Event",
    }
}

async fn read_message(reader: &mut BufReader<OwnedReadHalf>) -> Result<ServerMessage, ClientError> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(ClientError::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "installd closed the connection",
        )));
    }
    Ok(decode_frame(&line)?)
}
