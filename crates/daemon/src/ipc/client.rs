//! IPC client used by the CLI subcommands.

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::EventFrame;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for request/response exchanges.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A connection to the daemon's control socket.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connects to the daemon. Fails when no daemon is listening.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends a request and waits for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn exchange(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        self.read_response().await?.ok_or_else(|| {
            IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            ))
        })
    }

    async fn read_response(&mut self) -> Result<Option<IpcResponse>, IpcError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim())?))
    }

    /// Returns `true` if the daemon answers with `Pong`.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    pub async fn start(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Start).await
    }

    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    pub async fn send_command(&mut self, command: impl Into<String>) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::SendCommand {
            command: command.into(),
        })
        .await
    }

    pub async fn shutdown(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Shutdown).await
    }

    /// Subscribes to the event stream and returns the subscriber id.
    ///
    /// Afterwards the connection only carries events; read them with
    /// [`IpcClient::next_event`].
    pub async fn subscribe(&mut self) -> Result<String, IpcError> {
        match self.send(IpcRequest::Subscribe).await? {
            IpcResponse::Subscribed { subscriber_id } => Ok(subscriber_id),
            other => Err(IpcError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected response to Subscribe: {other:?}"),
            ))),
        }
    }

    /// Waits for the next event. Returns `None` when the daemon closes the
    /// stream. No timeout applies.
    pub async fn next_event(&mut self) -> Result<Option<EventFrame>, IpcError> {
        loop {
            match self.read_response().await? {
                None => return Ok(None),
                Some(IpcResponse::Event { event, data }) => {
                    return Ok(Some(EventFrame::new(event, data)))
                }
                Some(other) => {
                    tracing::debug!(response = ?other, "Ignoring non-event message on event stream");
                }
            }
        }
    }
}

fn timed_out(message: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message.to_string()))
}
