//! IPC server side: the daemon's control socket.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use protocol::EventFrame;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::messages::{IpcRequest, IpcResponse};

/// Listens for CLI connections on a Unix domain socket.
///
/// The socket file is removed when the server is dropped.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Binds to `path`, creating parent directories and replacing a stale
    /// socket file.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        tracing::debug!(path = %path.display(), "IPC socket bound");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the next client.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove IPC socket");
            }
        }
    }
}

/// One client connection speaking newline-delimited JSON.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Reads the next request. Returns `None` once the client disconnects.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }

    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        write_line(&mut self.writer, response).await
    }

    /// Writes every frame from `frames` as an `Event` line.
    ///
    /// Returns when the client disconnects, the frame source closes or
    /// `cancel` fires. Anything the client sends meanwhile is discarded.
    pub async fn forward_events(
        &mut self,
        mut frames: mpsc::Receiver<Arc<EventFrame>>,
        cancel: &CancellationToken,
    ) -> Result<(), IpcError> {
        let mut discard = [0u8; 256];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        write_line(&mut self.writer, &IpcResponse::from(frame.as_ref())).await?;
                    }
                    None => return Ok(()),
                },
                read = self.reader.read(&mut discard) => {
                    if read? == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn write_line(
    writer: &mut tokio::io::WriteHalf<UnixStream>,
    response: &IpcResponse,
) -> Result<(), IpcError> {
    let mut json = serde_json::to_string(response)?;
    json.push('\n');

    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    type RawClient = (
        BufReader<tokio::io::ReadHalf<UnixStream>>,
        tokio::io::WriteHalf<UnixStream>,
    );

    async fn raw_client(path: &Path) -> RawClient {
        let stream = UnixStream::connect(path).await.unwrap();
        let (read_half, write_half) = tokio::io::split(stream);
        (BufReader::new(read_half), write_half)
    }

    #[tokio::test]
    async fn test_bind_creates_parent_dirs() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("dir").join("daemon.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());

        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        std::fs::write(&socket_path, "stale").unwrap();

        let _server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_request_response() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        let client = tokio::spawn(async move {
            let (mut reader, mut writer) = raw_client(&path).await;
            writer
                .write_all(b"{\"SendCommand\":{\"command\":\"hi\"}}\n")
                .await
                .unwrap();

            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            serde_json::from_str::<IpcResponse>(line.trim()).unwrap()
        });

        let mut conn = server.accept().await.unwrap();
        let request = conn.read_request().await.unwrap().unwrap();
        assert_eq!(
            request,
            IpcRequest::SendCommand {
                command: "hi".to_string()
            }
        );
        conn.send_response(&IpcResponse::CommandAccepted).await.unwrap();

        assert_eq!(client.await.unwrap(), IpcResponse::CommandAccepted);
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        tokio::spawn(async move {
            let (_reader, mut writer) = raw_client(&path).await;
            writer.write_all(b"not json\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let mut conn = server.accept().await.unwrap();
        assert!(matches!(conn.read_request().await, Err(IpcError::Json(_))));
    }

    #[tokio::test]
    async fn test_read_returns_none_on_disconnect() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        tokio::spawn(async move {
            let _stream = UnixStream::connect(&path).await.unwrap();
        });

        let mut conn = server.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forward_events_until_client_leaves() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        let client = tokio::spawn(async move {
            let (mut reader, writer) = raw_client(&path).await;
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            drop(writer);
            drop(reader);
            serde_json::from_str::<IpcResponse>(line.trim()).unwrap()
        });

        let mut conn = server.accept().await.unwrap();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Arc::new(EventFrame::new("heartbeat", json!({"timestamp": "t"}))))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let forwarded = tokio::time::timeout(
            Duration::from_secs(2),
            conn.forward_events(rx, &cancel),
        )
        .await
        .expect("forwarding did not notice the disconnect");
        assert!(forwarded.is_ok());

        assert_eq!(
            client.await.unwrap(),
            IpcResponse::Event {
                event: "heartbeat".to_string(),
                data: json!({"timestamp": "t"}),
            }
        );
        drop(tx);
    }

    #[tokio::test]
    async fn test_forward_events_stops_on_cancel() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        let _client = tokio::spawn(async move {
            let client = raw_client(&path).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(client);
        });

        let mut conn = server.accept().await.unwrap();
        let (_tx, rx) = mpsc::channel::<Arc<EventFrame>>(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        conn.forward_events(rx, &cancel).await.unwrap();
    }
}
