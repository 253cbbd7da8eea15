//! Client side of the collector socket.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timed out while {operation} the collector socket")]
    Timeout { operation: &'static str },

    #[error("failed to connect to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("collector closed the connection before the end of the dump")]
    IncompleteDump,

    #[error("not connected to the collector")]
    NotConnected,

    #[error("collector socket {} did not appear after {attempts} attempts", .path.display())]
    SocketUnavailable { path: PathBuf, attempts: u32 },

    #[error("collector socket error: {0}")]
    Io(#[from] io::Error),
}

/// A connection to the collector, opened on demand.
#[derive(Debug)]
pub struct CollectorClient {
    path: PathBuf,
    timeout: Duration,
    stream: Option<BufReader<UnixStream>>,
    connect_attempts: u32,
}

impl CollectorClient {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            stream: None,
            connect_attempts: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// How many times this client has tried to connect.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// Connects unless already connected.
    pub async fn open(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.connect_attempts += 1;
        let stream = timeout(self.timeout, UnixStream::connect(&self.path))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connecting to",
            })?
            .map_err(|source| TransportError::Connect {
                path: self.path.clone(),
                source,
            })?;
        trace!(path = %self.path.display(), "Connected to collector");
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    /// Writes one or more command lines, connecting first when needed.
    ///
    /// On failure the connection is dropped so the next call reconnects.
    pub async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        self.open().await?;
        let result = match self.stream.as_mut() {
            Some(stream) => write_all(stream, command.as_bytes(), self.timeout).await,
            None => Err(TransportError::NotConnected),
        };
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    /// Reads a dump up to its terminating empty line.
    ///
    /// The returned text keeps the newline of its last line but not the
    /// extra one of the sentinel; an empty dump is returned as `""`.
    pub async fn receive_until_sentinel(&mut self) -> Result<String, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let mut dump = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = timeout(self.timeout, stream.read_until(b'\n', &mut line))
                .await
                .map_err(|_| TransportError::Timeout {
                    operation: "reading from",
                })??;
            if read == 0 {
                return Err(TransportError::IncompleteDump);
            }
            if line == b"\n" {
                break;
            }
            dump.extend_from_slice(&line);
        }
        Ok(String::from_utf8_lossy(&dump).into_owned())
    }

    /// Shuts the connection down. Closing a closed client does nothing.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Ok(Err(e)) = timeout(self.timeout, stream.get_mut().shutdown()).await {
                trace!("Error while closing collector connection: {}", e);
            }
        }
    }
}

async fn write_all(
    stream: &mut BufReader<UnixStream>,
    bytes: &[u8],
    limit: Duration,
) -> Result<(), TransportError> {
    let writer = stream.get_mut();
    timeout(limit, writer.write_all(bytes))
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "writing to",
        })??;
    timeout(limit, writer.flush())
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "writing to",
        })??;
    Ok(())
}

/// Polls until `path` exists, at most `attempts` times `interval` apart.
pub async fn wait_for_socket(
    path: &Path,
    attempts: u32,
    interval: Duration,
) -> Result<(), TransportError> {
    for attempt in 0..attempts {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            debug!(attempt, path = %path.display(), "Collector socket is ready");
            return Ok(());
        }
        sleep(interval).await;
    }
    Err(TransportError::SocketUnavailable {
        path: path.to_path_buf(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::protocol::SENTINEL;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    fn socket_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("collector.sock")
    }

    #[tokio::test]
    async fn test_receive_strips_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"a 1\nb 2\n\n").await.unwrap();
        });

        let mut client = CollectorClient::new(&path, Duration::from_secs(1));
        client.send("metrics\n").await.unwrap();
        assert_eq!(client.receive_until_sentinel().await.unwrap(), "a 1\nb 2\n");
        client.close().await;
        client.close().await;
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_empty_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(SENTINEL.as_bytes()).await.unwrap();
        });

        let mut client = CollectorClient::new(&path, Duration::from_secs(1));
        client.open().await.unwrap();
        assert_eq!(client.receive_until_sentinel().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_silent_collector_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let mut client = CollectorClient::new(&path, Duration::from_millis(100));
        client.send("metrics\n").await.unwrap();
        let err = client.receive_until_sentinel().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }), "{err}");
        server.abort();
    }

    #[tokio::test]
    async fn test_eof_before_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"a 1\n").await.unwrap();
        });

        let mut client = CollectorClient::new(&path, Duration::from_secs(1));
        client.open().await.unwrap();
        assert!(matches!(
            client.receive_until_sentinel().await,
            Err(TransportError::IncompleteDump)
        ));
    }

    #[tokio::test]
    async fn test_failed_write_closes_and_next_send_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).unwrap();

        let mut client = CollectorClient::new(&path, Duration::from_secs(1));
        client.open().await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        assert!(client.send("metrics\n").await.is_err());
        assert!(!client.is_open());

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            stream.read_to_string(&mut received).await.unwrap();
            received
        });
        client.send("metrics\n").await.unwrap();
        assert!(client.is_open());
        assert_eq!(client.connect_attempts(), 2);
        client.close().await;
        assert_eq!(server.await.unwrap(), "metrics\n");
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let mut client = CollectorClient::new(&path, Duration::from_millis(100));
        assert!(matches!(
            client.send("metrics\n").await,
            Err(TransportError::Connect { .. })
        ));
        assert!(!client.is_open());
        assert!(matches!(
            client.receive_until_sentinel().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_wait_for_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let err = wait_for_socket(&path, 2, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::SocketUnavailable { attempts: 2, .. }));

        let _listener = UnixListener::bind(&path).unwrap();
        wait_for_socket(&path, 2, Duration::from_millis(1)).await.unwrap();
    }
}
