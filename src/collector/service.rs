//! The aggregation service.
//!
//! [`Session`] is the per-connection state machine and knows nothing about
//! sockets; [`serve_connection`] drives it over any byte stream, and
//! [`CollectorService`] accepts unix-socket connections one at a time.

use super::protocol::{frame_dump, Command};
use crate::exporter::MetricsRegistry;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Longest command line a connection may send.
pub const MAX_LINE_BYTES: u64 = 64 * 1024;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("a collector is already listening on {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("failed to bind {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("connection timed out")]
    Timeout,

    #[error("command line longer than {limit} bytes")]
    LineTooLong { limit: u64 },

    #[error("connection error: {0}")]
    Io(#[from] io::Error),
}

/// What the connection should do after a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Read the next line.
    Continue,
    /// Write the framed dump, then close.
    Reply(String),
    /// Close without replying.
    Close,
}

/// Command handling for one connection.
#[derive(Debug)]
pub struct Session<'a> {
    registry: &'a MetricsRegistry,
    applied: u64,
    discarded: u64,
}

impl<'a> Session<'a> {
    pub fn new(registry: &'a MetricsRegistry) -> Self {
        Self {
            registry,
            applied: 0,
            discarded: 0,
        }
    }

    /// Handles one raw line. Malformed or rejected commands are logged and
    /// skipped; an empty line ends the batch.
    pub fn handle_line(&mut self, line: &[u8]) -> Step {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Step::Close;
        }
        match Command::parse_bytes(line) {
            Ok(Command::Metrics) => Step::Reply(frame_dump(&self.registry.render())),
            Ok(Command::Update(update)) => {
                match self.registry.apply(&update) {
                    Ok(()) => self.applied += 1,
                    Err(e) => {
                        self.discarded += 1;
                        warn!(metric = %update.name, "Discarding update: {}", e);
                    }
                }
                Step::Continue
            }
            Err(e) => {
                self.discarded += 1;
                warn!("Discarding command: {}", e);
                Step::Continue
            }
        }
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

/// Serves one connection until it closes, sends an empty line or asks for
/// a dump. Every read and write is bounded by `limit`, and no line may be
/// longer than [`MAX_LINE_BYTES`].
pub async fn serve_connection<S>(
    stream: S,
    registry: &MetricsRegistry,
    limit: Duration,
) -> Result<(), ServiceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut session = Session::new(registry);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = timeout(
            limit,
            (&mut reader).take(MAX_LINE_BYTES).read_until(b'\n', &mut line),
        )
        .await
        .map_err(|_| ServiceError::Timeout)??;
        if read == 0 {
            break;
        }
        if read as u64 == MAX_LINE_BYTES && line.last() != Some(&b'\n') {
            return Err(ServiceError::LineTooLong {
                limit: MAX_LINE_BYTES,
            });
        }
        match session.handle_line(&line) {
            Step::Continue => {}
            Step::Close => break,
            Step::Reply(dump) => {
                timeout(limit, writer.write_all(dump.as_bytes()))
                    .await
                    .map_err(|_| ServiceError::Timeout)??;
                timeout(limit, writer.flush())
                    .await
                    .map_err(|_| ServiceError::Timeout)??;
                break;
            }
        }
    }
    trace!(
        applied = session.applied(),
        discarded = session.discarded(),
        "Connection finished"
    );
    Ok(())
}

/// Removes the socket file when dropped.
#[derive(Debug)]
struct SocketGuard {
    path: PathBuf,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed collector socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Failed to remove collector socket: {}", e),
        }
    }
}

/// The collector listening on its unix socket.
#[derive(Debug)]
pub struct CollectorService {
    listener: UnixListener,
    registry: Arc<MetricsRegistry>,
    timeout: Duration,
    guard: SocketGuard,
}

impl CollectorService {
    /// Binds the socket at `path`.
    ///
    /// A leftover socket file nobody listens on is replaced; a live one is an
    /// error, and so is anything at `path` that is not a socket.
    pub async fn bind(
        path: impl AsRef<Path>,
        registry: Arc<MetricsRegistry>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let path = path.as_ref().to_path_buf();
        if let Ok(metadata) = tokio::fs::symlink_metadata(&path).await {
            if !metadata.file_type().is_socket() {
                return Err(ServiceError::Bind {
                    path,
                    source: io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "path exists and is not a socket",
                    ),
                });
            }
            if UnixStream::connect(&path).await.is_ok() {
                return Err(ServiceError::AlreadyRunning(path));
            }
            info!(path = %path.display(), "Removing stale collector socket");
            tokio::fs::remove_file(&path)
                .await
                .map_err(|source| ServiceError::Bind {
                    path: path.clone(),
                    source,
                })?;
        }

        let listener = UnixListener::bind(&path).map_err(|source| ServiceError::Bind {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "Collector listening");
        Ok(Self {
            listener,
            registry,
            timeout,
            guard: SocketGuard { path },
        })
    }

    pub fn path(&self) -> &Path {
        &self.guard.path
    }

    pub fn registry(&self) -> Arc<MetricsRegistry> {
        self.registry.clone()
    }

    /// Accepts and serves connections until the shutdown signal, then
    /// removes the socket file.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        if *shutdown_rx.borrow() {
            return;
        }
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("Collector received shutdown signal.");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        self.registry.clone().refresh_process_stats_async().await;
                        if let Err(e) = serve_connection(stream, &self.registry, self.timeout).await {
                            debug!("Collector connection failed: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Collector accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        info!(path = %self.path().display(), "Collector stopped");
    }
}
