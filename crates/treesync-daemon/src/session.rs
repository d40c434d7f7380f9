//! One connection between an initiator and the hub.
//!
//! A running session is a handful of tasks around one socket:
//! - the inbound loop reads frames and applies them through the dispatcher
//! - the event pump feeds watcher events through the sync engine, in order
//! - upload workers wait for files to become readable
//! - a single writer owns the socket's write half
//!
//! The inbound loop decides the session's lifetime: when it ends (EOF or a
//! transport error) every other task is stopped.

use futures::future::join_all;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use treesync_core::{
    ApplyOutcome, CodecError, CommandReader, CommandWriter, Dispatcher, Frame, FsEvent, Outbound,
    Outgoing, PathTypeCache, Role, SyncConfig, SyncEngine, SyncState, TreeError, UploadJob,
    WatchedTree,
};

/// Per-session runtime settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Upload workers
    pub workers: usize,
    /// Pending uploads before the event pump waits
    pub queue_capacity: usize,
    /// Messages waiting for the writer
    pub outbound_capacity: usize,
    /// Watcher events waiting for the event pump
    pub event_capacity: usize,
    pub sync: SyncConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            outbound_capacity: 64,
            event_capacity: 1024,
            sync: SyncConfig::default(),
        }
    }
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Commands and transfers that were applied
    pub applied: u64,
    /// Commands that changed nothing or failed
    pub skipped: u64,
    /// Transfers that ended short
    pub incomplete: u64,
    /// Lines that could not be parsed
    pub malformed: u64,
}

pub struct Session {
    id: String,
    peer: String,
    role: Role,
    tree: Arc<WatchedTree>,
    cache: Arc<PathTypeCache>,
    state: Arc<SyncState>,
    config: SessionConfig,
}

impl Session {
    /// Prepare a session over `tree` and fill its path cache from disk.
    pub async fn new(
        id: String,
        peer: String,
        role: Role,
        tree: WatchedTree,
        config: SessionConfig,
    ) -> Result<Self, TreeError> {
        let session = Self {
            id,
            peer,
            role,
            tree: Arc::new(tree),
            cache: Arc::new(PathTypeCache::new()),
            state: Arc::new(SyncState::new(config.sync.settle)),
            config,
        };
        session.engine().populate_cache().await?;
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tree(&self) -> &WatchedTree {
        &self.tree
    }

    pub fn cache(&self) -> &Arc<PathTypeCache> {
        &self.cache
    }

    /// Shared with the watcher so events can be tagged as they are captured.
    pub fn sync_state(&self) -> Arc<SyncState> {
        Arc::clone(&self.state)
    }

    fn engine(&self) -> SyncEngine {
        SyncEngine::new(
            Arc::clone(&self.tree),
            Arc::clone(&self.cache),
            Arc::clone(&self.state),
            self.role,
            self.config.sync,
        )
    }

    /// Run the session until the peer disconnects.
    pub async fn run<S>(self, stream: S, events: mpsc::Receiver<FsEvent>) -> SessionSummary
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let span = info_span!("session", id = %short_id(&self.id), root = %self.tree.root().display());
        self.run_inner(stream, events).instrument(span).await
    }

    async fn run_inner<S>(self, stream: S, events: mpsc::Receiver<FsEvent>) -> SessionSummary
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        info!("Session with {} active ({:?})", self.peer, self.role);

        let (read_half, write_half) = tokio::io::split(stream);
        let engine = Arc::new(self.engine());
        let dispatcher = Dispatcher::new(Arc::clone(&self.tree), Arc::clone(&self.state));

        let (out_tx, out_rx) = mpsc::channel::<Outgoing>(self.config.outbound_capacity.max(1));
        let (job_tx, job_rx) = mpsc::channel::<UploadJob>(self.config.queue_capacity.max(1));

        let writer = tokio::spawn(
            write_loop(CommandWriter::new(BufWriter::new(write_half)), out_rx).in_current_span(),
        );
        let pump = tokio::spawn(
            event_pump(Arc::clone(&engine), events, out_tx.clone(), job_tx).in_current_span(),
        );

        let job_rx = Arc::new(Mutex::new(job_rx));
        let workers: Vec<JoinHandle<()>> = (0..self.config.workers.max(1))
            .map(|n| {
                tokio::spawn(
                    upload_worker(n, Arc::clone(&engine), Arc::clone(&job_rx), out_tx.clone())
                        .in_current_span(),
                )
            })
            .collect();
        drop(out_tx);

        let summary = read_loop(&dispatcher, CommandReader::new(BufReader::new(read_half))).await;

        pump.abort();
        for worker in &workers {
            worker.abort();
        }
        writer.abort();
        let _ = join_all(workers).await;
        let _ = pump.await;
        let _ = writer.await;

        info!(
            "Session with {} closed: {} applied, {} skipped, {} incomplete, {} malformed",
            self.peer, summary.applied, summary.skipped, summary.incomplete, summary.malformed
        );
        summary
    }
}

/// Read frames until EOF or a transport error and apply each one.
async fn read_loop<R>(dispatcher: &Dispatcher, mut reader: CommandReader<R>) -> SessionSummary
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut summary = SessionSummary::default();

    loop {
        let frame = match reader.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                error!("Connection error: {}", e);
                break;
            }
        };

        let outcome = match frame {
            Frame::Command(command) => {
                debug!("Received {}", command);
                dispatcher.apply(&command).await
            }
            Frame::Transfer { command, size } => {
                debug!("Receiving {} ({} bytes)", command.path(), size);
                match dispatcher.receive_file(&command, size, &mut reader).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Connection error during transfer of {}: {}", command.path(), e);
                        break;
                    }
                }
            }
            Frame::Malformed { line, error } => {
                warn!("Ignoring malformed line {:?}: {}", line, error);
                summary.malformed += 1;
                continue;
            }
            Frame::Closed => {
                info!("Peer closed the connection");
                break;
            }
        };

        match outcome {
            ApplyOutcome::Applied | ApplyOutcome::AlreadyPresent => summary.applied += 1,
            ApplyOutcome::Incomplete { .. } => summary.incomplete += 1,
            ApplyOutcome::NotFound | ApplyOutcome::Failed(_) => summary.skipped += 1,
        }
    }

    summary
}

/// Feed watcher events through the engine in arrival order.
async fn event_pump(
    engine: Arc<SyncEngine>,
    mut events: mpsc::Receiver<FsEvent>,
    out_tx: mpsc::Sender<Outgoing>,
    job_tx: mpsc::Sender<UploadJob>,
) {
    while let Some(event) = events.recv().await {
        for item in engine.handle(event).await {
            let queued = match item {
                Outbound::Command(command) => out_tx.send(Outgoing::line(command)).await.is_ok(),
                Outbound::Upload(job) => job_tx.send(job).await.is_ok(),
            };
            if !queued {
                debug!("Session is closing, dropping outbound work");
                return;
            }
        }
    }
    debug!("Watcher event stream ended");
}

async fn upload_worker(
    n: usize,
    engine: Arc<SyncEngine>,
    jobs: Arc<Mutex<mpsc::Receiver<UploadJob>>>,
    out_tx: mpsc::Sender<Outgoing>,
) {
    loop {
        let job = {
            let mut jobs = jobs.lock().await;
            jobs.recv().await
        };
        let Some(job) = job else {
            break;
        };

        if let Some(outgoing) = engine.prepare_upload(job).await {
            if out_tx.send(outgoing).await.is_err() {
                break;
            }
        }
    }
    debug!("Upload worker {} stopped", n);
}

/// Sole owner of the socket's write half.
async fn write_loop<W>(mut writer: CommandWriter<W>, mut rx: mpsc::Receiver<Outgoing>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(outgoing) = rx.recv().await {
        let command = &outgoing.command;
        let result = match &outgoing.payload {
            Some(source) => writer.send_file(command, source).await.map(|_| ()),
            None => writer.send(command).await,
        };

        match result {
            Ok(()) => debug!("Sent {} {}", command.keyword(), command.path()),
            // Nothing reached the socket for these; the stream is still usable.
            Err(e @ CodecError::Source { .. }) => warn!("Not sending {}: {}", command.path(), e),
            Err(e @ CodecError::Encode(_)) => warn!("Not sending {}: {}", command.path(), e),
            Err(e @ (CodecError::PayloadRequired(_) | CodecError::NoPayload(_))) => {
                error!("Not sending {}: {}", command.path(), e)
            }
            Err(CodecError::Io(e)) => {
                error!("Failed to send {}: {}", command.keyword(), e);
                break;
            }
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
    use treesync_core::{AccessRetry, Command};

    fn config() -> SessionConfig {
        SessionConfig {
            workers: 2,
            sync: SyncConfig {
                access_retry: AccessRetry {
                    attempts: 3,
                    interval: Duration::from_millis(10),
                },
                settle: Duration::ZERO,
            },
            ..SessionConfig::default()
        }
    }

    async fn session(role: Role) -> (TempDir, Session) {
        let tmp = TempDir::new().unwrap();
        let tree = WatchedTree::open(tmp.path()).await.unwrap();
        let session = Session::new("test-session".into(), "peer".into(), role, tree, config())
            .await
            .unwrap();
        (tmp, session)
    }

    #[tokio::test]
    async fn test_new_populates_cache() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("d/f"), b"f").unwrap();

        let tree = WatchedTree::open(tmp.path()).await.unwrap();
        let session = Session::new("id".into(), "peer".into(), Role::Hub, tree, config())
            .await
            .unwrap();
        assert_eq!(session.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_inbound_commands_are_applied_and_summarized() {
        let (_tmp, session) = session(Role::Hub).await;
        let root = session.tree().root().to_path_buf();
        let (_events_tx, events_rx) = mpsc::channel(8);
        let (mut peer, local) = tokio::io::duplex(64 * 1024);

        let handle = tokio::spawn(session.run(local, events_rx));

        peer.write_all(b"CREATE_DIRECTORY \"a\"\nnonsense\nUPLOAD_FILE \"a/f.txt\" 3\nabcDELETE_FILE \"ghost\"\n")
            .await
            .unwrap();
        peer.shutdown().await.unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            summary,
            SessionSummary {
                applied: 2,
                skipped: 1,
                incomplete: 0,
                malformed: 1
            }
        );
        assert_eq!(std::fs::read(root.join("a/f.txt")).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_events_become_outbound_frames() {
        let (_tmp, session) = session(Role::Hub).await;
        let root = session.tree().root().to_path_buf();
        let (events_tx, events_rx) = mpsc::channel(8);
        let (peer, local) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(session.run(local, events_rx));

        std::fs::write(root.join("f.bin"), b"12345").unwrap();
        events_tx.send(FsEvent::created(root.join("f.bin"))).await.unwrap();

        let mut reader = tokio::io::BufReader::new(peer);
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "DOWNLOAD_FILE \"f.bin\"\n");
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "5\n");
        let mut payload = [0u8; 5];
        reader.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"12345");

        events_tx
            .send(FsEvent::created(root.join("f.bin")).with_during_apply(true))
            .await
            .unwrap();
        events_tx.send(FsEvent::deleted(root.join("gone"))).await.unwrap();
        std::fs::remove_file(root.join("f.bin")).unwrap();
        events_tx.send(FsEvent::deleted(root.join("f.bin"))).await.unwrap();

        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(
            Command::parse(line.trim_end()).unwrap(),
            Command::DeleteFile {
                path: "f.bin".into()
            }
        );

        drop(reader);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
