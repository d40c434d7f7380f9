//! Sync engine: turns filesystem events into outbound commands.
//!
//! Every event keeps the [`PathTypeCache`] in step with the tree. Outbound
//! commands are produced only while the session is not applying an inbound
//! command (see [`SyncState`]); otherwise the event is the echo of a change
//! the peer already has.
//!
//! File transfers are not sent from here. The engine hands back an
//! [`UploadJob`] and a worker later calls [`SyncEngine::prepare_upload`],
//! which waits until the file can be read.

use crate::cache::PathTypeCache;
use crate::command::Command;
use crate::config::{AccessRetry, SyncConfig};
use crate::event::{FsEvent, FsEventKind};
use crate::guard::SyncState;
use crate::tree::{self, TreeError, WatchedTree};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// Which end of the connection this engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Watches a local folder and opens the connection; sends `UPLOAD_FILE`.
    Initiator,
    /// Accepts connections, one subtree per initiator; sends `DOWNLOAD_FILE`.
    Hub,
}

impl Role {
    /// The file transfer command this role sends for `path`.
    pub fn transfer_command(self, path: String, size: u64) -> Command {
        match self {
            Role::Initiator => Command::UploadFile { path, size },
            Role::Hub => Command::DownloadFile { path },
        }
    }
}

/// A file whose contents must be sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    /// Wire path
    pub path: String,
    /// Absolute path on disk
    pub source: PathBuf,
}

/// What the engine wants sent in response to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A command with no payload, ready to be written.
    Command(Command),
    /// A file transfer that still has to wait for read access.
    Upload(UploadJob),
}

/// One complete message for the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub command: Command,
    /// File whose contents follow the command, for transfers
    pub payload: Option<PathBuf>,
}

impl Outgoing {
    pub fn line(command: Command) -> Self {
        Self {
            command,
            payload: None,
        }
    }

    pub fn file(command: Command, source: PathBuf) -> Self {
        Self {
            command,
            payload: Some(source),
        }
    }
}

/// Result of waiting for a file to become readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Ready { size: u64 },
    /// The file no longer exists.
    Vanished,
    /// The path is now a directory.
    NotAFile,
    /// Still unreadable after every attempt.
    Busy,
}

/// Poll `path` until it can be opened for reading.
///
/// A missing file ends the wait immediately. Any other open failure (usually
/// another process still holding the file) is retried `retry.attempts` times,
/// `retry.interval` apart.
pub async fn wait_for_file_access(path: &Path, retry: AccessRetry) -> FileAccess {
    let attempts = retry.attempts.max(1);
    for attempt in 1..=attempts {
        match fs::File::open(path).await {
            Ok(file) => match file.metadata().await {
                Ok(metadata) if metadata.is_dir() => return FileAccess::NotAFile,
                Ok(metadata) => {
                    return FileAccess::Ready {
                        size: metadata.len(),
                    };
                }
                Err(e) => debug!(
                    "Cannot stat {} (attempt {}/{}): {}",
                    path.display(),
                    attempt,
                    attempts,
                    e
                ),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FileAccess::Vanished,
            Err(e) => debug!(
                "{} not readable yet (attempt {}/{}): {}",
                path.display(),
                attempt,
                attempts,
                e
            ),
        }

        if attempt < attempts {
            tokio::time::sleep(retry.interval).await;
        }
    }
    FileAccess::Busy
}

pub struct SyncEngine {
    tree: Arc<WatchedTree>,
    cache: Arc<PathTypeCache>,
    state: Arc<SyncState>,
    role: Role,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        tree: Arc<WatchedTree>,
        cache: Arc<PathTypeCache>,
        state: Arc<SyncState>,
        role: Role,
        config: SyncConfig,
    ) -> Self {
        Self {
            tree,
            cache,
            state,
            role,
            config,
        }
    }

    pub fn tree(&self) -> &Arc<WatchedTree> {
        &self.tree
    }

    pub fn cache(&self) -> &Arc<PathTypeCache> {
        &self.cache
    }

    pub fn state(&self) -> &Arc<SyncState> {
        &self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Rebuild the cache from a full scan of the tree.
    pub async fn populate_cache(&self) -> Result<usize, TreeError> {
        let scanned = self.tree.scan().await?;
        self.cache.clear();
        let count = self.cache.populate(scanned);
        debug!(
            "Path cache populated with {} entries under {}",
            count,
            self.tree.root().display()
        );
        Ok(count)
    }

    /// Process one event: update the cache and return what should be sent.
    ///
    /// Nothing is returned for echoes of inbound commands: events the watcher
    /// flagged when it captured them, or whose paths are still marked.
    pub async fn handle(&self, event: FsEvent) -> Vec<Outbound> {
        let suppressed = event.during_apply || self.state.is_echo_any(event.kind.paths());
        let outbound = match event.kind {
            FsEventKind::Created(path) => self.on_created(&path).await,
            FsEventKind::Modified(path) => self.on_modified(&path).await,
            FsEventKind::Deleted(path) => self.on_deleted(&path),
            FsEventKind::Renamed { from, to } => self.on_renamed(&from, &to).await,
        };

        if suppressed {
            if !outbound.is_empty() {
                debug!("Suppressed {} outbound item(s) echoing an inbound change", outbound.len());
            }
            return Vec::new();
        }
        outbound
    }

    /// Wait for the job's file to be readable and build the message to send.
    ///
    /// Returns `None` when the transfer is abandoned.
    pub async fn prepare_upload(&self, job: UploadJob) -> Option<Outgoing> {
        match wait_for_file_access(&job.source, self.config.access_retry).await {
            FileAccess::Ready { size } => {
                let command = self.role.transfer_command(job.path, size);
                Some(Outgoing::file(command, job.source))
            }
            FileAccess::Vanished => {
                debug!("{} vanished before it could be sent", job.path);
                None
            }
            FileAccess::NotAFile => {
                debug!("{} is no longer a file, not sending", job.path);
                None
            }
            FileAccess::Busy => {
                warn!(
                    "Giving up on {} after {} attempts: file stayed unreadable",
                    job.path, self.config.access_retry.attempts
                );
                None
            }
        }
    }

    async fn on_created(&self, path: &Path) -> Vec<Outbound> {
        let Some(relative) = self.wire_path(path) else {
            return Vec::new();
        };

        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!("{} vanished before it was classified: {}", relative, e);
                return Vec::new();
            }
        };

        if !metadata.is_dir() {
            self.cache.set(path, false);
            return vec![self.upload(relative, path)];
        }

        self.cache.set(path, true);
        let mut outbound = vec![Outbound::Command(Command::CreateDirectory { path: relative })];

        // A directory can arrive with contents (moved in, or created faster
        // than the watcher registered it). Those entries get no events of
        // their own, so announce them here.
        let nested = match tree::scan_dir(path).await {
            Ok(nested) => nested,
            Err(e) => {
                warn!("Cannot scan new directory {}: {}", path.display(), e);
                return outbound;
            }
        };
        for (entry, is_dir) in nested {
            self.cache.set(&entry, is_dir);
            let Some(relative) = self.wire_path(&entry) else {
                continue;
            };
            if is_dir {
                outbound.push(Outbound::Command(Command::CreateDirectory { path: relative }));
            } else {
                outbound.push(self.upload(relative, &entry));
            }
        }
        outbound
    }

    async fn on_modified(&self, path: &Path) -> Vec<Outbound> {
        let Some(relative) = self.wire_path(path) else {
            return Vec::new();
        };

        match fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => {
                self.cache.set(path, true);
                Vec::new()
            }
            Ok(_) => {
                self.cache.set(path, false);
                vec![self.upload(relative, path)]
            }
            Err(e) => {
                debug!("{} vanished before it was re-sent: {}", relative, e);
                Vec::new()
            }
        }
    }

    fn on_deleted(&self, path: &Path) -> Vec<Outbound> {
        let Some(relative) = self.wire_path(path) else {
            return Vec::new();
        };

        match self.cache.remove(path) {
            Some(true) => {
                let removed = self.cache.remove_subtree(path);
                debug!("Dropped {} cached entries below {}", removed, relative);
                vec![Outbound::Command(Command::DeleteDirectory { path: relative })]
            }
            Some(false) => vec![Outbound::Command(Command::DeleteFile { path: relative })],
            None => {
                warn!("Deleted path {} was never classified, not propagating", relative);
                Vec::new()
            }
        }
    }

    async fn on_renamed(&self, from: &Path, to: &Path) -> Vec<Outbound> {
        match (self.tree.contains(from), self.tree.contains(to)) {
            (true, true) => {}
            (false, true) => return self.on_created(to).await,
            (true, false) => return self.on_deleted(from),
            (false, false) => return Vec::new(),
        }
        let (Some(old), Some(new)) = (self.wire_path(from), self.wire_path(to)) else {
            return Vec::new();
        };

        match self.cache.rename(from, to) {
            Some(true) => vec![Outbound::Command(Command::RenameDirectory { from: old, to: new })],
            Some(false) => vec![Outbound::Command(Command::RenameFile { from: old, to: new })],
            None => {
                warn!("Renamed path {} was never classified, not propagating", old);
                self.classify_from_disk(to).await;
                Vec::new()
            }
        }
    }

    async fn classify_from_disk(&self, path: &Path) {
        let Ok(metadata) = fs::metadata(path).await else {
            return;
        };
        self.cache.set(path, metadata.is_dir());
        if metadata.is_dir() {
            match tree::scan_dir(path).await {
                Ok(nested) => {
                    self.cache.populate(nested);
                }
                Err(e) => warn!("Cannot scan {}: {}", path.display(), e),
            }
        }
    }

    fn upload(&self, relative: String, source: &Path) -> Outbound {
        Outbound::Upload(UploadJob {
            path: relative,
            source: source.to_path_buf(),
        })
    }

    /// Wire path for an event path, or `None` for the root, paths outside
    /// the tree and names that are not UTF-8.
    fn wire_path(&self, path: &Path) -> Option<String> {
        match self.tree.relative(path) {
            Ok(relative) => Some(relative),
            Err(TreeError::IsRoot) | Err(TreeError::OutsideRoot(_)) => None,
            Err(e) => {
                warn!("Ignoring event: {}", e);
                None
            }
        }
    }
}
