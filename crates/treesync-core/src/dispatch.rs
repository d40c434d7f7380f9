//! Applies inbound commands to the local tree.
//!
//! Every application holds an [`ApplyGuard`](crate::guard::ApplyGuard) over
//! the paths the command names so the watcher notifications it causes are not
//! sent back to the peer. Filesystem
//! failures never escape as errors: they are logged with the offending path
//! and reported through [`ApplyOutcome`]. Only transport failures while
//! draining a payload are returned as `Err`, since they end the session.

use crate::codec::CommandReader;
use crate::command::Command;
use crate::guard::SyncState;
use crate::tree::{TreeError, WatchedTree};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncBufRead;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} carries a payload and must be applied with receive_file")]
    PayloadExpected(&'static str),
}

impl DispatchError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What applying one command did to the tree.
#[derive(Debug)]
pub enum ApplyOutcome {
    Applied,
    /// The path the command refers to does not exist; nothing was changed.
    NotFound,
    /// The directory to create already exists.
    AlreadyPresent,
    /// The file was written but the stream ended before `expected` bytes.
    Incomplete { expected: u64, received: u64 },
    Failed(DispatchError),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied | ApplyOutcome::AlreadyPresent)
    }
}

pub struct Dispatcher {
    tree: Arc<WatchedTree>,
    state: Arc<SyncState>,
}

impl Dispatcher {
    pub fn new(tree: Arc<WatchedTree>, state: Arc<SyncState>) -> Self {
        Self { tree, state }
    }

    pub fn tree(&self) -> &WatchedTree {
        &self.tree
    }

    /// Apply a command that has no payload.
    pub async fn apply(&self, command: &Command) -> ApplyOutcome {
        let _guard = self.state.enter(self.touched(command));
        let outcome = match self.apply_inner(command).await {
            Ok(outcome) => outcome,
            Err(e) => ApplyOutcome::Failed(e),
        };
        log_outcome(command, &outcome);
        outcome
    }

    /// Write the payload that follows a file transfer command to `path`.
    ///
    /// The payload is always drained from `reader`, even when the file cannot
    /// be created, so the stream stays in step with the sender.
    pub async fn receive_file<R>(
        &self,
        command: &Command,
        size: u64,
        reader: &mut CommandReader<R>,
    ) -> io::Result<ApplyOutcome>
    where
        R: AsyncBufRead + Unpin,
    {
        let _guard = self.state.enter(self.touched(command));

        let outcome = match self.create_target(command.path()).await {
            Ok((target, mut file)) => {
                let receipt = reader.read_payload(size, &mut file).await?;
                if let Some(source) = receipt.write_error {
                    ApplyOutcome::Failed(DispatchError::io(&target, source))
                } else if !receipt.is_complete() {
                    ApplyOutcome::Incomplete {
                        expected: receipt.expected,
                        received: receipt.received,
                    }
                } else {
                    ApplyOutcome::Applied
                }
            }
            Err(e) => {
                let receipt = reader.read_payload(size, &mut tokio::io::sink()).await?;
                debug!("Discarded {} payload bytes for {}", receipt.received, command.path());
                ApplyOutcome::Failed(e)
            }
        };

        log_outcome(command, &outcome);
        Ok(outcome)
    }

    /// Local paths a command will change. Invalid ones are rejected later.
    fn touched(&self, command: &Command) -> Vec<PathBuf> {
        command
            .paths()
            .into_iter()
            .filter_map(|path| self.tree.resolve(path).ok())
            .collect()
    }

    async fn apply_inner(&self, command: &Command) -> Result<ApplyOutcome, DispatchError> {
        match command {
            Command::UploadFile { .. } | Command::DownloadFile { .. } => {
                Err(DispatchError::PayloadExpected(command.keyword()))
            }
            Command::DeleteFile { path } => {
                let target = self.tree.resolve(path)?;
                match fs::remove_file(&target).await {
                    Ok(()) => Ok(ApplyOutcome::Applied),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ApplyOutcome::NotFound),
                    Err(e) => Err(DispatchError::io(&target, e)),
                }
            }
            Command::DeleteDirectory { path } => {
                let target = self.tree.resolve(path)?;
                match fs::remove_dir_all(&target).await {
                    Ok(()) => Ok(ApplyOutcome::Applied),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ApplyOutcome::NotFound),
                    Err(e) => Err(DispatchError::io(&target, e)),
                }
            }
            Command::CreateDirectory { path } => {
                let target = self.tree.resolve(path)?;
                if fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
                    return Ok(ApplyOutcome::AlreadyPresent);
                }
                fs::create_dir_all(&target)
                    .await
                    .map_err(|e| DispatchError::io(&target, e))?;
                Ok(ApplyOutcome::Applied)
            }
            Command::RenameFile { from, to } | Command::RenameDirectory { from, to } => {
                let source = self.tree.resolve(from)?;
                let destination = self.tree.resolve(to)?;
                if fs::symlink_metadata(&source).await.is_err() {
                    return Ok(ApplyOutcome::NotFound);
                }
                self.ensure_parent(&destination).await?;
                fs::rename(&source, &destination)
                    .await
                    .map_err(|e| DispatchError::io(&source, e))?;
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    async fn create_target(&self, path: &str) -> Result<(PathBuf, fs::File), DispatchError> {
        let target = self.tree.resolve(path)?;
        self.ensure_parent(&target).await?;
        let file = fs::File::create(&target)
            .await
            .map_err(|e| DispatchError::io(&target, e))?;
        Ok((target, file))
    }

    async fn ensure_parent(&self, path: &Path) -> Result<(), DispatchError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DispatchError::io(parent, e))?;
        }
        Ok(())
    }
}

fn log_outcome(command: &Command, outcome: &ApplyOutcome) {
    match outcome {
        ApplyOutcome::Applied => debug!("Applied {}", command),
        ApplyOutcome::AlreadyPresent => debug!("{}: directory already present", command.path()),
        ApplyOutcome::NotFound => info!(
            "{}: {} does not exist, nothing to do",
            command.keyword(),
            command.path()
        ),
        ApplyOutcome::Incomplete { expected, received } => warn!(
            "Incomplete transfer of {}: expected {} bytes, received {}",
            command.path(),
            expected,
            received
        ),
        ApplyOutcome::Failed(e) => error!("Failed to apply {}: {}", command.keyword(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Frame;
    use crate::guard::SyncPhase;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn dispatcher() -> (TempDir, Dispatcher, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let tree = Arc::new(WatchedTree::open(tmp.path()).await.unwrap());
        let root = tree.root().to_path_buf();
        let state = Arc::new(SyncState::new(Duration::ZERO));
        (tmp, Dispatcher::new(tree, state), root)
    }

    #[tokio::test]
    async fn test_create_directory_is_idempotent() {
        let (_tmp, d, root) = dispatcher().await;
        let cmd = Command::CreateDirectory { path: "a/b".into() };

        assert!(matches!(d.apply(&cmd).await, ApplyOutcome::Applied));
        assert!(matches!(d.apply(&cmd).await, ApplyOutcome::AlreadyPresent));
        assert!(root.join("a/b").is_dir());
        assert_eq!(std::fs::read_dir(root.join("a")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (_tmp, d, _root) = dispatcher().await;
        let outcome = d
            .apply(&Command::DeleteFile {
                path: "ghost.txt".into(),
            })
            .await;
        assert!(matches!(outcome, ApplyOutcome::NotFound));

        let outcome = d
            .apply(&Command::DeleteDirectory {
                path: "ghost".into(),
            })
            .await;
        assert!(matches!(outcome, ApplyOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_delete_directory_is_recursive() {
        let (_tmp, d, root) = dispatcher().await;
        std::fs::create_dir_all(root.join("docs/img")).unwrap();
        std::fs::write(root.join("docs/img/p.png"), b"p").unwrap();

        let outcome = d
            .apply(&Command::DeleteDirectory { path: "docs".into() })
            .await;
        assert!(outcome.is_applied());
        assert!(!root.join("docs").exists());
    }

    #[tokio::test]
    async fn test_rename_creates_destination_parent() {
        let (_tmp, d, root) = dispatcher().await;
        std::fs::write(root.join("a.txt"), b"a").unwrap();

        let outcome = d
            .apply(&Command::RenameFile {
                from: "a.txt".into(),
                to: "x/y/b.txt".into(),
            })
            .await;
        assert!(outcome.is_applied());
        assert_eq!(std::fs::read(root.join("x/y/b.txt")).unwrap(), b"a");
        assert!(!root.join("a.txt").exists());

        let outcome = d
            .apply(&Command::RenameDirectory {
                from: "nope".into(),
                to: "still-nope".into(),
            })
            .await;
        assert!(matches!(outcome, ApplyOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_applied_paths_are_marked_as_echoes() {
        let tmp = TempDir::new().unwrap();
        let tree = Arc::new(WatchedTree::open(tmp.path()).await.unwrap());
        let root = tree.root().to_path_buf();
        let state = Arc::new(SyncState::new(Duration::from_secs(60)));
        let d = Dispatcher::new(tree, Arc::clone(&state));
        std::fs::write(root.join("a.txt"), b"a").unwrap();

        let outcome = d
            .apply(&Command::RenameFile {
                from: "a.txt".into(),
                to: "moved/b.txt".into(),
            })
            .await;
        assert!(outcome.is_applied());

        assert!(state.is_echo(&root.join("a.txt")));
        assert!(state.is_echo(&root.join("moved/b.txt")));
        assert!(state.is_echo(&root.join("moved")));
        assert!(!state.is_echo(&root.join("local.txt")));
    }

    #[tokio::test]
    async fn test_escaping_path_is_rejected() {
        let (_tmp, d, _root) = dispatcher().await;
        let outcome = d
            .apply(&Command::CreateDirectory {
                path: "../evil".into(),
            })
            .await;
        assert!(matches!(
            outcome,
            ApplyOutcome::Failed(DispatchError::Tree(TreeError::InvalidRelative(_)))
        ));
    }

    #[tokio::test]
    async fn test_payload_command_needs_receive_file() {
        let (_tmp, d, _root) = dispatcher().await;
        let outcome = d
            .apply(&Command::DownloadFile { path: "f".into() })
            .await;
        assert!(matches!(
            outcome,
            ApplyOutcome::Failed(DispatchError::PayloadExpected(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_file_writes_payload() {
        let (_tmp, d, root) = dispatcher().await;
        let data = b"UPLOAD_FILE \"sub/f.bin\" 6\nabcdefCREATE_DIRECTORY \"z\"\n".to_vec();
        let mut reader = CommandReader::new(&data[..]);

        let Frame::Transfer { command, size } = reader.read_frame().await.unwrap() else {
            panic!("expected transfer");
        };
        let outcome = d.receive_file(&command, size, &mut reader).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied));
        assert_eq!(std::fs::read(root.join("sub/f.bin")).unwrap(), b"abcdef");
        assert_eq!(d.state.phase(), SyncPhase::Idle);

        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Command(Command::CreateDirectory { path: "z".into() })
        );
    }

    #[tokio::test]
    async fn test_receive_file_reports_short_payload() {
        let (_tmp, d, root) = dispatcher().await;
        let mut data = b"UPLOAD_FILE \"x.txt\" 100\n".to_vec();
        data.extend_from_slice(&[b'x'; 40]);
        let mut reader = CommandReader::new(&data[..]);

        let Frame::Transfer { command, size } = reader.read_frame().await.unwrap() else {
            panic!("expected transfer");
        };
        let outcome = d.receive_file(&command, size, &mut reader).await.unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Incomplete {
                expected: 100,
                received: 40
            }
        ));
        assert_eq!(std::fs::read(root.join("x.txt")).unwrap().len(), 40);
    }

    #[tokio::test]
    async fn test_receive_file_drains_payload_on_bad_path() {
        let (_tmp, d, root) = dispatcher().await;
        let data = b"UPLOAD_FILE \"../out.txt\" 3\nabcDELETE_FILE \"k\"\n".to_vec();
        let mut reader = CommandReader::new(&data[..]);

        let Frame::Transfer { command, size } = reader.read_frame().await.unwrap() else {
            panic!("expected transfer");
        };
        let outcome = d.receive_file(&command, size, &mut reader).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Failed(DispatchError::Tree(_))));
        assert!(!root.parent().unwrap().join("out.txt").exists());

        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Command(Command::DeleteFile { path: "k".into() })
        );
    }
}
