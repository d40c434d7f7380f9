//! Filesystem events consumed by the sync engine.
//!
//! Produced by the platform watch adapter (see the daemon's `watcher` module)
//! or injected directly in tests.

use std::path::{Path, PathBuf};

/// What happened to an entry in the watched tree. Paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEventKind {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl FsEventKind {
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            FsEventKind::Created(path) | FsEventKind::Modified(path) | FsEventKind::Deleted(path) => {
                vec![path]
            }
            FsEventKind::Renamed { from, to } => vec![from, to],
        }
    }
}

/// A filesystem event plus the syncing state observed when it was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    /// Set by the watcher when the notification arrived while one of its
    /// paths was marked by an inbound command
    pub during_apply: bool,
}

impl FsEvent {
    pub fn new(kind: FsEventKind) -> Self {
        Self {
            kind,
            during_apply: false,
        }
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(FsEventKind::Created(path.into()))
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(FsEventKind::Modified(path.into()))
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(FsEventKind::Deleted(path.into()))
    }

    pub fn renamed(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self::new(FsEventKind::Renamed {
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn with_during_apply(mut self, during_apply: bool) -> Self {
        self.during_apply = during_apply;
        self
    }
}
