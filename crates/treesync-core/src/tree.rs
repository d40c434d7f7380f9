//! The watched tree: a root directory plus conversions between absolute
//! paths and the `/`-separated relative paths used on the wire.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Path is outside the watched root: {0}")]
    OutsideRoot(PathBuf),

    #[error("Path is the watched root itself")]
    IsRoot,

    #[error("Path is not valid UTF-8: {0}")]
    NotUtf8(PathBuf),

    #[error("Invalid relative path: {0:?}")]
    InvalidRelative(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TreeError>;

/// A directory tree being mirrored.
#[derive(Debug, Clone)]
pub struct WatchedTree {
    root: PathBuf,
}

impl WatchedTree {
    /// Open a tree rooted at `root`, creating the directory if needed.
    ///
    /// The root is canonicalized so it matches paths reported by the
    /// platform's watcher (e.g. `/var` vs `/private/var` on macOS).
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).await.map_err(|source| TreeError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let root = fs::canonicalize(root).await.map_err(|source| TreeError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self { root })
    }

    /// Use `root` as-is without touching the filesystem.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert an absolute path under the root into its wire form.
    pub fn relative(&self, path: &Path) -> Result<String> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| TreeError::OutsideRoot(path.to_path_buf()))?;

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    let part = part
                        .to_str()
                        .ok_or_else(|| TreeError::NotUtf8(path.to_path_buf()))?;
                    parts.push(part);
                }
                Component::CurDir => {}
                _ => return Err(TreeError::OutsideRoot(path.to_path_buf())),
            }
        }

        if parts.is_empty() {
            return Err(TreeError::IsRoot);
        }
        Ok(parts.join("/"))
    }

    /// Resolve a wire path to an absolute path under the root.
    ///
    /// Rejects anything that could land outside the root: absolute paths,
    /// `.`/`..` segments, empty segments and embedded backslashes.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let invalid = || TreeError::InvalidRelative(relative.to_string());

        if relative.is_empty() || relative.starts_with('/') {
            return Err(invalid());
        }

        let mut path = self.root.clone();
        for segment in relative.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(invalid());
            }
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => path.push(segment),
                _ => return Err(invalid()),
            }
        }
        Ok(path)
    }

    /// Whether `path` is strictly below the root.
    pub fn contains(&self, path: &Path) -> bool {
        path != self.root && path.starts_with(&self.root)
    }

    /// Recursively list everything under the root: directories first, then files.
    pub async fn scan(&self) -> Result<Vec<(PathBuf, bool)>> {
        scan_dir(&self.root).await
    }
}

/// Recursively list everything below `dir` (not `dir` itself): directories
/// first, then files. Symlinks are classified by what they point to but
/// never descended into.
pub async fn scan_dir(dir: &Path) -> Result<Vec<(PathBuf, bool)>> {
    let mut directories = Vec::new();
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current).await.map_err(|source| TreeError::Io {
            path: current.clone(),
            source,
        })?;

        while let Some(entry) = entries.next_entry().await.map_err(|source| TreeError::Io {
            path: current.clone(),
            source,
        })? {
            let path = entry.path();
            let is_dir = match fs::metadata(&path).await {
                Ok(metadata) => metadata.is_dir(),
                // Entry vanished or is a dangling link; it will be reported by the watcher if it matters.
                Err(_) => continue,
            };
            let is_link = entry
                .file_type()
                .await
                .map(|file_type| file_type.is_symlink())
                .unwrap_or(false);
            if is_dir {
                if !is_link {
                    pending.push(path.clone());
                }
                directories.push(path);
            } else {
                files.push(path);
            }
        }
    }

    directories.sort();
    files.sort();
    Ok(directories
        .into_iter()
        .map(|p| (p, true))
        .chain(files.into_iter().map(|p| (p, false)))
        .collect())
}
