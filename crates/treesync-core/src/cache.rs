//! Path type cache: absolute path → "is directory".
//!
//! By the time a delete or rename notification is handled the entry it refers
//! to is already gone from disk, so this cache is the only way to tell whether
//! a `DELETE_FILE` or a `DELETE_DIRECTORY` should be sent. One cache exists per
//! watched tree. The lock is held for single operations only, never across I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct PathTypeCache {
    entries: Mutex<HashMap<PathBuf, bool>>,
}

impl PathTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the classification of `path`, replacing any previous one.
    pub fn set(&self, path: impl Into<PathBuf>, is_dir: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(path.into(), is_dir);
    }

    /// Look up the classification of `path` without changing it.
    pub fn lookup(&self, path: &Path) -> Option<bool> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(path).copied()
    }

    /// Remove `path` and return its previous classification.
    ///
    /// Descendants are left alone; see [`Self::remove_subtree`].
    pub fn remove(&self, path: &Path) -> Option<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(path)
    }

    /// Remove every entry strictly below `path`. Returns how many were removed.
    pub fn remove_subtree(&self, path: &Path) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|key, _| !is_strict_descendant(key, path));
        before - entries.len()
    }

    /// Move the entry for `from` to `to`, relocating every descendant with it.
    ///
    /// Returns the classification that was moved, or `None` when `from` was
    /// never recorded (nothing is changed in that case).
    pub fn rename(&self, from: &Path, to: &Path) -> Option<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let is_dir = entries.remove(from)?;

        if is_dir {
            let moved: Vec<(PathBuf, bool)> = entries
                .iter()
                .filter(|(key, _)| is_strict_descendant(key, from))
                .map(|(key, value)| (key.clone(), *value))
                .collect();

            for (old_key, value) in moved {
                entries.remove(&old_key);
                if let Ok(suffix) = old_key.strip_prefix(from) {
                    entries.insert(to.join(suffix), value);
                }
            }
        }

        entries.insert(to.to_path_buf(), is_dir);
        Some(is_dir)
    }

    /// Insert many entries at once, e.g. from a startup scan.
    pub fn populate(&self, scanned: impl IntoIterator<Item = (PathBuf, bool)>) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut count = 0;
        for (path, is_dir) in scanned {
            entries.insert(path, is_dir);
            count += 1;
        }
        count
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Component-wise descendant check, equivalent to a prefix match on
/// `ancestor + separator` (so `docs2/x` is not below `docs`).
fn is_strict_descendant(candidate: &Path, ancestor: &Path) -> bool {
    candidate != ancestor && candidate.starts_with(ancestor)
}
