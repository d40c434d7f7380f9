//! Syncing state: suppresses outbound commands while inbound ones are applied.
//!
//! Applying a command from the peer touches the local tree, which makes the
//! watcher fire. Those notifications must not be sent back, or the two ends
//! would bounce the same change forever. The dispatcher holds an
//! [`ApplyGuard`] over the paths a command touches for the whole application
//! of that command; the engine asks [`SyncState::is_echo`] before emitting
//! anything for a path.
//!
//! Watcher notifications arrive asynchronously, so a touched path stays marked
//! for a short settle window after its guard is dropped. Only entries related
//! to a marked path (the path itself, anything below it, or a directory above
//! it) are treated as echoes; unrelated local edits are never held back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Whether the session is applying an inbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    ApplyingInbound,
}

#[derive(Debug, Default)]
struct Mark {
    /// Guards currently held over this path
    held: usize,
    quiet_until: Option<Instant>,
}

impl Mark {
    fn is_live(&self, now: Instant) -> bool {
        self.held > 0 || self.quiet_until.is_some_and(|deadline| now < deadline)
    }
}

#[derive(Debug)]
pub struct SyncState {
    active: AtomicUsize,
    marks: Mutex<HashMap<PathBuf, Mark>>,
    settle: Duration,
}

impl SyncState {
    pub fn new(settle: Duration) -> Self {
        Self {
            active: AtomicUsize::new(0),
            marks: Mutex::new(HashMap::new()),
            settle,
        }
    }

    /// Enter the applying-inbound phase for `paths` until the returned guard
    /// is dropped.
    ///
    /// Guards nest: a path stays held until the last guard over it is dropped.
    pub fn enter<I>(&self, paths: I) -> ApplyGuard<'_>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let paths: Vec<PathBuf> = paths.into_iter().collect();
        {
            let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            marks.retain(|_, mark| mark.is_live(now));
            for path in &paths {
                marks.entry(path.clone()).or_default().held += 1;
            }
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        ApplyGuard { state: self, paths }
    }

    pub fn phase(&self) -> SyncPhase {
        if self.active.load(Ordering::SeqCst) > 0 {
            SyncPhase::ApplyingInbound
        } else {
            SyncPhase::Idle
        }
    }

    /// Whether a change at `path` was most likely caused by applying an
    /// inbound command: a guard over a related path is held, or was released
    /// less than the settle window ago.
    pub fn is_echo(&self, path: &Path) -> bool {
        let marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        marks
            .iter()
            .any(|(marked, mark)| mark.is_live(now) && related(marked, path))
    }

    /// [`is_echo`](Self::is_echo) for any of `paths`.
    pub fn is_echo_any<'a>(&self, paths: impl IntoIterator<Item = &'a Path>) -> bool {
        paths.into_iter().any(|path| self.is_echo(path))
    }

    fn leave(&self, paths: &[PathBuf]) {
        {
            let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
            let quiet_until = Instant::now() + self.settle;
            for path in paths {
                if let Some(mark) = marks.get_mut(path) {
                    mark.held = mark.held.saturating_sub(1);
                    mark.quiet_until = Some(quiet_until);
                }
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new(crate::config::SyncConfig::default().settle)
    }
}

/// Same entry, an entry below it, or a directory above it.
fn related(marked: &Path, path: &Path) -> bool {
    path.starts_with(marked) || marked.starts_with(path)
}

/// Scoped proof that an inbound command is being applied.
///
/// Released on drop, so every exit path (early return, `?`, panic) restores
/// the state.
#[must_use = "the syncing state ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ApplyGuard<'a> {
    state: &'a SyncState,
    paths: Vec<PathBuf>,
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        self.state.leave(&self.paths);
    }
}
