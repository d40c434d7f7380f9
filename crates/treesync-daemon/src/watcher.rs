//! Filesystem watch adapter built on `notify`.
//!
//! Raw notifications are captured on notify's thread, tagged with whether they
//! touch a path an inbound command is applying, and handed to a translation
//! task. The task turns them into [`FsEvent`]s for the session's bounded event
//! queue:
//! - rename halves are joined, and a half that never finds its partner is
//!   reported on its own after a short pairing window
//! - content changes are debounced per path, so a file written in many
//!   chunks is reported (and transferred) once
//!
//! Everything else is forwarded as soon as it is captured.

use anyhow::Result;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, trace};
use treesync_core::{FsEvent, FsEventKind, SyncState};

/// How many completed rename trackers to remember.
const COMPLETED_TRACKERS: usize = 64;

/// How long a rename "from" waits for its "to" before it counts as a deletion.
pub const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(100);

/// Quiet period a file must see before its content change is reported.
pub const MODIFY_DEBOUNCE: Duration = Duration::from_millis(200);

/// A raw notification and what was known when it was captured.
#[derive(Debug)]
struct Captured {
    event: notify::Event,
    during_apply: bool,
    at: Instant,
}

/// Watches a tree recursively until dropped.
pub struct FileWatcher {
    root: PathBuf,
    /// Watcher handle (must keep alive)
    _watcher: RecommendedWatcher,
    translator: JoinHandle<()>,
}

impl FileWatcher {
    /// Start watching `root` and send translated events to `event_tx`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(root: &Path, state: Arc<SyncState>, event_tx: mpsc::Sender<FsEvent>) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| match result {
                Ok(event) => {
                    let during_apply = state.is_echo_any(event.paths.iter().map(PathBuf::as_path));
                    let captured = Captured {
                        event,
                        during_apply,
                        at: Instant::now(),
                    };
                    if raw_tx.send(captured).is_err() {
                        trace!("Translator stopped, dropping notification");
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            })?;

        watcher.watch(root, RecursiveMode::Recursive)?;
        debug!("Watching {}", root.display());

        let translator = tokio::spawn(translate_loop(raw_rx, event_tx));

        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
            translator,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.translator.abort();
    }
}

/// Feed captured notifications through an [`EventTranslator`], waking up
/// whenever something it holds back is due.
async fn translate_loop(mut raw: mpsc::UnboundedReceiver<Captured>, event_tx: mpsc::Sender<FsEvent>) {
    let mut translator = EventTranslator::default();

    loop {
        let ready = match translator.next_deadline() {
            Some(deadline) => tokio::select! {
                captured = raw.recv() => match captured {
                    Some(c) => translator.translate(c.event, c.during_apply, c.at),
                    None => break,
                },
                _ = sleep_until(deadline) => translator.expire(Instant::now()),
            },
            None => match raw.recv().await {
                Some(c) => translator.translate(c.event, c.during_apply, c.at),
                None => break,
            },
        };

        for event in ready {
            if event_tx.send(event).await.is_err() {
                debug!("Event queue closed, stopping translator");
                return;
            }
        }
    }

    for event in translator.flush() {
        if event_tx.send(event).await.is_err() {
            return;
        }
    }
}

#[derive(Debug)]
struct PendingFrom {
    path: PathBuf,
    tracker: Option<usize>,
    during_apply: bool,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
struct PendingModify {
    during_apply: bool,
    deadline: Instant,
}

/// Turns raw `notify` events into created / modified / deleted / renamed.
///
/// Some backends report a rename as a "from" half and a "to" half linked by a
/// tracker cookie, and may report it again as a single "both" event. The
/// halves are joined here and the duplicate is dropped. A "from" that is not
/// followed by its "to" within [`RENAME_PAIR_WINDOW`] (the entry left the
/// tree) becomes a deletion; a "to" with no "from" (the entry arrived from
/// outside) becomes a creation.
///
/// Content changes are held per path until [`MODIFY_DEBOUNCE`] passes without
/// another one. The latest capture decides whether the change is an echo.
/// Held changes follow their file through renames and are dropped when it is
/// deleted.
#[derive(Debug, Default)]
pub struct EventTranslator {
    pending_from: Option<PendingFrom>,
    modified: HashMap<PathBuf, PendingModify>,
    completed: VecDeque<usize>,
}

impl EventTranslator {
    /// Translate one notification captured at `at`.
    ///
    /// Anything held back that fell due before `at` is returned first.
    pub fn translate(&mut self, event: notify::Event, during_apply: bool, at: Instant) -> Vec<FsEvent> {
        trace!("notify event: {:?}", event);
        let mut out = self.expire(at);
        let tracker = event.tracker();

        // Only a "to" (or "both") can complete a pending "from".
        let completes_rename = matches!(
            event.kind,
            EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both))
        );
        if !completes_rename {
            self.flush_pending_from(&mut out);
        }

        let mut paths = event.paths.into_iter();
        match event.kind {
            EventKind::Create(_) => {
                for path in paths {
                    self.emit(FsEventKind::Created(path), during_apply, &mut out);
                }
            }
            EventKind::Remove(_) => {
                for path in paths {
                    self.emit(FsEventKind::Deleted(path), during_apply, &mut out);
                }
            }
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                for path in paths {
                    self.modified.insert(
                        path,
                        PendingModify {
                            during_apply,
                            deadline: at + MODIFY_DEBOUNCE,
                        },
                    );
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if let Some(path) = paths.next() {
                    if !tracker.is_some_and(|t| self.is_completed(t)) {
                        self.pending_from = Some(PendingFrom {
                            path,
                            tracker,
                            during_apply,
                            deadline: at + RENAME_PAIR_WINDOW,
                        });
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                if let Some(to) = paths.next() {
                    self.on_rename_to(to, tracker, during_apply, &mut out);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let (Some(from), Some(to)) = (paths.next(), paths.next()) {
                    self.on_rename_both(from, to, tracker, during_apply, &mut out);
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                // No pairing information: judge each path by whether it still exists.
                for path in paths {
                    let kind = if path.exists() {
                        FsEventKind::Created(path)
                    } else {
                        FsEventKind::Deleted(path)
                    };
                    self.emit(kind, during_apply, &mut out);
                }
            }
            _ => {}
        }
        out
    }

    /// Release everything that is due at `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<FsEvent> {
        let mut out = Vec::new();

        if self.pending_from.as_ref().is_some_and(|p| p.deadline <= now) {
            self.flush_pending_from(&mut out);
        }

        let mut due: Vec<(PathBuf, PendingModify)> = self
            .modified
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(path, pending)| (path.clone(), *pending))
            .collect();
        due.sort_by_key(|(_, pending)| pending.deadline);
        for (path, pending) in due {
            self.modified.remove(&path);
            out.push(FsEvent::modified(path).with_during_apply(pending.during_apply));
        }
        out
    }

    /// Release everything held back, due or not.
    pub fn flush(&mut self) -> Vec<FsEvent> {
        let mut out = Vec::new();
        self.flush_pending_from(&mut out);
        let mut held: Vec<(PathBuf, PendingModify)> = self.modified.drain().collect();
        held.sort_by_key(|(_, pending)| pending.deadline);
        out.extend(
            held.into_iter()
                .map(|(path, pending)| FsEvent::modified(path).with_during_apply(pending.during_apply)),
        );
        out
    }

    /// When [`expire`](Self::expire) next has something to release.
    pub fn next_deadline(&self) -> Option<Instant> {
        let modified = self.modified.values().map(|pending| pending.deadline).min();
        let from = self.pending_from.as_ref().map(|pending| pending.deadline);
        match (from, modified) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Push `kind`, keeping held content changes in step with it.
    fn emit(&mut self, kind: FsEventKind, during_apply: bool, out: &mut Vec<FsEvent>) {
        match &kind {
            FsEventKind::Deleted(path) => self.modified.retain(|held, _| !held.starts_with(path)),
            FsEventKind::Renamed { from, to } => {
                let moved: Vec<PathBuf> = self
                    .modified
                    .keys()
                    .filter(|held| held.starts_with(from))
                    .cloned()
                    .collect();
                for old in moved {
                    if let (Some(pending), Ok(rest)) = (self.modified.remove(&old), old.strip_prefix(from)) {
                        let new = if rest.as_os_str().is_empty() {
                            to.clone()
                        } else {
                            to.join(rest)
                        };
                        self.modified.insert(new, pending);
                    }
                }
            }
            FsEventKind::Created(_) | FsEventKind::Modified(_) => {}
        }
        out.push(FsEvent::new(kind).with_during_apply(during_apply));
    }

    fn on_rename_to(
        &mut self,
        to: PathBuf,
        tracker: Option<usize>,
        during_apply: bool,
        out: &mut Vec<FsEvent>,
    ) {
        if let Some(t) = tracker {
            if self.is_completed(t) {
                self.take_pending_matching(tracker);
                return;
            }
        }

        match self.take_pending_matching(tracker) {
            Some(from) => {
                if let Some(t) = tracker {
                    self.mark_completed(t);
                }
                let during_apply = during_apply || from.during_apply;
                self.emit(FsEventKind::Renamed { from: from.path, to }, during_apply, out);
            }
            None => {
                self.flush_pending_from(out);
                self.emit(FsEventKind::Created(to), during_apply, out);
            }
        }
    }

    fn on_rename_both(
        &mut self,
        from: PathBuf,
        to: PathBuf,
        tracker: Option<usize>,
        during_apply: bool,
        out: &mut Vec<FsEvent>,
    ) {
        self.take_pending_matching(tracker);
        self.flush_pending_from(out);

        if let Some(t) = tracker {
            if self.is_completed(t) {
                return;
            }
            self.mark_completed(t);
        }
        self.emit(FsEventKind::Renamed { from, to }, during_apply, out);
    }

    fn take_pending_matching(&mut self, tracker: Option<usize>) -> Option<PendingFrom> {
        let matches = self
            .pending_from
            .as_ref()
            .is_some_and(|pending| pending.tracker == tracker);
        if matches { self.pending_from.take() } else { None }
    }

    fn flush_pending_from(&mut self, out: &mut Vec<FsEvent>) {
        if let Some(pending) = self.pending_from.take() {
            self.emit(FsEventKind::Deleted(pending.path), pending.during_apply, out);
        }
    }

    fn is_completed(&self, tracker: usize) -> bool {
        self.completed.contains(&tracker)
    }

    fn mark_completed(&mut self, tracker: usize) {
        if self.completed.len() == COMPLETED_TRACKERS {
            self.completed.pop_front();
        }
        self.completed.push_back(tracker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::io::Write;
    use tempfile::TempDir;

    fn rename(mode: RenameMode, paths: &[&str], tracker: Option<usize>) -> notify::Event {
        let mut event = notify::Event::new(EventKind::Modify(ModifyKind::Name(mode)));
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        match tracker {
            Some(t) => event.set_tracker(t),
            None => event,
        }
    }

    fn write(path: &str) -> notify::Event {
        notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(path.into())
    }

    fn kinds(events: Vec<FsEvent>) -> Vec<FsEventKind> {
        events.into_iter().map(|e| e.kind).collect()
    }

    /// Translate with no echo tag.
    fn feed(t: &mut EventTranslator, event: notify::Event, at: Instant) -> Vec<FsEventKind> {
        kinds(t.translate(event, false, at))
    }

    #[test]
    fn test_basic_kinds() {
        let mut t = EventTranslator::default();
        let now = Instant::now();
        let created = notify::Event::new(EventKind::Create(CreateKind::File)).add_path("/r/a".into());
        let chmod = notify::Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)))
            .add_path("/r/a".into());
        let removed = notify::Event::new(EventKind::Remove(RemoveKind::File)).add_path("/r/b".into());

        assert_eq!(feed(&mut t, created, now), vec![FsEventKind::Created("/r/a".into())]);
        assert!(feed(&mut t, write("/r/a"), now).is_empty());
        assert!(feed(&mut t, chmod, now).is_empty());
        assert_eq!(feed(&mut t, removed, now), vec![FsEventKind::Deleted("/r/b".into())]);
        assert_eq!(
            kinds(t.expire(now + MODIFY_DEBOUNCE)),
            vec![FsEventKind::Modified("/r/a".into())]
        );
    }

    #[test]
    fn test_write_burst_is_reported_once() {
        let mut t = EventTranslator::default();
        let start = Instant::now();
        for i in 0..50 {
            assert!(feed(&mut t, write("/r/big.bin"), start + Duration::from_millis(i)).is_empty());
        }

        let last = start + Duration::from_millis(49);
        assert_eq!(t.next_deadline(), Some(last + MODIFY_DEBOUNCE));
        assert!(t.expire(start + MODIFY_DEBOUNCE).is_empty());
        assert_eq!(
            kinds(t.expire(last + MODIFY_DEBOUNCE)),
            vec![FsEventKind::Modified("/r/big.bin".into())]
        );
        assert!(t.expire(last + MODIFY_DEBOUNCE * 10).is_empty());
        assert_eq!(t.next_deadline(), None);
    }

    #[test]
    fn test_latest_write_decides_echo() {
        let mut t = EventTranslator::default();
        let now = Instant::now();
        t.translate(write("/r/a"), true, now);
        t.translate(write("/r/a"), false, now);
        let out = t.expire(now + MODIFY_DEBOUNCE);
        assert_eq!(out.len(), 1);
        assert!(!out[0].during_apply);
    }

    #[test]
    fn test_held_write_follows_rename_and_dies_with_delete() {
        let mut t = EventTranslator::default();
        let now = Instant::now();
        feed(&mut t, write("/r/docs/a.txt"), now);
        feed(&mut t, write("/r/gone.txt"), now);

        assert_eq!(
            feed(&mut t, rename(RenameMode::Both, &["/r/docs", "/r/documents"], Some(4)), now),
            vec![FsEventKind::Renamed {
                from: "/r/docs".into(),
                to: "/r/documents".into()
            }]
        );
        let removed = notify::Event::new(EventKind::Remove(RemoveKind::File)).add_path("/r/gone.txt".into());
        assert_eq!(feed(&mut t, removed, now), vec![FsEventKind::Deleted("/r/gone.txt".into())]);

        assert_eq!(
            kinds(t.expire(now + MODIFY_DEBOUNCE)),
            vec![FsEventKind::Modified("/r/documents/a.txt".into())]
        );
    }

    #[test]
    fn test_from_to_pair_joined_and_both_dropped() {
        let mut t = EventTranslator::default();
        let now = Instant::now();
        assert!(feed(&mut t, rename(RenameMode::From, &["/r/docs"], Some(7)), now).is_empty());
        assert_eq!(
            feed(&mut t, rename(RenameMode::To, &["/r/documents"], Some(7)), now),
            vec![FsEventKind::Renamed {
                from: "/r/docs".into(),
                to: "/r/documents".into()
            }]
        );
        assert!(feed(&mut t, rename(RenameMode::Both, &["/r/docs", "/r/documents"], Some(7)), now).is_empty());
        assert_eq!(t.next_deadline(), None);
    }

    #[test]
    fn test_both_alone_is_a_rename() {
        let mut t = EventTranslator::default();
        assert_eq!(
            feed(&mut t, rename(RenameMode::Both, &["/r/a", "/r/b"], Some(3)), Instant::now()),
            vec![FsEventKind::Renamed {
                from: "/r/a".into(),
                to: "/r/b".into()
            }]
        );
    }

    #[test]
    fn test_unpaired_halves() {
        let mut t = EventTranslator::default();
        let now = Instant::now();
        assert_eq!(
            feed(&mut t, rename(RenameMode::To, &["/r/incoming"], Some(1)), now),
            vec![FsEventKind::Created("/r/incoming".into())]
        );

        assert!(feed(&mut t, rename(RenameMode::From, &["/r/leaving"], Some(2)), now).is_empty());
        let next = notify::Event::new(EventKind::Create(CreateKind::File)).add_path("/r/x".into());
        assert_eq!(
            feed(&mut t, next, now),
            vec![
                FsEventKind::Deleted("/r/leaving".into()),
                FsEventKind::Created("/r/x".into())
            ]
        );
    }

    #[test]
    fn test_unpaired_from_expires_as_delete() {
        let mut t = EventTranslator::default();
        let now = Instant::now();
        assert!(feed(&mut t, rename(RenameMode::From, &["/r/trashed"], Some(9)), now).is_empty());
        assert_eq!(t.next_deadline(), Some(now + RENAME_PAIR_WINDOW));

        assert!(t.expire(now).is_empty());
        assert_eq!(
            kinds(t.expire(now + RENAME_PAIR_WINDOW)),
            vec![FsEventKind::Deleted("/r/trashed".into())]
        );
        assert_eq!(t.next_deadline(), None);

        // A late "to" for the expired cookie is an arrival.
        assert_eq!(
            feed(&mut t, rename(RenameMode::To, &["/r/back"], Some(9)), now + RENAME_PAIR_WINDOW),
            vec![FsEventKind::Created("/r/back".into())]
        );
    }

    #[test]
    fn test_mismatched_tracker_is_not_paired() {
        let mut t = EventTranslator::default();
        let now = Instant::now();
        feed(&mut t, rename(RenameMode::From, &["/r/a"], Some(1)), now);
        assert_eq!(
            feed(&mut t, rename(RenameMode::To, &["/r/b"], Some(2)), now),
            vec![
                FsEventKind::Deleted("/r/a".into()),
                FsEventKind::Created("/r/b".into())
            ]
        );
    }

    #[test]
    fn test_untracked_rename_uses_existence() {
        let tmp = TempDir::new().unwrap();
        let present = tmp.path().join("present");
        std::fs::write(&present, b"x").unwrap();
        let absent = tmp.path().join("absent");

        let mut t = EventTranslator::default();
        let event = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
            .add_path(absent.clone())
            .add_path(present.clone());
        assert_eq!(
            feed(&mut t, event, Instant::now()),
            vec![FsEventKind::Deleted(absent), FsEventKind::Created(present)]
        );
    }

    /// Collect events until `quiet` passes without one.
    async fn drain(rx: &mut mpsc::Receiver<FsEvent>, quiet: Duration) -> Vec<FsEventKind> {
        let mut seen = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(quiet, rx.recv()).await {
            seen.push(event.kind);
        }
        seen
    }

    fn watch(root: &Path) -> (FileWatcher, mpsc::Receiver<FsEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        let watcher = FileWatcher::spawn(root, Arc::new(SyncState::new(Duration::ZERO)), tx).unwrap();
        (watcher, rx)
    }

    #[tokio::test]
    async fn test_watcher_reports_created_file() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let (_watcher, mut rx) = watch(&root);

        tokio::fs::write(root.join("hello.txt"), b"hi").await.unwrap();

        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                if event.kind == FsEventKind::Created(root.join("hello.txt")) {
                    return event;
                }
            }
            panic!("watcher channel closed");
        })
        .await
        .expect("Should see the created file");
        assert!(!found.during_apply);
    }

    #[tokio::test]
    async fn test_watcher_reports_file_moved_out_of_tree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        let root = root.canonicalize().unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();

        let (_watcher, mut rx) = watch(&root);
        std::fs::rename(root.join("a.txt"), outside.join("a.txt")).unwrap();

        let deleted = FsEventKind::Deleted(root.join("a.txt"));
        tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(event) = rx.recv().await {
                if event.kind == deleted {
                    return;
                }
            }
            panic!("watcher channel closed");
        })
        .await
        .expect("Moving a file out of the tree should report it deleted");
    }

    #[tokio::test]
    async fn test_watcher_coalesces_chunked_write() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let (_watcher, mut rx) = watch(&root);
        let target = root.join("big.bin");

        let path = target.clone();
        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::File::create(&path).unwrap();
            let chunk = vec![7u8; 16 * 1024];
            for _ in 0..200 {
                file.write_all(&chunk).unwrap();
            }
            file.sync_all().unwrap();
        })
        .await
        .unwrap();

        let seen = drain(&mut rx, MODIFY_DEBOUNCE * 5).await;
        let modified = seen
            .iter()
            .filter(|kind| **kind == FsEventKind::Modified(target.clone()))
            .count();
        assert_eq!(modified, 1, "events: {:?}", seen);
    }
}
