//! Filesystem watching.
//!
//! - `DirectoryWatcher` - notify-backed event loop feeding the indexer
//! - `Debouncer` - per-path quiet-period state machine
//! - `Supervisor` - restarts the event loop with backoff
//! - `Reconciler` - periodic full scans and store recovery

pub mod debounce;
pub mod reconcile;
pub mod supervisor;

pub use debounce::Debouncer;
pub use reconcile::Reconciler;
pub use supervisor::{Backoff, Supervisor};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::WatcherFault;
use crate::indexer::{ChangeBatch, ChangeKind, Indexer, PathChange};
use crate::scanner::MediaRoots;

/// Longest the loop sleeps without checking the shutdown flag.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// How often the loop checks whether roots appeared or vanished.
const ROOT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Events drained per wakeup before the loop gets a chance to flush.
const MAX_DRAIN: usize = 1024;

pub struct DirectoryWatcher {
    roots: MediaRoots,
    indexer: Arc<Indexer>,
    debounce: Duration,
    event_tx: Sender<PathChange>,
    event_rx: Receiver<PathChange>,
    overflow: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl DirectoryWatcher {
    /// The event channel outlives restarts of the event loop, so producers
    /// holding [`sender`](Self::sender) stay connected.
    pub fn new(
        roots: MediaRoots,
        indexer: Arc<Indexer>,
        debounce: Duration,
        channel_capacity: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let (event_tx, event_rx) = flume::bounded(channel_capacity.max(1));
        Self {
            roots,
            indexer,
            debounce,
            event_tx,
            event_rx,
            overflow: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    pub fn from_config(
        config: &Config,
        roots: MediaRoots,
        indexer: Arc<Indexer>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self::new(
            roots,
            indexer,
            config.debounce(),
            config.event_channel_capacity,
            shutdown,
        )
    }

    /// Producer side of the raw event channel.
    pub fn sender(&self) -> Sender<PathChange> {
        self.event_tx.clone()
    }

    /// Set when events were dropped; cleared by whoever runs the next full scan.
    pub fn overflow_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.overflow)
    }

    /// Watches the roots until shutdown or a fault.
    pub fn run(&self) -> Result<(), WatcherFault> {
        let watched = self.existing_roots();
        if watched.is_empty() {
            let names: Vec<String> = self.roots.iter().map(|(_, p)| p.display().to_string()).collect();
            return Err(WatcherFault::MissingRoot(names.join(", ")));
        }

        let (fault_tx, fault_rx) = flume::unbounded();
        let event_tx = self.event_tx.clone();
        let overflow = Arc::clone(&self.overflow);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.need_rescan() && !overflow.swap(true, Ordering::AcqRel) {
                        warn!("Watcher reported missed events, full scan scheduled");
                    }
                    for change in convert_event(&event) {
                        match event_tx.try_send(change) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                if !overflow.swap(true, Ordering::AcqRel) {
                                    warn!("Event channel full, full scan scheduled");
                                }
                            }
                            Err(TrySendError::Disconnected(_)) => return,
                        }
                    }
                }
                Err(e) => {
                    let _ = fault_tx.send(e);
                }
            },
            notify::Config::default(),
        )?;

        for root in &watched {
            watcher.watch(root, RecursiveMode::Recursive)?;
            info!(?root, "Watching media root");
        }

        let result = self.event_loop(&fault_rx, &watched);
        drop(watcher);
        result
    }

    fn existing_roots(&self) -> Vec<PathBuf> {
        self.roots
            .iter()
            .filter(|(_, root)| root.is_dir())
            .map(|(_, root)| root.to_path_buf())
            .collect()
    }

    /// Debounces channel events and applies quiet batches.
    ///
    /// Pending events are applied before returning, whatever the reason.
    fn event_loop(
        &self,
        faults: &Receiver<notify::Error>,
        watched: &[PathBuf],
    ) -> Result<(), WatcherFault> {
        let mut debouncer = Debouncer::new(self.debounce);
        let mut last_root_check = Instant::now();

        let outcome = loop {
            if self.shutdown.load(Ordering::Acquire) {
                break Ok(());
            }
            if let Ok(e) = faults.try_recv() {
                break Err(WatcherFault::Backend(e.to_string()));
            }

            let now = Instant::now();
            let wait = debouncer
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(IDLE_POLL)
                .min(IDLE_POLL);

            match self.event_rx.recv_timeout(wait) {
                Ok(change) => {
                    trace!(path = ?change.path, kind = ?change.kind, "Raw event");
                    debouncer.push(change, Instant::now());
                    for change in self.event_rx.try_iter().take(MAX_DRAIN) {
                        debouncer.push(change, Instant::now());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break Err(WatcherFault::Disconnected),
            }

            let batch = debouncer.flush_ready(Instant::now());
            self.apply(&batch);

            if last_root_check.elapsed() >= ROOT_CHECK_INTERVAL {
                last_root_check = Instant::now();
                if self.existing_roots() != watched {
                    break Err(WatcherFault::RootsChanged);
                }
            }
        };

        self.apply(&debouncer.flush_all());
        outcome
    }

    fn apply(&self, batch: &ChangeBatch) {
        if batch.is_empty() {
            return;
        }
        match self.indexer.apply(batch) {
            Ok(report) => debug!(?report, "Applied watcher batch"),
            Err(e) => {
                warn!(error = %e, changes = batch.len(), "Failed to apply watcher batch, full scan scheduled");
                self.overflow.store(true, Ordering::Release);
            }
        }
    }
}

/// Maps a notify event to path changes.
///
/// A rename reported with both paths becomes a removal of the old path and
/// a creation of the new one; the indexer pairs them up by checksum.
pub fn convert_event(event: &Event) -> Vec<PathChange> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Remove(_) => ChangeKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            return vec![
                PathChange::new(&event.paths[0], ChangeKind::Removed),
                PathChange::new(&event.paths[1], ChangeKind::Created),
            ];
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Direction unknown: decide by what is on disk now
            return event
                .paths
                .iter()
                .map(|path| {
                    let kind = if path.exists() {
                        ChangeKind::Created
                    } else {
                        ChangeKind::Removed
                    };
                    PathChange::new(path, kind)
                })
                .collect();
        }
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };
    event
        .paths
        .iter()
        .map(|path| PathChange::new(path, kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetadataCache;
    use crate::scanner::{FileScanner, NoProbe};
    use crate::store::tests::Flaky;
    use crate::store::{PersistenceLayer, RetryPolicy, SqliteStorage, Storage};
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::fs;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        roots: MediaRoots,
        store: Arc<PersistenceLayer>,
        watcher: Arc<DirectoryWatcher>,
        shutdown: Arc<AtomicBool>,
    }

    fn fixture(create_roots: bool) -> Fixture {
        fixture_with(create_roots, Arc::new(SqliteStorage::open_in_memory().unwrap()))
    }

    fn fixture_with(create_roots: bool, primary: Arc<dyn Storage>) -> Fixture {
        let dir = tempdir().unwrap();
        let roots = MediaRoots::new(dir.path().join("videos"), dir.path().join("images"));
        if create_roots {
            fs::create_dir_all(&roots.video).unwrap();
            fs::create_dir_all(&roots.image).unwrap();
        }
        let store = Arc::new(PersistenceLayer::new(
            primary,
            None,
            RetryPolicy::default(),
            false,
        ));
        let cache = Arc::new(MetadataCache::new(
            Arc::clone(&store),
            roots.clone(),
            Duration::from_secs(300),
            Duration::from_secs(60),
        ));
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&store),
            cache,
            FileScanner::new(roots.clone()),
            Box::new(NoProbe),
        ));
        let shutdown = Arc::new(AtomicBool::new(false));
        let watcher = Arc::new(DirectoryWatcher::new(
            roots.clone(),
            indexer,
            Duration::from_millis(50),
            16,
            Arc::clone(&shutdown),
        ));
        Fixture {
            _dir: dir,
            roots,
            store,
            watcher,
            shutdown,
        }
    }

    #[test]
    fn test_convert_create_remove_modify() {
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path("/v/a.mp4".into());
        assert_eq!(
            convert_event(&create),
            vec![PathChange::new("/v/a.mp4", ChangeKind::Created)]
        );

        let remove = Event::new(EventKind::Remove(RemoveKind::File)).add_path("/v/a.mp4".into());
        assert_eq!(convert_event(&remove)[0].kind, ChangeKind::Removed);

        let modify = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path("/v/a.mp4".into());
        assert_eq!(convert_event(&modify)[0].kind, ChangeKind::Modified);

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path("/v/a.mp4".into());
        assert!(convert_event(&access).is_empty());
    }

    #[test]
    fn test_convert_rename_both() {
        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/v/old.mp4".into())
            .add_path("/v/new.mp4".into());
        assert_eq!(
            convert_event(&rename),
            vec![
                PathChange::new("/v/old.mp4", ChangeKind::Removed),
                PathChange::new("/v/new.mp4", ChangeKind::Created),
            ]
        );
    }

    #[test]
    fn test_run_without_roots_faults() {
        let fx = fixture(false);
        assert!(matches!(fx.watcher.run(), Err(WatcherFault::MissingRoot(_))));
    }

    #[test]
    fn test_event_loop_applies_debounced_burst() {
        // Every apply cycle loads the known media rows exactly once
        let primary = Arc::new(Flaky::new(false));
        let fx = fixture_with(true, primary.clone());
        let path = fx.roots.video.join("a.mp4");
        fs::write(&path, b"video bytes").unwrap();

        let (_fault_tx, fault_rx) = flume::unbounded::<notify::Error>();
        let watched = fx.watcher.existing_roots();
        let watcher = Arc::clone(&fx.watcher);
        let handle = thread::spawn(move || watcher.event_loop(&fault_rx, &watched));

        let sender = fx.watcher.sender();
        sender.send(PathChange::new(&path, ChangeKind::Created)).unwrap();
        for _ in 0..4 {
            sender.send(PathChange::new(&path, ChangeKind::Modified)).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while primary.media_loads.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "batch never applied");
            thread::sleep(Duration::from_millis(10));
        }
        // Several windows later, still a single cycle
        thread::sleep(Duration::from_millis(300));
        fx.shutdown.store(true, Ordering::Release);
        assert!(handle.join().unwrap().is_ok());

        assert_eq!(primary.media_loads.load(Ordering::SeqCst), 1);
        assert_eq!(fx.store.media().unwrap()[0].key.as_str(), "a.mp4");
    }

    #[test]
    fn test_shutdown_leaves_queued_events_for_next_run() {
        let fx = fixture(true);
        let path = fx.roots.video.join("b.mp4");
        fs::write(&path, b"more bytes").unwrap();

        fx.watcher
            .sender()
            .send(PathChange::new(&path, ChangeKind::Created))
            .unwrap();
        fx.shutdown.store(true, Ordering::Release);

        let (_fault_tx, fault_rx) = flume::unbounded::<notify::Error>();
        let watched = fx.watcher.existing_roots();
        // Shutdown is seen before the event is received; the channel is
        // not drained, so nothing is applied.
        assert!(fx.watcher.event_loop(&fault_rx, &watched).is_ok());
        assert!(fx.store.media().unwrap().is_empty());
        assert_eq!(fx.watcher.event_rx.len(), 1);
    }

    #[test]
    fn test_backend_error_is_fault() {
        let fx = fixture(true);
        let (fault_tx, fault_rx) = flume::unbounded();
        fault_tx.send(notify::Error::generic("inotify gone")).unwrap();
        let watched = fx.watcher.existing_roots();
        assert!(matches!(
            fx.watcher.event_loop(&fault_rx, &watched),
            Err(WatcherFault::Backend(_))
        ));
    }
}
