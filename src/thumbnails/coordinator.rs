//! Thumbnail worker pool.
//!
//! - Bounded pool of OS threads pulling jobs from a bounded flume queue
//! - At most one pending/running job per media key
//! - `request` never blocks: a full queue drops the request, the next
//!   reconciliation asks again
//! - Output goes to a temp file and is renamed into place only if the
//!   source still exists

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::Config;
use crate::error::ThumbnailFault;
use crate::models::{MediaKey, MediaType};
use crate::scanner::{DurationProbe, MediaRoots};

use super::generator::{frame_offset, FrameExtractor};
use super::ledger::ThumbnailLedger;

/// Retries after the first failed extraction.
pub const MAX_RETRIES: u32 = 2;

/// Maximum number of queued jobs.
const MAX_QUEUE_SIZE: usize = 4096;

/// How often idle workers check the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThumbnailStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl ThumbnailStatus {
    pub fn is_active(self) -> bool {
        matches!(self, ThumbnailStatus::Pending | ThumbnailStatus::Running)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub dir: PathBuf,
    pub workers: usize,
    pub placeholder: Option<PathBuf>,
    pub queue_capacity: usize,
    /// Base delay between retries; attempt n waits `retry_backoff * n`.
    pub retry_backoff: Duration,
}

impl CoordinatorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dir: config.thumbnail_dir(),
            workers: config.worker_count(),
            placeholder: config.placeholder_thumbnail.clone(),
            queue_capacity: MAX_QUEUE_SIZE,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

struct Job {
    key: MediaKey,
    generation: u64,
}

/// Per-key bookkeeping. A slot whose job was discarded mid-run stays in the
/// map, still `Running`, until its worker finishes, so no second job for
/// the key can start alongside it.
#[derive(Debug, Clone, Copy)]
struct Slot {
    status: ThumbnailStatus,
    generation: u64,
    cancelled: bool,
    /// Requested again after being cancelled; re-queued when the run ends.
    rerun: bool,
}

impl Slot {
    fn settled(status: ThumbnailStatus) -> Self {
        Self {
            status,
            generation: 0,
            cancelled: false,
            rerun: false,
        }
    }

    /// The status callers see.
    fn visible(&self) -> Option<ThumbnailStatus> {
        match (self.cancelled, self.rerun) {
            (false, _) => Some(self.status),
            (true, true) => Some(ThumbnailStatus::Pending),
            (true, false) => None,
        }
    }
}

/// State shared between the coordinator handle and its workers.
struct Shared {
    roots: MediaRoots,
    dir: PathBuf,
    slots: RwLock<HashMap<MediaKey, Slot>>,
    extractor: Arc<dyn FrameExtractor>,
    probe: Arc<dyn DurationProbe>,
    ledger: Option<ThumbnailLedger>,
    retry_backoff: Duration,
    shutdown: AtomicBool,
    next_generation: AtomicU64,
    /// Used by workers to re-queue cancelled keys that were requested again.
    requeue_tx: Sender<Job>,
}

impl Shared {
    /// Sends a fresh job for `key` and marks it pending. Caller holds the
    /// slot lock.
    fn enqueue(
        &self,
        tx: &Sender<Job>,
        slots: &mut HashMap<MediaKey, Slot>,
        key: &MediaKey,
    ) -> bool {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        match tx.try_send(Job {
            key: key.clone(),
            generation,
        }) {
            Ok(()) => {
                slots.insert(
                    key.clone(),
                    Slot {
                        status: ThumbnailStatus::Pending,
                        generation,
                        cancelled: false,
                        rerun: false,
                    },
                );
                trace!(%key, generation, "Queued thumbnail job");
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(%key, "Thumbnail queue full, dropping request");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("Thumbnail queue disconnected");
                false
            }
        }
    }
}

pub struct ThumbnailCoordinator {
    shared: Arc<Shared>,
    request_tx: Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    placeholder: Option<PathBuf>,
}

impl ThumbnailCoordinator {
    /// Starts the worker pool.
    ///
    /// Terminal statuses recorded in `ledger` are loaded first; `Done`
    /// entries whose image is gone are dropped so they get regenerated.
    pub fn new(
        config: CoordinatorConfig,
        roots: MediaRoots,
        extractor: Arc<dyn FrameExtractor>,
        probe: Arc<dyn DurationProbe>,
        ledger: Option<ThumbnailLedger>,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.dir)?;

        let mut slots = HashMap::new();
        if let Some(ledger) = &ledger {
            match ledger.load() {
                Ok(recorded) => {
                    for (key, s) in recorded {
                        if s == ThumbnailStatus::Done && !thumbnail_file(&config.dir, &key).exists() {
                            continue;
                        }
                        slots.insert(key, Slot::settled(s));
                    }
                }
                Err(e) => warn!(error = %e, "Failed to load thumbnail ledger"),
            }
        }

        let (request_tx, request_rx) = flume::bounded(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            roots,
            dir: config.dir,
            slots: RwLock::new(slots),
            extractor,
            probe,
            ledger,
            retry_backoff: config.retry_backoff,
            shutdown: AtomicBool::new(false),
            next_generation: AtomicU64::new(0),
            requeue_tx: request_tx.clone(),
        });

        let num_workers = config.workers.max(1);
        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let rx = request_rx.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("thumb-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, rx, shared))?;
            handles.push(handle);
        }

        debug!(num_workers, "Started thumbnail worker pool");

        Ok(Self {
            shared,
            request_tx,
            workers: Mutex::new(handles),
            placeholder: config.placeholder,
        })
    }

    /// Queues a job for `key` unless one is already pending or running.
    ///
    /// Returns whether a job was queued. Never blocks.
    pub fn request(&self, key: &MediaKey) -> bool {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return false;
        }

        let mut slots = self.shared.slots.write();
        if let Some(slot) = slots.get_mut(key) {
            if slot.cancelled {
                // The discarded run still owns the key; its worker re-queues
                if slot.rerun {
                    return false;
                }
                slot.rerun = true;
                trace!(%key, "Thumbnail re-requested while cancelled run finishes");
                return true;
            }
            if slot.status.is_active() {
                trace!(%key, "Thumbnail already queued");
                return false;
            }
        }

        self.shared.enqueue(&self.request_tx, &mut slots, key)
    }

    /// Requests every key that has no image yet and has not failed before.
    ///
    /// Returns the number of jobs queued.
    pub fn request_missing(&self, keys: impl IntoIterator<Item = MediaKey>) -> usize {
        let mut queued = 0;
        for key in keys {
            let known = self.status(&key);
            if matches!(known, Some(ThumbnailStatus::Failed)) || known.is_some_and(|s| s.is_active()) {
                continue;
            }
            if self.thumbnail_path(&key).exists() {
                continue;
            }
            if self.request(&key) {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(queued, "Requested missing thumbnails");
        }
        queued
    }

    pub fn status(&self, key: &MediaKey) -> Option<ThumbnailStatus> {
        self.shared.slots.read().get(key).and_then(Slot::visible)
    }

    /// Final location of the image for `key`.
    pub fn thumbnail_path(&self, key: &MediaKey) -> PathBuf {
        thumbnail_file(&self.shared.dir, key)
    }

    /// The image to serve for `key`: the thumbnail when ready, else the
    /// configured placeholder.
    pub fn serve_path(&self, key: &MediaKey) -> Option<PathBuf> {
        let path = self.thumbnail_path(key);
        if path.exists() {
            return Some(path);
        }
        self.placeholder.clone()
    }

    /// Forgets `key`: status, ledger entry and image.
    ///
    /// A running job for `key` will not commit its output, and keeps the
    /// key busy until it ends.
    pub fn discard(&self, key: &MediaKey) {
        {
            let mut slots = self.shared.slots.write();
            let running = slots
                .get(key)
                .is_some_and(|slot| slot.status == ThumbnailStatus::Running);
            if running {
                if let Some(slot) = slots.get_mut(key) {
                    slot.cancelled = true;
                    slot.rerun = false;
                }
            } else {
                slots.remove(key);
            }
        }
        if let Some(ledger) = &self.shared.ledger {
            if let Err(e) = ledger.forget(key) {
                warn!(%key, error = %e, "Failed to forget thumbnail in ledger");
            }
        }
        let path = self.thumbnail_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(%key, "Discarded thumbnail"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(?path, error = %e, "Failed to remove thumbnail"),
        }
    }

    /// Deletes images whose key is not in `live`. Returns how many went.
    pub fn sweep_orphans(&self, live: &HashSet<MediaKey>) -> usize {
        let expected: HashSet<String> = live.iter().map(thumbnail_name).collect();

        let entries = match std::fs::read_dir(&self.shared.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = ?self.shared.dir, error = %e, "Failed to list thumbnail dir");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if expected.contains(&name) {
                continue;
            }
            // Temp files of running jobs start with a dot
            if name.starts_with('.') {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = ?entry.path(), error = %e, "Failed to remove orphan thumbnail"),
            }
        }

        {
            let mut slots = self.shared.slots.write();
            slots.retain(|key, slot| slot.status.is_active() || live.contains(key));
        }

        if removed > 0 {
            info!(removed, "Swept orphan thumbnails");
        }
        removed
    }

    /// Stops the workers. Queued jobs that have not started are dropped.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("Thumbnail workers stopped");
    }
}

impl Drop for ThumbnailCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `{xxh3(key):016x}.jpg`
fn thumbnail_name(key: &MediaKey) -> String {
    format!("{:016x}.jpg", xxh3_64(key.as_str().as_bytes()))
}

fn thumbnail_file(dir: &Path, key: &MediaKey) -> PathBuf {
    dir.join(thumbnail_name(key))
}

fn worker_loop(worker_id: usize, rx: Receiver<Job>, shared: Arc<Shared>) {
    trace!(worker_id, "Thumbnail worker started");

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }

        let job = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(job) => job,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        };

        {
            let mut slots = shared.slots.write();
            match slots.get_mut(&job.key) {
                Some(slot)
                    if slot.generation == job.generation
                        && slot.status == ThumbnailStatus::Pending =>
                {
                    slot.status = ThumbnailStatus::Running
                }
                // Discarded while queued, or superseded
                _ => continue,
            }
        }

        let outcome = run_job(worker_id, &shared, &job);
        finish_job(&shared, &job, outcome);
    }

    trace!(worker_id, "Thumbnail worker stopped");
}

fn run_job(worker_id: usize, shared: &Shared, job: &Job) -> Result<(), ThumbnailFault> {
    let key = &job.key;
    let source = shared.roots.resolve(MediaType::Video, key);
    if !source.exists() {
        return Err(ThumbnailFault::SourceMissing);
    }

    let duration_ms = shared
        .probe
        .duration(&source)
        .map(|d| d.as_millis() as u64);
    let dest = thumbnail_file(&shared.dir, key);
    let tmp = shared.dir.join(format!(".{}.{}.tmp", thumbnail_name(key), worker_id));

    let mut last_err = ThumbnailFault::Extractor("not attempted".to_string());
    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            thread::sleep(shared.retry_backoff * attempt);
            if shared.shutdown.load(Ordering::Relaxed) {
                break;
            }
        }

        let offset = frame_offset(duration_ms, attempt);
        match shared.extractor.extract(&source, offset, &tmp) {
            Ok(()) => return commit(shared, job, &source, &tmp, &dest),
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                if !source.exists() {
                    return Err(ThumbnailFault::SourceMissing);
                }
                debug!(%key, attempt, error = %e, "Thumbnail extraction attempt failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Moves `tmp` into place unless the source vanished or the job was
/// discarded while it ran.
fn commit(
    shared: &Shared,
    job: &Job,
    source: &Path,
    tmp: &Path,
    dest: &Path,
) -> Result<(), ThumbnailFault> {
    // Holding the slot lock orders the rename against `discard`
    let slots = shared.slots.read();
    let still_ours = slots.get(&job.key).is_some_and(|slot| {
        slot.generation == job.generation
            && slot.status == ThumbnailStatus::Running
            && !slot.cancelled
    });
    if !still_ours || !source.exists() {
        drop(slots);
        let _ = std::fs::remove_file(tmp);
        return Err(ThumbnailFault::SourceMissing);
    }
    std::fs::rename(tmp, dest)?;
    Ok(())
}

fn finish_job(shared: &Shared, job: &Job, outcome: Result<(), ThumbnailFault>) {
    let key = &job.key;
    let mut slots = shared.slots.write();
    let slot = match slots.get(key) {
        Some(slot) if slot.generation == job.generation => *slot,
        _ => return,
    };

    if slot.cancelled {
        if slot.rerun {
            debug!(%key, "Re-queueing thumbnail discarded while running");
            if !shared.enqueue(&shared.requeue_tx, &mut slots, key) {
                slots.remove(key);
            }
        } else {
            slots.remove(key);
        }
        return;
    }

    let (next, error) = match outcome {
        Ok(()) => {
            debug!(%key, "Thumbnail ready");
            (ThumbnailStatus::Done, None)
        }
        Err(ThumbnailFault::SourceMissing) => {
            debug!(%key, "Source vanished, thumbnail discarded");
            slots.remove(key);
            return;
        }
        Err(e) => {
            warn!(%key, error = %e, "Thumbnail generation failed");
            (ThumbnailStatus::Failed, Some(e.to_string()))
        }
    };
    slots.insert(key.clone(), Slot::settled(next));
    drop(slots);

    if let Some(ledger) = &shared.ledger {
        if let Err(e) = ledger.record(key, next, error.as_deref()) {
            warn!(%key, error = %e, "Failed to record thumbnail status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::NoProbe;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Instant;
    use tempfile::{tempdir, TempDir};

    /// Counts calls and overlapping runs; fails the first `failures` calls.
    struct FakeExtractor {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        failures: usize,
        delay: Duration,
        offsets: Mutex<Vec<Duration>>,
    }

    impl FakeExtractor {
        fn new(failures: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                failures,
                delay,
                offsets: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    impl FrameExtractor for FakeExtractor {
        fn extract(&self, _source: &Path, offset: Duration, dest: &Path) -> Result<(), ThumbnailFault> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            self.offsets.lock().push(offset);
            thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ThumbnailFault::Extractor("boom".to_string()));
            }
            std::fs::write(dest, b"jpeg")?;
            Ok(())
        }
    }

    struct Fixture {
        _media: TempDir,
        _data: TempDir,
        video_root: PathBuf,
        thumb_dir: PathBuf,
        coordinator: ThumbnailCoordinator,
    }

    fn fixture(extractor: Arc<FakeExtractor>, ledger: Option<ThumbnailLedger>) -> Fixture {
        let media = tempdir().unwrap();
        let data = tempdir().unwrap();
        let video_root = media.path().join("videos");
        std::fs::create_dir_all(&video_root).unwrap();
        std::fs::write(video_root.join("a.mp4"), b"video").unwrap();

        let thumb_dir = data.path().join("thumbnails");
        let config = CoordinatorConfig {
            dir: thumb_dir.clone(),
            workers: 2,
            placeholder: Some(PathBuf::from("/static/placeholder.jpg")),
            queue_capacity: 64,
            retry_backoff: Duration::from_millis(5),
        };
        let roots = MediaRoots::new(&video_root, media.path().join("images"));
        let coordinator =
            ThumbnailCoordinator::new(config, roots, extractor, Arc::new(NoProbe), ledger).unwrap();

        Fixture {
            _media: media,
            _data: data,
            video_root,
            thumb_dir,
            coordinator,
        }
    }

    fn wait_for(coordinator: &ThumbnailCoordinator, key: &MediaKey, want: Option<ThumbnailStatus>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while coordinator.status(key) != want {
            assert!(Instant::now() < deadline, "timed out waiting for {:?}", want);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_concurrent_requests_extract_once() {
        let extractor = FakeExtractor::new(0, Duration::from_millis(200));
        let fx = fixture(Arc::clone(&extractor), None);
        let key = MediaKey::from("a.mp4");

        let barrier = Barrier::new(10);
        let queued = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..10 {
                s.spawn(|| {
                    barrier.wait();
                    if fx.coordinator.request(&key) {
                        queued.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        wait_for(&fx.coordinator, &key, Some(ThumbnailStatus::Done));
        assert_eq!(queued.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.calls(), 1);
        assert!(fx.coordinator.thumbnail_path(&key).exists());
        assert_eq!(
            fx.coordinator.serve_path(&key),
            Some(fx.coordinator.thumbnail_path(&key))
        );
    }

    #[test]
    fn test_retries_then_succeeds_at_first_frame() {
        let extractor = FakeExtractor::new(2, Duration::ZERO);
        let fx = fixture(Arc::clone(&extractor), None);
        let key = MediaKey::from("a.mp4");

        assert!(fx.coordinator.request(&key));
        wait_for(&fx.coordinator, &key, Some(ThumbnailStatus::Done));
        assert_eq!(extractor.calls(), 3);
        let offsets = extractor.offsets.lock().clone();
        assert_eq!(offsets[1], Duration::ZERO);
    }

    #[test]
    fn test_persistent_failure_marks_failed_and_serves_placeholder() {
        let extractor = FakeExtractor::new(usize::MAX, Duration::ZERO);
        let ledger = ThumbnailLedger::open_in_memory().unwrap();
        let fx = fixture(Arc::clone(&extractor), Some(ledger));
        let key = MediaKey::from("a.mp4");

        fx.coordinator.request(&key);
        wait_for(&fx.coordinator, &key, Some(ThumbnailStatus::Failed));
        assert_eq!(extractor.calls(), 1 + MAX_RETRIES as usize);
        assert_eq!(
            fx.coordinator.serve_path(&key),
            Some(PathBuf::from("/static/placeholder.jpg"))
        );

        // Failed keys are not retried by the bulk path
        assert_eq!(fx.coordinator.request_missing([key.clone()]), 0);
        // No stray temp files
        let leftovers = std::fs::read_dir(&fx.thumb_dir).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_missing_source_is_discarded() {
        let extractor = FakeExtractor::new(0, Duration::ZERO);
        let fx = fixture(Arc::clone(&extractor), None);
        let key = MediaKey::from("gone.mp4");

        fx.coordinator.request(&key);
        wait_for(&fx.coordinator, &key, None);
        assert_eq!(extractor.calls(), 0);
        assert!(!fx.coordinator.thumbnail_path(&key).exists());
    }

    #[test]
    fn test_source_deleted_mid_run_is_not_committed() {
        let extractor = FakeExtractor::new(0, Duration::from_millis(200));
        let fx = fixture(Arc::clone(&extractor), None);
        let key = MediaKey::from("a.mp4");

        fx.coordinator.request(&key);
        wait_for(&fx.coordinator, &key, Some(ThumbnailStatus::Running));
        std::fs::remove_file(fx.video_root.join("a.mp4")).unwrap();

        wait_for(&fx.coordinator, &key, None);
        assert!(!fx.coordinator.thumbnail_path(&key).exists());
        assert_eq!(std::fs::read_dir(&fx.thumb_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_discard_and_sweep() {
        let extractor = FakeExtractor::new(0, Duration::ZERO);
        let fx = fixture(Arc::clone(&extractor), None);
        let key = MediaKey::from("a.mp4");

        fx.coordinator.request(&key);
        wait_for(&fx.coordinator, &key, Some(ThumbnailStatus::Done));

        std::fs::write(fx.thumb_dir.join("0123456789abcdef.jpg"), b"old").unwrap();
        let live: HashSet<MediaKey> = [key.clone()].into_iter().collect();
        assert_eq!(fx.coordinator.sweep_orphans(&live), 1);
        assert!(fx.coordinator.thumbnail_path(&key).exists());

        fx.coordinator.discard(&key);
        assert_eq!(fx.coordinator.status(&key), None);
        assert!(!fx.coordinator.thumbnail_path(&key).exists());
    }

    #[test]
    fn test_rerequest_after_discard_waits_for_running_job() {
        let extractor = FakeExtractor::new(0, Duration::from_millis(300));
        let fx = fixture(Arc::clone(&extractor), None);
        let key = MediaKey::from("a.mp4");

        assert!(fx.coordinator.request(&key));
        wait_for(&fx.coordinator, &key, Some(ThumbnailStatus::Running));

        // Content changed: the indexer discards then requests again
        fx.coordinator.discard(&key);
        assert_eq!(fx.coordinator.status(&key), None);
        assert!(fx.coordinator.request(&key));
        assert_eq!(fx.coordinator.status(&key), Some(ThumbnailStatus::Pending));
        assert!(!fx.coordinator.request(&key));

        wait_for(&fx.coordinator, &key, Some(ThumbnailStatus::Done));
        assert_eq!(extractor.calls(), 2);
        assert_eq!(extractor.peak(), 1);
        assert!(fx.coordinator.thumbnail_path(&key).exists());
    }

    #[test]
    fn test_discard_while_running_drops_output() {
        let extractor = FakeExtractor::new(0, Duration::from_millis(200));
        let fx = fixture(Arc::clone(&extractor), None);
        let key = MediaKey::from("a.mp4");

        fx.coordinator.request(&key);
        wait_for(&fx.coordinator, &key, Some(ThumbnailStatus::Running));
        fx.coordinator.discard(&key);

        // The cancelled run clears its slot without committing
        let deadline = Instant::now() + Duration::from_secs(5);
        while fx.coordinator.shared.slots.read().contains_key(&key) {
            assert!(Instant::now() < deadline, "cancelled run never finished");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(extractor.calls(), 1);
        assert!(!fx.coordinator.thumbnail_path(&key).exists());
        assert_eq!(std::fs::read_dir(&fx.thumb_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_request_missing_skips_existing() {
        let extractor = FakeExtractor::new(0, Duration::ZERO);
        let fx = fixture(Arc::clone(&extractor), None);
        let key = MediaKey::from("a.mp4");
        std::fs::write(fx.coordinator.thumbnail_path(&key), b"jpeg").unwrap();

        assert_eq!(fx.coordinator.request_missing([key]), 0);
        assert_eq!(extractor.calls(), 0);
    }

    #[test]
    fn test_thumbnail_name_is_stable() {
        let key = MediaKey::from("dir/clip.mp4");
        assert_eq!(thumbnail_name(&key), thumbnail_name(&key.clone()));
        assert!(thumbnail_name(&key).ends_with(".jpg"));
        assert_eq!(thumbnail_name(&key).len(), 16 + 4);
    }
}
