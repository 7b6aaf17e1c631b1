//! Per-path debouncing of filesystem events.
//!
//! Each path has its own quiet-period deadline. A new event for the path
//! resets the deadline (it does not add to it) and merges its kind with the
//! pending one.
//!
//! Removals are held for one extra window, and quiet creations wait for any
//! pending removal (for at most one extra window). The two halves of a
//! rename then land in the same [`ChangeBatch`] even when their events
//! arrive apart, so the indexer can pair them by checksum. Whenever
//! anything is due, every quiet path is flushed with it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::indexer::{ChangeBatch, ChangeKind, PathChange};

#[derive(Debug)]
struct PendingPath {
    /// `None` when the events so far cancel out (created then removed).
    kind: Option<ChangeKind>,
    deadline: Instant,
}

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, PendingPath>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, change: PathChange, now: Instant) {
        let deadline = now + self.window;
        match self.pending.get_mut(&change.path) {
            Some(entry) => {
                entry.kind = match entry.kind {
                    Some(earlier) => ChangeKind::merge(earlier, change.kind),
                    None => Some(change.kind),
                };
                entry.deadline = deadline;
            }
            None => {
                self.pending.insert(
                    change.path,
                    PendingPath {
                        kind: Some(change.kind),
                        deadline,
                    },
                );
            }
        }
    }

    fn removal_pending(&self) -> bool {
        self.pending
            .values()
            .any(|p| p.kind == Some(ChangeKind::Removed))
    }

    /// When `entry` must be flushed at the latest.
    fn due(&self, entry: &PendingPath, removal_pending: bool) -> Instant {
        if entry.kind == Some(ChangeKind::Removed) || removal_pending {
            entry.deadline + self.window
        } else {
            entry.deadline
        }
    }

    /// Removes and returns every quiet path, once at least one path is due.
    pub fn flush_ready(&mut self, now: Instant) -> ChangeBatch {
        let removal_pending = self.removal_pending();
        if !self
            .pending
            .values()
            .any(|p| self.due(p, removal_pending) <= now)
        {
            return ChangeBatch::new();
        }

        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        let mut batch = ChangeBatch::new();
        for path in ready {
            if let Some(PendingPath { kind: Some(kind), .. }) = self.pending.remove(&path) {
                batch.push(PathChange::new(path, kind));
            }
        }
        batch
    }

    /// Removes and returns everything, quiet or not.
    pub fn flush_all(&mut self) -> ChangeBatch {
        self.pending
            .drain()
            .filter_map(|(path, p)| p.kind.map(|kind| PathChange::new(path, kind)))
            .collect()
    }

    /// Earliest time [`flush_ready`](Self::flush_ready) will return something.
    pub fn next_deadline(&self) -> Option<Instant> {
        let removal_pending = self.removal_pending();
        self.pending
            .values()
            .map(|p| self.due(p, removal_pending))
            .min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(2);

    fn change(path: &str, kind: ChangeKind) -> PathChange {
        PathChange::new(path, kind)
    }

    #[test]
    fn test_burst_flushes_once() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.push(change("/v/a.mp4", ChangeKind::Created), t0);
        for i in 1..5 {
            d.push(
                change("/v/a.mp4", ChangeKind::Modified),
                t0 + Duration::from_millis(500 * i),
            );
        }

        // The last event was at t0+2s, so nothing is quiet at t0+3s
        assert!(d.flush_ready(t0 + Duration::from_secs(3)).is_empty());

        let batch = d.flush_ready(t0 + Duration::from_secs(4));
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch.kind_of(std::path::Path::new("/v/a.mp4")),
            Some(ChangeKind::Created)
        );
        assert!(d.is_empty());
        assert!(d.flush_ready(t0 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_create_then_remove_is_noop() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.push(change("/v/tmp.mp4", ChangeKind::Created), t0);
        d.push(change("/v/tmp.mp4", ChangeKind::Removed), t0);
        assert!(d.flush_ready(t0 + WINDOW).is_empty());
        assert!(d.is_empty());
    }

    #[test]
    fn test_cancelled_path_can_reappear() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.push(change("/v/a.mp4", ChangeKind::Created), t0);
        d.push(change("/v/a.mp4", ChangeKind::Removed), t0);
        d.push(change("/v/a.mp4", ChangeKind::Created), t0);
        let batch = d.flush_ready(t0 + WINDOW);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_removal_is_held_one_extra_window() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.push(change("/v/gone.mp4", ChangeKind::Removed), t0);

        assert_eq!(d.next_deadline(), Some(t0 + WINDOW * 2));
        assert!(d.flush_ready(t0 + WINDOW).is_empty());
        assert_eq!(d.flush_ready(t0 + WINDOW * 2).len(), 1);
    }

    #[test]
    fn test_rename_halves_arriving_apart_flush_together() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.push(change("/v/a.mp4", ChangeKind::Removed), t0);
        d.push(
            change("/v/b.mp4", ChangeKind::Created),
            t0 + Duration::from_millis(1),
        );

        // Neither half goes out on its own
        assert!(d.flush_ready(t0 + WINDOW).is_empty());
        assert!(d
            .flush_ready(t0 + WINDOW + Duration::from_millis(1))
            .is_empty());

        let batch = d.flush_ready(t0 + WINDOW * 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.kind_of(std::path::Path::new("/v/a.mp4")),
            Some(ChangeKind::Removed)
        );
        assert_eq!(
            batch.kind_of(std::path::Path::new("/v/b.mp4")),
            Some(ChangeKind::Created)
        );
        assert!(d.is_empty());
    }

    #[test]
    fn test_creation_before_removal_waits_for_it() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.push(change("/v/b.mp4", ChangeKind::Created), t0);
        d.push(
            change("/v/a.mp4", ChangeKind::Removed),
            t0 + Duration::from_millis(1),
        );

        assert!(d.flush_ready(t0 + WINDOW + Duration::from_millis(1)).is_empty());
        // The creation is due after one extra window and takes the quiet removal along
        assert_eq!(d.flush_ready(t0 + WINDOW * 2).len(), 2);
    }

    #[test]
    fn test_paths_flush_independently() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.push(change("/v/a.mp4", ChangeKind::Created), t0);
        d.push(change("/v/b.mp4", ChangeKind::Created), t0 + Duration::from_secs(1));

        assert_eq!(d.next_deadline(), Some(t0 + WINDOW));
        assert_eq!(d.flush_ready(t0 + WINDOW).len(), 1);
        assert_eq!(d.len(), 1);
        assert_eq!(d.flush_all().len(), 1);
        assert_eq!(d.next_deadline(), None);
    }
}
