//! A single cached collection with TTL and single-flight rebuilds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::error::{MediaError, Result};

struct Slot<T> {
    value: Option<Arc<T>>,
    /// `None` after an invalidation.
    fetched_at: Option<Instant>,
    /// Bumped on every invalidation. A rebuild only publishes its value if the
    /// generation it started under is still current.
    generation: u64,
}

/// A rebuild in progress. Followers block on `cv` until the leader fills `done`.
struct Flight<T> {
    done: Mutex<Option<Result<Arc<T>>>>,
    cv: Condvar,
}

impl<T> Flight<T> {
    fn new() -> Self {
        Self {
            done: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<Arc<T>> {
        let mut done = self.done.lock();
        loop {
            if let Some(result) = done.as_ref() {
                return result.clone();
            }
            self.cv.wait(&mut done);
        }
    }

    fn finish(&self, result: Result<Arc<T>>) {
        *self.done.lock() = Some(result);
        self.cv.notify_all();
    }
}

/// Completes the flight even if the loader panics, so followers never hang.
struct LeaderGuard<'a, T> {
    entry: &'a CacheEntry<T>,
    flight: Arc<Flight<T>>,
    finished: bool,
}

impl<T> LeaderGuard<'_, T> {
    fn finish(mut self, result: Result<Arc<T>>) -> Result<Arc<T>> {
        self.finished = true;
        self.entry.detach(&self.flight);
        self.flight.finish(result.clone());
        result
    }
}

impl<T> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            self.entry.detach(&self.flight);
            self.flight
                .finish(Err(MediaError::storage("cache rebuild aborted")));
        }
    }
}

/// One cached collection.
///
/// Reads take the slot's read lock only long enough to clone an `Arc`.
/// The rebuild itself runs without holding the slot lock; concurrent callers
/// that find the value stale share one rebuild.
pub struct CacheEntry<T> {
    name: &'static str,
    ttl: Duration,
    slot: RwLock<Slot<T>>,
    inflight: Mutex<Option<Arc<Flight<T>>>>,
}

impl<T> CacheEntry<T> {
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            slot: RwLock::new(Slot {
                value: None,
                fetched_at: None,
                generation: 0,
            }),
            inflight: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn fresh(&self) -> Option<Arc<T>> {
        let slot = self.slot.read();
        match (&slot.value, slot.fetched_at) {
            (Some(value), Some(at)) if at.elapsed() <= self.ttl => Some(Arc::clone(value)),
            _ => None,
        }
    }

    /// The last value, fresh or not.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.slot.read().value.clone()
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh().is_some()
    }

    /// Returns the cached value, rebuilding it with `load` when it is missing
    /// or older than the TTL.
    ///
    /// If the rebuild fails and an older value exists, the older value is
    /// returned instead of the error.
    pub fn get_with(&self, load: impl FnOnce() -> Result<T>) -> Result<Arc<T>> {
        if let Some(value) = self.fresh() {
            trace!(collection = self.name, "Cache hit");
            return Ok(value);
        }

        let (flight, generation) = {
            let mut inflight = self.inflight.lock();
            // A rebuild may have finished while we waited for the lock.
            if let Some(value) = self.fresh() {
                return Ok(value);
            }
            if let Some(flight) = inflight.as_ref() {
                let flight = Arc::clone(flight);
                drop(inflight);
                trace!(collection = self.name, "Joining in-flight rebuild");
                return flight.wait();
            }
            let flight = Arc::new(Flight::new());
            *inflight = Some(Arc::clone(&flight));
            (flight, self.slot.read().generation)
        };

        let guard = LeaderGuard {
            entry: self,
            flight,
            finished: false,
        };

        debug!(collection = self.name, "Rebuilding cache entry");
        let result = match load() {
            Ok(value) => {
                let value = Arc::new(value);
                let mut slot = self.slot.write();
                if slot.generation == generation {
                    slot.value = Some(Arc::clone(&value));
                    slot.fetched_at = Some(Instant::now());
                } else {
                    debug!(collection = self.name, "Invalidated during rebuild, not publishing");
                }
                Ok(value)
            }
            Err(err) => match self.peek() {
                Some(stale) => {
                    warn!(collection = self.name, error = ?err, "Rebuild failed, serving stale value");
                    Ok(stale)
                }
                None => Err(err),
            },
        };

        guard.finish(result)
    }

    /// Marks the value stale. The next read rebuilds it.
    ///
    /// The old value is kept as the stale fallback. A rebuild already in
    /// flight is detached so later readers start a fresh one.
    pub fn invalidate(&self) {
        {
            let mut slot = self.slot.write();
            slot.fetched_at = None;
            slot.generation = slot.generation.wrapping_add(1);
        }
        self.inflight.lock().take();
        trace!(collection = self.name, "Invalidated");
    }

    fn detach(&self, flight: &Arc<Flight<T>>) {
        let mut inflight = self.inflight.lock();
        if inflight.as_ref().is_some_and(|f| Arc::ptr_eq(f, flight)) {
            *inflight = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_hit_until_invalidated() {
        let entry = CacheEntry::new("test", Duration::from_secs(300));
        let loads = AtomicUsize::new(0);
        let load = || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(loads.load(Ordering::SeqCst))
        };

        assert_eq!(*entry.get_with(load).unwrap(), 1);
        assert_eq!(*entry.get_with(load).unwrap(), 1);
        entry.invalidate();
        assert!(!entry.is_fresh());
        assert_eq!(*entry.get_with(load).unwrap(), 2);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ttl_expiry_rebuilds() {
        let entry = CacheEntry::new("test", Duration::from_millis(20));
        let loads = AtomicUsize::new(0);
        let load = || Ok(loads.fetch_add(1, Ordering::SeqCst));

        entry.get_with(load).unwrap();
        thread::sleep(Duration::from_millis(40));
        entry.get_with(load).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_single_flight() {
        let entry = Arc::new(CacheEntry::new("test", Duration::from_secs(300)));
        let loads = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let entry = Arc::clone(&entry);
                let loads = Arc::clone(&loads);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    *entry
                        .get_with(|| {
                            loads.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(100));
                            Ok(42)
                        })
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_serves_stale_on_error() {
        let entry = CacheEntry::new("test", Duration::from_secs(300));
        entry.get_with(|| Ok(7)).unwrap();
        entry.invalidate();

        let value = entry
            .get_with(|| Err(MediaError::storage("down")))
            .unwrap();
        assert_eq!(*value, 7);
    }

    #[test]
    fn test_error_without_value_propagates() {
        let entry: CacheEntry<u32> = CacheEntry::new("test", Duration::from_secs(300));
        let err = entry
            .get_with(|| Err(MediaError::storage("down")))
            .unwrap_err();
        assert!(matches!(err, MediaError::Storage(_)));

        // The failed flight is cleared; the next call retries.
        assert_eq!(*entry.get_with(|| Ok(1)).unwrap(), 1);
    }

    #[test]
    fn test_invalidate_during_rebuild_is_not_published() {
        let entry = Arc::new(CacheEntry::new("test", Duration::from_secs(300)));
        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let leader = {
            let entry = Arc::clone(&entry);
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                *entry
                    .get_with(|| {
                        started.wait();
                        release.wait();
                        Ok("old")
                    })
                    .unwrap()
            })
        };

        started.wait();
        entry.invalidate();
        release.wait();
        assert_eq!(leader.join().unwrap(), "old");

        assert!(!entry.is_fresh());
        assert_eq!(*entry.get_with(|| Ok("new")).unwrap(), "new");
    }

    #[test]
    fn test_panicking_loader_releases_followers() {
        let entry: Arc<CacheEntry<u32>> = Arc::new(CacheEntry::new("test", Duration::from_secs(300)));
        let leader = {
            let entry = Arc::clone(&entry);
            thread::spawn(move || {
                let _ = entry.get_with(|| panic!("loader blew up"));
            })
        };
        assert!(leader.join().is_err());
        assert_eq!(*entry.get_with(|| Ok(3)).unwrap(), 3);
    }
}
