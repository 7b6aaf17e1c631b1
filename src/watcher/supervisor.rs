//! Restart loop for long-running background tasks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::WatcherFault;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Doubling delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    /// Returns the current delay and doubles it for next time.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(MIN_BACKOFF, MAX_BACKOFF)
    }
}

/// Sleeps for `duration` or until `shutdown` is set. Returns false if
/// interrupted.
pub fn sleep_unless(shutdown: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

/// Runs a task, restarting it with backoff whenever it faults or panics.
///
/// The task returning `Ok(())` means it stopped on purpose; the supervisor
/// stops too. A task that ran longer than the maximum backoff before
/// faulting restarts at the minimum delay again.
pub struct Supervisor {
    name: &'static str,
    backoff: Backoff,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(name: &'static str, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            name,
            backoff: Backoff::default(),
            shutdown,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Blocks until the task stops cleanly or shutdown is requested.
    /// Returns the number of restarts.
    pub fn run<F>(&mut self, mut task: F) -> usize
    where
        F: FnMut() -> Result<(), WatcherFault>,
    {
        let mut restarts = 0;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let started = Instant::now();
            match catch_unwind(AssertUnwindSafe(&mut task)) {
                Ok(Ok(())) => {
                    debug!(task = self.name, "Task stopped");
                    break;
                }
                Ok(Err(fault)) => warn!(task = self.name, error = %fault, "Task faulted"),
                Err(_) => error!(task = self.name, "Task panicked"),
            }

            if started.elapsed() >= self.backoff.max() {
                self.backoff.reset();
            }
            let delay = self.backoff.next_delay();
            restarts += 1;
            warn!(task = self.name, ?delay, restarts, "Restarting task");
            if !sleep_unless(&self.shutdown, delay) {
                break;
            }
        }
        restarts
    }

    /// Runs the supervisor on its own thread.
    pub fn spawn<F>(mut self, task: F) -> std::io::Result<JoinHandle<usize>>
    where
        F: FnMut() -> Result<(), WatcherFault> + Send + 'static,
    {
        let name = self.name;
        thread::Builder::new()
            .name(format!("{}-supervisor", name))
            .spawn(move || {
                info!(task = name, "Supervisor started");
                self.run(task)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        b.reset();
        assert_eq!(b.next_delay(), MIN_BACKOFF);
    }

    #[test]
    fn test_restarts_until_clean_stop() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut calls = 0;
        let restarts = Supervisor::new("test", shutdown)
            .with_backoff(fast())
            .run(|| {
                calls += 1;
                if calls < 4 {
                    Err(WatcherFault::Disconnected)
                } else {
                    Ok(())
                }
            });
        assert_eq!(restarts, 3);
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_survives_panic() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut calls = 0;
        let restarts = Supervisor::new("test", shutdown)
            .with_backoff(fast())
            .run(|| {
                calls += 1;
                if calls == 1 {
                    panic!("event loop exploded");
                }
                Ok(())
            });
        assert_eq!(restarts, 1);
    }

    #[test]
    fn test_shutdown_interrupts_backoff() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = Supervisor::new("test", shutdown)
            .with_backoff(Backoff::new(Duration::from_secs(30), Duration::from_secs(60)))
            .spawn(|| Err(WatcherFault::Disconnected))
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::Release);
        assert_eq!(handle.join().unwrap(), 1);
    }
}
