//! Periodic full reconciliation.
//!
//! Watcher events can be missed (downtime, overflow, unmounted roots). Every
//! interval, or sooner when the watcher raises the overflow flag, the
//! reconciler rescans both roots and applies the difference through the
//! indexer. It also gives a degraded store the chance to recover.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::indexer::{ApplyReport, Indexer};
use crate::store::PersistenceLayer;

use super::supervisor::sleep_unless;

const CHECK_INTERVAL: Duration = Duration::from_millis(250);

pub struct Reconciler {
    indexer: Arc<Indexer>,
    store: Arc<PersistenceLayer>,
    interval: Duration,
    overflow: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn new(
        indexer: Arc<Indexer>,
        store: Arc<PersistenceLayer>,
        interval: Duration,
        overflow: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            indexer,
            store,
            interval,
            overflow,
            shutdown,
        }
    }

    /// One reconciliation pass.
    pub fn tick(&self) -> Result<ApplyReport> {
        if self.store.is_degraded() {
            if self.store.try_recover() {
                info!("Relational store recovered");
            } else {
                debug!("Store still degraded");
            }
        }

        let started = Instant::now();
        let report = self.indexer.reconcile_now()?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            created = report.created,
            renamed = report.renamed,
            removed = report.removed,
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Waits for the next interval, an overflow, or shutdown. Returns false
    /// on shutdown.
    fn wait(&self) -> bool {
        let deadline = Instant::now() + self.interval;
        loop {
            if self.overflow.load(Ordering::Acquire) {
                return !self.shutdown.load(Ordering::Acquire);
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            if !sleep_unless(&self.shutdown, (deadline - now).min(CHECK_INTERVAL)) {
                return false;
            }
        }
    }

    pub fn run(&self) {
        while self.wait() {
            if self.overflow.swap(false, Ordering::AcqRel) {
                info!("Running full scan after dropped watcher events");
            }
            match catch_unwind(AssertUnwindSafe(|| self.tick())) {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Reconciliation failed"),
                Err(_) => error!("Reconciliation panicked"),
            }
        }
        debug!("Reconciler stopped");
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("reconciler".to_string())
            .spawn(move || self.run())
    }
}
