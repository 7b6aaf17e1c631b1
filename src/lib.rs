//! Metadata cache and filesystem synchronization for a media browser.
//!
//! The HTTP layer reads through [`MetadataCache`] and writes through
//! [`PersistenceLayer`], invalidating the touched collection afterwards.
//! [`DirectoryWatcher`] and [`Reconciler`] keep the store in step with the
//! media roots via the [`Indexer`], which also feeds the
//! [`ThumbnailCoordinator`]. [`Services`] wires all of it from a [`Config`].

pub mod cache;
pub mod config;
pub mod error;
pub mod indexer;
pub mod models;
pub mod scanner;
pub mod store;
pub mod thumbnails;
pub mod watcher;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tracing::{info, warn};

pub use cache::{MetadataCache, RelatedItem};
pub use config::Config;
pub use error::MediaError;
pub use indexer::{ApplyReport, ChangeBatch, ChangeKind, Indexer, PathChange};
pub use models::{MediaItem, MediaKey, MediaType, RatingSummary, RatingsSnapshot, SortKey};
pub use scanner::{DurationProbe, FfprobeDuration, FileScanner, MediaRoots, NoProbe};
pub use store::PersistenceLayer;
pub use thumbnails::{ThumbnailCoordinator, ThumbnailStatus};
pub use watcher::{DirectoryWatcher, Reconciler, Supervisor};

use thumbnails::{CoordinatorConfig, FfmpegExtractor, ThumbnailLedger};

/// Every long-lived component, built once and shared by handle.
pub struct Services {
    pub config: Config,
    pub roots: MediaRoots,
    pub store: Arc<PersistenceLayer>,
    pub cache: Arc<MetadataCache>,
    pub thumbnails: Arc<ThumbnailCoordinator>,
    pub indexer: Arc<Indexer>,
    pub watcher: Arc<DirectoryWatcher>,
    shutdown: Arc<AtomicBool>,
}

/// Threads started by [`Services::start_background`].
pub struct BackgroundTasks {
    supervisor: JoinHandle<usize>,
    reconciler: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Waits for both threads. Call after [`Services::shutdown`].
    pub fn join(self) {
        match self.supervisor.join() {
            Ok(restarts) => info!(restarts, "Watcher supervisor stopped"),
            Err(_) => warn!("Watcher supervisor panicked"),
        }
        if self.reconciler.join().is_err() {
            warn!("Reconciler panicked");
        }
    }
}

fn duration_probe(config: &Config) -> Box<dyn DurationProbe> {
    if config.probe_durations {
        Box::new(FfprobeDuration::new(&config.ffprobe_path))
    } else {
        Box::new(NoProbe)
    }
}

impl Services {
    /// Opens the stores and starts the thumbnail workers.
    ///
    /// Nothing watches the filesystem until [`start_background`](Self::start_background).
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data dir {:?}", config.data_dir))?;

        let roots = MediaRoots::new(&config.video_root, &config.image_root);
        let shutdown = Arc::new(AtomicBool::new(false));

        let store = Arc::new(PersistenceLayer::open(&config)?);
        let cache = Arc::new(MetadataCache::from_config(Arc::clone(&store), &config));

        let ledger = match ThumbnailLedger::open(&config.bookkeeping_db_path()) {
            Ok(ledger) => Some(ledger),
            Err(e) => {
                warn!(error = %e, "Thumbnail ledger unavailable, statuses will not persist");
                None
            }
        };
        let thumbnails = Arc::new(
            ThumbnailCoordinator::new(
                CoordinatorConfig::from_config(&config),
                roots.clone(),
                Arc::new(FfmpegExtractor::new(&config.ffmpeg_path, config.thumbnail_height)),
                Arc::from(duration_probe(&config)),
                ledger,
            )
            .context("Failed to start thumbnail workers")?,
        );

        let indexer = Arc::new(
            Indexer::new(
                Arc::clone(&store),
                Arc::clone(&cache),
                FileScanner::new(roots.clone()),
                duration_probe(&config),
            )
            .with_thumbnails(Arc::clone(&thumbnails)),
        );

        let watcher = Arc::new(DirectoryWatcher::from_config(
            &config,
            roots.clone(),
            Arc::clone(&indexer),
            Arc::clone(&shutdown),
        ));
        cache.set_orphan_sink(watcher.sender());

        info!(backend = store.backend_name(), "Services ready");

        Ok(Self {
            config,
            roots,
            store,
            cache,
            thumbnails,
            indexer,
            watcher,
            shutdown,
        })
    }

    /// Scans both roots, reconciles the store and drops thumbnails of
    /// media that no longer exists.
    pub async fn startup(&self) -> Result<ApplyReport> {
        let listing = self.indexer.scanner().scan().await?;
        info!(
            videos = listing.videos,
            images = listing.images,
            missing_roots = listing.missing_roots.len(),
            "Startup scan finished"
        );

        let indexer = Arc::clone(&self.indexer);
        let report = tokio::task::spawn_blocking(move || indexer.reconcile(&listing))
            .await
            .context("Reconcile task panicked")??;

        let live: HashSet<MediaKey> = self
            .store
            .media()?
            .into_iter()
            .filter(|item| item.is_video())
            .map(|item| item.key)
            .collect();
        self.thumbnails.sweep_orphans(&live);

        Ok(report)
    }

    /// Starts the supervised watcher and the reconciler.
    pub fn start_background(&self) -> Result<BackgroundTasks> {
        let watcher = Arc::clone(&self.watcher);
        let supervisor = Supervisor::new("watcher", Arc::clone(&self.shutdown))
            .spawn(move || watcher.run())
            .context("Failed to spawn watcher supervisor")?;

        let reconciler = Reconciler::new(
            Arc::clone(&self.indexer),
            Arc::clone(&self.store),
            self.config.reconcile_interval(),
            self.watcher.overflow_flag(),
            Arc::clone(&self.shutdown),
        )
        .spawn()
        .context("Failed to spawn reconciler")?;

        Ok(BackgroundTasks {
            supervisor,
            reconciler,
        })
    }

    /// Signals background threads to stop and stops the thumbnail workers.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.thumbnails.shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
