//! Canonical metadata storage.
//!
//! Two interchangeable backends implement [`Storage`]: [`SqliteStorage`]
//! (preferred) and [`FlatFileStorage`] (per-field JSON files, used as a
//! fallback and as the one-time migration source). The backend is picked once
//! in [`PersistenceLayer::open`]; call sites never branch on it.

pub mod flat_file;
pub mod migration;
pub mod sqlite;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result as AnyResult};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{BackendError, MediaError, Result};
use crate::models::{
    FavoriteSet, MediaItem, MediaKey, Rating, RatingRow, RatingSummary, RatingsSnapshot, Snapshot,
    StoreStats, TagMap, ViewCounts,
};

pub use flat_file::FlatFileStorage;
pub use migration::MigrationReport;
pub use sqlite::SqliteStorage;

/// One storage backend.
///
/// Write operations on metadata (ratings, views, tags, favorites) fail with
/// [`BackendError::UnknownKey`] when no media row exists for the key.
pub trait Storage: Send + Sync {
    fn name(&self) -> &'static str;

    fn load_media(&self) -> Result<Vec<MediaItem>, BackendError>;
    fn upsert_media(&self, items: &[MediaItem]) -> Result<usize, BackendError>;
    /// Moves the row at `old` (and everything keyed by it) to `item.key`.
    fn remap_media(&self, old: &MediaKey, item: &MediaItem) -> Result<bool, BackendError>;
    /// Removes the row and every dependent record.
    fn delete_media(&self, key: &MediaKey) -> Result<bool, BackendError>;

    fn load_ratings(&self) -> Result<Vec<RatingRow>, BackendError>;
    fn set_rating(&self, key: &MediaKey, user: &str, value: Rating) -> Result<(), BackendError>;

    fn load_views(&self) -> Result<ViewCounts, BackendError>;
    fn increment_view(&self, key: &MediaKey) -> Result<u64, BackendError>;
    /// Raises the stored count to `count` if it is lower. Counts never decrease.
    fn set_view_count(&self, key: &MediaKey, count: u64) -> Result<(), BackendError>;

    fn load_tags(&self) -> Result<TagMap, BackendError>;
    fn add_tag(&self, key: &MediaKey, tag: &str) -> Result<bool, BackendError>;
    fn remove_tag(&self, key: &MediaKey, tag: &str) -> Result<bool, BackendError>;

    fn load_favorites(&self) -> Result<FavoriteSet, BackendError>;
    fn toggle_favorite(&self, key: &MediaKey) -> Result<bool, BackendError>;
    fn set_favorite(&self, key: &MediaKey, favorite: bool) -> Result<(), BackendError>;

    fn export_snapshot(&self) -> Result<Snapshot, BackendError>;
    /// Writes a full projection. With `replace`, existing contents are dropped first.
    fn import_snapshot(&self, snapshot: &Snapshot, replace: bool) -> Result<(), BackendError>;
    fn stats(&self) -> Result<StoreStats, BackendError>;
}

/// Current unix time in seconds.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Bounded exponential backoff for busy/locked conditions.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.store_retry_attempts.max(1),
            base: config.retry_base(),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_millis(50),
        }
    }
}

/// The persistence facade used by the indexer and the HTTP layer.
///
/// Writes go to the primary backend with retry on busy. A write the primary
/// cannot complete is retried once on the fallback and the layer is marked
/// degraded; while degraded, reads and writes go to the fallback until
/// [`try_recover`](Self::try_recover) replays it into the primary.
pub struct PersistenceLayer {
    primary: Arc<dyn Storage>,
    fallback: Option<Arc<dyn Storage>>,
    mirror: bool,
    retry: RetryPolicy,
    degraded: AtomicBool,
    /// Fallback writes hold the read side; recovery holds the write side
    /// from snapshot export until the degraded flag is cleared.
    recovery: RwLock<()>,
}

impl PersistenceLayer {
    pub fn new(
        primary: Arc<dyn Storage>,
        fallback: Option<Arc<dyn Storage>>,
        retry: RetryPolicy,
        mirror: bool,
    ) -> Self {
        Self {
            primary,
            fallback,
            mirror,
            retry,
            degraded: AtomicBool::new(false),
            recovery: RwLock::new(()),
        }
    }

    /// Opens the relational store with the flat files as fallback.
    ///
    /// If the relational store cannot be opened at all, the flat files become
    /// the only backend. Runs the one-time flat-file migration.
    pub fn open(config: &Config) -> AnyResult<Self> {
        let flat = Arc::new(
            FlatFileStorage::open(&config.flat_file_dir(), &config.default_user)
                .context("Failed to open flat-file store")?,
        );
        let retry = RetryPolicy::from_config(config);

        let layer = match SqliteStorage::open(&config.metadata_db_path()) {
            Ok(sqlite) => Self::new(
                Arc::new(sqlite),
                Some(flat as Arc<dyn Storage>),
                retry,
                config.mirror_flat_files,
            ),
            Err(e) => {
                warn!(error = %e, "Relational store unavailable, using flat files only");
                Self::new(flat, None, retry, false)
            }
        };

        let report = layer.migrate_from_flat_files()?;
        if report.migrated {
            info!(?report, "Migrated flat-file metadata");
        }
        if layer.mirror {
            layer.seed_mirror();
        }
        Ok(layer)
    }

    pub fn backend_name(&self) -> &'static str {
        self.primary.name()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    /// Runs `op` against `storage`, retrying busy/locked failures.
    fn with_retry<T>(
        &self,
        storage: &dyn Storage,
        op: &dyn Fn(&dyn Storage) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut attempt = 0;
        loop {
            match op(storage) {
                Err(e) if e.is_busy() && attempt + 1 < self.retry.attempts => {
                    let delay = self.retry.delay(attempt);
                    debug!(backend = storage.name(), attempt, ?delay, "Store busy, retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn write<T>(
        &self,
        what: &'static str,
        key: Option<&MediaKey>,
        op: impl Fn(&dyn Storage) -> Result<T, BackendError>,
        mirror: impl Fn(&dyn Storage, &T) -> Result<(), BackendError>,
    ) -> Result<T> {
        let not_found = || MediaError::not_found(key.map(|k| k.to_string()).unwrap_or_default());

        if self.is_degraded() {
            if let Some(fallback) = &self.fallback {
                let _recovery = self.recovery.read();
                // Recovery may have finished while we waited
                if self.is_degraded() {
                    return match self.with_retry(fallback.as_ref(), &op) {
                        Ok(value) => Ok(value),
                        Err(e) => Err(self.fallback_error(what, key, e)),
                    };
                }
            }
        }

        let primary_err = match self.with_retry(self.primary.as_ref(), &op) {
            Ok(value) => {
                if self.mirror {
                    if let Some(fallback) = &self.fallback {
                        if let Err(e) = mirror(fallback.as_ref(), &value) {
                            debug!(what, error = %e, "Flat-file mirror write failed");
                        }
                    }
                }
                return Ok(value);
            }
            Err(BackendError::UnknownKey(_)) => return Err(not_found()),
            Err(e) => e,
        };

        let Some(fallback) = &self.fallback else {
            error!(what, backend = self.primary.name(), error = %primary_err, "Store write failed");
            return Err(if primary_err.is_busy() {
                MediaError::Concurrency(primary_err.to_string())
            } else {
                MediaError::storage(primary_err.to_string())
            });
        };

        warn!(
            what,
            backend = self.primary.name(),
            error = %primary_err,
            "Primary store write failed, switching to flat files"
        );
        let _recovery = self.recovery.read();
        self.degraded.store(true, Ordering::Release);

        op(fallback.as_ref()).map_err(|e| self.fallback_error(what, key, e))
    }

    /// Maps a fallback write failure to the public error.
    ///
    /// Without mirroring the flat files never learn about new media rows, so
    /// an unknown key there says nothing about whether the key is valid.
    fn fallback_error(&self, what: &'static str, key: Option<&MediaKey>, e: BackendError) -> MediaError {
        match e {
            BackendError::UnknownKey(_) if self.mirror => {
                MediaError::not_found(key.map(|k| k.to_string()).unwrap_or_default())
            }
            e => {
                error!(what, error = %e, "Fallback store write failed");
                MediaError::storage(e.to_string())
            }
        }
    }

    fn read<T>(
        &self,
        what: &'static str,
        op: impl Fn(&dyn Storage) -> Result<T, BackendError>,
    ) -> Result<T> {
        let (first, second) = match (&self.fallback, self.is_degraded()) {
            (Some(fallback), true) => (fallback.as_ref(), Some(self.primary.as_ref())),
            (fallback, _) => (self.primary.as_ref(), fallback.as_deref()),
        };

        let err = match self.with_retry(first, &op) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        match second {
            Some(second) => {
                warn!(what, backend = first.name(), error = %err, "Read failed, trying {}", second.name());
                op(second).map_err(|e| {
                    error!(what, error = %e, "Both stores failed");
                    MediaError::storage(e.to_string())
                })
            }
            None => {
                error!(what, backend = first.name(), error = %err, "Store read failed");
                Err(MediaError::storage(err.to_string()))
            }
        }
    }

    // =========================================================================
    // Media rows
    // =========================================================================

    pub fn media(&self) -> Result<Vec<MediaItem>> {
        self.read("media", |s| s.load_media())
    }

    pub fn upsert_media(&self, items: &[MediaItem]) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        self.write(
            "upsert_media",
            None,
            |s| s.upsert_media(items),
            |s, _| s.upsert_media(items).map(|_| ()),
        )
    }

    /// Moves an existing row to a new key, keeping its ratings, views, tags
    /// and favorites. Returns false if `old` was not tracked.
    pub fn remap(&self, old: &MediaKey, item: &MediaItem) -> Result<bool> {
        self.write(
            "remap",
            Some(old),
            |s| s.remap_media(old, item),
            |s, _| s.remap_media(old, item).map(|_| ()),
        )
    }

    /// Deletes the row for `key` and cascades to every dependent record.
    ///
    /// The file on disk is untouched. Returns false if the key was not tracked.
    pub fn soft_delete(&self, key: &MediaKey) -> Result<bool> {
        self.write(
            "soft_delete",
            Some(key),
            |s| s.delete_media(key),
            |s, _| s.delete_media(key).map(|_| ()),
        )
    }

    // =========================================================================
    // Ratings
    // =========================================================================

    /// Sets `user`'s rating for `key`. Values outside 1-5 are rejected
    /// before any storage is touched.
    pub fn set_rating(&self, key: &MediaKey, user: &str, value: i64) -> Result<()> {
        let rating = Rating::try_from(value)?;
        if user.trim().is_empty() {
            return Err(MediaError::validation("user id must not be empty"));
        }
        self.write(
            "set_rating",
            Some(key),
            |s| s.set_rating(key, user, rating),
            |s, _| s.set_rating(key, user, rating),
        )
    }

    /// Rating summary for one key. Unrated keys yield an empty summary.
    pub fn get_rating(&self, key: &MediaKey) -> Result<RatingSummary> {
        let rows = self.read("ratings", |s| s.load_ratings())?;
        let snapshot = RatingsSnapshot::from_rows(rows.iter().filter(|r| &r.media_key == key));
        Ok(snapshot.summary(key.as_str()).cloned().unwrap_or_default())
    }

    pub fn ratings(&self) -> Result<RatingsSnapshot> {
        let rows = self.read("ratings", |s| s.load_ratings())?;
        Ok(RatingsSnapshot::from_rows(&rows))
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn increment_view(&self, key: &MediaKey) -> Result<u64> {
        self.write(
            "increment_view",
            Some(key),
            |s| s.increment_view(key),
            |s, count| s.set_view_count(key, *count),
        )
    }

    pub fn get_views(&self, key: &MediaKey) -> Result<u64> {
        let views = self.views()?;
        Ok(views.get(key).copied().unwrap_or(0))
    }

    pub fn views(&self) -> Result<ViewCounts> {
        self.read("views", |s| s.load_views())
    }

    // =========================================================================
    // Tags
    // =========================================================================

    /// Adds a tag. Returns false if the key already carried it.
    pub fn add_tag(&self, key: &MediaKey, tag: &str) -> Result<bool> {
        let tag = normalize_tag(tag)?;
        self.write(
            "add_tag",
            Some(key),
            |s| s.add_tag(key, &tag),
            |s, _| s.add_tag(key, &tag).map(|_| ()),
        )
    }

    pub fn remove_tag(&self, key: &MediaKey, tag: &str) -> Result<bool> {
        let tag = normalize_tag(tag)?;
        self.write(
            "remove_tag",
            Some(key),
            |s| s.remove_tag(key, &tag),
            |s, _| s.remove_tag(key, &tag).map(|_| ()),
        )
    }

    pub fn get_tags(&self, key: &MediaKey) -> Result<BTreeSet<String>> {
        let mut tags = self.tags()?;
        Ok(tags.remove(key).unwrap_or_default())
    }

    pub fn tags(&self) -> Result<TagMap> {
        self.read("tags", |s| s.load_tags())
    }

    // =========================================================================
    // Favorites
    // =========================================================================

    /// Flips favorite membership; returns true if `key` is now a favorite.
    pub fn toggle_favorite(&self, key: &MediaKey) -> Result<bool> {
        self.write(
            "toggle_favorite",
            Some(key),
            |s| s.toggle_favorite(key),
            |s, favorite| s.set_favorite(key, *favorite),
        )
    }

    pub fn get_favorites(&self) -> Result<FavoriteSet> {
        self.read("favorites", |s| s.load_favorites())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// One-time import of the flat files into the relational store.
    ///
    /// Only runs when the relational tables are empty and the flat files hold
    /// data, so running it again is a no-op.
    pub fn migrate_from_flat_files(&self) -> Result<MigrationReport> {
        let Some(fallback) = &self.fallback else {
            return Ok(MigrationReport::default());
        };
        migration::migrate(self.primary.as_ref(), fallback.as_ref()).map_err(|e| {
            error!(error = %e, "Flat-file migration failed");
            MediaError::storage(e.to_string())
        })
    }

    /// Fills empty flat files from the relational store so the fallback is usable.
    fn seed_mirror(&self) {
        if let Some(fallback) = &self.fallback {
            if let Err(e) = migration::seed(self.primary.as_ref(), fallback.as_ref()) {
                warn!(error = %e, "Failed to seed flat-file mirror");
            }
        }
    }

    /// Leaves degraded mode by replaying the flat files into the primary.
    ///
    /// Returns true if the layer was degraded and is now healthy again.
    pub fn try_recover(&self) -> bool {
        if !self.is_degraded() {
            return false;
        }
        let Some(fallback) = &self.fallback else {
            return false;
        };

        // No fallback write may land between the export and the flag clear
        let _recovery = self.recovery.write();
        if !self.is_degraded() {
            return false;
        }
        let result = fallback
            .export_snapshot()
            .and_then(|snapshot| {
                self.with_retry(self.primary.as_ref(), &|s: &dyn Storage| {
                    s.import_snapshot(&snapshot, true)
                })
            });

        match result {
            Ok(()) => {
                self.degraded.store(false, Ordering::Release);
                info!(backend = self.primary.name(), "Primary store recovered, resynced from flat files");
                true
            }
            Err(e) => {
                debug!(error = %e, "Primary store still unavailable");
                false
            }
        }
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.read("stats", |s| s.stats())
    }
}

fn normalize_tag(tag: &str) -> Result<String> {
    let tag = tag.trim();
    if tag.is_empty() {
        return Err(MediaError::validation("tag must not be empty"));
    }
    Ok(tag.to_string())
}
