//! One-directional flat-file to relational migration.

use tracing::{debug, info};

use crate::error::BackendError;
use crate::models::StoreStats;
use crate::store::Storage;

/// Outcome of [`migrate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// True if rows were imported on this run.
    pub migrated: bool,
    /// Row counts of the target after the run.
    pub stats: StoreStats,
}

fn is_empty(stats: &StoreStats) -> bool {
    *stats == StoreStats::default()
}

/// Imports everything in `source` into `target`.
///
/// Only runs when `target` holds no rows at all and `source` holds some,
/// so a second run is always a no-op.
pub fn migrate(target: &dyn Storage, source: &dyn Storage) -> Result<MigrationReport, BackendError> {
    let before = target.stats()?;
    if !is_empty(&before) {
        debug!(?before, "Relational store already populated, skipping migration");
        return Ok(MigrationReport {
            migrated: false,
            stats: before,
        });
    }

    let snapshot = source.export_snapshot()?;
    if snapshot.is_empty() {
        debug!("No flat-file data to migrate");
        return Ok(MigrationReport::default());
    }

    target.import_snapshot(&snapshot, false)?;
    let stats = target.stats()?;
    info!(
        from = source.name(),
        to = target.name(),
        media = stats.media,
        ratings = stats.ratings,
        views = stats.views,
        tags = stats.tags,
        favorites = stats.favorites,
        "Migration complete"
    );
    Ok(MigrationReport {
        migrated: true,
        stats,
    })
}

/// Copies `primary` into a mirror that tracks no media rows yet.
///
/// Returns true if anything was written.
pub fn seed(primary: &dyn Storage, mirror: &dyn Storage) -> Result<bool, BackendError> {
    if mirror.stats()?.media > 0 {
        return Ok(false);
    }
    let snapshot = primary.export_snapshot()?;
    if snapshot.is_empty() {
        return Ok(false);
    }
    mirror.import_snapshot(&snapshot, true)?;
    debug!(media = snapshot.media.len(), "Seeded flat-file mirror");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MediaKey;
    use crate::store::{FlatFileStorage, SqliteStorage};
    use std::fs;
    use tempfile::tempdir;

    fn legacy_dir() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("ratings.json"), r#"{"a.mp4": 4, "b.webm": 2}"#).unwrap();
        fs::write(dir.path().join("views.json"), r#"{"a.mp4": 3}"#).unwrap();
        fs::write(dir.path().join("tags.json"), r#"{"a.mp4": ["cats"]}"#).unwrap();
        fs::write(dir.path().join("favorites.json"), r#"{"favorites": ["c.mp4"]}"#).unwrap();
        dir
    }

    #[test]
    fn test_migration_is_idempotent() {
        let dir = legacy_dir();
        let flat = FlatFileStorage::open(dir.path(), "local").unwrap();
        let sqlite = SqliteStorage::open_in_memory().unwrap();

        let first = migrate(&sqlite, &flat).unwrap();
        assert!(first.migrated);
        assert_eq!(first.stats.media, 3);
        assert_eq!(first.stats.ratings, 2);
        assert_eq!(first.stats.views, 1);
        assert_eq!(first.stats.tags, 1);
        assert_eq!(first.stats.favorites, 1);

        let second = migrate(&sqlite, &flat).unwrap();
        assert!(!second.migrated);
        assert_eq!(second.stats, first.stats);
        assert_eq!(sqlite.stats().unwrap(), first.stats);
    }

    #[test]
    fn test_legacy_ratings_belong_to_default_user() {
        let dir = legacy_dir();
        let flat = FlatFileStorage::open(dir.path(), "local").unwrap();
        let sqlite = SqliteStorage::open_in_memory().unwrap();
        migrate(&sqlite, &flat).unwrap();

        let rows = sqlite.load_ratings().unwrap();
        assert!(rows.iter().all(|r| r.user_id == "local"));
        let a = rows.iter().find(|r| r.media_key == MediaKey::from("a.mp4")).unwrap();
        assert_eq!(a.value.get(), 4);
    }

    #[test]
    fn test_no_flat_files_is_noop() {
        let dir = tempdir().unwrap();
        let flat = FlatFileStorage::open(dir.path(), "local").unwrap();
        let sqlite = SqliteStorage::open_in_memory().unwrap();
        let report = migrate(&sqlite, &flat).unwrap();
        assert!(!report.migrated);
        assert_eq!(report.stats, StoreStats::default());
    }

    #[test]
    fn test_seed_fills_empty_mirror_once() {
        let legacy = legacy_dir();
        let source = FlatFileStorage::open(legacy.path(), "local").unwrap();
        let sqlite = SqliteStorage::open_in_memory().unwrap();
        migrate(&sqlite, &source).unwrap();

        let mirror_dir = tempdir().unwrap();
        let mirror = FlatFileStorage::open(mirror_dir.path(), "local").unwrap();
        assert!(seed(&sqlite, &mirror).unwrap());
        assert_eq!(mirror.stats().unwrap(), sqlite.stats().unwrap());
        assert!(!seed(&sqlite, &mirror).unwrap());
    }
}
