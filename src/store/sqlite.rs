//! SQLite backend for media metadata.
//!
//! This is the primary [`Storage`] implementation. It holds:
//! - Media rows (key, type, checksum, size, mtime, duration)
//! - Per-user ratings, view counts, tags and favorites, all keyed by media key
//!
//! Dependent tables reference `media(key)` with `ON DELETE CASCADE` and
//! `ON UPDATE CASCADE`, so deleting a row removes its metadata and remapping
//! a key (rename) carries the metadata along.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, Transaction};
use tracing::{debug, info};

use crate::error::BackendError;
use crate::models::{
    FavoriteSet, MediaItem, MediaKey, MediaType, Rating, RatingRow, Snapshot, StoreStats, TagMap,
    ViewCounts,
};
use crate::store::{now, Storage};

/// How long SQLite itself waits on a lock before reporting `SQLITE_BUSY`.
///
/// Kept short so the persistence layer's own backoff stays in charge.
const BUSY_TIMEOUT: Duration = Duration::from_millis(200);

/// SQLite-backed metadata storage.
///
/// A single connection guarded by a mutex; the database uses WAL mode so
/// other processes can read while we write.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Opens or creates the database at the specified path.
    ///
    /// Configures SQLite for this workload:
    /// - journal_mode = WAL (readers don't block the writer)
    /// - synchronous = NORMAL (balance between safety and speed)
    /// - foreign_keys = ON (required for the cascades)
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA cache_size = -16000;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;

        info!("Opened metadata store at {:?}", path);
        Ok(store)
    }

    /// Opens a private in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    /// Creates the database schema if it doesn't exist.
    fn create_tables(&self) -> Result<(), BackendError> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS media (
                key TEXT PRIMARY KEY NOT NULL,
                media_type INTEGER NOT NULL,
                checksum TEXT NOT NULL DEFAULT '',
                size INTEGER NOT NULL DEFAULT 0,
                mtime INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_media_checksum ON media(checksum);

            CREATE TABLE IF NOT EXISTS ratings (
                media_key TEXT NOT NULL
                    REFERENCES media(key) ON DELETE CASCADE ON UPDATE CASCADE,
                user_id TEXT NOT NULL,
                value INTEGER NOT NULL CHECK (value >= 1 AND value <= 5),
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (media_key, user_id)
            );

            CREATE TABLE IF NOT EXISTS views (
                media_key TEXT PRIMARY KEY NOT NULL
                    REFERENCES media(key) ON DELETE CASCADE ON UPDATE CASCADE,
                count INTEGER NOT NULL DEFAULT 0,
                last_viewed INTEGER,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tags (
                media_key TEXT NOT NULL
                    REFERENCES media(key) ON DELETE CASCADE ON UPDATE CASCADE,
                tag TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (media_key, tag)
            );

            CREATE INDEX IF NOT EXISTS idx_tags_tag ON tags(tag);

            CREATE TABLE IF NOT EXISTS favorites (
                media_key TEXT PRIMARY KEY NOT NULL
                    REFERENCES media(key) ON DELETE CASCADE ON UPDATE CASCADE,
                created_at INTEGER NOT NULL
            );
            ",
        )?;

        debug!("Database tables created/verified");
        Ok(())
    }

    /// Bumps `media.updated_at`, failing with `UnknownKey` if the row is missing.
    fn touch(tx: &Transaction, key: &MediaKey, ts: i64) -> Result<(), BackendError> {
        let rows = tx.execute(
            "UPDATE media SET updated_at = ?1 WHERE key = ?2",
            params![ts, key.as_str()],
        )?;
        if rows == 0 {
            return Err(BackendError::UnknownKey(key.to_string()));
        }
        Ok(())
    }

    fn upsert_media_in_tx(tx: &Transaction, items: &[MediaItem]) -> Result<usize, BackendError> {
        let mut stmt = tx.prepare_cached(
            "
            INSERT INTO media (
                key, media_type, checksum, size, mtime, duration_ms, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(key) DO UPDATE SET
                media_type = excluded.media_type,
                checksum = excluded.checksum,
                size = excluded.size,
                mtime = excluded.mtime,
                duration_ms = COALESCE(excluded.duration_ms, media.duration_ms),
                updated_at = excluded.updated_at
            ",
        )?;

        let mut count = 0;
        for item in items {
            stmt.execute(params![
                item.key.as_str(),
                media_type_to_int(item.media_type),
                item.checksum,
                item.size,
                item.mtime,
                item.duration_ms.map(|d| d as i64),
                item.created_at,
                item.updated_at,
            ])?;
            count += 1;
        }
        Ok(count)
    }

    /// Inserts placeholder media rows so imported metadata satisfies the foreign keys.
    fn ensure_media_rows(
        tx: &Transaction,
        keys: &BTreeSet<MediaKey>,
        ts: i64,
    ) -> Result<(), BackendError> {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO media (key, media_type, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
        )?;
        for key in keys {
            let media_type = MediaType::from_path(Path::new(key.as_str())).unwrap_or(MediaType::Video);
            stmt.execute(params![key.as_str(), media_type_to_int(media_type), ts])?;
        }
        Ok(())
    }

    fn count(conn: &Connection, table: &str) -> Result<usize, BackendError> {
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        Ok(count as usize)
    }
}

impl Storage for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    // =========================================================================
    // Media rows
    // =========================================================================

    fn load_media(&self) -> Result<Vec<MediaItem>, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "
            SELECT key, media_type, checksum, size, mtime, duration_ms, created_at, updated_at
            FROM media
            ORDER BY key
            ",
        )?;

        let items = stmt
            .query_map([], |row| {
                Ok(MediaItem {
                    key: MediaKey::new(row.get::<_, String>(0)?),
                    media_type: int_to_media_type(row.get(1)?),
                    checksum: row.get(2)?,
                    size: row.get(3)?,
                    mtime: row.get(4)?,
                    duration_ms: row.get::<_, Option<i64>>(5)?.map(|d| d as u64),
                    created_at: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(items)
    }

    fn upsert_media(&self, items: &[MediaItem]) -> Result<usize, BackendError> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let count = Self::upsert_media_in_tx(&tx, items)?;
        tx.commit()?;

        debug!("Batch upserted {} media items", count);
        Ok(count)
    }

    fn remap_media(&self, old: &MediaKey, item: &MediaItem) -> Result<bool, BackendError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if old != &item.key {
            // A row may already exist at the new key if it was indexed before
            // the rename was recognised; the old row's metadata wins.
            tx.execute("DELETE FROM media WHERE key = ?1", params![item.key.as_str()])?;
        }

        let rows = tx.execute(
            "
            UPDATE media SET
                key = ?1,
                media_type = ?2,
                checksum = ?3,
                size = ?4,
                mtime = ?5,
                duration_ms = COALESCE(?6, duration_ms),
                updated_at = ?7
            WHERE key = ?8
            ",
            params![
                item.key.as_str(),
                media_type_to_int(item.media_type),
                item.checksum,
                item.size,
                item.mtime,
                item.duration_ms.map(|d| d as i64),
                item.updated_at,
                old.as_str(),
            ],
        )?;
        tx.commit()?;

        Ok(rows > 0)
    }

    fn delete_media(&self, key: &MediaKey) -> Result<bool, BackendError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        // The foreign keys cascade, but connections opened without
        // `foreign_keys = ON` (older tooling) would leave orphans behind.
        for table in ["ratings", "views", "tags", "favorites"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE media_key = ?1"),
                params![key.as_str()],
            )?;
        }
        let rows = tx.execute("DELETE FROM media WHERE key = ?1", params![key.as_str()])?;
        tx.commit()?;
        Ok(rows > 0)
    }

    // =========================================================================
    // Ratings
    // =========================================================================

    fn load_ratings(&self) -> Result<Vec<RatingRow>, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT media_key, user_id, value, created_at FROM ratings ORDER BY media_key, user_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // The CHECK constraint keeps values in range; anything else is skipped.
        Ok(rows
            .into_iter()
            .filter_map(|(key, user, value, created_at)| {
                Rating::try_from(value).ok().map(|value| RatingRow {
                    media_key: MediaKey::new(key),
                    user_id: user,
                    value,
                    created_at,
                })
            })
            .collect())
    }

    fn set_rating(&self, key: &MediaKey, user: &str, value: Rating) -> Result<(), BackendError> {
        let ts = now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::touch(&tx, key, ts)?;
        tx.execute(
            "
            INSERT INTO ratings (media_key, user_id, value, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(media_key, user_id) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            ",
            params![key.as_str(), user, value.get(), ts],
        )?;
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Views
    // =========================================================================

    fn load_views(&self) -> Result<ViewCounts, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT media_key, count FROM views")?;
        let views = stmt
            .query_map([], |row| {
                Ok((
                    MediaKey::new(row.get::<_, String>(0)?),
                    row.get::<_, i64>(1)?.max(0) as u64,
                ))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(views)
    }

    fn increment_view(&self, key: &MediaKey) -> Result<u64, BackendError> {
        let ts = now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::touch(&tx, key, ts)?;
        tx.execute(
            "
            INSERT INTO views (media_key, count, last_viewed, updated_at)
            VALUES (?1, 1, ?2, ?2)
            ON CONFLICT(media_key) DO UPDATE SET
                count = count + 1,
                last_viewed = excluded.last_viewed,
                updated_at = excluded.updated_at
            ",
            params![key.as_str(), ts],
        )?;
        let count: i64 = tx.query_row(
            "SELECT count FROM views WHERE media_key = ?1",
            params![key.as_str()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(count.max(0) as u64)
    }

    fn set_view_count(&self, key: &MediaKey, count: u64) -> Result<(), BackendError> {
        let ts = now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::touch(&tx, key, ts)?;
        tx.execute(
            "
            INSERT INTO views (media_key, count, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(media_key) DO UPDATE SET
                count = MAX(count, excluded.count),
                updated_at = excluded.updated_at
            ",
            params![key.as_str(), count as i64, ts],
        )?;
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Tags
    // =========================================================================

    fn load_tags(&self) -> Result<TagMap, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT media_key, tag FROM tags")?;
        let mut tags = TagMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, tag) = row?;
            tags.entry(MediaKey::new(key)).or_default().insert(tag);
        }
        Ok(tags)
    }

    fn add_tag(&self, key: &MediaKey, tag: &str) -> Result<bool, BackendError> {
        let ts = now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::touch(&tx, key, ts)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO tags (media_key, tag, created_at) VALUES (?1, ?2, ?3)",
            params![key.as_str(), tag, ts],
        )?;
        tx.commit()?;
        Ok(inserted > 0)
    }

    fn remove_tag(&self, key: &MediaKey, tag: &str) -> Result<bool, BackendError> {
        let ts = now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::touch(&tx, key, ts)?;
        let removed = tx.execute(
            "DELETE FROM tags WHERE media_key = ?1 AND tag = ?2",
            params![key.as_str(), tag],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    // =========================================================================
    // Favorites
    // =========================================================================

    fn load_favorites(&self) -> Result<FavoriteSet, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT media_key FROM favorites")?;
        let favorites = stmt
            .query_map([], |row| Ok(MediaKey::new(row.get::<_, String>(0)?)))?
            .collect::<Result<FavoriteSet, _>>()?;
        Ok(favorites)
    }

    /// Toggles favorite status; returns true if the item is now favorited.
    fn toggle_favorite(&self, key: &MediaKey) -> Result<bool, BackendError> {
        let ts = now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::touch(&tx, key, ts)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO favorites (media_key, created_at) VALUES (?1, ?2)",
            params![key.as_str(), ts],
        )?;
        if inserted == 0 {
            tx.execute("DELETE FROM favorites WHERE media_key = ?1", params![key.as_str()])?;
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    fn set_favorite(&self, key: &MediaKey, favorite: bool) -> Result<(), BackendError> {
        let ts = now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::touch(&tx, key, ts)?;
        if favorite {
            tx.execute(
                "INSERT OR IGNORE INTO favorites (media_key, created_at) VALUES (?1, ?2)",
                params![key.as_str(), ts],
            )?;
        } else {
            tx.execute("DELETE FROM favorites WHERE media_key = ?1", params![key.as_str()])?;
        }
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Bulk import/export
    // =========================================================================

    fn export_snapshot(&self) -> Result<Snapshot, BackendError> {
        Ok(Snapshot {
            media: self.load_media()?,
            ratings: self.load_ratings()?,
            views: self.load_views()?,
            tags: self.load_tags()?,
            favorites: self.load_favorites()?,
        })
    }

    fn import_snapshot(&self, snapshot: &Snapshot, replace: bool) -> Result<(), BackendError> {
        let ts = now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if replace {
            for table in ["ratings", "views", "tags", "favorites", "media"] {
                tx.execute(&format!("DELETE FROM {table}"), [])?;
            }
        }

        Self::upsert_media_in_tx(&tx, &snapshot.media)?;
        Self::ensure_media_rows(&tx, &snapshot.referenced_keys(), ts)?;

        {
            let mut stmt = tx.prepare_cached(
                "
                INSERT INTO ratings (media_key, user_id, value, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(media_key, user_id) DO UPDATE SET value = excluded.value
                ",
            )?;
            for row in &snapshot.ratings {
                let created = if row.created_at > 0 { row.created_at } else { ts };
                stmt.execute(params![
                    row.media_key.as_str(),
                    row.user_id,
                    row.value.get(),
                    created,
                    ts
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare_cached(
                "
                INSERT INTO views (media_key, count, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(media_key) DO UPDATE SET count = excluded.count
                ",
            )?;
            for (key, count) in &snapshot.views {
                stmt.execute(params![key.as_str(), *count as i64, ts])?;
            }
        }
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO tags (media_key, tag, created_at) VALUES (?1, ?2, ?3)",
            )?;
            for (key, tags) in &snapshot.tags {
                for tag in tags {
                    stmt.execute(params![key.as_str(), tag, ts])?;
                }
            }
        }
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO favorites (media_key, created_at) VALUES (?1, ?2)",
            )?;
            for key in &snapshot.favorites {
                stmt.execute(params![key.as_str(), ts])?;
            }
        }

        tx.commit()?;
        info!(
            media = snapshot.media.len(),
            ratings = snapshot.ratings.len(),
            replace,
            "Imported metadata snapshot"
        );
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats, BackendError> {
        let conn = self.conn.lock();
        Ok(StoreStats {
            media: Self::count(&conn, "media")?,
            ratings: Self::count(&conn, "ratings")?,
            views: Self::count(&conn, "views")?,
            tags: Self::count(&conn, "tags")?,
            favorites: Self::count(&conn, "favorites")?,
        })
    }
}

// =========================================================================
// Helper Functions
// =========================================================================

/// Converts MediaType enum to integer for storage.
fn media_type_to_int(media_type: MediaType) -> i32 {
    match media_type {
        MediaType::Image => 0,
        MediaType::Video => 1,
    }
}

/// Converts stored integer back to MediaType enum.
fn int_to_media_type(value: i32) -> MediaType {
    match value {
        0 => MediaType::Image,
        _ => MediaType::Video,
    }
}
