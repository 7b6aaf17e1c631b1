//! Thumbnail bookkeeping store.
//!
//! Persists the terminal status of each thumbnail job in its own SQLite file,
//! so failed extractions are not retried on every startup.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::error::BackendError;
use crate::models::MediaKey;
use crate::store::now;
use crate::thumbnails::ThumbnailStatus;

pub struct ThumbnailLedger {
    conn: Mutex<Connection>,
}

impl ThumbnailLedger {
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.create_tables()?;
        info!("Opened thumbnail ledger at {:?}", path);
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, BackendError> {
        let ledger = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        ledger.create_tables()?;
        Ok(ledger)
    }

    fn create_tables(&self) -> Result<(), BackendError> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS thumbnails (
                media_key TEXT PRIMARY KEY NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                updated_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Records a terminal status. Non-terminal statuses are ignored.
    pub fn record(
        &self,
        key: &MediaKey,
        status: ThumbnailStatus,
        error: Option<&str>,
    ) -> Result<(), BackendError> {
        let label = match status {
            ThumbnailStatus::Done => "done",
            ThumbnailStatus::Failed => "failed",
            ThumbnailStatus::Pending | ThumbnailStatus::Running => return Ok(()),
        };
        self.conn.lock().execute(
            "
            INSERT INTO thumbnails (media_key, status, error, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(media_key) DO UPDATE SET
                status = excluded.status,
                error = excluded.error,
                updated_at = excluded.updated_at
            ",
            params![key.as_str(), label, error, now()],
        )?;
        Ok(())
    }

    pub fn forget(&self, key: &MediaKey) -> Result<(), BackendError> {
        self.conn
            .lock()
            .execute("DELETE FROM thumbnails WHERE media_key = ?1", params![key.as_str()])?;
        Ok(())
    }

    /// All recorded statuses.
    pub fn load(&self) -> Result<HashMap<MediaKey, ThumbnailStatus>, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT media_key, status FROM thumbnails")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (key, status) = row?;
            let status = match status.as_str() {
                "done" => ThumbnailStatus::Done,
                "failed" => ThumbnailStatus::Failed,
                other => {
                    debug!(%key, status = other, "Skipping unknown ledger status");
                    continue;
                }
            };
            map.insert(MediaKey::new(key), status);
        }
        Ok(map)
    }
}
