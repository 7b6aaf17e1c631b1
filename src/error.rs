//! Error types for the metadata subsystem.
//!
//! `MediaError` is the only error the public API returns. Its messages are
//! deliberately generic; backend detail is logged where the failure happens.

use thiserror::Error;

/// Errors surfaced to callers of the persistence layer and the cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// Input rejected before touching storage (e.g. a rating outside 1-5).
    #[error("invalid input: {0}")]
    Validation(String),
    /// The media key is not known to the store.
    #[error("media not found")]
    NotFound(String),
    /// Both storage backends failed for this operation.
    #[error("storage unavailable")]
    Storage(String),
    /// The store stayed busy after every retry.
    #[error("storage busy")]
    Concurrency(String),
}

impl MediaError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

pub type Result<T, E = MediaError> = std::result::Result<T, E>;

/// Errors raised inside a single storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown media key {0}")]
    UnknownKey(String),
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// True when the backend reported a busy/locked condition worth retrying.
    pub fn is_busy(&self) -> bool {
        match self {
            BackendError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Reasons a watcher event loop stops. Handled by the supervisor.
#[derive(Debug, Error)]
pub enum WatcherFault {
    #[error("failed to start filesystem watcher: {0}")]
    Init(#[from] notify::Error),
    #[error("no media root exists: {0}")]
    MissingRoot(String),
    #[error("set of watchable roots changed")]
    RootsChanged,
    #[error("watcher backend error: {0}")]
    Backend(String),
    #[error("event channel disconnected")]
    Disconnected,
}

/// Reasons a thumbnail job fails. Converted into `ThumbnailStatus::Failed`.
#[derive(Debug, Error)]
pub enum ThumbnailFault {
    #[error("frame extractor could not be started: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("frame extractor exited with {0}")]
    Extractor(String),
    #[error("decode/encode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("source vanished")]
    SourceMissing,
}
