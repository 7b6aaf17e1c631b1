//! Runtime configuration.
//!
//! All fields have defaults; a TOML file only needs to name what it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;

/// Environment variable naming the config file when no CLI argument is given.
pub const CONFIG_ENV: &str = "VIDCACHE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory holding video files.
    pub video_root: PathBuf,
    /// Root directory holding image files.
    pub image_root: PathBuf,
    /// Directory for the SQLite stores, flat files and thumbnails.
    pub data_dir: PathBuf,
    /// TTL for ratings/views/tags/favorites.
    pub cache_ttl_secs: u64,
    /// TTL for the media listing.
    pub media_list_ttl_secs: u64,
    /// Quiet period before a burst of filesystem events is applied.
    pub debounce_ms: u64,
    /// Interval between full reconciliation scans.
    pub reconcile_interval_secs: u64,
    /// Thumbnail worker count. `None` means max(1, cpus / 2).
    pub thumbnail_workers: Option<usize>,
    /// Target thumbnail height in pixels.
    pub thumbnail_height: u32,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Probe video durations with ffprobe while indexing.
    pub probe_durations: bool,
    /// Attempts against a busy relational store before falling back.
    pub store_retry_attempts: u32,
    /// Base delay of the exponential backoff between attempts.
    pub store_retry_base_ms: u64,
    /// Mirror committed writes into the flat files.
    pub mirror_flat_files: bool,
    /// Image served while a thumbnail is missing or failed.
    pub placeholder_thumbnail: Option<PathBuf>,
    /// User id for ratings written without an explicit user.
    pub default_user: String,
    /// Capacity of the raw filesystem event channel.
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video_root: PathBuf::from("videos"),
            image_root: PathBuf::from("images"),
            data_dir: default_data_dir(),
            cache_ttl_secs: 300,
            media_list_ttl_secs: 60,
            debounce_ms: 2000,
            reconcile_interval_secs: 600,
            thumbnail_workers: None,
            thumbnail_height: 180,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            probe_durations: true,
            store_retry_attempts: 3,
            store_retry_base_ms: 50,
            mirror_flat_files: true,
            placeholder_thumbnail: None,
            default_user: "local".to_string(),
            event_channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Loads the config from `path`, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(?path, "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the config path from the CLI argument or the environment.
    pub fn locate(arg: Option<String>) -> Option<PathBuf> {
        arg.or_else(|| std::env::var(CONFIG_ENV).ok())
            .map(PathBuf::from)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_ttl_secs == 0 || self.media_list_ttl_secs == 0 {
            bail!("cache TTLs must be positive");
        }
        if self.debounce_ms == 0 {
            bail!("debounce_ms must be positive");
        }
        if self.reconcile_interval_secs == 0 {
            bail!("reconcile_interval_secs must be positive");
        }
        if self.video_root.as_os_str().is_empty() || self.image_root.as_os_str().is_empty() {
            bail!("media roots must not be empty");
        }
        if self.store_retry_attempts == 0 {
            bail!("store_retry_attempts must be at least 1");
        }
        if self.event_channel_capacity == 0 {
            bail!("event_channel_capacity must be positive");
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn media_list_ttl(&self) -> Duration {
        Duration::from_secs(self.media_list_ttl_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.store_retry_base_ms)
    }

    pub fn worker_count(&self) -> usize {
        self.thumbnail_workers
            .unwrap_or_else(default_worker_count)
            .max(1)
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.data_dir.join("metadata.sqlite")
    }

    pub fn bookkeeping_db_path(&self) -> PathBuf {
        self.data_dir.join("bookkeeping.sqlite")
    }

    pub fn flat_file_dir(&self) -> PathBuf {
        self.data_dir.join("flat")
    }

    pub fn thumbnail_dir(&self) -> PathBuf {
        self.data_dir.join("thumbnails")
    }
}

/// max(1, available cpus / 2)
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / 2).max(1)
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("", "", "vidcache")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".vidcache"))
}
