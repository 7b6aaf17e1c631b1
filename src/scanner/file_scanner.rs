//! File scanner for discovering media files under the media roots.
//!
//! This module provides the `FileScanner` struct which handles:
//! - Recursive directory scanning using walkdir
//! - Media type detection by file extension, per root
//! - Stat collection (size, mtime) for each discovered file
//!
//! Hashing and store updates happen in the indexer; the scanner only lists.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use tokio::task;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::models::{MediaKey, MediaType};
use crate::scanner::MediaRoots;

/// Configuration for the file scanner.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Maximum directory depth (0 = unlimited).
    pub max_depth: usize,
    /// Whether to follow symbolic links.
    pub follow_symlinks: bool,
    /// Whether to include dot-files and dot-directories.
    pub include_hidden: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_depth: 0, // unlimited
            follow_symlinks: false,
            include_hidden: false,
        }
    }
}

/// A media file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEntry {
    pub path: PathBuf,
    pub key: MediaKey,
    pub media_type: MediaType,
    pub size: i64,
    pub mtime: i64,
}

/// Result of a completed scan.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Every media file found, sorted by key.
    pub entries: Vec<DiscoveredEntry>,
    pub videos: usize,
    pub images: usize,
    /// Roots that did not exist or could not be read.
    pub missing_roots: Vec<PathBuf>,
}

/// Scanner over both media roots.
#[derive(Debug, Clone)]
pub struct FileScanner {
    roots: MediaRoots,
    config: ScanConfig,
}

impl FileScanner {
    pub fn new(roots: MediaRoots) -> Self {
        Self {
            roots,
            config: ScanConfig::default(),
        }
    }

    pub fn with_config(roots: MediaRoots, config: ScanConfig) -> Self {
        Self { roots, config }
    }

    pub fn roots(&self) -> &MediaRoots {
        &self.roots
    }

    /// Scans both roots on a blocking thread.
    pub async fn scan(&self) -> Result<ScanResult> {
        let scanner = self.clone();
        task::spawn_blocking(move || scanner.scan_sync())
            .await
            .context("Scan task panicked")
    }

    /// Synchronous scan of both roots.
    pub fn scan_sync(&self) -> ScanResult {
        let mut result = ScanResult::default();
        for (media_type, root) in self.roots.iter() {
            if !root.is_dir() {
                warn!(?root, "Media root missing, skipping");
                result.missing_roots.push(root.to_path_buf());
                continue;
            }
            let found = self.discover(root, media_type);
            debug!(?root, count = found.len(), "Scanned media root");
            match media_type {
                MediaType::Video => result.videos += found.len(),
                MediaType::Image => result.images += found.len(),
            }
            result.entries.extend(found);
        }
        result.entries.sort_by(|a, b| a.key.cmp(&b.key));
        result.entries.dedup_by(|a, b| a.key == b.key && a.media_type == b.media_type);

        info!(
            videos = result.videos,
            images = result.images,
            "Scan complete"
        );
        result
    }

    /// Lists the files of one type under one root.
    fn discover(&self, root: &Path, media_type: MediaType) -> Vec<DiscoveredEntry> {
        let mut walker = WalkDir::new(root).follow_links(self.config.follow_symlinks);
        if self.config.max_depth > 0 {
            walker = walker.max_depth(self.config.max_depth);
        }

        let include_hidden = self.config.include_hidden;
        let mut entries = Vec::new();

        let iter = walker
            .into_iter()
            .filter_entry(|e| include_hidden || e.depth() == 0 || !is_hidden(e.file_name()));

        for entry in iter {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Error walking media root");
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }

            let path = entry.path();
            if MediaType::from_path(path) != Some(media_type) {
                continue;
            }
            let Some((_, key)) = self.roots.key_for(path) else {
                continue;
            };

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to read metadata for {:?}: {}", path, e);
                    continue;
                }
            };
            let (size, mtime) = size_and_mtime(&metadata);

            entries.push(DiscoveredEntry {
                path: path.to_path_buf(),
                key,
                media_type,
                size,
                mtime,
            });
        }

        entries
    }

    /// Stats a single file and classifies it. `None` if it is gone or not media.
    pub fn stat(&self, path: &Path) -> Option<DiscoveredEntry> {
        let (media_type, key) = self.roots.key_for(path)?;
        let metadata = std::fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        let (size, mtime) = size_and_mtime(&metadata);
        Some(DiscoveredEntry {
            path: path.to_path_buf(),
            key,
            media_type,
            size,
            mtime,
        })
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}

/// Extracts (size, mtime seconds) from file metadata.
pub fn size_and_mtime(metadata: &Metadata) -> (i64, i64) {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    (metadata.len() as i64, mtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, MediaRoots) {
        let dir = tempdir().unwrap();
        let videos = dir.path().join("videos");
        let images = dir.path().join("images");
        fs::create_dir_all(videos.join("shows")).unwrap();
        fs::create_dir_all(images.join(".hidden")).unwrap();

        fs::write(videos.join("a.mp4"), b"a").unwrap();
        fs::write(videos.join("shows/b.mkv"), b"bb").unwrap();
        fs::write(videos.join("cover.jpg"), b"not indexed here").unwrap();
        fs::write(videos.join("a.mp4.json"), b"{}").unwrap();
        fs::write(images.join("c.png"), b"ccc").unwrap();
        fs::write(images.join(".hidden/d.png"), b"d").unwrap();

        (dir, MediaRoots::new(videos, images))
    }

    #[test]
    fn test_scan_both_roots() {
        let (_dir, roots) = setup();
        let result = FileScanner::new(roots).scan_sync();

        let keys: Vec<&str> = result.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a.mp4", "c.png", "shows/b.mkv"]);
        assert_eq!(result.videos, 2);
        assert_eq!(result.images, 1);
        assert_eq!(result.entries[2].size, 2);
    }

    #[test]
    fn test_missing_root_is_reported() {
        let (dir, _) = setup();
        let roots = MediaRoots::new(dir.path().join("videos"), dir.path().join("nope"));
        let result = FileScanner::new(roots).scan_sync();
        assert_eq!(result.missing_roots.len(), 1);
        assert_eq!(result.videos, 2);
    }

    #[test]
    fn test_stat_single_file() {
        let (_dir, roots) = setup();
        let scanner = FileScanner::new(roots.clone());
        let entry = scanner.stat(&roots.video.join("shows/b.mkv")).unwrap();
        assert_eq!(entry.key.as_str(), "shows/b.mkv");
        assert!(scanner.stat(&roots.video.join("gone.mp4")).is_none());
        assert!(scanner.stat(&roots.video.join("cover.jpg")).is_none());
    }

    #[tokio::test]
    async fn test_async_scan() {
        let (_dir, roots) = setup();
        let result = FileScanner::new(roots).scan().await.unwrap();
        assert_eq!(result.entries.len(), 3);
    }
}
