//! Mapping between absolute paths and media keys.

use std::path::{Path, PathBuf};

use crate::models::{MediaItem, MediaKey, MediaType};

/// The two media directories.
///
/// The video root only yields video keys and the image root only image keys,
/// so a key plus its media type always resolves to exactly one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRoots {
    pub video: PathBuf,
    pub image: PathBuf,
}

impl MediaRoots {
    pub fn new(video: impl Into<PathBuf>, image: impl Into<PathBuf>) -> Self {
        Self {
            video: video.into(),
            image: image.into(),
        }
    }

    pub fn root_for(&self, media_type: MediaType) -> &Path {
        match media_type {
            MediaType::Video => &self.video,
            MediaType::Image => &self.image,
        }
    }

    /// Classifies an absolute path. `None` for files outside both roots or
    /// with an extension the containing root does not index.
    pub fn key_for(&self, path: &Path) -> Option<(MediaType, MediaKey)> {
        let media_type = MediaType::from_path(path)?;
        let rel = path.strip_prefix(self.root_for(media_type)).ok()?;
        MediaKey::from_relative(rel).map(|key| (media_type, key))
    }

    pub fn resolve(&self, media_type: MediaType, key: &MediaKey) -> PathBuf {
        let mut path = self.root_for(media_type).to_path_buf();
        path.extend(key.as_str().split('/'));
        path
    }

    pub fn path_of(&self, item: &MediaItem) -> PathBuf {
        self.resolve(item.media_type, &item.key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (MediaType, &Path)> {
        [
            (MediaType::Video, self.video.as_path()),
            (MediaType::Image, self.image.as_path()),
        ]
        .into_iter()
    }
}
