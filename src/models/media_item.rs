use std::borrow::Borrow;
use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "webp" | "gif" | "bmp" | "tiff" | "tif" => Some(Self::Image),
            "webm" | "mp4" | "mkv" | "avi" | "mov" | "m4v" | "wmv" | "flv" | "ogg" => {
                Some(Self::Video)
            }
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// Root-relative path of a media file, always with `/` separators.
///
/// This is the unique identity of a [`MediaItem`] and the key of every
/// per-media collection (ratings, views, tags, favorites).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaKey(String);

impl MediaKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Builds a key from a path relative to its media root.
    ///
    /// Returns `None` for paths that escape the root or contain no file name.
    pub fn from_relative(rel: &Path) -> Option<Self> {
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for MediaKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for MediaKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MediaKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MediaKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A media file as tracked by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub key: MediaKey,
    pub media_type: MediaType,
    /// Partial checksum (head hash + size), used for rename detection.
    pub checksum: String,
    pub size: i64,
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl MediaItem {
    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    /// Copies the identity-independent attributes of `other` onto `self`,
    /// keeping the original creation time.
    pub fn refresh_from(&mut self, other: &MediaItem) {
        self.media_type = other.media_type;
        self.checksum = other.checksum.clone();
        self.size = other.size;
        self.mtime = other.mtime;
        if other.duration_ms.is_some() {
            self.duration_ms = other.duration_ms;
        }
        self.updated_at = other.updated_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_media_type_from_extension() {
        assert_eq!(MediaType::from_extension("MP4"), Some(MediaType::Video));
        assert_eq!(MediaType::from_extension("jpeg"), Some(MediaType::Image));
        assert_eq!(MediaType::from_extension("txt"), None);
        assert_eq!(MediaType::from_path(Path::new("a/b.webm")), Some(MediaType::Video));
        assert_eq!(MediaType::from_path(Path::new("a/b")), None);
    }

    #[test]
    fn test_key_from_relative() {
        let key = MediaKey::from_relative(&PathBuf::from("shows").join("ep1.mkv")).unwrap();
        assert_eq!(key.as_str(), "shows/ep1.mkv");

        assert!(MediaKey::from_relative(Path::new("../escape.mp4")).is_none());
        assert!(MediaKey::from_relative(Path::new("")).is_none());
    }

    #[test]
    fn test_key_borrows_as_str() {
        let mut map = std::collections::HashMap::new();
        map.insert(MediaKey::from("a.mp4"), 1);
        assert_eq!(map.get("a.mp4"), Some(&1));
    }
}
