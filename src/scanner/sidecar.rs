//! Sidecar metadata files.
//!
//! A media file `clip.mp4` may be accompanied by `clip.mp4.json` carrying
//! externally authored tags:
//!
//! ```json
//! { "tags": ["concert", "2019"] }
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::models::MediaType;

const SIDECAR_EXT: &str = "json";

#[derive(Debug, Default, Deserialize)]
struct Sidecar {
    #[serde(default)]
    tags: Vec<String>,
}

/// `clip.mp4` -> `clip.mp4.json`
pub fn sidecar_path(media: &Path) -> PathBuf {
    let mut name = media.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXT);
    PathBuf::from(name)
}

/// `clip.mp4.json` -> `clip.mp4`, if `path` is a sidecar of a media file.
pub fn media_for_sidecar(path: &Path) -> Option<PathBuf> {
    if path.extension()? != SIDECAR_EXT {
        return None;
    }
    let media = path.with_extension("");
    MediaType::from_path(&media).map(|_| media)
}

/// Reads the tags of `media`'s sidecar. Missing or malformed sidecars yield none.
pub fn read_sidecar_tags(media: &Path) -> Vec<String> {
    let path = sidecar_path(media);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(?path, error = %e, "Failed to read sidecar");
            return Vec::new();
        }
    };

    match serde_json::from_slice::<Sidecar>(&bytes) {
        Ok(sidecar) => sidecar
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        Err(e) => {
            warn!(?path, error = %e, "Ignoring malformed sidecar");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sidecar_naming() {
        let media = Path::new("/v/clip.mp4");
        let sidecar = sidecar_path(media);
        assert_eq!(sidecar, Path::new("/v/clip.mp4.json"));
        assert_eq!(media_for_sidecar(&sidecar).unwrap(), media);

        assert!(media_for_sidecar(Path::new("/v/notes.json")).is_none());
        assert!(media_for_sidecar(Path::new("/v/clip.mp4")).is_none());
    }

    #[test]
    fn test_read_tags() {
        let dir = tempdir().unwrap();
        let media = dir.path().join("clip.webm");
        fs::write(sidecar_path(&media), r#"{"tags": [" live ", "", "2019"], "title": "x"}"#).unwrap();
        assert_eq!(read_sidecar_tags(&media), vec!["live", "2019"]);
    }

    #[test]
    fn test_missing_or_malformed_is_empty() {
        let dir = tempdir().unwrap();
        let media = dir.path().join("clip.webm");
        assert!(read_sidecar_tags(&media).is_empty());
        fs::write(sidecar_path(&media), b"{not json").unwrap();
        assert!(read_sidecar_tags(&media).is_empty());
    }
}
