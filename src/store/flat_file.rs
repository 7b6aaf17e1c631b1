//! Flat per-field JSON files.
//!
//! One file per metadata kind in a single directory:
//! `media.json`, `ratings.json`, `views.json`, `tags.json`, `favorites.json`.
//! Every write rewrites the whole file through a temp file and an atomic
//! rename, so readers never see a half-written file.
//!
//! The reader also accepts the legacy single-user layouts
//! (`{"clip.mp4": 4}` for ratings, a bare list for favorites).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BackendError;
use crate::models::{
    FavoriteSet, MediaItem, MediaKey, MediaType, Rating, RatingRow, Snapshot, StoreStats, TagMap,
    ViewCounts,
};
use crate::store::{now, Storage};

const MEDIA_FILE: &str = "media.json";
const RATINGS_FILE: &str = "ratings.json";
const VIEWS_FILE: &str = "views.json";
const TAGS_FILE: &str = "tags.json";
const FAVORITES_FILE: &str = "favorites.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RatingsEntry {
    Legacy(i64),
    PerUser(BTreeMap<String, i64>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum FavoritesFile {
    Wrapped { favorites: Vec<String> },
    Bare(Vec<String>),
}

impl FavoritesFile {
    fn into_keys(self) -> Vec<String> {
        match self {
            Self::Wrapped { favorites } | Self::Bare(favorites) => favorites,
        }
    }
}

/// JSON-file storage backend.
pub struct FlatFileStorage {
    dir: PathBuf,
    /// User that legacy single-user ratings are attributed to.
    legacy_user: String,
    /// Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl FlatFileStorage {
    pub fn open(dir: &Path, legacy_user: &str) -> Result<Self, BackendError> {
        fs::create_dir_all(dir)?;
        debug!(?dir, "Opened flat-file store");
        Ok(Self {
            dir: dir.to_path_buf(),
            legacy_user: legacy_user.to_string(),
            lock: Mutex::new(()),
        })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Reads a file, treating a missing file as empty.
    fn read_file<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T, BackendError> {
        match fs::read(self.path(file)) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(T::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_file<T: Serialize>(&self, file: &str, value: &T) -> Result<(), BackendError> {
        let target = self.path(file);
        let tmp = self.path(&format!(".{file}.tmp"));
        {
            let mut out = fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut out, value)?;
            out.write_all(b"\n")?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn read_media(&self) -> Result<Vec<MediaItem>, BackendError> {
        self.read_file(MEDIA_FILE)
    }

    fn read_ratings(&self) -> Result<BTreeMap<String, BTreeMap<String, i64>>, BackendError> {
        let raw: BTreeMap<String, RatingsEntry> = self.read_file(RATINGS_FILE)?;
        Ok(raw
            .into_iter()
            .map(|(key, entry)| {
                let users = match entry {
                    RatingsEntry::Legacy(value) => {
                        BTreeMap::from([(self.legacy_user.clone(), value)])
                    }
                    RatingsEntry::PerUser(users) => users,
                };
                (key, users)
            })
            .collect())
    }

    fn write_ratings(&self, ratings: &BTreeMap<String, BTreeMap<String, i64>>) -> Result<(), BackendError> {
        self.write_file(RATINGS_FILE, ratings)
    }

    fn read_views(&self) -> Result<BTreeMap<String, u64>, BackendError> {
        self.read_file(VIEWS_FILE)
    }

    fn read_tags(&self) -> Result<BTreeMap<String, BTreeSet<String>>, BackendError> {
        self.read_file(TAGS_FILE)
    }

    fn read_favorites(&self) -> Result<Vec<String>, BackendError> {
        match fs::read(self.path(FAVORITES_FILE)) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice::<FavoritesFile>(&bytes)?.into_keys()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_favorites(&self, favorites: Vec<String>) -> Result<(), BackendError> {
        self.write_file(FAVORITES_FILE, &FavoritesFile::Wrapped { favorites })
    }

    /// Fails with `UnknownKey` unless `key` has a media row.
    ///
    /// Legacy directories have no `media.json`; the check is skipped there.
    fn require_key(&self, key: &MediaKey) -> Result<(), BackendError> {
        if !self.path(MEDIA_FILE).exists() {
            return Ok(());
        }
        if self.read_media()?.iter().any(|m| &m.key == key) {
            Ok(())
        } else {
            Err(BackendError::UnknownKey(key.to_string()))
        }
    }

    /// Moves every per-key record from `old` to `new`, or drops it when `new` is `None`.
    fn rekey_all(&self, old: &str, new: Option<&str>) -> Result<(), BackendError> {
        fn rekey<V>(map: &mut BTreeMap<String, V>, old: &str, new: Option<&str>) -> bool {
            match map.remove(old) {
                Some(value) => {
                    if let Some(new) = new {
                        map.insert(new.to_string(), value);
                    }
                    true
                }
                None => {
                    if let Some(new) = new {
                        // The row at the new key is replaced by the old one.
                        return map.remove(new).is_some();
                    }
                    false
                }
            }
        }

        let mut ratings = self.read_ratings()?;
        if rekey(&mut ratings, old, new) {
            self.write_ratings(&ratings)?;
        }
        let mut views = self.read_views()?;
        if rekey(&mut views, old, new) {
            self.write_file(VIEWS_FILE, &views)?;
        }
        let mut tags = self.read_tags()?;
        if rekey(&mut tags, old, new) {
            self.write_file(TAGS_FILE, &tags)?;
        }

        let mut favorites = self.read_favorites()?;
        let before = favorites.len();
        let was_favorite = favorites.iter().any(|f| f == old);
        favorites.retain(|f| f != old && Some(f.as_str()) != new);
        if let (Some(new), true) = (new, was_favorite) {
            favorites.push(new.to_string());
        }
        if favorites.len() != before || was_favorite {
            self.write_favorites(favorites)?;
        }
        Ok(())
    }
}

impl Storage for FlatFileStorage {
    fn name(&self) -> &'static str {
        "flat-file"
    }

    fn load_media(&self) -> Result<Vec<MediaItem>, BackendError> {
        let mut media = self.read_media()?;
        media.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(media)
    }

    fn upsert_media(&self, items: &[MediaItem]) -> Result<usize, BackendError> {
        let _guard = self.lock.lock();
        let mut media = self.read_media()?;
        let mut index: HashMap<MediaKey, usize> = media
            .iter()
            .enumerate()
            .map(|(i, m)| (m.key.clone(), i))
            .collect();

        for item in items {
            match index.get(&item.key) {
                Some(&i) => media[i].refresh_from(item),
                None => {
                    index.insert(item.key.clone(), media.len());
                    media.push(item.clone());
                }
            }
        }
        self.write_file(MEDIA_FILE, &media)?;
        Ok(items.len())
    }

    fn remap_media(&self, old: &MediaKey, item: &MediaItem) -> Result<bool, BackendError> {
        let _guard = self.lock.lock();
        let mut media = self.read_media()?;
        if !media.iter().any(|m| &m.key == old) {
            return Ok(false);
        }
        if old != &item.key {
            media.retain(|m| m.key != item.key);
        }
        if let Some(row) = media.iter_mut().find(|m| &m.key == old) {
            row.key = item.key.clone();
            row.refresh_from(item);
        }
        self.write_file(MEDIA_FILE, &media)?;

        if old != &item.key {
            self.rekey_all(old.as_str(), Some(item.key.as_str()))?;
        }
        Ok(true)
    }

    fn delete_media(&self, key: &MediaKey) -> Result<bool, BackendError> {
        let _guard = self.lock.lock();
        let mut media = self.read_media()?;
        let before = media.len();
        media.retain(|m| &m.key != key);
        let removed = media.len() != before;
        if removed {
            self.write_file(MEDIA_FILE, &media)?;
        }
        self.rekey_all(key.as_str(), None)?;
        Ok(removed)
    }

    fn load_ratings(&self) -> Result<Vec<RatingRow>, BackendError> {
        let mut rows = Vec::new();
        for (key, users) in self.read_ratings()? {
            for (user, value) in users {
                match Rating::try_from(value) {
                    Ok(value) => rows.push(RatingRow {
                        media_key: MediaKey::new(key.clone()),
                        user_id: user,
                        value,
                        created_at: 0,
                    }),
                    Err(_) => warn!(%key, value, "Skipping out-of-range rating in flat file"),
                }
            }
        }
        Ok(rows)
    }

    fn set_rating(&self, key: &MediaKey, user: &str, value: Rating) -> Result<(), BackendError> {
        let _guard = self.lock.lock();
        self.require_key(key)?;
        let mut ratings = self.read_ratings()?;
        ratings
            .entry(key.to_string())
            .or_default()
            .insert(user.to_string(), value.into());
        self.write_ratings(&ratings)
    }

    fn load_views(&self) -> Result<ViewCounts, BackendError> {
        Ok(self
            .read_views()?
            .into_iter()
            .map(|(k, v)| (MediaKey::new(k), v))
            .collect())
    }

    fn increment_view(&self, key: &MediaKey) -> Result<u64, BackendError> {
        let _guard = self.lock.lock();
        self.require_key(key)?;
        let mut views = self.read_views()?;
        let count = views.entry(key.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        self.write_file(VIEWS_FILE, &views)?;
        Ok(count)
    }

    fn set_view_count(&self, key: &MediaKey, count: u64) -> Result<(), BackendError> {
        let _guard = self.lock.lock();
        self.require_key(key)?;
        let mut views = self.read_views()?;
        let current = views.entry(key.to_string()).or_insert(0);
        if *current >= count {
            return Ok(());
        }
        *current = count;
        self.write_file(VIEWS_FILE, &views)
    }

    fn load_tags(&self) -> Result<TagMap, BackendError> {
        Ok(self
            .read_tags()?
            .into_iter()
            .filter(|(_, tags)| !tags.is_empty())
            .map(|(k, v)| (MediaKey::new(k), v))
            .collect())
    }

    fn add_tag(&self, key: &MediaKey, tag: &str) -> Result<bool, BackendError> {
        let _guard = self.lock.lock();
        self.require_key(key)?;
        let mut tags = self.read_tags()?;
        let inserted = tags.entry(key.to_string()).or_default().insert(tag.to_string());
        if inserted {
            self.write_file(TAGS_FILE, &tags)?;
        }
        Ok(inserted)
    }

    fn remove_tag(&self, key: &MediaKey, tag: &str) -> Result<bool, BackendError> {
        let _guard = self.lock.lock();
        self.require_key(key)?;
        let mut tags = self.read_tags()?;
        let removed = match tags.get_mut(key.as_str()) {
            Some(set) => {
                let removed = set.remove(tag);
                if set.is_empty() {
                    tags.remove(key.as_str());
                }
                removed
            }
            None => false,
        };
        if removed {
            self.write_file(TAGS_FILE, &tags)?;
        }
        Ok(removed)
    }

    fn load_favorites(&self) -> Result<FavoriteSet, BackendError> {
        Ok(self.read_favorites()?.into_iter().map(MediaKey::new).collect())
    }

    fn toggle_favorite(&self, key: &MediaKey) -> Result<bool, BackendError> {
        let _guard = self.lock.lock();
        self.require_key(key)?;
        let mut favorites = self.read_favorites()?;
        let now_favorite = if favorites.iter().any(|f| f == key.as_str()) {
            favorites.retain(|f| f != key.as_str());
            false
        } else {
            favorites.push(key.to_string());
            true
        };
        self.write_favorites(favorites)?;
        Ok(now_favorite)
    }

    fn set_favorite(&self, key: &MediaKey, favorite: bool) -> Result<(), BackendError> {
        let _guard = self.lock.lock();
        self.require_key(key)?;
        let mut favorites = self.read_favorites()?;
        let present = favorites.iter().any(|f| f == key.as_str());
        match (present, favorite) {
            (false, true) => favorites.push(key.to_string()),
            (true, false) => favorites.retain(|f| f != key.as_str()),
            _ => return Ok(()),
        }
        self.write_favorites(favorites)
    }

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
        let _guard = self.lock.lock();

        let mut media = if replace { Vec::new() } else { self.read_media()? };
        let mut known: BTreeSet<MediaKey> = media.iter().map(|m| m.key.clone()).collect();
        for item in &snapshot.media {
            if known.insert(item.key.clone()) {
                media.push(item.clone());
            }
        }
        let ts = now();
        for key in snapshot.referenced_keys() {
            if known.insert(key.clone()) {
                let media_type =
                    MediaType::from_path(Path::new(key.as_str())).unwrap_or(MediaType::Video);
                media.push(MediaItem {
                    key,
                    media_type,
                    checksum: String::new(),
                    size: 0,
                    mtime: 0,
                    duration_ms: None,
                    created_at: ts,
                    updated_at: ts,
                });
            }
        }
        self.write_file(MEDIA_FILE, &media)?;

        let mut ratings = if replace { BTreeMap::new() } else { self.read_ratings()? };
        for row in &snapshot.ratings {
            ratings
                .entry(row.media_key.to_string())
                .or_default()
                .insert(row.user_id.clone(), row.value.into());
        }
        self.write_ratings(&ratings)?;

        let mut views = if replace { BTreeMap::new() } else { self.read_views()? };
        for (key, count) in &snapshot.views {
            views.insert(key.to_string(), *count);
        }
        self.write_file(VIEWS_FILE, &views)?;

        let mut tags = if replace { BTreeMap::new() } else { self.read_tags()? };
        for (key, set) in &snapshot.tags {
            tags.entry(key.to_string()).or_default().extend(set.iter().cloned());
        }
        self.write_file(TAGS_FILE, &tags)?;

        let mut favorites: BTreeSet<String> = if replace {
            BTreeSet::new()
        } else {
            self.read_favorites()?.into_iter().collect()
        };
        favorites.extend(snapshot.favorites.iter().map(|k| k.to_string()));
        self.write_favorites(favorites.into_iter().collect())
    }

    fn stats(&self) -> Result<StoreStats, BackendError> {
        Ok(StoreStats {
            media: self.read_media()?.len(),
            ratings: self.read_ratings()?.values().map(|u| u.len()).sum(),
            views: self.read_views()?.len(),
            tags: self.read_tags()?.values().map(|t| t.len()).sum(),
            favorites: self.read_favorites()?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::item;
    use tempfile::tempdir;

    #[test]
    fn test_reads_legacy_formats() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(RATINGS_FILE), r#"{"a.mp4": 4, "b.mp4": {"bob": 2}}"#).unwrap();
        fs::write(dir.path().join(FAVORITES_FILE), r#"{"favorites": ["a.mp4"]}"#).unwrap();
        fs::write(dir.path().join(VIEWS_FILE), r#"{"a.mp4": 12}"#).unwrap();
        fs::write(dir.path().join(TAGS_FILE), r#"{"a.mp4": ["cats", "cats", "dogs"]}"#).unwrap();

        let store = FlatFileStorage::open(dir.path(), "local").unwrap();
        let mut ratings = store.load_ratings().unwrap();
        ratings.sort_by(|a, b| a.media_key.cmp(&b.media_key));
        assert_eq!(ratings.len(), 2);
        assert_eq!(ratings[0].user_id, "local");
        assert_eq!(ratings[0].value.get(), 4);
        assert_eq!(ratings[1].user_id, "bob");

        assert!(store.load_favorites().unwrap().contains("a.mp4"));
        assert_eq!(store.load_views().unwrap().get("a.mp4"), Some(&12));
        assert_eq!(store.load_tags().unwrap()["a.mp4"].len(), 2);
    }

    #[test]
    fn test_bare_favorites_list() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(FAVORITES_FILE), r#"["x.mp4", "y.mp4"]"#).unwrap();
        let store = FlatFileStorage::open(dir.path(), "local").unwrap();
        assert_eq!(store.load_favorites().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_files_are_empty() {
        let dir = tempdir().unwrap();
        let store = FlatFileStorage::open(dir.path(), "local").unwrap();
        assert!(store.export_snapshot().unwrap().is_empty());
        assert_eq!(store.stats().unwrap(), StoreStats::default());
    }

    #[test]
    fn test_writes_are_atomic_and_leave_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = FlatFileStorage::open(dir.path(), "local").unwrap();
        store.upsert_media(&[item("a.mp4")]).unwrap();
        store.add_tag(&MediaKey::from("a.mp4"), "x").unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
        assert!(names.contains(&TAGS_FILE.to_string()));
    }

    #[test]
    fn test_unknown_key_once_media_tracked() {
        let dir = tempdir().unwrap();
        let store = FlatFileStorage::open(dir.path(), "local").unwrap();

        // No media.json yet: legacy mode accepts any key.
        store.increment_view(&MediaKey::from("legacy.mp4")).unwrap();

        store.upsert_media(&[item("a.mp4")]).unwrap();
        assert!(matches!(
            store.increment_view(&MediaKey::from("ghost.mp4")),
            Err(BackendError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_delete_and_remap() {
        let dir = tempdir().unwrap();
        let store = FlatFileStorage::open(dir.path(), "local").unwrap();
        store.upsert_media(&[item("a.mp4"), item("b.mp4")]).unwrap();
        let a = MediaKey::from("a.mp4");
        store.set_rating(&a, "local", Rating::try_from(5).unwrap()).unwrap();
        store.add_tag(&a, "keep").unwrap();
        store.toggle_favorite(&a).unwrap();

        assert!(store.remap_media(&a, &item("moved/a.mp4")).unwrap());
        let snapshot = store.export_snapshot().unwrap();
        assert_eq!(snapshot.media.len(), 2);
        assert_eq!(snapshot.ratings[0].media_key.as_str(), "moved/a.mp4");
        assert!(snapshot.favorites.contains("moved/a.mp4"));

        let moved = MediaKey::from("moved/a.mp4");
        assert!(store.delete_media(&moved).unwrap());
        let stats = store.stats().unwrap();
        assert_eq!(stats.media, 1);
        assert_eq!(stats.ratings, 0);
        assert_eq!(stats.tags, 0);
        assert_eq!(stats.favorites, 0);
    }
}
