//! Read-through, write-invalidate cache over the persistence layer.
//!
//! Every collection is fetched whole: there is no per-key read path, so a
//! caller rendering a page reads each collection once and filters locally.
//! Each collection has its own lock, TTL and single-flight rebuild.

mod entry;

pub use entry::CacheEntry;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{MediaError, Result};
use crate::indexer::{ChangeKind, PathChange};
use crate::models::{FavoriteSet, MediaItem, MediaKey, RatingsSnapshot, SortKey, TagMap, ViewCounts};
use crate::scanner::MediaRoots;
use crate::store::PersistenceLayer;

/// An item related to another by shared tags.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedItem {
    pub item: MediaItem,
    /// Number of tags shared with the reference item.
    pub overlap: usize,
    pub rating: f64,
}

pub struct MetadataCache {
    store: Arc<PersistenceLayer>,
    roots: MediaRoots,
    media: CacheEntry<Vec<MediaItem>>,
    ratings: CacheEntry<RatingsSnapshot>,
    views: CacheEntry<ViewCounts>,
    tags: CacheEntry<TagMap>,
    favorites: CacheEntry<FavoriteSet>,
    /// Where vanished files are reported. Set once the watcher is running.
    orphan_sink: OnceCell<Sender<PathChange>>,
    /// Orphans already reported since the last media invalidation.
    reported: Mutex<HashSet<MediaKey>>,
}

impl MetadataCache {
    pub fn new(
        store: Arc<PersistenceLayer>,
        roots: MediaRoots,
        ttl: Duration,
        media_ttl: Duration,
    ) -> Self {
        Self {
            store,
            roots,
            media: CacheEntry::new("media", media_ttl),
            ratings: CacheEntry::new("ratings", ttl),
            views: CacheEntry::new("views", ttl),
            tags: CacheEntry::new("tags", ttl),
            favorites: CacheEntry::new("favorites", ttl),
            orphan_sink: OnceCell::new(),
            reported: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(store: Arc<PersistenceLayer>, config: &Config) -> Self {
        Self::new(
            store,
            MediaRoots::new(&config.video_root, &config.image_root),
            config.cache_ttl(),
            config.media_list_ttl(),
        )
    }

    /// Routes orphan removals through the watcher pipeline instead of
    /// deleting inline. Only the first call has an effect.
    pub fn set_orphan_sink(&self, sink: Sender<PathChange>) {
        if self.orphan_sink.set(sink).is_err() {
            debug!("Orphan sink already set");
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// All media whose backing file still exists, sorted.
    ///
    /// Items whose file has vanished are left out and reported for removal.
    pub fn get_all_media(&self, sort: SortKey, reverse: bool) -> Result<Vec<MediaItem>> {
        let all = self.media.get_with(|| self.store.media())?;

        let (mut live, orphans): (Vec<MediaItem>, Vec<&MediaItem>) = {
            let mut live = Vec::with_capacity(all.len());
            let mut orphans = Vec::new();
            for item in all.iter() {
                if self.roots.path_of(item).exists() {
                    live.push(item.clone());
                } else {
                    orphans.push(item);
                }
            }
            (live, orphans)
        };

        if !orphans.is_empty() {
            self.reap(&orphans);
        }

        self.sort(&mut live, sort)?;
        if reverse {
            live.reverse();
        }
        Ok(live)
    }

    pub fn get_ratings(&self) -> Result<Arc<RatingsSnapshot>> {
        self.ratings.get_with(|| self.store.ratings())
    }

    pub fn get_views(&self) -> Result<Arc<ViewCounts>> {
        self.views.get_with(|| self.store.views())
    }

    pub fn get_tags(&self) -> Result<Arc<TagMap>> {
        self.tags.get_with(|| self.store.tags())
    }

    pub fn get_favorites(&self) -> Result<Arc<FavoriteSet>> {
        self.favorites.get_with(|| self.store.get_favorites())
    }

    // =========================================================================
    // Derived views
    // =========================================================================

    /// Live items carrying a tag that contains `needle`, ignoring case.
    pub fn media_with_tag(&self, needle: &str) -> Result<Vec<MediaItem>> {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return Err(MediaError::validation("tag filter must not be empty"));
        }
        let tags = self.get_tags()?;
        let mut items = self.get_all_media(SortKey::Title, false)?;
        items.retain(|item| {
            tags.get(&item.key)
                .is_some_and(|set| set.iter().any(|t| t.to_lowercase().contains(&needle)))
        });
        Ok(items)
    }

    /// Up to `limit` live items sharing tags with `key`, most shared tags
    /// first, then highest average rating.
    pub fn related(&self, key: &MediaKey, limit: usize) -> Result<Vec<RelatedItem>> {
        let tags = self.get_tags()?;
        let Some(own) = tags.get(key).filter(|set| !set.is_empty()) else {
            return Ok(Vec::new());
        };
        let ratings = self.get_ratings()?;

        let mut related: Vec<RelatedItem> = self
            .get_all_media(SortKey::Title, false)?
            .into_iter()
            .filter(|item| &item.key != key)
            .filter_map(|item| {
                let overlap = tags.get(&item.key)?.intersection(own).count();
                (overlap > 0).then(|| RelatedItem {
                    rating: ratings.average(item.key.as_str()),
                    item,
                    overlap,
                })
            })
            .collect();

        related.sort_by(|a, b| {
            b.overlap
                .cmp(&a.overlap)
                .then_with(|| b.rating.partial_cmp(&a.rating).unwrap_or(Ordering::Equal))
                .then_with(|| a.item.key.cmp(&b.item.key))
        });
        related.truncate(limit);
        Ok(related)
    }

    /// Every tag in use, sorted case-insensitively.
    pub fn unique_tags(&self) -> Result<Vec<String>> {
        let tags = self.get_tags()?;
        let mut unique: Vec<String> = tags
            .values()
            .flatten()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        unique.sort_by_cached_key(|t| (t.to_lowercase(), t.clone()));
        Ok(unique)
    }

    fn sort(&self, items: &mut [MediaItem], sort: SortKey) -> Result<()> {
        let by_key = |a: &MediaItem, b: &MediaItem| a.key.cmp(&b.key);
        match sort {
            SortKey::Date => items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| by_key(a, b))),
            SortKey::Title => items.sort_by_cached_key(|item| (item.key.as_str().to_lowercase(), item.key.clone())),
            SortKey::Size => items.sort_by(|a, b| a.size.cmp(&b.size).then_with(|| by_key(a, b))),
            SortKey::Rating => {
                let ratings = self.get_ratings()?;
                items.sort_by(|a, b| {
                    ratings
                        .average(a.key.as_str())
                        .partial_cmp(&ratings.average(b.key.as_str()))
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| by_key(a, b))
                });
            }
            SortKey::Views => {
                let views = self.get_views()?;
                let count = |item: &MediaItem| views.get(&item.key).copied().unwrap_or(0);
                items.sort_by(|a, b| count(a).cmp(&count(b)).then_with(|| by_key(a, b)));
            }
        }
        Ok(())
    }

    /// Hands vanished files to the watcher, or deletes them inline without one.
    fn reap(&self, orphans: &[&MediaItem]) {
        let fresh: Vec<&MediaItem> = {
            let mut reported = self.reported.lock();
            orphans
                .iter()
                .copied()
                .filter(|item| reported.insert(item.key.clone()))
                .collect()
        };
        if fresh.is_empty() {
            return;
        }

        let mut inline = Vec::new();
        match self.orphan_sink.get() {
            Some(sink) => {
                for item in fresh {
                    let change = PathChange::new(self.roots.path_of(item), ChangeKind::Removed);
                    if sink.try_send(change).is_err() {
                        inline.push(item);
                    }
                }
            }
            None => inline = fresh,
        }
        if inline.is_empty() {
            return;
        }

        let mut deleted = 0;
        for item in inline {
            match self.store.soft_delete(&item.key) {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %item.key, error = %e, "Failed to remove orphaned media row"),
            }
        }
        if deleted > 0 {
            info!(deleted, "Removed media rows whose files vanished");
            self.invalidate_all();
        }
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    pub fn invalidate_media(&self) {
        self.media.invalidate();
        self.reported.lock().clear();
    }

    pub fn invalidate_ratings(&self) {
        self.ratings.invalidate();
    }

    pub fn invalidate_views(&self) {
        self.views.invalidate();
    }

    pub fn invalidate_tags(&self) {
        self.tags.invalidate();
    }

    pub fn invalidate_favorites(&self) {
        self.favorites.invalidate();
    }

    pub fn invalidate_all(&self) {
        self.invalidate_media();
        self.invalidate_ratings();
        self.invalidate_views();
        self.invalidate_tags();
        self.invalidate_favorites();
    }
}
