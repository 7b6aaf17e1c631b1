//! Per-media metadata collections and the bulk views the cache hands out.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MediaError;
use crate::models::{MediaItem, MediaKey};

/// Lowest accepted rating value.
pub const MIN_RATING: i64 = 1;

/// Highest accepted rating value.
pub const MAX_RATING: i64 = 5;

/// A validated 1-5 rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Rating(u8);

impl Rating {
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Rating {
    type Error = MediaError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if (MIN_RATING..=MAX_RATING).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(MediaError::validation(format!(
                "rating must be between {MIN_RATING} and {MAX_RATING}, got {value}"
            )))
        }
    }
}

impl From<Rating> for i64 {
    fn from(value: Rating) -> Self {
        value.0 as i64
    }
}

/// One user's rating of one media item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatingRow {
    pub media_key: MediaKey,
    pub user_id: String,
    pub value: Rating,
    pub created_at: i64,
}

/// Aggregate of all ratings for one media item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RatingSummary {
    pub average: f64,
    pub count: usize,
    pub by_user: BTreeMap<String, u8>,
}

impl RatingSummary {
    /// The user's rating, or 0 when they have not rated this item.
    pub fn value_for(&self, user: &str) -> u8 {
        self.by_user.get(user).copied().unwrap_or(0)
    }

    fn push(&mut self, user: &str, value: u8) {
        self.by_user.insert(user.to_string(), value);
        self.count = self.by_user.len();
        let sum: u32 = self.by_user.values().map(|v| *v as u32).sum();
        self.average = sum as f64 / self.count as f64;
    }
}

/// Rating summaries for every rated media key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RatingsSnapshot(HashMap<MediaKey, RatingSummary>);

impl RatingsSnapshot {
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a RatingRow>) -> Self {
        let mut map: HashMap<MediaKey, RatingSummary> = HashMap::new();
        for row in rows {
            map.entry(row.media_key.clone())
                .or_default()
                .push(&row.user_id, row.value.get());
        }
        Self(map)
    }

    pub fn summary(&self, key: &str) -> Option<&RatingSummary> {
        self.0.get(key)
    }

    /// Rating shown for `key`: the user's value, 0 when unrated.
    pub fn value(&self, key: &str, user: &str) -> u8 {
        self.0.get(key).map(|s| s.value_for(user)).unwrap_or(0)
    }

    /// Average across users, 0.0 when unrated.
    pub fn average(&self, key: &str) -> f64 {
        self.0.get(key).map(|s| s.average).unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MediaKey, &RatingSummary)> {
        self.0.iter()
    }
}

pub type ViewCounts = HashMap<MediaKey, u64>;
pub type TagMap = HashMap<MediaKey, BTreeSet<String>>;
pub type FavoriteSet = HashSet<MediaKey>;

/// Full projection of one backend, used for migration and resync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub media: Vec<MediaItem>,
    pub ratings: Vec<RatingRow>,
    pub views: ViewCounts,
    pub tags: TagMap,
    pub favorites: FavoriteSet,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.media.is_empty()
            && self.ratings.is_empty()
            && self.views.is_empty()
            && self.tags.is_empty()
            && self.favorites.is_empty()
    }

    /// Every key referenced by any collection.
    pub fn referenced_keys(&self) -> BTreeSet<MediaKey> {
        let mut keys: BTreeSet<MediaKey> = self.media.iter().map(|m| m.key.clone()).collect();
        keys.extend(self.ratings.iter().map(|r| r.media_key.clone()));
        keys.extend(self.views.keys().cloned());
        keys.extend(self.tags.keys().cloned());
        keys.extend(self.favorites.iter().cloned());
        keys
    }
}

/// Sort order for the media listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    Date,
    Title,
    Rating,
    Views,
    Size,
}

impl FromStr for SortKey {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "date" | "added_date" | "created" => Ok(Self::Date),
            "title" | "filename" | "name" => Ok(Self::Title),
            "rating" => Ok(Self::Rating),
            "views" => Ok(Self::Views),
            "size" => Ok(Self::Size),
            other => Err(MediaError::validation(format!("unknown sort key {other}"))),
        }
    }
}

/// Table row counts, used for diagnostics and migration checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub media: usize,
    pub ratings: usize,
    pub views: usize,
    pub tags: usize,
    pub favorites: usize,
}
