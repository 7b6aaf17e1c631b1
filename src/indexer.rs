//! Applies filesystem changes to the store.
//!
//! The indexer is the only writer of media rows outside the startup
//! migration. Both the watcher (debounced event batches) and the reconciler
//! (full scans) feed it [`ChangeBatch`]es; it stats and checksums the
//! affected files, detects renames, writes the store, and only then
//! invalidates the cache and schedules thumbnails.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

use crate::cache::MetadataCache;
use crate::error::{MediaError, Result};
use crate::models::{MediaItem, MediaKey, MediaType};
use crate::scanner::{sidecar, ChecksumCache, DiscoveredEntry, DurationProbe, FileScanner, ScanResult};
use crate::store::{now, PersistenceLayer};
use crate::thumbnails::ThumbnailCoordinator;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

impl ChangeKind {
    /// Folds a later event for the same path into an earlier one.
    ///
    /// `None` means the two cancel out (created then removed in one window).
    pub fn merge(earlier: ChangeKind, later: ChangeKind) -> Option<ChangeKind> {
        use ChangeKind::*;
        match (earlier, later) {
            (Created, Removed) => None,
            (Removed, Created) => Some(Modified),
            (Created, Modified) => Some(Created),
            (_, later) => Some(later),
        }
    }
}

/// A single filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl PathChange {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Changes deduplicated per path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    changes: BTreeMap<PathBuf, ChangeKind>,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: PathChange) {
        match self.changes.remove(&change.path) {
            Some(earlier) => {
                if let Some(kind) = ChangeKind::merge(earlier, change.kind) {
                    self.changes.insert(change.path, kind);
                }
            }
            None => {
                self.changes.insert(change.path, change.kind);
            }
        }
    }

    pub fn kind_of(&self, path: &Path) -> Option<ChangeKind> {
        self.changes.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, ChangeKind)> {
        self.changes.iter().map(|(p, k)| (p.as_path(), *k))
    }
}

impl FromIterator<PathChange> for ChangeBatch {
    fn from_iter<I: IntoIterator<Item = PathChange>>(iter: I) -> Self {
        let mut batch = Self::new();
        for change in iter {
            batch.push(change);
        }
        batch
    }
}

/// Summary of one apply cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub renamed: usize,
    pub removed: usize,
    pub tags_merged: usize,
    pub skipped: usize,
}

impl ApplyReport {
    pub fn is_empty(&self) -> bool {
        self.created + self.updated + self.renamed + self.removed + self.tags_merged == 0
    }
}

/// Planned store writes for one batch.
#[derive(Default)]
struct Plan {
    upserts: Vec<MediaItem>,
    remaps: Vec<(MediaKey, MediaItem)>,
    removals: Vec<MediaItem>,
    /// Media files whose sidecar should be merged after the writes.
    sidecars: Vec<(MediaKey, PathBuf)>,
    /// Videos needing a (re)generated thumbnail.
    thumbnails: Vec<MediaKey>,
    /// Videos whose thumbnail is stale or gone.
    discards: Vec<MediaKey>,
    created: usize,
    skipped: usize,
}

pub struct Indexer {
    store: Arc<PersistenceLayer>,
    cache: Arc<MetadataCache>,
    scanner: FileScanner,
    checksums: ChecksumCache,
    probe: Box<dyn DurationProbe>,
    thumbnails: Option<Arc<ThumbnailCoordinator>>,
    /// Serializes watcher flushes and reconciliation scans.
    apply_lock: Mutex<()>,
}

impl Indexer {
    pub fn new(
        store: Arc<PersistenceLayer>,
        cache: Arc<MetadataCache>,
        scanner: FileScanner,
        probe: Box<dyn DurationProbe>,
    ) -> Self {
        Self {
            store,
            cache,
            scanner,
            checksums: ChecksumCache::default(),
            probe,
            thumbnails: None,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn with_thumbnails(mut self, thumbnails: Arc<ThumbnailCoordinator>) -> Self {
        self.thumbnails = Some(thumbnails);
        self
    }

    pub fn scanner(&self) -> &FileScanner {
        &self.scanner
    }

    /// Applies one batch of filesystem changes.
    pub fn apply(&self, batch: &ChangeBatch) -> Result<ApplyReport> {
        if batch.is_empty() {
            return Ok(ApplyReport::default());
        }
        let _guard = self.apply_lock.lock();

        let changes = self.normalize(batch);
        let known: HashMap<MediaKey, MediaItem> = self
            .store
            .media()?
            .into_iter()
            .map(|item| (item.key.clone(), item))
            .collect();

        let plan = self.plan(&changes, &known);
        self.execute(plan)
    }

    /// Diffs a full listing against the store and applies the difference.
    ///
    /// Rows under a root that is missing entirely are left alone, so an
    /// unmounted drive does not wipe its metadata.
    pub fn reconcile(&self, listing: &ScanResult) -> Result<ApplyReport> {
        let known = self.store.media()?;
        let on_disk: HashMap<&MediaKey, &DiscoveredEntry> =
            listing.entries.iter().map(|e| (&e.key, e)).collect();
        let roots = self.scanner.roots();
        let missing: HashSet<&Path> = listing.missing_roots.iter().map(|p| p.as_path()).collect();

        let mut batch = ChangeBatch::new();
        let mut known_keys = HashSet::with_capacity(known.len());
        for item in &known {
            known_keys.insert(&item.key);
            match on_disk.get(&item.key) {
                Some(entry) if entry.media_type == item.media_type => {
                    if entry.size != item.size || entry.mtime != item.mtime {
                        batch.push(PathChange::new(&entry.path, ChangeKind::Modified));
                    }
                }
                _ => {
                    if !missing.contains(roots.root_for(item.media_type)) {
                        batch.push(PathChange::new(roots.path_of(item), ChangeKind::Removed));
                    }
                }
            }
        }
        for entry in &listing.entries {
            if !known_keys.contains(&entry.key) {
                batch.push(PathChange::new(&entry.path, ChangeKind::Created));
            }
        }

        if let Some(thumbnails) = &self.thumbnails {
            let videos = listing
                .entries
                .iter()
                .filter(|e| e.media_type == MediaType::Video)
                .map(|e| e.key.clone());
            thumbnails.request_missing(videos);
        }

        debug!(changes = batch.len(), "Reconciliation diff computed");
        self.apply(&batch)
    }

    /// Scans both roots and reconciles.
    pub fn reconcile_now(&self) -> Result<ApplyReport> {
        let listing = self.scanner.scan_sync();
        self.reconcile(&listing)
    }

    // =========================================================================
    // Planning
    // =========================================================================

    /// Maps sidecars to their media file and expands directory events.
    fn normalize(&self, batch: &ChangeBatch) -> ChangeBatch {
        let roots = self.scanner.roots();
        let mut out = ChangeBatch::new();

        for (path, kind) in batch.iter() {
            if let Some(media) = sidecar::media_for_sidecar(path) {
                if roots.key_for(&media).is_some() && media.exists() {
                    out.push(PathChange::new(media, ChangeKind::Modified));
                }
                continue;
            }
            if roots.key_for(path).is_some() {
                out.push(PathChange::new(path, kind));
                continue;
            }
            // Directory created or moved in: index its contents.
            if kind != ChangeKind::Removed && path.is_dir() {
                for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                    if entry.file_type().is_file() && roots.key_for(entry.path()).is_some() {
                        out.push(PathChange::new(entry.path(), ChangeKind::Created));
                    }
                }
                continue;
            }
            // A removed directory is handled in `plan` by prefix.
            if kind == ChangeKind::Removed {
                out.push(PathChange::new(path, kind));
            } else {
                trace!(?path, "Ignoring non-media path");
            }
        }
        out
    }

    fn plan(&self, changes: &ChangeBatch, known: &HashMap<MediaKey, MediaItem>) -> Plan {
        let roots = self.scanner.roots();
        let mut plan = Plan::default();
        let ts = now();

        // Rows whose file is reported gone in this batch, by key.
        let mut removed: BTreeMap<MediaKey, MediaItem> = BTreeMap::new();
        let mut present: Vec<DiscoveredEntry> = Vec::new();

        for (path, kind) in changes.iter() {
            match roots.key_for(path) {
                Some((_, key)) => match self.scanner.stat(path) {
                    Some(entry) => present.push(entry),
                    None => {
                        if kind != ChangeKind::Removed {
                            trace!(?path, "Changed file vanished before indexing");
                        }
                        if let Some(item) = known.get(&key) {
                            removed.insert(key, item.clone());
                        }
                    }
                },
                None => {
                    // Directory removal: every row beneath it whose file is gone.
                    for item in known.values() {
                        let item_path = roots.path_of(item);
                        if item_path.starts_with(path) && !item_path.exists() {
                            removed.insert(item.key.clone(), item.clone());
                        }
                    }
                }
            }
        }

        // Rename candidates: known rows whose file is gone, by checksum.
        let mut by_checksum: HashMap<&str, Vec<&MediaItem>> = HashMap::new();
        for item in known.values() {
            if item.checksum.is_empty() {
                continue;
            }
            if removed.contains_key(&item.key) || !roots.path_of(item).exists() {
                by_checksum.entry(item.checksum.as_str()).or_default().push(item);
            }
        }
        let mut claimed: HashSet<MediaKey> = HashSet::new();

        for entry in present {
            let checksum = match self.checksums.checksum(&entry.path, entry.size, entry.mtime) {
                Ok(sum) => sum,
                Err(e) => {
                    warn!(path = ?entry.path, error = %e, "Failed to checksum file");
                    plan.skipped += 1;
                    continue;
                }
            };
            let is_video = entry.media_type == MediaType::Video;

            if let Some(existing) = known.get(&entry.key) {
                let content_changed = existing.checksum != checksum
                    || existing.size != entry.size
                    || existing.mtime != entry.mtime;
                let mut item = existing.clone();
                let probed = MediaItem {
                    key: entry.key.clone(),
                    media_type: entry.media_type,
                    checksum,
                    size: entry.size,
                    mtime: entry.mtime,
                    duration_ms: if is_video && (content_changed || existing.duration_ms.is_none()) {
                        self.probe_duration(&entry.path)
                    } else {
                        None
                    },
                    created_at: existing.created_at,
                    updated_at: ts,
                };
                item.refresh_from(&probed);
                plan.upserts.push(item);
                if is_video && content_changed {
                    plan.discards.push(entry.key.clone());
                    plan.thumbnails.push(entry.key.clone());
                }
                plan.sidecars.push((entry.key.clone(), entry.path.clone()));
                continue;
            }

            let rename_from = by_checksum.get(checksum.as_str()).and_then(|candidates| {
                candidates
                    .iter()
                    .find(|c| c.media_type == entry.media_type && !claimed.contains(&c.key))
                    .map(|c| (*c).clone())
            });

            let mut item = MediaItem {
                key: entry.key.clone(),
                media_type: entry.media_type,
                checksum,
                size: entry.size,
                mtime: entry.mtime,
                duration_ms: None,
                created_at: ts,
                updated_at: ts,
            };

            match rename_from {
                Some(old) => {
                    debug!(from = %old.key, to = %item.key, "Detected rename");
                    claimed.insert(old.key.clone());
                    removed.remove(&old.key);
                    item.created_at = old.created_at;
                    item.duration_ms = old.duration_ms;
                    if is_video {
                        plan.discards.push(old.key.clone());
                        plan.thumbnails.push(item.key.clone());
                    }
                    plan.remaps.push((old.key, item));
                }
                None => {
                    if is_video {
                        item.duration_ms = self.probe_duration(&entry.path);
                        plan.thumbnails.push(item.key.clone());
                    }
                    plan.created += 1;
                    plan.upserts.push(item);
                }
            }
            plan.sidecars.push((entry.key.clone(), entry.path.clone()));
        }

        for (key, item) in removed {
            if claimed.contains(&key) {
                continue;
            }
            if item.is_video() {
                plan.discards.push(key);
            }
            plan.removals.push(item);
        }
        plan
    }

    fn probe_duration(&self, path: &Path) -> Option<u64> {
        self.probe.duration(path).map(|d| d.as_millis() as u64)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn execute(&self, plan: Plan) -> Result<ApplyReport> {
        let mut report = ApplyReport {
            created: plan.created,
            updated: plan.upserts.len() - plan.created,
            skipped: plan.skipped,
            ..Default::default()
        };

        let written = self.write_plan(&plan, &mut report);

        // Store writes are committed; now the cache may drop its copies.
        if written.is_err() || report.renamed > 0 || report.removed > 0 {
            self.cache.invalidate_all();
        } else {
            if report.created + report.updated > 0 {
                self.cache.invalidate_media();
            }
            if report.tags_merged > 0 {
                self.cache.invalidate_tags();
            }
        }
        written?;

        if let Some(thumbnails) = &self.thumbnails {
            for key in &plan.discards {
                thumbnails.discard(key);
            }
            for key in plan.thumbnails {
                thumbnails.request(&key);
            }
        }

        if report.is_empty() {
            debug!(?report, "Batch applied with no changes");
        } else {
            info!(
                created = report.created,
                updated = report.updated,
                renamed = report.renamed,
                removed = report.removed,
                tags = report.tags_merged,
                "Applied filesystem changes"
            );
        }
        Ok(report)
    }

    /// Remaps, then upserts, then removals, then sidecar tags.
    ///
    /// Stops at the first store error; `report` counts what was written.
    fn write_plan(&self, plan: &Plan, report: &mut ApplyReport) -> Result<()> {
        // Remaps first: an upsert for the new key must not pre-empt the move.
        for (old, item) in &plan.remaps {
            match self.store.remap(old, item) {
                Ok(true) => report.renamed += 1,
                // The old row vanished meanwhile; index as new.
                Ok(false) | Err(MediaError::NotFound(_)) => {
                    self.store.upsert_media(std::slice::from_ref(item))?;
                    report.created += 1;
                }
                Err(e) => return Err(e),
            }
        }

        self.store.upsert_media(&plan.upserts)?;

        for item in &plan.removals {
            if self.store.soft_delete(&item.key)? {
                report.removed += 1;
            }
        }

        for (key, path) in &plan.sidecars {
            for tag in sidecar::read_sidecar_tags(path) {
                match self.store.add_tag(key, &tag) {
                    Ok(true) => report.tags_merged += 1,
                    Ok(false) => {}
                    Err(e) => warn!(%key, error = %e, "Failed to merge sidecar tag"),
                }
            }
        }
        Ok(())
    }
}
