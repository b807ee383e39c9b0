//! Folder path resolution.
//!
//! Turns a human-readable path such as `"Mailman/Newsletter"` into a stable
//! folder id for a mailbox owner. The backing store only exposes one level
//! of children at a time, so the path is walked segment by segment with
//! find → create → re-find-on-conflict. That sequence is idempotent and
//! safe to repeat, so concurrent or retried resolutions never produce
//! duplicate folders.

mod catalog;

pub use catalog::DestinationCatalog;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::{debug, info, warn};

use crate::error::{MailStoreError, PathResolutionError};
use crate::mail::MailStore;

/// Accepted segment separators.
const SEPARATORS: [char; 2] = ['/', '\\'];

/// An ordered, non-empty sequence of folder display names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderPath {
    segments: Vec<String>,
}

impl FolderPath {
    /// Split on `/` or `\`, discarding empty and whitespace-only segments.
    /// Other segments are kept verbatim, surrounding spaces included, since
    /// display names are matched exactly.
    pub fn parse(raw: &str) -> Result<Self, PathResolutionError> {
        let segments: Vec<String> = raw
            .split(SEPARATORS)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .collect();

        if segments.is_empty() {
            return Err(PathResolutionError::EmptyPath {
                path: raw.to_string(),
            });
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Case-insensitive cache key text.
    pub fn normalized(&self) -> String {
        self.segments.join("/").to_lowercase()
    }
}

impl fmt::Display for FolderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

/// Key of a cached resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FolderCacheKey {
    owner_id: String,
    path: String,
}

impl FolderCacheKey {
    pub fn new(owner_id: &str, path: &FolderPath) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            path: path.normalized(),
        }
    }
}

/// `(owner, normalized path) → folder id` mappings.
///
/// Only fully successful resolutions are stored. Without a TTL entries live
/// for the whole process; the move tool invalidates an entry when the store
/// reports its folder gone.
#[derive(Clone)]
pub struct FolderCache {
    entries: Cache<FolderCacheKey, String>,
}

impl FolderCache {
    /// Unbounded cache that never evicts.
    pub fn new() -> Self {
        Self {
            entries: Cache::builder().build(),
        }
    }

    /// Cache whose entries expire `ttl` after insertion.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().time_to_live(ttl).build(),
        }
    }

    pub async fn get(&self, key: &FolderCacheKey) -> Option<String> {
        self.entries.get(key).await
    }

    pub async fn invalidate(&self, key: &FolderCacheKey) {
        self.entries.invalidate(key).await;
    }
}

impl Default for FolderCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FolderCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FolderCache")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

/// Folder names the store addresses by a constant id, e.g. `Inbox` → `inbox`.
#[derive(Debug, Clone)]
pub struct WellKnownFolders {
    by_name: HashMap<String, String>,
}

impl WellKnownFolders {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
        }
    }

    pub fn with(mut self, display_name: &str, id: &str) -> Self {
        self.by_name
            .insert(display_name.to_lowercase(), id.to_string());
        self
    }

    pub fn get(&self, display_name: &str) -> Option<&str> {
        self.by_name
            .get(&display_name.to_lowercase())
            .map(String::as_str)
    }
}

impl Default for WellKnownFolders {
    /// Graph's well-known mail folder names.
    fn default() -> Self {
        Self::new()
            .with("Inbox", "inbox")
            .with("Archive", "archive")
            .with("Drafts", "drafts")
            .with("Sent Items", "sentitems")
            .with("Deleted Items", "deleteditems")
            .with("Junk Email", "junkemail")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkMode {
    Create,
    FindOnly,
}

/// Resolves folder paths to ids, creating missing segments.
pub struct FolderPathResolver {
    store: Arc<dyn MailStore>,
    cache: FolderCache,
    well_known: WellKnownFolders,
}

impl FolderPathResolver {
    pub fn new(store: Arc<dyn MailStore>, cache: FolderCache, well_known: WellKnownFolders) -> Self {
        Self {
            store,
            cache,
            well_known,
        }
    }

    /// Resolve `raw_path` for `owner_id`, creating any missing folders.
    pub async fn resolve(
        &self,
        owner_id: &str,
        raw_path: &str,
    ) -> Result<String, PathResolutionError> {
        let path = FolderPath::parse(raw_path)?;

        // A bare well-known name needs no store round trip.
        if let [only] = path.segments()
            && let Some(id) = self.well_known.get(only)
        {
            return Ok(id.to_string());
        }

        self.cached_or_walk(owner_id, path, WalkMode::Create).await
    }

    /// Resolve `raw_path` without creating anything. A missing segment is
    /// `PathResolutionError::NotFound`.
    pub async fn lookup(
        &self,
        owner_id: &str,
        raw_path: &str,
    ) -> Result<String, PathResolutionError> {
        let path = FolderPath::parse(raw_path)?;
        if let [only] = path.segments()
            && let Some(id) = self.well_known.get(only)
        {
            return Ok(id.to_string());
        }
        self.cached_or_walk(owner_id, path, WalkMode::FindOnly).await
    }

    async fn cached_or_walk(
        &self,
        owner_id: &str,
        path: FolderPath,
        mode: WalkMode,
    ) -> Result<String, PathResolutionError> {
        let key = FolderCacheKey::new(owner_id, &path);
        if let Some(id) = self.cache.get(&key).await {
            debug!(owner = %owner_id, path = %path, folder_id = %id, "Folder cache hit");
            return Ok(id);
        }

        // Concurrent misses on one key share a single walk; errors are not cached.
        self.cache
            .entries
            .try_get_with(key, self.walk(owner_id, &path, mode))
            .await
            .map_err(|e| (*e).clone())
    }

    /// Drop a cached resolution, e.g. after the folder turned out to be gone.
    pub async fn invalidate(&self, owner_id: &str, raw_path: &str) {
        if let Ok(path) = FolderPath::parse(raw_path) {
            self.cache
                .invalidate(&FolderCacheKey::new(owner_id, &path))
                .await;
        }
    }

    async fn walk(
        &self,
        owner_id: &str,
        path: &FolderPath,
        mode: WalkMode,
    ) -> Result<String, PathResolutionError> {
        let segments = path.segments();
        let (mut parent, rest) = match self.well_known.get(&segments[0]) {
            Some(id) => (Some(id.to_string()), &segments[1..]),
            None => (None, segments),
        };

        for segment in rest {
            let id = self
                .resolve_segment(owner_id, parent.as_deref(), segment, path, mode)
                .await?;
            parent = Some(id);
        }

        let folder_id = parent.ok_or_else(|| PathResolutionError::EmptyPath {
            path: path.to_string(),
        })?;
        info!(owner = %owner_id, path = %path, folder_id = %folder_id, "Resolved folder path");
        Ok(folder_id)
    }

    async fn resolve_segment(
        &self,
        owner_id: &str,
        parent_id: Option<&str>,
        segment: &str,
        path: &FolderPath,
        mode: WalkMode,
    ) -> Result<String, PathResolutionError> {
        let transport = |e: MailStoreError| PathResolutionError::Transport {
            path: path.to_string(),
            reason: e.to_string(),
        };

        if let Some(folder) = self
            .store
            .find_child_folder(owner_id, parent_id, segment)
            .await
            .map_err(transport)?
        {
            return Ok(folder.id);
        }
        if mode == WalkMode::FindOnly {
            return Err(PathResolutionError::NotFound {
                path: path.to_string(),
                segment: segment.to_string(),
            });
        }

        match self
            .store
            .create_child_folder(owner_id, parent_id, segment)
            .await
        {
            Ok(folder) => {
                info!(
                    owner = %owner_id,
                    segment = %segment,
                    folder_id = %folder.id,
                    "Created folder"
                );
                Ok(folder.id)
            }
            Err(MailStoreError::Conflict { .. }) => {
                warn!(
                    owner = %owner_id,
                    segment = %segment,
                    path = %path,
                    "Folder create conflicted, re-fetching"
                );
                match self
                    .store
                    .find_child_folder(owner_id, parent_id, segment)
                    .await
                    .map_err(transport)?
                {
                    Some(folder) => Ok(folder.id),
                    None => Err(PathResolutionError::ConflictUnresolved {
                        path: path.to_string(),
                        segment: segment.to_string(),
                    }),
                }
            }
            Err(e) => Err(PathResolutionError::CreateFailed {
                path: path.to_string(),
                segment: segment.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
