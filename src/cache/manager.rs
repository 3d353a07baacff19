//! Pricing cache persisted as one JSON record per cache key
//!
//! Records carry their own TTL so successful lookups and cached failures can
//! expire on different schedules. Expired records stay on disk until they are
//! overwritten or removed by `purge_expired`/`clear`.

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::CacheKey;

/// Errors from writing or scanning the cache directory
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem access failed
    #[error("Cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded
    #[error("Failed to encode cache record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Record body stored on disk
#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    /// Cached price, `null` for a cached failure or missing price
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    value: Option<Decimal>,
    /// When the record was written
    stored_at: DateTime<Utc>,
    /// Time-to-live in milliseconds
    ttl_ms: u64,
    region: String,
    item_id: String,
    price_kind: String,
}

impl CacheRecord {
    fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Whether the record was written for `key` and not a key that
    /// normalizes to the same file name
    fn belongs_to(&self, key: &CacheKey) -> bool {
        self.region == key.region && self.item_id == key.item_id && self.price_kind == key.price_kind.label()
    }

    /// A record is valid while `now - stored_at < ttl`
    fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        let age = (now - self.stored_at).to_std().unwrap_or_default();
        age < self.ttl()
    }
}

/// A stored record as seen by callers
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Normalized storage key
    pub key: String,
    pub value: Option<Decimal>,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
}

/// Result of looking a key up in the cache
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// No record exists (or it could not be read)
    Absent,
    /// A record exists but its TTL has elapsed
    Expired { stored_at: DateTime<Utc> },
    /// A valid record; `None` is a cached failure or missing price
    Fresh(Option<Decimal>),
}

impl CacheLookup {
    /// Only fresh records count as hits
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Fresh(_))
    }
}

/// Restricts which records `clear` removes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearFilter {
    pub region: Option<String>,
    pub item_id: Option<String>,
}

impl ClearFilter {
    /// Matches every record
    pub fn all() -> Self {
        Self::default()
    }

    pub fn region(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            item_id: None,
        }
    }

    pub fn item(item_id: impl Into<String>) -> Self {
        Self {
            region: None,
            item_id: Some(item_id.into()),
        }
    }

    fn is_empty(&self) -> bool {
        self.region.is_none() && self.item_id.is_none()
    }

    fn matches(&self, record: &CacheRecord) -> bool {
        if let Some(ref region) = self.region {
            if &record.region != region {
                return false;
            }
        }
        if let Some(ref item_id) = self.item_id {
            if &record.item_id != item_id {
                return false;
            }
        }
        true
    }
}

/// Summary of what is currently stored
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub fresh_entries: usize,
    pub expired_entries: usize,
    /// Files that exist but could not be parsed
    pub unreadable_entries: usize,
    pub approx_size_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Thread-safe pricing cache backed by a directory of JSON records
///
/// All operations take a single lock. Lookups are local disk reads, so the
/// lock is held only briefly even when many fetch workers share the cache.
#[derive(Debug)]
pub struct PricingCache {
    /// Directory where cache files are stored
    cache_dir: PathBuf,
    lock: Mutex<()>,
}

impl PricingCache {
    /// Creates a cache in the XDG cache directory (`~/.cache/pricefetch/` on Linux)
    ///
    /// Returns `None` if the cache directory cannot be determined (e.g., no home directory).
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "pricefetch")?;
        Some(Self::with_dir(project_dirs.cache_dir().to_path_buf()))
    }

    /// Creates a cache rooted at a custom directory
    pub fn with_dir(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            lock: Mutex::new(()),
        }
    }

    /// Directory the records live in
    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the path to a cache file for the given key
    fn cache_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key.storage_key()))
    }

    fn read_record(path: &Path) -> Result<Option<CacheRecord>, String> {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| e.to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Record files currently in the cache directory
    fn record_files(&self) -> Result<Vec<PathBuf>, CacheError> {
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Looks up a key
    ///
    /// Unreadable records are reported as `Absent` and left in place.
    pub fn get(&self, key: &CacheKey) -> CacheLookup {
        let path = self.cache_path(key);
        let record = {
            let _guard = self.guard();
            Self::read_record(&path)
        };

        match record {
            Ok(None) => {
                debug!(key = %key, "cache miss");
                CacheLookup::Absent
            }
            Ok(Some(record)) if !record.belongs_to(key) => {
                debug!(key = %key, stored_item = %record.item_id, "cache record belongs to another key");
                CacheLookup::Absent
            }
            Ok(Some(record)) if record.is_fresh_at(Utc::now()) => {
                debug!(key = %key, value = ?record.value, "cache hit");
                CacheLookup::Fresh(record.value)
            }
            Ok(Some(record)) => {
                debug!(key = %key, stored_at = %record.stored_at, "cache entry expired");
                CacheLookup::Expired {
                    stored_at: record.stored_at,
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to read cache record");
                CacheLookup::Absent
            }
        }
    }

    /// Returns the raw entry for a key regardless of freshness
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        let path = self.cache_path(key);
        let _guard = self.guard();
        let record = Self::read_record(&path).ok()??;
        if !record.belongs_to(key) {
            return None;
        }
        Some(CacheEntry {
            key: key.storage_key(),
            value: record.value,
            stored_at: record.stored_at,
            ttl: record.ttl(),
        })
    }

    /// Stores a value, overwriting any previous record for the key
    pub fn put(
        &self,
        key: &CacheKey,
        value: Option<Decimal>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let record = CacheRecord {
            value,
            stored_at: Utc::now(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            region: key.region.clone(),
            item_id: key.item_id.clone(),
            price_kind: key.price_kind.label(),
        };
        let json = serde_json::to_string_pretty(&record)?;

        let path = self.cache_path(key);
        let tmp_path = path.with_extension("json.tmp");

        let _guard = self.guard();
        fs::create_dir_all(&self.cache_dir)?;
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &path)?;
        debug!(key = %key, value = ?value, ttl_ms = record.ttl_ms, "cached");
        Ok(())
    }

    /// Removes the record for one key; returns whether a record existed
    pub fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let path = self.cache_path(key);
        let _guard = self.guard();
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(key = %key, "cache entry removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes records matching the filter and returns how many were removed
    ///
    /// With an empty filter every record file is removed, including unreadable ones.
    pub fn clear(&self, filter: &ClearFilter) -> Result<usize, CacheError> {
        let _guard = self.guard();
        let mut removed = 0;

        for path in self.record_files()? {
            if !filter.is_empty() {
                match Self::read_record(&path) {
                    Ok(Some(record)) if filter.matches(&record) => {}
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable cache record");
                        continue;
                    }
                }
            }
            fs::remove_file(&path)?;
            removed += 1;
        }

        debug!(removed, ?filter, "cache cleared");
        Ok(removed)
    }

    /// Deletes expired and unreadable records, returning how many were removed
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let _guard = self.guard();
        let now = Utc::now();
        let mut removed = 0;

        for path in self.record_files()? {
            let stale = match Self::read_record(&path) {
                Ok(Some(record)) => !record.is_fresh_at(now),
                Ok(None) => false,
                Err(_) => true,
            };
            if stale {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }

        debug!(removed, "purged expired cache records");
        Ok(removed)
    }

    /// Scans every record and summarizes freshness, size and age
    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let _guard = self.guard();
        let now = Utc::now();
        let mut stats = CacheStats::default();

        for path in self.record_files()? {
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            stats.approx_size_bytes += size;

            let record = match Self::read_record(&path) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read cache record for stats");
                    stats.unreadable_entries += 1;
                    continue;
                }
            };

            stats.total_entries += 1;
            if record.is_fresh_at(now) {
                stats.fresh_entries += 1;
            } else {
                stats.expired_entries += 1;
            }

            let stored_at = record.stored_at;
            if stats.oldest.map_or(true, |oldest| stored_at < oldest) {
                stats.oldest = Some(stored_at);
            }
            if stats.newest.map_or(true, |newest| stored_at > newest) {
                stats.newest = Some(stored_at);
            }
        }

        Ok(stats)
    }
}
