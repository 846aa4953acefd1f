//! Point-lookup metadata cache tier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::identity::BlobId;
use crate::record::BlobRecord;

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// The cache holds metadata for the blob
    Hit(BlobRecord),
    /// The cache has nothing; not an error
    Miss,
    /// The cache tier failed; callers absorb this and fall back
    Error(String),
}

/// Fast metadata lookup consulted before the backend.
pub trait MetadataCache: Send + Sync {
    /// Looks up metadata by storage class and local key.
    fn lookup_blob_metadata(
        &self,
        storage_class: i32,
        local_key: i32,
        last_modified: Option<i64>,
    ) -> CacheLookup;

    /// Whether the cache tier is answering lookups.
    fn is_available(&self) -> bool;
}

#[derive(Debug, Clone)]
struct CachedRecord {
    record: BlobRecord,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedRecord {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

/// In-memory [`MetadataCache`] with TTL and oldest-first eviction.
pub struct MemoryMetadataCache {
    entries: Mutex<HashMap<BlobId, CachedRecord>>,
    max_entries: usize,
    default_ttl: Duration,
    degraded: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl MemoryMetadataCache {
    /// Creates a cache holding at most `max_entries` records.
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            default_ttl,
            degraded: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Caches a record with the default TTL.
    pub fn insert(&self, blob_id: BlobId, record: BlobRecord) {
        self.insert_with_ttl(blob_id, record, self.default_ttl);
    }

    /// Caches a record with a custom TTL, evicting the oldest entry when full.
    pub fn insert_with_ttl(&self, blob_id: BlobId, record: BlobRecord, ttl: Duration) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(&blob_id) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, v)| v.cached_at)
                .map(|(k, _)| *k);
            if let Some(key) = oldest {
                trace!(evicted = %key, "metadata cache full");
                entries.remove(&key);
            }
        }
        entries.insert(
            blob_id,
            CachedRecord {
                record,
                cached_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Drops one entry.
    pub fn invalidate(&self, blob_id: BlobId) {
        self.entries.lock().remove(&blob_id);
    }

    /// Makes every lookup return [`CacheLookup::Error`] until cleared.
    pub fn set_degraded(&self, degraded: bool) {
        debug!(degraded, "metadata cache mode changed");
        self.degraded.store(degraded, Ordering::SeqCst);
    }

    /// Removes expired entries and returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, v| !v.is_expired());
        before - entries.len()
    }

    /// Returns (hits, misses, errors).
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }

    /// Hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let (hits, misses, _) = self.stats();
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Current number of entries (including expired)
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the cache holds nothing
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl MetadataCache for MemoryMetadataCache {
    fn lookup_blob_metadata(
        &self,
        storage_class: i32,
        local_key: i32,
        last_modified: Option<i64>,
    ) -> CacheLookup {
        if self.degraded.load(Ordering::SeqCst) {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return CacheLookup::Error("metadata cache is degraded".to_string());
        }

        let blob_id = BlobId::new(storage_class, local_key);
        let entries = self.entries.lock();
        let hit = entries
            .get(&blob_id)
            .filter(|cached| !cached.is_expired())
            .filter(|cached| last_modified.map_or(true, |lm| lm == cached.record.last_modified()));

        match hit {
            Some(cached) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Hit(cached.record.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Miss
            }
        }
    }

    fn is_available(&self) -> bool {
        !self.degraded.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(lm: i64) -> BlobRecord {
        BlobRecord::new(100, 2, lm)
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = MemoryMetadataCache::new(10, Duration::from_secs(60));
        cache.insert(BlobId::new(4, 1), record(5));

        assert_eq!(cache.lookup_blob_metadata(4, 1, None), CacheLookup::Hit(record(5)));
        assert_eq!(cache.lookup_blob_metadata(4, 2, None), CacheLookup::Miss);
        assert_eq!(cache.stats(), (1, 1, 0));
        assert!((cache.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_last_modified_mismatch_is_miss() {
        let cache = MemoryMetadataCache::new(10, Duration::from_secs(60));
        cache.insert(BlobId::new(4, 1), record(5));
        assert_eq!(cache.lookup_blob_metadata(4, 1, Some(6)), CacheLookup::Miss);
        assert!(matches!(
            cache.lookup_blob_metadata(4, 1, Some(5)),
            CacheLookup::Hit(_)
        ));
    }

    #[test]
    fn test_expired_entry_is_miss() {
        let cache = MemoryMetadataCache::new(10, Duration::from_secs(60));
        cache.insert_with_ttl(BlobId::new(4, 1), record(5), Duration::ZERO);
        assert_eq!(cache.lookup_blob_metadata(4, 1, None), CacheLookup::Miss);
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_oldest_evicted_when_full() {
        let cache = MemoryMetadataCache::new(2, Duration::from_secs(60));
        cache.insert(BlobId::new(4, 1), record(1));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(BlobId::new(4, 2), record(2));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(BlobId::new(4, 3), record(3));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup_blob_metadata(4, 1, None), CacheLookup::Miss);
        assert!(matches!(cache.lookup_blob_metadata(4, 3, None), CacheLookup::Hit(_)));
    }

    #[test]
    fn test_degraded_mode() {
        let cache = MemoryMetadataCache::new(10, Duration::from_secs(60));
        cache.insert(BlobId::new(4, 1), record(5));
        cache.set_degraded(true);
        assert!(!cache.is_available());
        assert!(matches!(cache.lookup_blob_metadata(4, 1, None), CacheLookup::Error(_)));
        assert_eq!(cache.stats().2, 1);

        cache.set_degraded(false);
        assert!(matches!(cache.lookup_blob_metadata(4, 1, None), CacheLookup::Hit(_)));
    }

    #[test]
    fn test_invalidate() {
        let cache = MemoryMetadataCache::new(10, Duration::from_secs(60));
        cache.insert(BlobId::new(4, 1), record(5));
        cache.invalidate(BlobId::new(4, 1));
        assert_eq!(cache.lookup_blob_metadata(4, 1, None), CacheLookup::Miss);
    }
}
