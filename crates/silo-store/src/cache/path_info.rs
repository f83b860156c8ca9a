//! In-process path-info cache (tier 1).
//!
//! Advisory only: both hits and misses expire, and a refreshing caller
//! bypasses the cache entirely so stale answers never mask the backend.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::narinfo::NarInfo;

const CAPACITY: usize = 65536;

/// How long a "not present" answer may be served from cache.
pub(crate) const TTL_NEGATIVE_SECS: u64 = 3600;
/// How long a "present" answer may be served from cache.
pub(crate) const TTL_POSITIVE_SECS: u64 = 30 * 24 * 3600;

pub(crate) fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone)]
pub(crate) struct PathInfoCacheValue {
    /// `None` caches a miss.
    pub value: Option<Arc<NarInfo>>,
    stored_at: u64,
}

impl PathInfoCacheValue {
    fn is_fresh(&self, now: u64) -> bool {
        let ttl = if self.value.is_some() {
            TTL_POSITIVE_SECS
        } else {
            TTL_NEGATIVE_SECS
        };
        now < self.stored_at.saturating_add(ttl)
    }
}

/// LRU over hash parts, guarded by a lock with short critical sections.
pub(crate) struct PathInfoCache {
    inner: Mutex<LruCache<String, PathInfoCacheValue>>,
}

impl PathInfoCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    /// Fresh cached answer for a hash part, if any. Expired entries are
    /// dropped on the way out.
    pub fn lookup(&self, hash_part: &str) -> Option<PathInfoCacheValue> {
        let now = timestamp_secs();
        let mut cache = self.inner.lock().expect("path info cache lock");
        match cache.get(hash_part) {
            Some(entry) if entry.is_fresh(now) => Some(entry.clone()),
            Some(_) => {
                cache.pop(hash_part);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, hash_part: String, value: Option<Arc<NarInfo>>) {
        let entry = PathInfoCacheValue {
            value,
            stored_at: timestamp_secs(),
        };
        self.inner
            .lock()
            .expect("path info cache lock")
            .put(hash_part, entry);
    }

    pub fn evict(&self, hash_part: &str) {
        self.inner
            .lock()
            .expect("path info cache lock")
            .pop(hash_part);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_hits_and_misses_separately() {
        let cache = PathInfoCache::new();
        cache.insert("aaaa".into(), None);
        let miss = cache.lookup("aaaa").expect("negative entry present");
        assert!(miss.value.is_none());
        assert!(cache.lookup("bbbb").is_none());
    }

    #[test]
    fn eviction_forgets_the_entry() {
        let cache = PathInfoCache::new();
        cache.insert("aaaa".into(), None);
        cache.evict("aaaa");
        assert!(cache.lookup("aaaa").is_none());
    }
}
