//! In-memory block cache
//!
//! Bounded, strict least-recently-used cache keyed by block height. A hit
//! refreshes the entry's recency. Nothing is persisted across restarts.

use blockrelay_common::Block;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Thread-safe LRU cache of fetched blocks
#[derive(Debug)]
pub struct BlockCache {
    inner: Mutex<LruCache<u64, Arc<Block>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        tracing::debug!(capacity = capacity.get(), "Block cache created");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, height: u64) -> Option<Arc<Block>> {
        let found = self.inner.lock().get(&height).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Insert or replace; evicts the least recently used entry when full.
    pub fn put(&self, height: u64, block: Arc<Block>) {
        if let Some((evicted, _)) = self.inner.lock().push(height, block) {
            if evicted != height {
                tracing::trace!(evicted, "Evicted block from cache");
            }
        }
    }

    pub fn remove(&self, height: u64) -> Option<Arc<Block>> {
        self.inner.lock().pop(&height)
    }

    pub fn contains(&self, height: u64) -> bool {
        self.inner.lock().contains(&height)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: inner.len(),
            capacity: inner.cap().get(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn test_block(height: u64) -> Arc<Block> {
        test_block_with_parent(height, height.wrapping_sub(1))
    }

    /// Block whose hash bytes are derived from `height` and whose parent hash
    /// is derived from `parent`.
    pub(crate) fn test_block_with_parent(height: u64, parent: u64) -> Arc<Block> {
        let hash_of = |h: u64| {
            let mut bytes = [0u8; 32];
            bytes[..8].copy_from_slice(&h.to_be_bytes());
            hex::encode(bytes)
        };
        Arc::new(
            Block::from_value(json!({
                "block": {
                    "header": {
                        "height": height,
                        "hash": hash_of(height),
                        "prev_hash": hash_of(parent),
                    }
                },
                "shards": []
            }))
            .unwrap(),
        )
    }

    fn cache(capacity: usize) -> BlockCache {
        BlockCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn test_get_after_put() {
        let cache = cache(2);
        cache.put(1, test_block(1));
        assert_eq!(cache.get(1).unwrap().height, 1);
        assert!(cache.get(2).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.capacity, 2);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = cache(2);
        cache.put(1, test_block(1));
        cache.put(2, test_block(2));

        // Touch 1 so 2 becomes the eviction candidate
        assert!(cache.get(1).is_some());
        cache.put(3, test_block(3));

        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_put_same_height_does_not_grow() {
        let cache = cache(2);
        cache.put(7, test_block(7));
        cache.put(7, test_block(7));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = cache(4);
        cache.put(1, test_block(1));
        cache.put(2, test_block(2));
        assert!(cache.remove(1).is_some());
        assert!(!cache.contains(1));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_access_stays_bounded() {
        let cache = Arc::new(cache(16));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..200u64 {
                        let height = t * 1000 + i;
                        cache.put(height, test_block(height));
                        cache.get(height.saturating_sub(1));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 16);
    }
}
