//! In-memory descriptor index: a fixed-capacity LRU with a per-entry TTL.
//!
//! Purely a hot-path accelerator over the blob store. A hit here still
//! requires the backing blob file to exist; callers that find the file gone
//! should evict the descriptor and fall through to the disk path.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::model::Descriptor;

struct Entry {
    descriptor: Descriptor,
    inserted_at: Instant,
}

pub struct DescriptorIndex {
    cache: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl DescriptorIndex {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn get(&self, digest: &str) -> Option<Descriptor> {
        use std::sync::atomic::Ordering;
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(digest) {
            if entry.inserted_at.elapsed() <= self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.descriptor.clone());
            }
            cache.pop(digest);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, descriptor: Descriptor) {
        let mut cache = self.cache.lock();
        cache.put(descriptor.digest.clone(), Entry { descriptor, inserted_at: Instant::now() });
    }

    pub fn evict(&self, digest: &str) {
        self.cache.lock().pop(digest);
    }

    pub fn hit_rate(&self) -> f64 {
        use std::sync::atomic::Ordering;
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 { 0.0 } else { hits / (hits + misses) }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_after_put() {
        let idx = DescriptorIndex::new(8, Duration::from_secs(60));
        idx.put(Descriptor::new("sha256:aaa", 10, None));
        assert!(idx.get("sha256:aaa").is_some());
        assert_eq!(idx.hits(), 1);
    }

    #[test]
    fn miss_on_unknown_key() {
        let idx = DescriptorIndex::new(8, Duration::from_secs(60));
        assert!(idx.get("sha256:bbb").is_none());
        assert_eq!(idx.misses(), 1);
    }

    #[test]
    fn expires_after_ttl() {
        let idx = DescriptorIndex::new(8, Duration::from_millis(0));
        idx.put(Descriptor::new("sha256:ccc", 10, None));
        std::thread::sleep(Duration::from_millis(5));
        assert!(idx.get("sha256:ccc").is_none());
    }

    #[test]
    fn evicts_past_capacity() {
        let idx = DescriptorIndex::new(1, Duration::from_secs(60));
        idx.put(Descriptor::new("sha256:a", 1, None));
        idx.put(Descriptor::new("sha256:b", 1, None));
        assert!(idx.get("sha256:a").is_none());
        assert!(idx.get("sha256:b").is_some());
    }
}
