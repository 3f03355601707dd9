//! Statistics counters: plain atomics sampled concurrently without locks,
//! exposed via the API crate's `/stats` and `/stats/cache` routes.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    pub blob_hits: AtomicU64,
    pub blob_misses: AtomicU64,
    pub manifest_hits: AtomicU64,
    pub manifest_misses: AtomicU64,
    pub blob_count: AtomicU64,
    pub manifest_count: AtomicU64,
    pub total_size: AtomicI64,
    pub deduplicated: AtomicU64,
    pub last_cleanup: AtomicI64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_blob_hit(&self) {
        self.blob_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blob_miss(&self) {
        self.blob_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manifest_hit(&self) {
        self.manifest_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manifest_miss(&self) {
        self.manifest_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            blob_hits: self.blob_hits.load(Ordering::Relaxed),
            blob_misses: self.blob_misses.load(Ordering::Relaxed),
            manifest_hits: self.manifest_hits.load(Ordering::Relaxed),
            manifest_misses: self.manifest_misses.load(Ordering::Relaxed),
            blob_count: self.blob_count.load(Ordering::Relaxed),
            manifest_count: self.manifest_count.load(Ordering::Relaxed),
            total_size: self.total_size.load(Ordering::Relaxed).max(0) as u64,
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            last_cleanup: self.last_cleanup.load(Ordering::Relaxed),
        }
    }
}

#[derive(serde::Serialize)]
pub struct StatsSnapshot {
    pub blob_hits: u64,
    pub blob_misses: u64,
    pub manifest_hits: u64,
    pub manifest_misses: u64,
    pub blob_count: u64,
    pub manifest_count: u64,
    pub total_size: u64,
    pub deduplicated: u64,
    pub last_cleanup: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_snapshots() {
        let stats = Stats::new();
        stats.record_blob_hit();
        stats.record_blob_hit();
        stats.record_blob_miss();
        let snap = stats.snapshot();
        assert_eq!(snap.blob_hits, 2);
        assert_eq!(snap.blob_misses, 1);
    }
}
