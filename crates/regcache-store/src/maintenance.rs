//! Background maintenance task.
//!
//! A single recurring task that sweeps manifest TTLs, sweeps/evicts blobs
//! against a size cap, and stamps `last_cleanup`. Drives both stores from
//! one ticker and exits promptly on shutdown.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::blob::BlobStore;
use crate::manifest::ManifestStore;

pub struct LastCleanup(AtomicI64);

impl LastCleanup {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn stamp(&self) {
        self.0.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for LastCleanup {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the maintenance loop. The first tick is skipped so cleanup doesn't
/// race startup's index rebuild; the task exits as soon as `shutdown` fires.
pub fn spawn_maintenance(
    blobs: Arc<BlobStore>,
    manifests: Arc<ManifestStore>,
    last_cleanup: Arc<LastCleanup>,
    max_blob_size: u64,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_once(&manifests, &blobs, max_blob_size, &last_cleanup).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("maintenance task observed shutdown signal, exiting");
                        break;
                    }
                }
            }
        }
    })
}

async fn run_once(manifests: &ManifestStore, blobs: &BlobStore, max_blob_size: u64, last_cleanup: &LastCleanup) {
    match manifests.cleanup().await {
        Ok(removed) => info!(removed, "manifest cleanup complete"),
        Err(err) => warn!(%err, "manifest cleanup failed"),
    }
    if let Err(err) = blobs.cleanup(max_blob_size).await {
        warn!(%err, "blob cleanup failed");
    }
    last_cleanup.stamp();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_cleanup_starts_at_zero() {
        let lc = LastCleanup::new();
        assert_eq!(lc.get(), 0);
        lc.stamp();
        assert!(lc.get() > 0);
    }
}
