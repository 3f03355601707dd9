//! Inflight coalescer: single-flight per cache key.
//!
//! Built on `DashMap<String, Entry>` plus `tokio::sync::Notify`: the first
//! caller for a key installs an in-flight entry and is responsible for
//! resolving it; followers await the same `Notify` and then re-consult the
//! cache themselves.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Notify;

struct Entry {
    notify: Arc<Notify>,
    watchers: AtomicI64,
    started: Instant,
    error: parking_lot::Mutex<Option<String>>,
}

/// Handle returned to the first caller for a key. Must eventually call
/// `done`, or the entry leaks until the process restarts.
pub struct FirstCaller {
    key: String,
    table: Arc<DashMap<String, Arc<Entry>>>,
}

impl FirstCaller {
    pub fn done(self, error: Option<String>) {
        if let Some((_, entry)) = self.table.remove(&self.key) {
            *entry.error.lock() = error;
            entry.notify.notify_waiters();
        }
    }
}

pub enum TryStart {
    First(FirstCaller),
    Follower(Follower),
}

pub struct Follower {
    entry: Arc<Entry>,
}

impl Follower {
    /// Waits for the first caller to finish, or for `cancel` to fire first.
    /// Returns the first caller's reported error, if any.
    pub async fn wait(self, cancel: impl std::future::Future<Output = ()>) -> Result<Option<String>, ()> {
        self.entry.watchers.fetch_add(1, Ordering::Relaxed);
        let notified = self.entry.notify.notified();
        tokio::select! {
            _ = notified => {
                self.entry.watchers.fetch_sub(1, Ordering::Relaxed);
                Ok(self.entry.error.lock().clone())
            }
            _ = cancel => {
                self.entry.watchers.fetch_sub(1, Ordering::Relaxed);
                Err(())
            }
        }
    }
}

pub struct Coalescer {
    table: Arc<DashMap<String, Arc<Entry>>>,
    total: AtomicU64,
    deduplicated: AtomicU64,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new()
    }
}

impl Coalescer {
    pub fn new() -> Self {
        Self { table: Arc::new(DashMap::new()), total: AtomicU64::new(0), deduplicated: AtomicU64::new(0) }
    }

    pub fn try_start(&self, key: &str) -> TryStart {
        self.total.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.table.get(key) {
            self.deduplicated.fetch_add(1, Ordering::Relaxed);
            return TryStart::Follower(Follower { entry: entry.clone() });
        }
        match self.table.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                TryStart::Follower(Follower { entry: occupied.get().clone() })
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let entry = Arc::new(Entry {
                    notify: Arc::new(Notify::new()),
                    watchers: AtomicI64::new(0),
                    started: Instant::now(),
                    error: parking_lot::Mutex::new(None),
                });
                vacant.insert(entry);
                TryStart::First(FirstCaller { key: key.to_string(), table: self.table.clone() })
            }
        }
    }

    pub fn active_keys(&self) -> usize {
        self.table.len()
    }

    pub fn total_requests(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn deduplicated_requests(&self) -> u64 {
        self.deduplicated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn exactly_one_fetch_among_concurrent_followers() {
        let coalescer = Arc::new(Coalescer::new());
        let fetch_count = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..10 {
            let coalescer = coalescer.clone();
            let fetch_count = fetch_count.clone();
            handles.push(tokio::spawn(async move {
                match coalescer.try_start("blob:sha256:abc") {
                    TryStart::First(first) => {
                        fetch_count.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        first.done(None);
                    }
                    TryStart::Follower(follower) => {
                        let pending: std::future::Pending<()> = std::future::pending();
                        follower.wait(pending).await.unwrap();
                    }
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(fetch_count.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.total_requests(), 10);
        assert_eq!(coalescer.deduplicated_requests(), 9);
    }

    #[tokio::test]
    async fn entry_removed_after_done() {
        let coalescer = Coalescer::new();
        match coalescer.try_start("k") {
            TryStart::First(first) => first.done(None),
            TryStart::Follower(_) => panic!("expected first caller"),
        }
        assert_eq!(coalescer.active_keys(), 0);
    }

    #[tokio::test]
    async fn follower_cancel_returns_err() {
        let coalescer = Arc::new(Coalescer::new());
        let first = match coalescer.try_start("k") {
            TryStart::First(first) => first,
            TryStart::Follower(_) => panic!("expected first caller"),
        };
        let follower = match coalescer.try_start("k") {
            TryStart::Follower(follower) => follower,
            TryStart::First(_) => panic!("expected follower"),
        };
        let cancel_now = async {};
        assert!(follower.wait(cancel_now).await.is_err());
        first.done(None);
    }
}
