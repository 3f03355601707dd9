//! Manifest store (disk tier).
//!
//! Keyed by `repository + reference`, sharded the same way as the blob
//! store but addressed by a hash of the key rather than by content digest
//! (the manifest's own `descriptor.digest` is informational, not the
//! storage key).

use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::model::{CacheEntry, ManifestKey};

pub struct ManifestStore {
    root: PathBuf,
    tag_ttl: ChronoDuration,
    digest_ttl: ChronoDuration,
    index: RwLock<std::collections::HashMap<String, ()>>,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>, tag_ttl: ChronoDuration, digest_ttl: ChronoDuration) -> Self {
        Self { root: root.into(), tag_ttl, digest_ttl, index: RwLock::new(Default::default()) }
    }

    fn hash_key(key: &ManifestKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.cache_key().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn path_for(&self, key: &ManifestKey) -> PathBuf {
        let hash = Self::hash_key(key);
        let a = &hash[0..2];
        let b = &hash[2..4];
        self.root.join(a).join(b).join(format!("{hash}.json"))
    }

    pub fn ttl_for(&self, key: &ManifestKey) -> ChronoDuration {
        if key.is_digest_reference() { self.digest_ttl } else { self.tag_ttl }
    }

    pub async fn put(&self, key: &ManifestKey, mut entry: CacheEntry) -> Result<(), StoreError> {
        let now = Utc::now();
        entry.cached_at = now;
        entry.expires_at = now + self.ttl_for(key);

        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&entry)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        self.index.write().unwrap().insert(key.cache_key(), ());
        Ok(())
    }

    pub async fn get(&self, key: &ManifestKey) -> Result<Option<CacheEntry>, StoreError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(_) => {
                tokio::fs::remove_file(&path).await.ok();
                return Ok(None);
            }
        };
        if entry.is_expired(Utc::now()) {
            self.delete(key).await.ok();
            return Ok(None);
        }
        Ok(Some(entry))
    }

    pub async fn delete(&self, key: &ManifestKey) -> Result<(), StoreError> {
        let path = self.path_for(key);
        tokio::fs::remove_file(&path).await.ok();
        self.index.write().unwrap().remove(&key.cache_key());
        Ok(())
    }

    /// Sweeps every manifest file on disk, deleting expired entries.
    pub async fn cleanup(&self) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Ok(bytes) = tokio::fs::read(&path).await {
                    if let Ok(cached) = serde_json::from_slice::<CacheEntry>(&bytes) {
                        if cached.is_expired(Utc::now()) {
                            tokio::fs::remove_file(&path).await.ok();
                            removed += 1;
                        }
                    }
                }
            }
        }
        Ok(removed)
    }

    pub async fn load_index(&self) -> Result<u64, StoreError> {
        let mut count = 0u64;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    pub fn count(&self) -> usize {
        self.index.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Descriptor;

    fn entry() -> CacheEntry {
        CacheEntry {
            descriptor: Descriptor::new("sha256:".to_string() + &"a".repeat(64), 4, None),
            headers: vec![],
            status_code: 200,
            data: Some(b"body".to_vec()),
            body_path: None,
            cached_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path(), ChronoDuration::hours(24), ChronoDuration::days(365));
        let key = ManifestKey::new("library/nginx", "latest");
        store.put(&key, entry()).await.unwrap();
        let fetched = store.get(&key).await.unwrap().unwrap();
        assert_eq!(fetched.data, Some(b"body".to_vec()));
    }

    #[tokio::test]
    async fn digest_reference_gets_long_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path(), ChronoDuration::hours(24), ChronoDuration::days(365));
        let tag_key = ManifestKey::new("library/nginx", "latest");
        let digest_key = ManifestKey::new("library/nginx", "sha256:abc");
        assert!(store.ttl_for(&digest_key) > store.ttl_for(&tag_key));
    }
}
