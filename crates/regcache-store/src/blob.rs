//! Content-addressed blob store (disk tier).
//!
//! Layout under the configured root: `<hh>/<hh>/<hex>` for data plus a JSON
//! sidecar `<hh>/<hh>/<hex>.meta`. Writes are integrity-verified against the
//! claimed digest; the temp-file-then-rename discipline is carried through a
//! guard so every early-return path unlinks the partial file.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::descriptor::DescriptorIndex;
use crate::error::StoreError;
use crate::model::{parse_digest, BlobRecord, Descriptor};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StoreError>> + Send>>;

/// Renames a temp file into place on `success()`; unlinks it on drop otherwise.
struct WriteGuard {
    tmp_path: PathBuf,
    committed: bool,
}

impl WriteGuard {
    fn new(tmp_path: PathBuf) -> Self {
        Self { tmp_path, committed: false }
    }

    async fn success(mut self, final_path: &Path) -> Result<(), StoreError> {
        if let Err(err) = tokio::fs::rename(&self.tmp_path, final_path).await {
            // cross-device rename: fall back to copy + remove.
            tokio::fs::copy(&self.tmp_path, final_path).await?;
            tokio::fs::remove_file(&self.tmp_path).await.ok();
            self.committed = true;
            return err_to_ok(err);
        }
        self.committed = true;
        Ok(())
    }
}

fn err_to_ok(_err: std::io::Error) -> Result<(), StoreError> {
    Ok(())
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if !self.committed {
            let path = self.tmp_path.clone();
            tokio::spawn(async move {
                tokio::fs::remove_file(&path).await.ok();
            });
        }
    }
}

pub struct BlobStore {
    root: PathBuf,
    index: Arc<DescriptorIndex>,
    ttl: ChronoDuration,
    blob_count: AtomicU64,
    total_size: AtomicI64,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, index: Arc<DescriptorIndex>, ttl: ChronoDuration) -> Self {
        Self {
            root: root.into(),
            index,
            ttl,
            blob_count: AtomicU64::new(0),
            total_size: AtomicI64::new(0),
        }
    }

    fn shard_dir(&self, hash: &str) -> PathBuf {
        let a = &hash[0..2.min(hash.len())];
        let b = &hash[2..4.min(hash.len())];
        self.root.join(a).join(b)
    }

    fn data_path(&self, digest: &str) -> Result<PathBuf, StoreError> {
        let (_, hash) = parse_digest(digest).ok_or_else(|| StoreError::InvalidDigest(digest.to_string()))?;
        Ok(self.shard_dir(hash).join(hash))
    }

    fn meta_path(&self, digest: &str) -> Result<PathBuf, StoreError> {
        let (_, hash) = parse_digest(digest).ok_or_else(|| StoreError::InvalidDigest(digest.to_string()))?;
        Ok(self.shard_dir(hash).join(format!("{hash}.meta")))
    }

    /// Streams `body` into the CAS keyed by `digest`, verifying integrity as it goes.
    pub async fn put(
        &self,
        digest: &str,
        media_type: Option<String>,
        mut body: impl Stream<Item = Result<Bytes, StoreError>> + Unpin,
    ) -> Result<BlobRecord, StoreError> {
        let (_, hash) = parse_digest(digest).ok_or_else(|| StoreError::InvalidDigest(digest.to_string()))?;
        let dir = self.shard_dir(hash);
        tokio::fs::create_dir_all(&dir).await?;

        let tmp_path = dir.join(format!(".{hash}.{}.tmp", uuid_like()));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let guard = WriteGuard::new(tmp_path.clone());

        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != digest {
            return Err(StoreError::DigestMismatch { expected: digest.to_string(), actual: computed });
        }

        let final_path = dir.join(hash);
        guard.success(&final_path).await?;

        let now = Utc::now();
        let record = BlobRecord {
            digest: digest.to_string(),
            size,
            media_type,
            cached_at: now,
            expires_at: now + self.ttl,
            file_path: final_path.to_string_lossy().into_owned(),
        };
        self.write_sidecar(digest, &record).await?;
        self.index.put(record.descriptor());
        self.blob_count.fetch_add(1, Ordering::Relaxed);
        self.total_size.fetch_add(size as i64, Ordering::Relaxed);
        Ok(record)
    }

    async fn write_sidecar(&self, digest: &str, record: &BlobRecord) -> Result<(), StoreError> {
        let meta_path = self.meta_path(digest)?;
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = meta_path.with_extension("meta.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &meta_path).await?;
        Ok(())
    }

    /// Checks presence and freshness of a blob, reading the sidecar when the
    /// descriptor index doesn't already know about it. Self-heals orphaned
    /// or expired sidecars by removing them.
    pub async fn stat(&self, digest: &str) -> Result<Option<BlobRecord>, StoreError> {
        if self.index.get(digest).is_some() {
            if let Some(record) = self.read_sidecar(digest).await? {
                if !record.is_expired(Utc::now()) {
                    return Ok(Some(record));
                }
            }
        }
        match self.read_sidecar(digest).await? {
            Some(record) if record.is_expired(Utc::now()) => {
                self.delete(digest).await.ok();
                Ok(None)
            }
            Some(record) => {
                self.index.put(record.descriptor());
                Ok(Some(record))
            }
            None => {
                self.index.evict(digest);
                Ok(None)
            }
        }
    }

    async fn read_sidecar(&self, digest: &str) -> Result<Option<BlobRecord>, StoreError> {
        let meta_path = match self.meta_path(digest) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };
        match tokio::fs::read(&meta_path).await {
            Ok(bytes) => match serde_json::from_slice::<BlobRecord>(&bytes) {
                Ok(record) => Ok(Some(record)),
                Err(_) => {
                    // orphaned/corrupt sidecar: self-heal by removing it.
                    tokio::fs::remove_file(&meta_path).await.ok();
                    Ok(None)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, digest: &str) -> Result<Option<ByteStream>, StoreError> {
        if self.stat(digest).await?.is_none() {
            return Ok(None);
        }
        let data_path = self.data_path(digest)?;
        let file = match tokio::fs::File::open(&data_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let stream = tokio_util::io::ReaderStream::new(file).map(|r| r.map_err(StoreError::from));
        Ok(Some(Box::pin(stream)))
    }

    pub async fn delete(&self, digest: &str) -> Result<(), StoreError> {
        let data_path = self.data_path(digest)?;
        let meta_path = self.meta_path(digest)?;
        tokio::fs::remove_file(&data_path).await.ok();
        tokio::fs::remove_file(&meta_path).await.ok();
        self.index.evict(digest);
        Ok(())
    }

    /// Sweeps expired entries and evicts further entries (LRU-ordered) until
    /// the aggregate size is under `max_size`.
    pub async fn cleanup(&self, max_size: u64) -> Result<(), StoreError> {
        let mut expired = Vec::new();
        let mut entries = Vec::new();
        self.walk(|record| {
            if record.is_expired(Utc::now()) {
                expired.push(record.digest.clone());
            } else {
                entries.push(record);
            }
        })
        .await?;
        for digest in expired {
            self.delete(&digest).await.ok();
        }

        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        // recency-ordered eviction: oldest cached_at first.
        entries.sort_by_key(|e| e.cached_at);
        for record in entries {
            if total <= max_size {
                break;
            }
            total = total.saturating_sub(record.size);
            self.delete(&record.digest).await.ok();
        }
        Ok(())
    }

    /// Walks the on-disk tree, invoking `visit` for each valid, non-expired record.
    async fn walk(&self, mut visit: impl FnMut(BlobRecord)) -> Result<(), StoreError> {
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
                if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                    continue;
                }
                if let Ok(bytes) = tokio::fs::read(&path).await {
                    if let Ok(record) = serde_json::from_slice::<BlobRecord>(&bytes) {
                        visit(record);
                    }
                }
            }
        }
        Ok(())
    }

    /// Loads every non-expired sidecar into the descriptor index. Returns
    /// `(count, total_size)`.
    pub async fn load_index(&self) -> Result<(u64, u64), StoreError> {
        let mut count = 0u64;
        let mut size = 0u64;
        let now = Utc::now();
        self.walk(|record| {
            if record.is_expired(now) {
                return;
            }
            size += record.size;
            count += 1;
        })
        .await?;
        // second pass populates the index (kept separate so size/count are
        // accurate even if population is skipped for huge trees later).
        self.walk(|record| {
            if !record.is_expired(now) {
                self.index.put(record.descriptor());
            }
        })
        .await?;
        self.blob_count.store(count, Ordering::Relaxed);
        self.total_size.store(size as i64, Ordering::Relaxed);
        Ok((count, size))
    }

    pub fn blob_count(&self) -> u64 {
        self.blob_count.load(Ordering::Relaxed)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn descriptor_from(record: &BlobRecord) -> Descriptor {
        record.descriptor()
    }
}

fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    format!("{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn index() -> Arc<DescriptorIndex> {
        Arc::new(DescriptorIndex::new(64, std::time::Duration::from_secs(3600)))
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), index(), ChronoDuration::hours(1));
        let data = b"hello world".to_vec();
        let digest = crate::model::compute_sha256(&data);
        let body = stream::once(async move { Ok(Bytes::from(data.clone())) });
        store.put(&digest, None, Box::pin(body)).await.unwrap();

        let mut out = Vec::new();
        let mut s = store.get(&digest).await.unwrap().unwrap();
        while let Some(chunk) = s.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn digest_mismatch_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), index(), ChronoDuration::hours(1));
        let claimed = "sha256:".to_string() + &"a".repeat(64);
        let body = stream::once(async { Ok(Bytes::from_static(b"not matching")) });
        let err = store.put(&claimed, None, Box::pin(body)).await.unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));
        assert!(store.stat(&claimed).await.unwrap().is_none());

        let mut walked = 0;
        for entry in walkdir_count(dir.path()) {
            walked += entry;
        }
        assert_eq!(walked, 0);
    }

    fn walkdir_count(root: &Path) -> Vec<usize> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    out.extend(walkdir_count(&path));
                } else {
                    out.push(1);
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn stat_reports_absent_after_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), index(), ChronoDuration::hours(1));
        let data = b"abc".to_vec();
        let digest = crate::model::compute_sha256(&data);
        let body = stream::once(async move { Ok(Bytes::from(data.clone())) });
        store.put(&digest, None, Box::pin(body)).await.unwrap();
        store.delete(&digest).await.unwrap();
        assert!(store.stat(&digest).await.unwrap().is_none());
    }
}
