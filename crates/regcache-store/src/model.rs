//! Shared data types for the descriptor index, blob store, and manifest store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a piece of content: digest, size and an optional media type.
///
/// Invariant: once a descriptor is stored, the bytes addressed by `digest`
/// hash to `digest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub digest: String,
    pub size: u64,
    pub media_type: Option<String>,
}

impl Descriptor {
    pub fn new(digest: impl Into<String>, size: u64, media_type: Option<String>) -> Self {
        Self { digest: digest.into(), size, media_type }
    }
}

/// Splits a digest of the form `<algorithm>:<hex>` into its two parts.
pub fn parse_digest(digest: &str) -> Option<(&str, &str)> {
    let mut parts = digest.splitn(2, ':');
    let algorithm = parts.next()?;
    let hash = parts.next()?;
    if algorithm.is_empty() || hash.is_empty() {
        return None;
    }
    Some((algorithm, hash))
}

/// Computes the `sha256:<hex>` digest of a byte slice.
pub fn compute_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// A captured response header, stored case-preserved.
pub type Header = (String, String);

/// Unit of response cache for manifests and small in-memory bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub descriptor: Descriptor,
    pub headers: Vec<Header>,
    pub status_code: u16,
    pub data: Option<Vec<u8>>,
    pub body_path: Option<String>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Persistent sidecar metadata accompanying a blob file on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRecord {
    pub digest: String,
    pub size: u64,
    pub media_type: Option<String>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub file_path: String,
}

impl BlobRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(self.digest.clone(), self.size, self.media_type.clone())
    }
}

/// Key identifying a manifest: a repository name plus a tag or digest reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestKey {
    pub repository: String,
    pub reference: String,
}

impl ManifestKey {
    pub fn new(repository: impl Into<String>, reference: impl Into<String>) -> Self {
        Self { repository: repository.into(), reference: reference.into() }
    }

    /// Digest references are immutable and get the long TTL; tags get the short TTL.
    pub fn is_digest_reference(&self) -> bool {
        self.reference.starts_with("sha256:")
    }

    pub fn cache_key(&self) -> String {
        format!("{}/{}", self.repository, self.reference)
    }
}
