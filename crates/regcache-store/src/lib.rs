//! Two-tier cache storage: an in-memory descriptor index backed by an
//! on-disk content-addressed blob store and a separate on-disk manifest
//! store, plus the background maintenance sweep that keeps both bounded.

pub mod blob;
pub mod descriptor;
pub mod error;
pub mod maintenance;
pub mod manifest;
pub mod model;

pub use blob::{BlobStore, ByteStream};
pub use descriptor::DescriptorIndex;
pub use error::StoreError;
pub use maintenance::{spawn_maintenance, LastCleanup};
pub use manifest::ManifestStore;
pub use model::{compute_sha256, parse_digest, BlobRecord, CacheEntry, Descriptor, ManifestKey};
