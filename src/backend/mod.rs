//! The storage capability set every layer (compressed, encrypted) decorates
//! and every concrete backend (local disk, object store) implements.
//!
//! Grounded on the teacher workspace's decorator-style layering (liboxen's
//! `Backend`-shaped storage traits live under `src/lib/src/storage.rs`);
//! this is a smaller, explicit version scoped to exactly §4.F of the spec.

pub mod local;
pub mod object_store;

use crate::error::BkResult;

#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    pub blob_count: u64,
    pub blob_bytes: u64,
    pub metadata_count: u64,
    pub metadata_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct BlobStat {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct MetadataStat {
    pub key: String,
    pub size: u64,
}

/// A decorator chain (compressed -> encrypted -> concrete backend) built
/// from trait objects, not inheritance.
pub trait Backend: Send + Sync {
    fn write_blob(&self, name: &str, bytes: &[u8]) -> BkResult<()>;
    fn read_blob(&self, name: &str) -> BkResult<Vec<u8>>;
    fn blob_exists(&self, name: &str) -> BkResult<bool>;
    fn list_blobs(&self, prefix: &str) -> BkResult<Vec<BlobStat>>;

    fn write_metadata(&self, key: &str, bytes: &[u8]) -> BkResult<()>;
    fn read_metadata(&self, key: &str) -> BkResult<Vec<u8>>;
    fn metadata_exists(&self, key: &str) -> BkResult<bool>;
    fn list_metadata(&self) -> BkResult<Vec<MetadataStat>>;

    fn sync(&self) -> BkResult<()>;
    fn fsck(&self) -> BkResult<Vec<String>>;
    fn stats(&self) -> BkResult<BackendStats>;
    fn describe(&self) -> String;
}
