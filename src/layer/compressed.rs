//! Transparent per-blob compression wrapping a backend.
//!
//! Codec tag 0 = stored raw (compression would have inflated the payload),
//! codec tag 1 = DEFLATE via `flate2`, the compression crate the teacher
//! dedup crate already depended on.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::backend::{Backend, BackendStats, BlobStat, MetadataStat};
use crate::error::{BkError, BkResult};

const CODEC_RAW: u8 = 0;
const CODEC_ZLIB: u8 = 1;

pub struct CompressedLayer {
    inner: Box<dyn Backend>,
}

impl CompressedLayer {
    pub fn new(inner: Box<dyn Backend>) -> Self {
        CompressedLayer { inner }
    }

    fn encode(plaintext: &[u8]) -> BkResult<Vec<u8>> {
        compress_blob(plaintext)
    }

    fn decode(storage_bytes: &[u8]) -> BkResult<Vec<u8>> {
        decompress_blob(storage_bytes)
    }
}

/// Free-standing version of the codec so `pack.rs` can apply it per chunk
/// without going through the `Backend` decorator (a pack file bundles many
/// already-encoded chunk records into one stored object; see `pack.rs`).
pub fn compress_blob(plaintext: &[u8]) -> BkResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(plaintext)?;
    let compressed = encoder.finish()?;

    let mut out = Vec::with_capacity(compressed.len().min(plaintext.len()) + 5);
    if compressed.len() < plaintext.len() {
        out.push(CODEC_ZLIB);
        out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
        out.extend_from_slice(&compressed);
    } else {
        out.push(CODEC_RAW);
        out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
        out.extend_from_slice(plaintext);
    }
    Ok(out)
}

pub fn decompress_blob(storage_bytes: &[u8]) -> BkResult<Vec<u8>> {
    if storage_bytes.len() < 5 {
        return Err(BkError::IntegrityError(
            "truncated compressed-layer header".into(),
        ));
    }
    let codec = storage_bytes[0];
    let plain_len = u32::from_le_bytes(storage_bytes[1..5].try_into().unwrap()) as usize;
    let payload = &storage_bytes[5..];
    match codec {
        CODEC_RAW => {
            if payload.len() != plain_len {
                return Err(BkError::IntegrityError("raw codec length mismatch".into()));
            }
            Ok(payload.to_vec())
        }
        CODEC_ZLIB => {
            let mut decoder = ZlibDecoder::new(payload);
            let mut out = Vec::with_capacity(plain_len);
            decoder.read_to_end(&mut out)?;
            if out.len() != plain_len {
                return Err(BkError::IntegrityError(
                    "decompressed length mismatch".into(),
                ));
            }
            Ok(out)
        }
        other => Err(BkError::IntegrityError(format!(
            "unknown compression codec tag {other}"
        ))),
    }
}

impl Backend for CompressedLayer {
    fn write_blob(&self, name: &str, bytes: &[u8]) -> BkResult<()> {
        self.inner.write_blob(name, &Self::encode(bytes)?)
    }

    fn read_blob(&self, name: &str) -> BkResult<Vec<u8>> {
        Self::decode(&self.inner.read_blob(name)?)
    }

    fn blob_exists(&self, name: &str) -> BkResult<bool> {
        self.inner.blob_exists(name)
    }

    fn list_blobs(&self, prefix: &str) -> BkResult<Vec<BlobStat>> {
        self.inner.list_blobs(prefix)
    }

    fn write_metadata(&self, key: &str, bytes: &[u8]) -> BkResult<()> {
        self.inner.write_metadata(key, &Self::encode(bytes)?)
    }

    fn read_metadata(&self, key: &str) -> BkResult<Vec<u8>> {
        Self::decode(&self.inner.read_metadata(key)?)
    }

    fn metadata_exists(&self, key: &str) -> BkResult<bool> {
        self.inner.metadata_exists(key)
    }

    fn list_metadata(&self) -> BkResult<Vec<MetadataStat>> {
        self.inner.list_metadata()
    }

    fn sync(&self) -> BkResult<()> {
        self.inner.sync()
    }

    fn fsck(&self) -> BkResult<Vec<String>> {
        self.inner.fsck()
    }

    fn stats(&self) -> BkResult<BackendStats> {
        self.inner.stats()
    }

    fn describe(&self) -> String {
        format!("compressed({})", self.inner.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;

    #[test]
    fn round_trips_compressible_data() {
        let dir = tempfile::tempdir().unwrap();
        let layer = CompressedLayer::new(Box::new(LocalBackend::open(dir.path()).unwrap()));
        let data = vec![b'a'; 10_000];
        layer.write_blob("k", &data).unwrap();
        assert_eq!(layer.read_blob("k").unwrap(), data);
    }

    #[test]
    fn round_trips_incompressible_data() {
        let dir = tempfile::tempdir().unwrap();
        let layer = CompressedLayer::new(Box::new(LocalBackend::open(dir.path()).unwrap()));
        let data: Vec<u8> = (0..=255u8).cycle().take(4000).collect();
        layer.write_blob("k", &data).unwrap();
        assert_eq!(layer.read_blob("k").unwrap(), data);
    }

    #[test]
    fn empty_blob_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let layer = CompressedLayer::new(Box::new(LocalBackend::open(dir.path()).unwrap()));
        layer.write_blob("k", b"").unwrap();
        assert_eq!(layer.read_blob("k").unwrap(), b"");
    }
}
