//! Append-only chunk packs and their index.
//!
//! A pack file bundles many chunks' already-compressed, already-encrypted
//! "storage-layer form" (§4.D/§4.E) into one object so a repository with
//! millions of small chunks doesn't turn into millions of small files. Each
//! chunk is still individually compressed and individually AEAD-sealed
//! before it's appended — `ChunkCodec` applies exactly the same per-blob
//! transform `layer::compressed`/`layer::encrypted` expose for metadata, just
//! invoked directly instead of through the `Backend` decorator, since the
//! unit being encoded here is one chunk record inside a bigger file rather
//! than one backend-addressed object.

use std::collections::BTreeMap;
use std::sync::Arc;

use aes_gcm::Aes256Gcm;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::{BkError, BkResult};
use crate::hash::Hash;
use crate::layer::encrypted::{open_with, seal_with, CHUNK_AAD_TAG};
use crate::layer::compressed::{compress_blob, decompress_blob};

const PACK_MAGIC: &[u8; 4] = b"BKPK";
const PACK_VERSION: u8 = 1;

/// Target size before a pack is closed and a new one opened. The hard cap
/// exists so one pathological chunk stream can't grow a single pack
/// unboundedly past the target.
pub const PACK_TARGET_SIZE: u64 = 64 * 1024 * 1024;
pub const PACK_HARD_CAP: u64 = 128 * 1024 * 1024;

struct ChunkCodec {
    cipher: Option<Aes256Gcm>,
}

impl ChunkCodec {
    fn encode(&self, plaintext: &[u8]) -> BkResult<Vec<u8>> {
        let compressed = compress_blob(plaintext)?;
        match &self.cipher {
            Some(cipher) => seal_with(cipher, &compressed, CHUNK_AAD_TAG),
            None => Ok(compressed),
        }
    }

    fn decode(&self, storage_bytes: &[u8], hash: Hash) -> BkResult<Vec<u8>> {
        let compressed = match &self.cipher {
            Some(cipher) => open_with(cipher, storage_bytes, CHUNK_AAD_TAG, &hash.to_hex())?,
            None => storage_bytes.to_vec(),
        };
        decompress_blob(&compressed)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub pack_id: Uuid,
    pub offset: u64,
    pub plain_len: u32,
    pub stored_len: u32,
}

#[derive(Serialize, Deserialize)]
struct PackIndexEntry {
    hash: [u8; 32],
    offset: u64,
    plain_len: u32,
    stored_len: u32,
}

#[derive(Serialize, Deserialize, Default)]
struct PackIndexBlob {
    pack_id: Uuid,
    entries: Vec<PackIndexEntry>,
}

struct OpenPack {
    id: Uuid,
    buf: Vec<u8>,
    entries: Vec<PackIndexEntry>,
}

impl OpenPack {
    fn new() -> Self {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(PACK_MAGIC);
        buf.push(PACK_VERSION);
        OpenPack {
            id: Uuid::new_v4(),
            buf,
            entries: Vec::new(),
        }
    }

    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn append(&mut self, hash: Hash, plain_len: u32, storage_bytes: &[u8]) -> u64 {
        let offset = self.buf.len() as u64;
        let mut len_buf = Vec::new();
        leb128::write::unsigned(&mut len_buf, storage_bytes.len() as u64).unwrap();
        self.buf.extend_from_slice(&len_buf);
        self.buf.extend_from_slice(storage_bytes);
        self.entries.push(PackIndexEntry {
            hash: *hash.as_bytes(),
            offset,
            plain_len,
            stored_len: storage_bytes.len() as u32,
        });
        offset
    }

    /// Appends the trailing index and returns the finished pack bytes plus
    /// its own index blob, per the §6 binary layout.
    fn finalize(mut self) -> (Vec<u8>, PackIndexBlob) {
        let trailer_offset = self.buf.len() as u64;
        let mut index_bytes = Vec::new();
        for entry in &self.entries {
            index_bytes.extend_from_slice(&entry.hash);
            leb128::write::unsigned(&mut index_bytes, entry.offset).unwrap();
            leb128::write::unsigned(&mut index_bytes, entry.plain_len as u64).unwrap();
            leb128::write::unsigned(&mut index_bytes, entry.stored_len as u64).unwrap();
        }
        let index_len = index_bytes.len() as u64;
        self.buf.extend_from_slice(&index_bytes);
        self.buf.extend_from_slice(&trailer_offset.to_le_bytes());
        self.buf.extend_from_slice(&index_len.to_le_bytes());

        (
            self.buf,
            PackIndexBlob {
                pack_id: self.id,
                entries: self.entries,
            },
        )
    }
}

fn pack_blob_name(id: Uuid) -> String {
    format!("pack-{id}")
}

fn packidx_key(id: Uuid) -> String {
    format!("packidx-{id}")
}

/// Reads a finalized pack file's storage-layer record at the given offset.
fn read_record(pack_bytes: &[u8], offset: u64, stored_len: u32) -> BkResult<&[u8]> {
    let mut cursor = &pack_bytes[offset as usize..];
    let declared_len = leb128::read::unsigned(&mut cursor)
        .map_err(|e| BkError::IntegrityError(format!("bad pack record length: {e}")))?;
    if declared_len != stored_len as u64 {
        return Err(BkError::IntegrityError(
            "pack record length disagrees with index".into(),
        ));
    }
    let header_len = pack_bytes[offset as usize..].len() - cursor.len();
    let start = offset as usize + header_len;
    let end = start + stored_len as usize;
    if end > pack_bytes.len() {
        return Err(BkError::IntegrityError("truncated pack file".into()));
    }
    Ok(&pack_bytes[start..end])
}

/// Appends chunks into bounded pack files; maintains the chunk index.
/// Single writer per repository (§4.C concurrency note).
pub struct BlobPack {
    /// Raw, undecorated backend for `pack-<uuid>` blob bytes: each chunk
    /// record inside is already individually compressed and encrypted by
    /// `ChunkCodec`, so running the whole pack through `CompressedLayer`/
    /// `EncryptedLayer` again would double that work for no benefit.
    blobs: Arc<dyn Backend>,
    /// Decorated backend (compressed, optionally encrypted) for
    /// `packidx-<uuid>` metadata, which is small and benefits from the same
    /// treatment as every other metadata blob.
    meta: Arc<dyn Backend>,
    codec: ChunkCodec,
    index: RwLock<BTreeMap<Hash, ChunkLocation>>,
    open: RwLock<Option<OpenPack>>,
}

impl BlobPack {
    /// `blobs` must be the undecorated backend (pack bytes are self-encoding);
    /// `meta` is the decorated backend used for everything else.
    pub fn open(blobs: Arc<dyn Backend>, meta: Arc<dyn Backend>, cipher: Option<Aes256Gcm>) -> BkResult<Self> {
        let pack = BlobPack {
            blobs,
            meta,
            codec: ChunkCodec { cipher },
            index: RwLock::new(BTreeMap::new()),
            open: RwLock::new(None),
        };
        pack.load_index()?;
        Ok(pack)
    }

    fn load_index(&self) -> BkResult<()> {
        let mut index = self.index.write();
        let metadata = self.meta.list_metadata()?;
        let mut indexed_packs = std::collections::HashSet::new();

        for entry in metadata.iter().filter(|m| m.key.starts_with("packidx-")) {
            let bytes = self.meta.read_metadata(&entry.key)?;
            let blob: PackIndexBlob = bincode::deserialize(&bytes)?;
            indexed_packs.insert(blob.pack_id);
            for e in blob.entries {
                let hash = Hash::from_bytes(&e.hash)?;
                index.insert(
                    hash,
                    ChunkLocation {
                        pack_id: blob.pack_id,
                        offset: e.offset,
                        plain_len: e.plain_len,
                        stored_len: e.stored_len,
                    },
                );
            }
        }

        // Recover packs that were closed but never got their index written
        // (crash between pack-close and index-write, §4.H state machine).
        for blob in self.blobs.list_blobs("pack-")? {
            let id_str = blob.name.trim_start_matches("pack-");
            let Ok(id) = Uuid::parse_str(id_str) else { continue };
            if indexed_packs.contains(&id) {
                continue;
            }
            let pack_bytes = self.blobs.read_blob(&blob.name)?;
            for (hash, loc) in rebuild_index_from_pack(id, &pack_bytes)? {
                index.insert(hash, loc);
            }
        }
        Ok(())
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.index.read().contains_key(hash)
    }

    /// Hashes plaintext; if already indexed, no store write happens.
    pub fn write(&self, plaintext: &[u8]) -> BkResult<Hash> {
        let hash = Hash::of(plaintext);
        if self.contains(&hash) {
            return Ok(hash);
        }

        let storage_bytes = self.codec.encode(plaintext)?;
        let mut open_guard = self.open.write();
        if open_guard.is_none() {
            *open_guard = Some(OpenPack::new());
        }
        let open = open_guard.as_mut().unwrap();
        let offset = open.append(hash, plaintext.len() as u32, &storage_bytes);
        let pack_id = open.id;
        let should_rotate = open.len() >= PACK_TARGET_SIZE;

        self.index.write().insert(
            hash,
            ChunkLocation {
                pack_id,
                offset,
                plain_len: plaintext.len() as u32,
                stored_len: storage_bytes.len() as u32,
            },
        );

        if should_rotate || open.len() >= PACK_HARD_CAP {
            let finished = open_guard.take().unwrap();
            drop(open_guard);
            self.close_pack(finished)?;
        }

        Ok(hash)
    }

    fn close_pack(&self, pack: OpenPack) -> BkResult<()> {
        if pack.entries.is_empty() {
            return Ok(());
        }
        let (bytes, index_blob) = pack.finalize();
        let name = pack_blob_name(index_blob.pack_id);
        self.blobs.write_blob(&name, &bytes)?;
        let index_bytes = bincode::serialize(&index_blob)?;
        self.meta
            .write_metadata(&packidx_key(index_blob.pack_id), &index_bytes)?;
        Ok(())
    }

    pub fn read(&self, hash: &Hash) -> BkResult<Vec<u8>> {
        let loc = *self
            .index
            .read()
            .get(hash)
            .ok_or_else(|| BkError::NotFound(format!("chunk {hash}")))?;

        // The chunk may still be sitting in the open (not yet closed) pack.
        if let Some(open) = self.open.read().as_ref() {
            if open.id == loc.pack_id {
                let record = &open.buf[loc.offset as usize..];
                let mut cursor = record;
                let declared_len = leb128::read::unsigned(&mut cursor)
                    .map_err(|e| BkError::IntegrityError(format!("bad pack record: {e}")))?;
                let header_len = record.len() - cursor.len();
                let start = loc.offset as usize + header_len;
                let end = start + declared_len as usize;
                return self.codec.decode(&open.buf[start..end], *hash);
            }
        }

        let pack_bytes = self.blobs.read_blob(&pack_blob_name(loc.pack_id))?;
        let record = read_record(&pack_bytes, loc.offset, loc.stored_len)?;
        self.codec.decode(record, *hash)
    }

    /// Flushes any open pack, writes its index, begins a new open pack.
    pub fn sync(&self) -> BkResult<()> {
        let finished = self.open.write().take();
        if let Some(pack) = finished {
            self.close_pack(pack)?;
        }
        self.blobs.sync()?;
        self.meta.sync()
    }

    /// Verifies every indexed chunk is retrievable and rehashes correctly
    /// (I1). Accumulates rather than stopping at the first problem (§7).
    pub fn fsck(&self) -> BkResult<Vec<String>> {
        let mut problems = Vec::new();
        let index_snapshot: Vec<(Hash, ChunkLocation)> =
            self.index.read().iter().map(|(h, l)| (*h, *l)).collect();

        for (hash, _loc) in index_snapshot {
            match self.read(&hash) {
                Ok(plaintext) => {
                    let recomputed = Hash::of(&plaintext);
                    if recomputed != hash {
                        problems.push(format!(
                            "chunk {hash}: rehashes as {recomputed}"
                        ));
                    }
                }
                Err(e) => problems.push(format!("chunk {hash}: {e}")),
            }
        }
        problems.extend(self.blobs.fsck()?);
        if !Arc::ptr_eq(&self.blobs, &self.meta) {
            problems.extend(self.meta.fsck()?);
        }
        Ok(problems)
    }

    pub fn chunk_count(&self) -> usize {
        self.index.read().len()
    }
}

fn rebuild_index_from_pack(id: Uuid, pack_bytes: &[u8]) -> BkResult<Vec<(Hash, ChunkLocation)>> {
    if pack_bytes.len() < 16 || &pack_bytes[0..4] != PACK_MAGIC {
        return Err(BkError::IntegrityError(format!(
            "pack {id} has a bad magic header"
        )));
    }
    let len = pack_bytes.len();
    let trailer_offset = u64::from_le_bytes(pack_bytes[len - 16..len - 8].try_into().unwrap());
    let index_len = u64::from_le_bytes(pack_bytes[len - 8..].try_into().unwrap());
    let index_start = trailer_offset as usize;
    let index_end = index_start + index_len as usize;
    if index_end > len {
        return Err(BkError::IntegrityError(format!(
            "pack {id} trailer is out of bounds"
        )));
    }

    let mut cursor = &pack_bytes[index_start..index_end];
    let mut out = Vec::new();
    while !cursor.is_empty() {
        if cursor.len() < 32 {
            return Err(BkError::IntegrityError(format!(
                "pack {id} index is truncated"
            )));
        }
        let mut hash_bytes = [0u8; 32];
        hash_bytes.copy_from_slice(&cursor[..32]);
        cursor = &cursor[32..];
        let offset = leb128::read::unsigned(&mut cursor)
            .map_err(|e| BkError::IntegrityError(e.to_string()))?;
        let plain_len = leb128::read::unsigned(&mut cursor)
            .map_err(|e| BkError::IntegrityError(e.to_string()))? as u32;
        let stored_len = leb128::read::unsigned(&mut cursor)
            .map_err(|e| BkError::IntegrityError(e.to_string()))? as u32;
        out.push((
            Hash::from_bytes(&hash_bytes)?,
            ChunkLocation {
                pack_id: id,
                offset,
                plain_len,
                stored_len,
            },
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;

    fn pack(dir: &std::path::Path) -> BlobPack {
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::open(dir).unwrap());
        BlobPack::open(Arc::clone(&backend), backend, None).unwrap()
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let p = pack(dir.path());
        let hash = p.write(b"hello world").unwrap();
        assert_eq!(p.read(&hash).unwrap(), b"hello world");
    }

    #[test]
    fn duplicate_plaintext_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let p = pack(dir.path());
        let h1 = p.write(b"same bytes").unwrap();
        let h2 = p.write(b"same bytes").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(p.chunk_count(), 1);
    }

    #[test]
    fn survives_sync_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let hash;
        {
            let p = pack(dir.path());
            hash = p.write(b"durable bytes").unwrap();
            p.sync().unwrap();
        }
        let p2 = pack(dir.path());
        assert_eq!(p2.read(&hash).unwrap(), b"durable bytes");
    }

    #[test]
    fn fsck_clean_on_healthy_repo() {
        let dir = tempfile::tempdir().unwrap();
        let p = pack(dir.path());
        p.write(b"a").unwrap();
        p.write(b"b").unwrap();
        p.sync().unwrap();
        assert!(p.fsck().unwrap().is_empty());
    }

    #[test]
    fn fsck_detects_pack_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path()).unwrap();
        let hash;
        {
            let b: Arc<dyn Backend> = Arc::new(LocalBackend::open(dir.path()).unwrap());
            let p = BlobPack::open(Arc::clone(&b), b, None).unwrap();
            hash = p.write(b"tamper me").unwrap();
            p.sync().unwrap();
        }
        let _ = hash;

        // Flip a byte inside the single pack file on disk.
        let packs = backend.list_blobs("pack-").unwrap();
        assert_eq!(packs.len(), 1);
        let mut bytes = backend.read_blob(&packs[0].name).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        backend.write_blob(&packs[0].name, &bytes).unwrap();

        let b2: Arc<dyn Backend> = Arc::new(LocalBackend::open(dir.path()).unwrap());
        let p2 = BlobPack::open(Arc::clone(&b2), b2, None).unwrap();
        assert!(!p2.fsck().unwrap().is_empty());
    }
}
