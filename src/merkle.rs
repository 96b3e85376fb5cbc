//! Merkle streams: a byte stream is content-defined-chunked, each chunk
//! content-addressed and written into the pack layer, and the resulting
//! array of chunk hashes is itself serialized and recursively chunked until
//! exactly one chunk remains. The stream is fully described by that root
//! chunk's hash, the recursion depth, and the original byte length.
//!
//! Grounded on the teacher's `dedup` crate treating a merkle node as "a list
//! of child hashes stored the same way as any other chunked content" (see
//! the original `chunker.rs` tree-building pass); this module generalizes
//! that to the spec's explicit depth/len-tagged `MerkleHash`.

use std::io::{self, Read};

use serde::{Deserialize, Serialize};

use crate::error::{BkError, BkResult};
use crate::hash::Hash;
use crate::pack::BlobPack;
use crate::splitter::{RollingSplitter, SplitterConfig};

/// A fully-qualified pointer to a merkle stream: which chunk is the root,
/// how many chunking levels separate it from the leaves, and how long the
/// original plaintext was (needed because the last leaf chunk may be
/// shorter than it looks from hashes alone).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleHash {
    pub root: Hash,
    pub depth: u8,
    pub len: u64,
}

/// One level's worth of child references, as stored inside a chunk: a flat
/// array of 32-byte hashes. This is the "storage layer form" a content
/// chunk's bytes take whenever depth > 0.
fn encode_level(hashes: &[Hash]) -> Vec<u8> {
    let mut out = Vec::with_capacity(hashes.len() * Hash::LEN);
    for h in hashes {
        out.extend_from_slice(h.as_bytes());
    }
    out
}

fn decode_level(bytes: &[u8]) -> BkResult<Vec<Hash>> {
    if bytes.len() % Hash::LEN != 0 {
        return Err(BkError::IntegrityError(
            "merkle level is not a whole number of hashes".into(),
        ));
    }
    bytes
        .chunks_exact(Hash::LEN)
        .map(Hash::from_bytes)
        .collect()
}

/// Writes a byte stream into the pack, returning the `MerkleHash` that
/// addresses it in full.
pub fn write_stream<R: Read>(pack: &BlobPack, config: &SplitterConfig, mut reader: R) -> BkResult<MerkleHash> {
    let mut total_len: u64 = 0;
    let mut leaf_hashes = Vec::new();
    let mut splitter = RollingSplitter::new(config.clone());
    let mut current = Vec::new();
    let mut byte = [0u8; 8192];

    loop {
        let n = reader.read(&mut byte)?;
        if n == 0 {
            break;
        }
        for &b in &byte[..n] {
            current.push(b);
            total_len += 1;
            if splitter.push(b) {
                leaf_hashes.push(pack.write(&current)?);
                current.clear();
                splitter.reset_chunk();
            }
        }
    }
    if !current.is_empty() || leaf_hashes.is_empty() {
        leaf_hashes.push(pack.write(&current)?);
    }

    if leaf_hashes.len() == 1 {
        return Ok(MerkleHash {
            root: leaf_hashes[0],
            depth: 0,
            len: total_len,
        });
    }

    let mut level = leaf_hashes;
    let mut depth: u8 = 1;
    loop {
        let encoded = encode_level(&level);
        let mut next_level = Vec::new();
        let mut splitter = RollingSplitter::new(config.clone());
        let mut chunk_start = 0usize;
        for (i, &b) in encoded.iter().enumerate() {
            if splitter.push(b) {
                next_level.push(pack.write(&encoded[chunk_start..=i])?);
                chunk_start = i + 1;
                splitter.reset_chunk();
            }
        }
        if chunk_start < encoded.len() || next_level.is_empty() {
            next_level.push(pack.write(&encoded[chunk_start..])?);
        }

        if next_level.len() == 1 {
            return Ok(MerkleHash {
                root: next_level[0],
                depth,
                len: total_len,
            });
        }
        level = next_level;
        depth += 1;
    }
}

/// Convenience wrapper for in-memory buffers (manifests, small metadata
/// payloads that still want dedup and chunk-sized pack records).
pub fn write_bytes(pack: &BlobPack, config: &SplitterConfig, bytes: &[u8]) -> BkResult<MerkleHash> {
    write_stream(pack, config, bytes)
}

/// Reads an entire merkle stream's plaintext back into memory. For large
/// streams prefer `MerkleReader`.
pub fn read_bytes(pack: &BlobPack, handle: MerkleHash) -> BkResult<Vec<u8>> {
    let mut out = Vec::with_capacity(handle.len as usize);
    let mut reader = MerkleReader::new(pack, handle);
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Depth-first traversal, verifying every referenced chunk exists and
/// rehashes correctly. Accumulates problems rather than stopping at the
/// first one, per the fsck contract.
pub fn fsck(pack: &BlobPack, handle: MerkleHash, problems: &mut Vec<String>) {
    fn walk(pack: &BlobPack, hash: Hash, depth: u8, problems: &mut Vec<String>) {
        let bytes = match pack.read(&hash) {
            Ok(b) => b,
            Err(e) => {
                problems.push(format!("merkle node {hash}: {e}"));
                return;
            }
        };
        if depth == 0 {
            return;
        }
        match decode_level(&bytes) {
            Ok(children) => {
                for child in children {
                    walk(pack, child, depth - 1, problems);
                }
            }
            Err(e) => problems.push(format!("merkle node {hash} at depth {depth}: {e}")),
        }
    }
    walk(pack, handle.root, handle.depth, problems);
}

/// Lazy, streaming reader over a merkle stream's plaintext. Expands one
/// leaf chunk at a time rather than materializing the whole stream, so
/// restoring a large file doesn't require holding it entirely in memory.
pub struct MerkleReader<'a> {
    pack: &'a BlobPack,
    // Stack of (remaining child hashes at this level, depth of those children)
    stack: Vec<(std::vec::IntoIter<Hash>, u8)>,
    current_leaf: io::Cursor<Vec<u8>>,
    done: bool,
}

impl<'a> MerkleReader<'a> {
    pub fn new(pack: &'a BlobPack, handle: MerkleHash) -> Self {
        MerkleReader {
            pack,
            stack: vec![(vec![handle.root].into_iter(), handle.depth)],
            current_leaf: io::Cursor::new(Vec::new()),
            done: false,
        }
    }

    fn advance_to_next_leaf(&mut self) -> BkResult<bool> {
        loop {
            let Some((iter, depth)) = self.stack.last_mut() else {
                return Ok(false);
            };
            let Some(hash) = iter.next() else {
                self.stack.pop();
                continue;
            };
            let depth = *depth;
            let bytes = self.pack.read(&hash)?;
            if depth == 0 {
                self.current_leaf = io::Cursor::new(bytes);
                return Ok(true);
            }
            let children = decode_level(&bytes)?;
            self.stack.push((children.into_iter(), depth - 1));
        }
    }
}

impl<'a> Read for MerkleReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done {
            return Ok(0);
        }
        loop {
            let n = self.current_leaf.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            match self.advance_to_next_leaf() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return Ok(0);
                }
                Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use std::sync::Arc;

    fn pack(dir: &std::path::Path) -> BlobPack {
        let backend: Arc<dyn crate::backend::Backend> =
            Arc::new(LocalBackend::open(dir).unwrap());
        BlobPack::open(Arc::clone(&backend), backend, None).unwrap()
    }

    #[test]
    fn single_chunk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = pack(dir.path());
        let config = SplitterConfig::new(14);
        let handle = write_bytes(&p, &config, b"small file").unwrap();
        assert_eq!(handle.depth, 0);
        assert_eq!(read_bytes(&p, handle).unwrap(), b"small file");
    }

    #[test]
    fn multi_chunk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = pack(dir.path());
        let config = SplitterConfig::new(8); // small split_bits -> many chunks
        let data: Vec<u8> = (0..500_000u32).map(|i| (i % 251) as u8).collect();
        let handle = write_bytes(&p, &config, &data).unwrap();
        assert_eq!(handle.len, data.len() as u64);
        assert_eq!(read_bytes(&p, handle).unwrap(), data);
    }

    #[test]
    fn streaming_reader_matches_bulk_read() {
        let dir = tempfile::tempdir().unwrap();
        let p = pack(dir.path());
        let config = SplitterConfig::new(8);
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 197) as u8).collect();
        let handle = write_bytes(&p, &config, &data).unwrap();

        let mut streamed = Vec::new();
        let mut reader = MerkleReader::new(&p, handle);
        reader.read_to_end(&mut streamed).unwrap();
        assert_eq!(streamed, data);
    }

    #[test]
    fn identical_content_dedups_to_same_root() {
        let dir = tempfile::tempdir().unwrap();
        let p = pack(dir.path());
        let config = SplitterConfig::new(8);
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 199) as u8).collect();
        let h1 = write_bytes(&p, &config, &data).unwrap();
        let h2 = write_bytes(&p, &config, &data).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn fsck_detects_missing_child_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let p = pack(dir.path());
        let config = SplitterConfig::new(8);
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 211) as u8).collect();
        let handle = write_bytes(&p, &config, &data).unwrap();

        let mut problems = Vec::new();
        fsck(&p, handle, &mut problems);
        assert!(problems.is_empty());

        let bogus = MerkleHash {
            root: Hash::of(b"never written"),
            depth: 0,
            len: 0,
        };
        let mut problems = Vec::new();
        fsck(&p, bogus, &mut problems);
        assert!(!problems.is_empty());
    }
}
