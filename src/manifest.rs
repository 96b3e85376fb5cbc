//! Directory manifests: the serialized, sorted record stream a directory's
//! entries become before being stored as a Merkle stream.
//!
//! Grounded on the teacher workspace's `leb128`-based varint framing used
//! elsewhere for compact binary records; this module is the self-describing
//! envelope §4.H specifies.

use std::io::{Cursor, Read};

use serde::{Deserialize, Serialize};

use crate::error::{BkError, BkResult};
use crate::merkle::MerkleHash;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

impl EntryKind {
    fn to_tag(self) -> u8 {
        match self {
            EntryKind::File => 0,
            EntryKind::Dir => 1,
            EntryKind::Symlink => 2,
        }
    }

    fn from_tag(tag: u8) -> BkResult<Self> {
        match tag {
            0 => Ok(EntryKind::File),
            1 => Ok(EntryKind::Dir),
            2 => Ok(EntryKind::Symlink),
            other => Err(BkError::IntegrityError(format!(
                "unknown manifest entry kind tag {other}"
            ))),
        }
    }
}

/// One entry in a directory manifest. `target` means different things by
/// kind: a file's body `MerkleHash`, a directory's child-manifest
/// `MerkleHash`, or (for symlinks) a literal link string carried as raw
/// bytes rather than a hash.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_nanos: i128,
    pub size: u64,
    pub target: EntryTarget,
}

#[derive(Clone, Debug)]
pub enum EntryTarget {
    Merkle(MerkleHash),
    LinkText(String),
}

impl EntryTarget {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            EntryTarget::Merkle(h) => {
                let mut out = Vec::with_capacity(41);
                out.extend_from_slice(h.root.as_bytes());
                out.push(h.depth);
                out.extend_from_slice(&h.len.to_le_bytes());
                out
            }
            EntryTarget::LinkText(s) => s.as_bytes().to_vec(),
        }
    }

    fn from_bytes(kind: EntryKind, bytes: &[u8]) -> BkResult<Self> {
        match kind {
            EntryKind::Symlink => Ok(EntryTarget::LinkText(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| BkError::IntegrityError(format!("bad symlink target: {e}")))?,
            )),
            EntryKind::File | EntryKind::Dir => {
                if bytes.len() != 41 {
                    return Err(BkError::IntegrityError(
                        "manifest target is not a 41-byte MerkleHash".into(),
                    ));
                }
                let root = crate::hash::Hash::from_bytes(&bytes[0..32])?;
                let depth = bytes[32];
                let len = u64::from_le_bytes(bytes[33..41].try_into().unwrap());
                Ok(EntryTarget::Merkle(MerkleHash { root, depth, len }))
            }
        }
    }
}

/// Serializes entries (already sorted by name by the caller) into the
/// self-describing binary record stream §4.H specifies.
pub fn encode_manifest(entries: &[DirEntry]) -> BkResult<Vec<u8>> {
    let mut out = Vec::new();
    for entry in entries {
        let mut record = Vec::new();
        write_lenprefixed(&mut record, entry.name.as_bytes());
        record.push(entry.kind.to_tag());
        leb128::write::unsigned(&mut record, entry.mode as u64).unwrap();
        leb128::write::unsigned(&mut record, entry.uid as u64).unwrap();
        leb128::write::unsigned(&mut record, entry.gid as u64).unwrap();
        record.extend_from_slice(&(entry.mtime_nanos as i64).to_le_bytes());
        leb128::write::unsigned(&mut record, entry.size).unwrap();
        write_lenprefixed(&mut record, &entry.target.to_bytes());

        // Outer length-prefixed envelope per record, so a future reader can
        // skip unknown trailing fields without understanding them.
        leb128::write::unsigned(&mut out, record.len() as u64).unwrap();
        out.extend_from_slice(&record);
    }
    Ok(out)
}

fn write_lenprefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    leb128::write::unsigned(out, bytes.len() as u64).unwrap();
    out.extend_from_slice(bytes);
}

pub fn decode_manifest(bytes: &[u8]) -> BkResult<Vec<DirEntry>> {
    let mut cursor = Cursor::new(bytes);
    let mut entries = Vec::new();

    while (cursor.position() as usize) < bytes.len() {
        let record_len = leb128::read::unsigned(&mut cursor)
            .map_err(|e| BkError::IntegrityError(format!("bad manifest record length: {e}")))?
            as usize;
        let start = cursor.position() as usize;
        let end = start + record_len;
        if end > bytes.len() {
            return Err(BkError::IntegrityError("truncated manifest record".into()));
        }
        let record = &bytes[start..end];
        entries.push(decode_entry(record)?);
        cursor.set_position(end as u64);
    }
    Ok(entries)
}

fn decode_entry(record: &[u8]) -> BkResult<DirEntry> {
    let mut cursor = Cursor::new(record);

    let name = read_lenprefixed_string(&mut cursor)?;
    let mut kind_tag = [0u8; 1];
    cursor
        .read_exact(&mut kind_tag)
        .map_err(|_| BkError::IntegrityError("truncated manifest entry kind".into()))?;
    let kind = EntryKind::from_tag(kind_tag[0])?;

    let mode = leb128::read::unsigned(&mut cursor)
        .map_err(|e| BkError::IntegrityError(e.to_string()))? as u32;
    let uid = leb128::read::unsigned(&mut cursor)
        .map_err(|e| BkError::IntegrityError(e.to_string()))? as u32;
    let gid = leb128::read::unsigned(&mut cursor)
        .map_err(|e| BkError::IntegrityError(e.to_string()))? as u32;

    let mut mtime_bytes = [0u8; 8];
    cursor
        .read_exact(&mut mtime_bytes)
        .map_err(|_| BkError::IntegrityError("truncated manifest entry mtime".into()))?;
    let mtime_nanos = i64::from_le_bytes(mtime_bytes) as i128;

    let size = leb128::read::unsigned(&mut cursor)
        .map_err(|e| BkError::IntegrityError(e.to_string()))?;

    let target_len = leb128::read::unsigned(&mut cursor)
        .map_err(|e| BkError::IntegrityError(e.to_string()))? as usize;
    let target_start = cursor.position() as usize;
    let target_end = target_start + target_len;
    if target_end > record.len() {
        return Err(BkError::IntegrityError("truncated manifest target".into()));
    }
    let target = EntryTarget::from_bytes(kind, &record[target_start..target_end])?;

    Ok(DirEntry {
        name,
        kind,
        mode,
        uid,
        gid,
        mtime_nanos,
        size,
        target,
    })
}

fn read_lenprefixed_string(cursor: &mut Cursor<&[u8]>) -> BkResult<String> {
    let len = leb128::read::unsigned(cursor).map_err(|e| BkError::IntegrityError(e.to_string()))? as usize;
    let start = cursor.position() as usize;
    let end = start + len;
    let bytes = cursor.get_ref();
    if end > bytes.len() {
        return Err(BkError::IntegrityError("truncated manifest name".into()));
    }
    let s = String::from_utf8(bytes[start..end].to_vec())
        .map_err(|e| BkError::IntegrityError(format!("non-utf8 manifest name: {e}")))?;
    cursor.set_position(end as u64);
    Ok(s)
}
