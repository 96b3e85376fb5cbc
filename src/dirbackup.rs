//! Directory tree ingest and restore.
//!
//! Grounded on the teacher workspace's directory-walking backup path (the
//! wider `liboxen` workspace walks working directories with `walkdir`
//! exactly this way to build its own content index); this module adapts
//! that walk to produce `manifest::DirEntry` records addressed by Merkle
//! streams instead of the teacher's own index format.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::error::{BkError, BkResult};
use crate::manifest::{decode_manifest, encode_manifest, DirEntry, EntryKind, EntryTarget};
use crate::merkle::{self, MerkleHash};
use crate::pack::BlobPack;
use crate::splitter::SplitterConfig;

/// `(path relative to the backup root, size, mtime)` -> body hash, built
/// from a prior snapshot's manifests so unchanged files can skip rehashing
/// their contents. Purely an optimization: omitting it, or passing an empty
/// index, changes nothing about the resulting root hash (§8 property 7).
pub type BaseIndex = HashMap<(PathBuf, u64, i128), MerkleHash>;

/// Loads every `(path, size, mtime) -> MerkleHash` pair reachable from a
/// prior snapshot's root, for reuse during an incremental backup.
pub fn load_base_index(pack: &BlobPack, root: MerkleHash) -> BkResult<BaseIndex> {
    let mut index = BaseIndex::new();
    walk_manifest_for_index(pack, root, &Path::new(""), &mut index)?;
    Ok(index)
}

fn walk_manifest_for_index(
    pack: &BlobPack,
    manifest_root: MerkleHash,
    prefix: &Path,
    index: &mut BaseIndex,
) -> BkResult<()> {
    let bytes = merkle::read_bytes(pack, manifest_root)?;
    let entries = decode_manifest(&bytes)?;
    for entry in entries {
        let path = prefix.join(&entry.name);
        match (entry.kind, entry.target) {
            (EntryKind::File, EntryTarget::Merkle(body)) => {
                index.insert((path, entry.size, entry.mtime_nanos), body);
            }
            (EntryKind::Dir, EntryTarget::Merkle(child_root)) => {
                walk_manifest_for_index(pack, child_root, &path, index)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Recursively ingests a directory tree, returning the root `MerkleHash` of
/// its top-level manifest. Refuses to follow symlinks (§9): a symlink entry
/// is recorded by its literal target text, never traversed.
pub fn ingest_dir(
    pack: &BlobPack,
    config: &SplitterConfig,
    root: &Path,
    base_index: Option<&BaseIndex>,
) -> BkResult<MerkleHash> {
    ingest_dir_inner(pack, config, root, &PathBuf::new(), base_index)
}

fn ingest_dir_inner(
    pack: &BlobPack,
    config: &SplitterConfig,
    abs_path: &Path,
    rel_path: &Path,
    base_index: Option<&BaseIndex>,
) -> BkResult<MerkleHash> {
    let mut names: Vec<_> = fs::read_dir(abs_path)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        let child_abs = abs_path.join(&name);
        let child_rel = rel_path.join(&name);
        let meta = fs::symlink_metadata(&child_abs)?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(&child_abs)?;
            entries.push(DirEntry {
                name,
                kind: EntryKind::Symlink,
                mode: meta.permissions().mode(),
                uid: meta.uid(),
                gid: meta.gid(),
                mtime_nanos: mtime_nanos(&meta),
                size: 0,
                target: EntryTarget::LinkText(target.to_string_lossy().into_owned()),
            });
        } else if meta.is_dir() {
            let child_root = ingest_dir_inner(pack, config, &child_abs, &child_rel, base_index)?;
            entries.push(DirEntry {
                name,
                kind: EntryKind::Dir,
                mode: meta.permissions().mode(),
                uid: meta.uid(),
                gid: meta.gid(),
                mtime_nanos: mtime_nanos(&meta),
                size: 0,
                target: EntryTarget::Merkle(child_root),
            });
        } else {
            let size = meta.len();
            let mtime = mtime_nanos(&meta);
            let body = match base_index.and_then(|idx| idx.get(&(child_rel.clone(), size, mtime))) {
                Some(reused) => *reused,
                None => {
                    let file = fs::File::open(&child_abs)?;
                    merkle::write_stream(pack, config, file)?
                }
            };
            entries.push(DirEntry {
                name,
                kind: EntryKind::File,
                mode: meta.permissions().mode(),
                uid: meta.uid(),
                gid: meta.gid(),
                mtime_nanos: mtime,
                size,
                target: EntryTarget::Merkle(body),
            });
        }
    }

    let serialized = encode_manifest(&entries)?;
    merkle::write_bytes(pack, config, &serialized)
}

fn mtime_nanos(meta: &fs::Metadata) -> i128 {
    meta.mtime() as i128 * 1_000_000_000 + meta.mtime_nsec() as i128
}

/// Recreates a directory tree under `target`, which must not already exist
/// with content in it (`TargetExists`).
pub fn restore_dir(pack: &BlobPack, root: MerkleHash, target: &Path) -> BkResult<()> {
    if target.exists() && fs::read_dir(target)?.next().is_some() {
        return Err(BkError::TargetExists(target.to_path_buf()));
    }
    fs::create_dir_all(target)?;
    restore_dir_inner(pack, root, target)
}

fn restore_dir_inner(pack: &BlobPack, manifest_root: MerkleHash, target: &Path) -> BkResult<()> {
    let bytes = merkle::read_bytes(pack, manifest_root)?;
    let entries = decode_manifest(&bytes)?;

    for entry in entries {
        let path = target.join(&entry.name);
        match (&entry.kind, &entry.target) {
            (EntryKind::File, EntryTarget::Merkle(body)) => {
                let mut file = fs::File::create(&path)?;
                let mut reader = merkle::MerkleReader::new(pack, *body);
                std::io::copy(&mut reader, &mut file)?;
                apply_attrs(&path, &entry)?;
            }
            (EntryKind::Dir, EntryTarget::Merkle(child_root)) => {
                fs::create_dir_all(&path)?;
                restore_dir_inner(pack, *child_root, &path)?;
                apply_attrs(&path, &entry)?;
            }
            (EntryKind::Symlink, EntryTarget::LinkText(link)) => {
                std::os::unix::fs::symlink(link, &path)?;
            }
            _ => {
                return Err(BkError::IntegrityError(format!(
                    "manifest entry {} has a kind/target mismatch",
                    entry.name
                )))
            }
        }
    }
    Ok(())
}

fn apply_attrs(path: &Path, entry: &DirEntry) -> BkResult<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(entry.mode))?;

    let secs = (entry.mtime_nanos / 1_000_000_000) as i64;
    let nanos = (entry.mtime_nanos % 1_000_000_000) as u32;
    let ft = FileTime::from_unix_time(secs, nanos);
    if let Err(e) = filetime::set_file_times(path, ft, ft) {
        log::warn!("could not restore mtime on {}: {e}", path.display());
    }

    // uid/gid restoration is best-effort: it requires privileges the
    // restoring process frequently doesn't have, so failure is logged, not
    // fatal (§4.H).
    #[cfg(unix)]
    {
        use std::ffi::CString;
        let path_c = CString::new(path.as_os_str().to_string_lossy().as_bytes())
            .map_err(|e| BkError::IntegrityError(e.to_string()))?;
        let rc = unsafe { libc::chown(path_c.as_ptr(), entry.uid, entry.gid) };
        if rc != 0 {
            log::warn!("could not restore uid/gid on {}", path.display());
        }
    }
    Ok(())
}
