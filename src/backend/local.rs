//! Local directory backend: blobs and metadata as files under a base path,
//! arranged in 2-byte hex prefix subdirectories so no single directory ever
//! holds every chunk in the repository.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::backend::{Backend, BackendStats, BlobStat, MetadataStat};
use crate::error::{BkError, BkResult};

pub struct LocalBackend {
    blobs_dir: PathBuf,
    metadata_dir: PathBuf,
    // Guards directory creation so two writers racing on the same
    // not-yet-existing prefix subdirectory don't both try to create it.
    mkdir_guard: Mutex<()>,
}

impl LocalBackend {
    pub fn open(base: &Path) -> BkResult<Self> {
        let blobs_dir = base.join("blobs");
        let metadata_dir = base.join("metadata");
        fs::create_dir_all(&blobs_dir)?;
        fs::create_dir_all(&metadata_dir)?;
        Ok(LocalBackend {
            blobs_dir,
            metadata_dir,
            mkdir_guard: Mutex::new(()),
        })
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        prefixed_path(&self.blobs_dir, name)
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        // Metadata keys are printable ASCII and not necessarily hex, but we
        // still want sharding to avoid unbounded directory fan-out.
        prefixed_path(&self.metadata_dir, key)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> BkResult<()> {
        if let Some(parent) = path.parent() {
            let _guard = self.mkdir_guard.lock();
            fs::create_dir_all(parent)?;
        }
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| BkError::IOFatal(format!("persisting {}: {}", path.display(), e.error)))?;
        Ok(())
    }
}

// Hex-encodes the name/key so it round-trips through the filesystem
// verbatim, whatever punctuation it contains; `walk_files` decodes it back
// on the way out so `list_blobs`/`list_metadata` return the original key,
// not the on-disk filename.
fn prefixed_path(root: &Path, name: &str) -> PathBuf {
    let encoded = hex::encode(name.as_bytes());
    let prefix: String = encoded.chars().take(2).collect();
    let prefix = if prefix.is_empty() { "__".to_string() } else { prefix };
    root.join(prefix).join(encoded)
}

fn walk_files(root: &Path) -> BkResult<Vec<(String, u64)>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            let encoded = entry.file_name().to_string_lossy();
            let Ok(decoded) = hex::decode(encoded.as_ref()) else {
                continue;
            };
            let Ok(name) = String::from_utf8(decoded) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            out.push((name, size));
        }
    }
    Ok(out)
}

impl Backend for LocalBackend {
    fn write_blob(&self, name: &str, bytes: &[u8]) -> BkResult<()> {
        self.write_atomic(&self.blob_path(name), bytes)
    }

    fn read_blob(&self, name: &str) -> BkResult<Vec<u8>> {
        let path = self.blob_path(name);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BkError::NotFound(format!("blob {name}"))
            } else {
                BkError::Io(e)
            }
        })
    }

    fn blob_exists(&self, name: &str) -> BkResult<bool> {
        Ok(self.blob_path(name).exists())
    }

    fn list_blobs(&self, prefix: &str) -> BkResult<Vec<BlobStat>> {
        Ok(walk_files(&self.blobs_dir)?
            .into_iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, size)| BlobStat { name, size })
            .collect())
    }

    fn write_metadata(&self, key: &str, bytes: &[u8]) -> BkResult<()> {
        self.write_atomic(&self.metadata_path(key), bytes)
    }

    fn read_metadata(&self, key: &str) -> BkResult<Vec<u8>> {
        let path = self.metadata_path(key);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BkError::NotFound(format!("metadata {key}"))
            } else {
                BkError::Io(e)
            }
        })
    }

    fn metadata_exists(&self, key: &str) -> BkResult<bool> {
        Ok(self.metadata_path(key).exists())
    }

    fn list_metadata(&self) -> BkResult<Vec<MetadataStat>> {
        Ok(walk_files(&self.metadata_dir)?
            .into_iter()
            .map(|(key, size)| MetadataStat { key, size })
            .collect())
    }

    fn sync(&self) -> BkResult<()> {
        // Files are written via rename-into-place already; nothing buffered
        // at this layer to flush.
        Ok(())
    }

    fn fsck(&self) -> BkResult<Vec<String>> {
        // Existence/readability only; hash verification happens above us in
        // the pack layer, which knows plaintext hashes.
        let mut problems = Vec::new();
        for (name, size) in walk_files(&self.blobs_dir)? {
            if size == 0 {
                problems.push(format!("zero-length blob file: {name}"));
            }
        }
        Ok(problems)
    }

    fn stats(&self) -> BkResult<BackendStats> {
        let blobs = walk_files(&self.blobs_dir)?;
        let metadata = walk_files(&self.metadata_dir)?;
        Ok(BackendStats {
            blob_count: blobs.len() as u64,
            blob_bytes: blobs.iter().map(|(_, s)| *s).sum(),
            metadata_count: metadata.len() as u64,
            metadata_bytes: metadata.iter().map(|(_, s)| *s).sum(),
        })
    }

    fn describe(&self) -> String {
        format!("local directory at {}", self.blobs_dir.parent().unwrap_or(&self.blobs_dir).display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_blob() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path()).unwrap();
        backend.write_blob("abc123", b"hello").unwrap();
        assert!(backend.blob_exists("abc123").unwrap());
        assert_eq!(backend.read_blob("abc123").unwrap(), b"hello");
    }

    #[test]
    fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path()).unwrap();
        let err = backend.read_blob("missing").unwrap_err();
        assert!(matches!(err, BkError::NotFound(_)));
    }

    #[test]
    fn metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path()).unwrap();
        backend.write_metadata("readme_bk.txt", b"hi").unwrap();
        assert!(backend.metadata_exists("readme_bk.txt").unwrap());
        let listed = backend.list_metadata().unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn punctuation_key_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path()).unwrap();
        let key = "backup-my.db-20260101-000000";
        backend.write_metadata(key, b"manifest bytes").unwrap();
        assert!(backend.metadata_exists(key).unwrap());
        assert_eq!(backend.read_metadata(key).unwrap(), b"manifest bytes");

        let listed = backend.list_metadata().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, key);
    }

    #[test]
    fn punctuation_differing_keys_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path()).unwrap();
        backend.write_metadata("backup-my.db-1", b"a").unwrap();
        backend.write_metadata("backup-my_db-1", b"b").unwrap();

        assert_eq!(backend.read_metadata("backup-my.db-1").unwrap(), b"a");
        assert_eq!(backend.read_metadata("backup-my_db-1").unwrap(), b"b");
        assert_eq!(backend.list_metadata().unwrap().len(), 2);
    }
}
