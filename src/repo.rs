//! Repository / session: owns the layer stack, enforces the commit state
//! machine, and exposes the command surface (§6) as plain methods. `main.rs`
//! is a thin `clap` front-end over this module — it builds a `Config`,
//! opens a `Repository`, dispatches one method, and turns the `Result` into
//! a log line plus exit code.
//!
//! Grounded on the teacher workspace's repository-object pattern (liboxen's
//! `LocalRepository` owns its storage and dispatches commands the CLI calls
//! into); this module is the same shape, scoped to the backend/layer stack
//! §4.F-§4.L describe instead of a full working-copy model.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::backend::local::LocalBackend;
use crate::backend::object_store::ObjectStoreBackend;
use crate::backend::{Backend, MetadataStat};
use crate::config::{Config, StoreTarget};
use crate::dirbackup;
use crate::error::{BkError, BkResult};
use crate::hash::Hash;
use crate::layer::encrypted::KdfParams;
use crate::layer::{CompressedLayer, EncryptedLayer};
use crate::merkle::{self, MerkleHash};
use crate::pack::BlobPack;
use crate::splitter::SplitterConfig;

pub const README_KEY: &str = "readme_bk.txt";
pub const ENCRYPT_KEY: &str = "encrypt.txt";
const README_BODY: &[u8] = b"This directory is a bk repository. Do not edit its contents by hand.\n";

/// Object-store rate limit used when `BK_DIR` points at a bucket. The spec
/// leaves the exact number to the implementation; this is a conservative
/// default a single backup session won't usually saturate.
const OBJECT_STORE_BYTES_PER_SEC: u32 = 8 * 1024 * 1024;

fn backup_key(name: &str) -> String {
    format!("backup-{name}")
}

fn bits_key(name: &str) -> String {
    format!("bits-{name}")
}

/// Cooperative cancellation: set from a `signal_hook` SIGINT handler and
/// checked between chunks so an interrupted session aborts cleanly instead
/// of leaving a half-written pack index or name (§5 cancellation).
#[derive(Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The raw flag, for registering with `signal_hook::flag::register`.
    pub fn raw(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        CancelFlag::new()
    }
}

/// Raised mid-session when `CancelFlag` trips, so the open pack gets its
/// buffered bytes flushed but no index or name metadata is written (§4.H
/// state machine: a Writing-state crash is harmless, a Syncing-state crash
/// leaves an orphan hash, both tolerated by design).
fn check_cancelled(cancel: &CancelFlag) -> BkResult<()> {
    if cancel.is_tripped() {
        return Err(BkError::IOFatal("interrupted".into()));
    }
    Ok(())
}

/// Owns the chosen backend (wrapped `CompressedLayer` then, if the
/// repository is encrypted, `EncryptedLayer`) and the `BlobPack`. One
/// `Repository` per process invocation; logging flows through the global
/// `log` macros, counted by the one `Logger` the CLI entry point owns.
pub struct Repository {
    backend: Arc<dyn Backend>,
    pack: BlobPack,
    split_bits: u32,
}

impl Repository {
    /// A fresh, undecorated handle onto the configured store. Used for pack
    /// blob bytes, which are self-encoding (§4.D/§4.E) and would otherwise be
    /// compressed/encrypted twice if routed through the decorated chain.
    fn build_raw_backend(config: &Config) -> BkResult<Box<dyn Backend>> {
        Ok(match &config.store {
            StoreTarget::LocalDir(path) => Box::new(LocalBackend::open(path)?),
            StoreTarget::ObjectStore { bucket_url, project_id } => Box::new(
                ObjectStoreBackend::new(bucket_url, project_id.clone(), OBJECT_STORE_BYTES_PER_SEC)?,
            ),
        })
    }

    fn build_backend(config: &Config) -> BkResult<Box<dyn Backend>> {
        Ok(Box::new(CompressedLayer::new(Self::build_raw_backend(config)?)))
    }

    /// Opens an already-initialized repository. Fails with `ConfigError` if
    /// `readme_bk.txt` is absent, or if the repository is encrypted and no
    /// passphrase (or the wrong one) was supplied.
    pub fn open(config: &Config) -> BkResult<Repository> {
        let compressed = Self::build_backend(config)?;
        if !compressed.metadata_exists(README_KEY)? {
            return Err(BkError::ConfigError(
                "repository is not initialized (run `bk init` first)".into(),
            ));
        }

        // Derive the KDF key once here (scrypt is deliberately memory-hard,
        // so this must happen at most once per process) and keep the chunk
        // cipher alongside the decorated backend rather than re-deriving it.
        let (backend, cipher): (Arc<dyn Backend>, Option<aes_gcm::Aes256Gcm>) =
            if compressed.metadata_exists(ENCRYPT_KEY)? {
                let passphrase = config.passphrase.as_deref().ok_or_else(|| {
                    BkError::ConfigError(
                        "repository is encrypted but BK_PASSPHRASE is not set".into(),
                    )
                })?;
                let params_bytes = compressed.read_metadata(ENCRYPT_KEY)?;
                let params = KdfParams::decode(&params_bytes)?;
                let layer = EncryptedLayer::new(compressed, &params, passphrase)?;
                let chunk_cipher = layer.chunk_cipher()?;
                (Arc::new(layer), Some(chunk_cipher))
            } else {
                (Arc::from(compressed), None)
            };

        let raw_backend: Arc<dyn Backend> = Arc::from(Self::build_raw_backend(config)?);
        let pack = BlobPack::open(raw_backend, Arc::clone(&backend), cipher)?;

        Ok(Repository {
            backend,
            pack,
            split_bits: config.split_bits,
        })
    }

    /// `init [--encrypt]`: writes `readme_bk.txt`, and if requested,
    /// `encrypt.txt` with a freshly generated KDF salt. Refuses to
    /// reinitialize an already-initialized repository.
    pub fn init(config: &Config, encrypt: bool) -> BkResult<()> {
        let backend = Self::build_backend(config)?;
        if backend.metadata_exists(README_KEY)? {
            return Err(BkError::UserError("repository is already initialized".into()));
        }
        backend.write_metadata(README_KEY, README_BODY)?;
        if encrypt {
            let params = KdfParams::generate();
            backend.write_metadata(ENCRYPT_KEY, &params.encode()?)?;
        }
        backend.sync()
    }

    fn splitter_config(&self, override_bits: Option<u32>) -> SplitterConfig {
        SplitterConfig::new(override_bits.unwrap_or(self.split_bits))
    }

    /// `backup [--base NAME] [--split-bits N] <name> <dir>`. Refuses a
    /// colliding name (`metadata_exists` check immediately before commit;
    /// last-writer-wins is explicitly forbidden, §9 open question).
    pub fn backup(
        &self,
        name: &str,
        dir: &Path,
        base: Option<&str>,
        split_bits: Option<u32>,
        cancel: &CancelFlag,
    ) -> BkResult<String> {
        let key = backup_key(&format!("{name}-{}", Utc::now().format("%Y%m%d-%H%M%S")));
        if self.backend.metadata_exists(&key)? {
            return Err(BkError::UserError(format!(
                "a backup named {key} already exists (try again after the current second elapses)"
            )));
        }

        let base_index = match base {
            Some(base_name) => {
                let root = self.resolve_backup_root(base_name)?;
                Some(dirbackup::load_base_index(&self.pack, root)?)
            }
            None => None,
        };

        let config = self.splitter_config(split_bits);
        check_cancelled(cancel)?;
        let root = dirbackup::ingest_dir(&self.pack, &config, dir, base_index.as_ref())?;
        check_cancelled(cancel)?;

        // sync-after-data, write-name, sync-after-name (§5 ordering
        // guarantees): every chunk and pack index referenced by `root` is
        // durable before the name that makes it reachable exists at all.
        self.pack.sync()?;
        self.write_root_metadata(&key, root)?;
        self.backend.sync()?;

        Ok(key)
    }

    /// `restore <name> <dir>`.
    pub fn restore(&self, name: &str, dir: &Path) -> BkResult<()> {
        let root = self.resolve_backup_root(name)?;
        dirbackup::restore_dir(&self.pack, root, dir)
    }

    /// `savebits [--split-bits N] <name>`: reads a byte stream (any
    /// `Read`, typically stdin) and stores it as a top-level Merkle stream.
    pub fn savebits<R: Read>(
        &self,
        name: &str,
        reader: R,
        split_bits: Option<u32>,
        cancel: &CancelFlag,
    ) -> BkResult<String> {
        let key = bits_key(&format!("{name}-{}", Utc::now().format("%Y%m%d-%H%M%S")));
        if self.backend.metadata_exists(&key)? {
            return Err(BkError::UserError(format!(
                "a stream named {key} already exists (try again after the current second elapses)"
            )));
        }

        let config = self.splitter_config(split_bits);
        check_cancelled(cancel)?;
        let root = merkle::write_stream(&self.pack, &config, reader)?;
        check_cancelled(cancel)?;

        self.pack.sync()?;
        self.write_root_metadata(&key, root)?;
        self.backend.sync()?;

        Ok(key)
    }

    /// `restorebits <name>`: writes the stream's bytes to `writer`
    /// (typically stdout), streaming rather than buffering the whole thing.
    pub fn restorebits<W: Write>(&self, name: &str, mut writer: W) -> BkResult<()> {
        let root = self.resolve_bits_root(name)?;
        let mut reader = merkle::MerkleReader::new(&self.pack, root);
        std::io::copy(&mut reader, &mut writer)?;
        Ok(())
    }

    /// `list`: every `backup-*` and `bits-*` metadata name, grouped by kind.
    pub fn list(&self) -> BkResult<(Vec<String>, Vec<String>)> {
        let metadata = self.backend.list_metadata()?;
        let mut backups: Vec<String> = metadata
            .iter()
            .filter_map(|m| strip_prefix_name(&m.key, "backup-"))
            .collect();
        let mut streams: Vec<String> = metadata
            .iter()
            .filter_map(|m| strip_prefix_name(&m.key, "bits-"))
            .collect();
        backups.sort();
        streams.sort();
        Ok((backups, streams))
    }

    /// `fsck`: integrity-checks every named root, then the blob layer
    /// itself. Accumulates problems rather than stopping at the first.
    pub fn fsck(&self) -> BkResult<Vec<String>> {
        let mut problems = Vec::new();
        let metadata = self.backend.list_metadata()?;

        for entry in &metadata {
            let is_backup = entry.key.starts_with("backup-");
            let is_bits = entry.key.starts_with("bits-");
            if !is_backup && !is_bits {
                continue;
            }
            match self.read_root(&entry.key) {
                Ok(root) => merkle::fsck(&self.pack, root, &mut problems),
                Err(e) => problems.push(format!("{}: {e}", entry.key)),
            }
        }

        problems.extend(self.pack.fsck()?);
        Ok(problems)
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    fn write_root_metadata(&self, key: &str, root: MerkleHash) -> BkResult<()> {
        let bytes = encode_root(root);
        self.backend.write_metadata(key, &bytes)
    }

    fn read_root(&self, key: &str) -> BkResult<MerkleHash> {
        let bytes = self.backend.read_metadata(key)?;
        decode_root(&bytes)
    }

    fn resolve_backup_root(&self, name: &str) -> BkResult<MerkleHash> {
        self.resolve_named_root("backup-", name)
    }

    fn resolve_bits_root(&self, name: &str) -> BkResult<MerkleHash> {
        self.resolve_named_root("bits-", name)
    }

    /// Resolves a user-supplied name to its metadata key. Accepts either
    /// the bare `<user-name>` prefix (matching the most recent timestamped
    /// key) or the full `<user-name>-<timestamp>` key.
    fn resolve_named_root(&self, kind_prefix: &str, name: &str) -> BkResult<MerkleHash> {
        let full_key = format!("{kind_prefix}{name}");
        if self.backend.metadata_exists(&full_key)? {
            return self.read_root(&full_key);
        }

        let metadata = self.backend.list_metadata()?;
        let mut matches: Vec<&MetadataStat> = metadata
            .iter()
            .filter(|m| m.key.starts_with(kind_prefix) && strip_prefix_name(&m.key, kind_prefix)
                .map(|n| n.starts_with(&format!("{name}-")))
                .unwrap_or(false))
            .collect();
        matches.sort_by(|a, b| a.key.cmp(&b.key));

        match matches.pop() {
            Some(latest) => self.read_root(&latest.key),
            None => Err(BkError::NotFound(format!("{kind_prefix}{name}"))),
        }
    }
}

fn strip_prefix_name(key: &str, prefix: &str) -> Option<String> {
    key.strip_prefix(prefix).map(|s| s.to_string())
}

/// A `Hash` + depth byte + fixed64 length, matching the manifest target
/// encoding in `manifest.rs` so the two don't drift.
fn encode_root(root: MerkleHash) -> Vec<u8> {
    let mut out = Vec::with_capacity(41);
    out.extend_from_slice(root.root.as_bytes());
    out.push(root.depth);
    out.extend_from_slice(&root.len.to_le_bytes());
    out
}

fn decode_root(bytes: &[u8]) -> BkResult<MerkleHash> {
    if bytes.len() != 41 {
        return Err(BkError::IntegrityError(
            "malformed root metadata value".into(),
        ));
    }
    let root = Hash::from_bytes(&bytes[0..32])?;
    let depth = bytes[32];
    let len = u64::from_le_bytes(bytes[33..41].try_into().unwrap());
    Ok(MerkleHash { root, depth, len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Verbosity;
    use std::fs;

    fn config_for(dir: &Path) -> Config {
        Config {
            store: StoreTarget::LocalDir(dir.to_path_buf()),
            passphrase: None,
            split_bits: 12,
            verbosity: Verbosity::Default,
            profile: false,
        }
    }

    #[test]
    fn open_fails_before_init() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        let err = Repository::open(&config).unwrap_err();
        assert!(matches!(err, BkError::ConfigError(_)));
    }

    #[test]
    fn init_then_open_then_double_init_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        Repository::init(&config, false).unwrap();
        assert!(matches!(
            Repository::init(&config, false),
            Err(BkError::UserError(_))
        ));
    }

    #[test]
    fn empty_dir_backup_and_restore_round_trips() {
        let repo_dir = tempfile::tempdir().unwrap();
        let config = config_for(repo_dir.path());
        Repository::init(&config, false).unwrap();

        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let out = dst.path().join("out");

        let repo = Repository::open(&config).unwrap();
        let name = repo
            .backup("x", src.path(), None, None, &CancelFlag::new())
            .unwrap();
        assert!(name.starts_with("backup-x-"));

        repo.restore("x", &out).unwrap();
        assert!(fs::read_dir(&out).unwrap().next().is_none());
    }

    #[test]
    fn backup_restore_round_trips_file_bytes() {
        let repo_dir = tempfile::tempdir().unwrap();
        let config = config_for(repo_dir.path());
        Repository::init(&config, false).unwrap();

        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello backup world").unwrap();

        let repo = Repository::open(&config).unwrap();
        repo.backup("daily", src.path(), None, None, &CancelFlag::new())
            .unwrap();

        let dst = tempfile::tempdir().unwrap();
        let out = dst.path().join("restored");
        repo.restore("daily", &out).unwrap();
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"hello backup world");
    }

    #[test]
    fn savebits_restorebits_round_trips() {
        let repo_dir = tempfile::tempdir().unwrap();
        let config = config_for(repo_dir.path());
        Repository::init(&config, false).unwrap();
        let repo = Repository::open(&config).unwrap();

        let data = vec![9u8; 200_000];
        repo.savebits("stream", &data[..], None, &CancelFlag::new())
            .unwrap();

        let mut out = Vec::new();
        repo.restorebits("stream", &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn list_groups_backups_and_streams() {
        let repo_dir = tempfile::tempdir().unwrap();
        let config = config_for(repo_dir.path());
        Repository::init(&config, false).unwrap();
        let repo = Repository::open(&config).unwrap();

        let src = tempfile::tempdir().unwrap();
        repo.backup("x", src.path(), None, None, &CancelFlag::new())
            .unwrap();
        repo.savebits("y", &b"abc"[..], None, &CancelFlag::new())
            .unwrap();

        let (backups, streams) = repo.list().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(streams.len(), 1);
    }

    #[test]
    fn fsck_clean_then_detects_tamper() {
        let repo_dir = tempfile::tempdir().unwrap();
        let config = config_for(repo_dir.path());
        Repository::init(&config, false).unwrap();
        let repo = Repository::open(&config).unwrap();

        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f.bin"), vec![3u8; 30_000]).unwrap();
        repo.backup("x", src.path(), None, None, &CancelFlag::new())
            .unwrap();

        assert!(repo.fsck().unwrap().is_empty());

        // Blob filenames are hex-encoded on disk (see `backend::local`), so
        // just grab any file under `blobs/` rather than matching the
        // plaintext `pack-` name.
        let packs = std::fs::read_dir(repo_dir.path().join("blobs"))
            .unwrap()
            .flatten()
            .flat_map(|d| std::fs::read_dir(d.path()).unwrap())
            .flatten()
            .find(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .unwrap();
        let mut bytes = std::fs::read(packs.path()).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(packs.path(), bytes).unwrap();

        let repo2 = Repository::open(&config).unwrap();
        assert!(!repo2.fsck().unwrap().is_empty());
    }

    #[test]
    fn duplicate_backup_name_within_same_second_is_refused() {
        let repo_dir = tempfile::tempdir().unwrap();
        let config = config_for(repo_dir.path());
        Repository::init(&config, false).unwrap();
        let repo = Repository::open(&config).unwrap();

        let src = tempfile::tempdir().unwrap();
        repo.backup("x", src.path(), None, None, &CancelFlag::new())
            .unwrap();
        let err = repo
            .backup("x", src.path(), None, None, &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, BkError::UserError(_)));
    }

    #[test]
    fn restore_of_unknown_name_is_not_found() {
        let repo_dir = tempfile::tempdir().unwrap();
        let config = config_for(repo_dir.path());
        Repository::init(&config, false).unwrap();
        let repo = Repository::open(&config).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let err = repo.restore("nope", dst.path()).unwrap_err();
        assert!(matches!(err, BkError::NotFound(_)));
    }

    #[test]
    fn cancelled_backup_never_writes_a_name() {
        let repo_dir = tempfile::tempdir().unwrap();
        let config = config_for(repo_dir.path());
        Repository::init(&config, false).unwrap();
        let repo = Repository::open(&config).unwrap();

        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f.bin"), vec![1u8; 5000]).unwrap();

        let cancel = CancelFlag::new();
        cancel.trip();
        assert!(repo.backup("x", src.path(), None, None, &cancel).is_err());

        let (backups, _) = repo.list().unwrap();
        assert!(backups.is_empty());
    }
}
