//! Authenticated encryption wrapping a backend.
//!
//! Content addressing sits above this layer: chunks are hashed by plaintext
//! before they ever reach here, so two writers with the same plaintext but
//! different random nonces still dedup to one stored ciphertext. Metadata
//! and blobs use distinct associated-data tags so a metadata blob ciphertext
//! can never be replayed as a chunk, or vice versa.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use scrypt::Params as ScryptParams;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, BackendStats, BlobStat, MetadataStat};
use crate::error::{BkError, BkResult};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

const CHUNK_AAD: &[u8] = b"bk-chunk-v1";
const METADATA_AAD: &[u8] = b"bk-metadata-v1";

const KDF_PARAMS_VERSION: u8 = 1;

/// What gets serialized into the repository's `encrypt.txt` metadata blob.
/// This itself is stored in the clear below the encrypted layer — it's the
/// bootstrap data the passphrase needs before any key exists.
#[derive(Serialize, Deserialize, Clone)]
pub struct KdfParams {
    pub salt: [u8; 16],
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl KdfParams {
    pub fn generate() -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        KdfParams {
            salt,
            log_n: 15, // N = 2^15, matching scrypt's own recommended interactive cost
            r: 8,
            p: 1,
        }
    }

    pub fn encode(&self) -> BkResult<Vec<u8>> {
        let mut out = vec![KDF_PARAMS_VERSION];
        out.extend(bincode::serialize(self)?);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> BkResult<Self> {
        if bytes.is_empty() || bytes[0] != KDF_PARAMS_VERSION {
            return Err(BkError::ConfigError(
                "unsupported encrypt.txt format version".into(),
            ));
        }
        Ok(bincode::deserialize(&bytes[1..])?)
    }

    fn derive_key(&self, passphrase: &str) -> BkResult<[u8; KEY_LEN]> {
        let params = ScryptParams::new(self.log_n, self.r, self.p, KEY_LEN)
            .map_err(|e| BkError::ConfigError(format!("invalid KDF parameters: {e}")))?;
        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(passphrase.as_bytes(), &self.salt, &params, &mut key)
            .map_err(|e| BkError::ConfigError(format!("key derivation failed: {e}")))?;
        Ok(key)
    }
}

pub struct EncryptedLayer {
    inner: Box<dyn Backend>,
    key: [u8; KEY_LEN],
    cipher: Aes256Gcm,
}

impl EncryptedLayer {
    pub fn new(inner: Box<dyn Backend>, params: &KdfParams, passphrase: &str) -> BkResult<Self> {
        let key = params.derive_key(passphrase)?;
        let cipher = cipher_from_key(&key)?;
        Ok(EncryptedLayer { inner, key, cipher })
    }

    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> BkResult<Vec<u8>> {
        seal_with(&self.cipher, plaintext, aad)
    }

    fn open(&self, storage_bytes: &[u8], aad: &[u8], what: &str) -> BkResult<Vec<u8>> {
        open_with(&self.cipher, storage_bytes, aad, what)
    }

    /// Builds a fresh cipher from the same derived key so `pack.rs` can
    /// seal/open individual chunks with the chunk domain tag without going
    /// through `write_blob` (a pack file bundles many already-sealed chunk
    /// records; see `pack.rs`). Rebuilt rather than shared/cloned since
    /// `Aes256Gcm` construction from a key is cheap and this keeps the two
    /// call sites independent of whatever `Clone` bounds the cipher type
    /// happens to carry.
    pub fn chunk_cipher(&self) -> BkResult<Aes256Gcm> {
        cipher_from_key(&self.key)
    }
}

fn cipher_from_key(key: &[u8; KEY_LEN]) -> BkResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|e| BkError::ConfigError(format!("bad key: {e}")))
}

/// Free-standing seal/open so both the `Backend` decorator above and the
/// per-chunk codec in `pack.rs` share one implementation.
pub fn seal_with(cipher: &Aes256Gcm, plaintext: &[u8], aad: &[u8]) -> BkResult<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| BkError::IntegrityError("encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open_with(cipher: &Aes256Gcm, storage_bytes: &[u8], aad: &[u8], what: &str) -> BkResult<Vec<u8>> {
    if storage_bytes.len() < NONCE_LEN + TAG_LEN {
        return Err(BkError::AuthFailed(what.to_string()));
    }
    let (nonce_bytes, ciphertext) = storage_bytes.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| BkError::AuthFailed(what.to_string()))
}

pub const CHUNK_AAD_TAG: &[u8] = CHUNK_AAD;

impl Backend for EncryptedLayer {
    fn write_blob(&self, name: &str, bytes: &[u8]) -> BkResult<()> {
        self.inner.write_blob(name, &self.seal(bytes, CHUNK_AAD)?)
    }

    fn read_blob(&self, name: &str) -> BkResult<Vec<u8>> {
        self.open(&self.inner.read_blob(name)?, CHUNK_AAD, name)
    }

    fn blob_exists(&self, name: &str) -> BkResult<bool> {
        self.inner.blob_exists(name)
    }

    fn list_blobs(&self, prefix: &str) -> BkResult<Vec<BlobStat>> {
        self.inner.list_blobs(prefix)
    }

    fn write_metadata(&self, key: &str, bytes: &[u8]) -> BkResult<()> {
        self.inner
            .write_metadata(key, &self.seal(bytes, METADATA_AAD)?)
    }

    fn read_metadata(&self, key: &str) -> BkResult<Vec<u8>> {
        self.open(&self.inner.read_metadata(key)?, METADATA_AAD, key)
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
        format!("encrypted({})", self.inner.describe())
    }
}
