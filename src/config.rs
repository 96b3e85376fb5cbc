//! Resolves a single `Config` from defaults, environment, and CLI flags.
//!
//! Priority, lowest to highest: compiled-in defaults, `BK_DIR` /
//! `BK_GCS_PROJECT_ID` / `BK_PASSPHRASE` from the environment, then CLI
//! flag overrides. Never persisted as repository data — only `encrypt.txt`'s
//! KDF salt/params live inside the repository itself (§4.K).

use crate::error::{BkError, BkResult};
use crate::logger::Verbosity;
use crate::splitter::DEFAULT_SPLIT_BITS;

#[derive(Clone, Debug)]
pub enum StoreTarget {
    LocalDir(std::path::PathBuf),
    ObjectStore { bucket_url: String, project_id: Option<String> },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub store: StoreTarget,
    pub passphrase: Option<String>,
    pub split_bits: u32,
    pub verbosity: Verbosity,
    pub profile: bool,
}

/// Raw CLI overrides, collected by `main.rs` before resolution. Every field
/// is optional: `None` means "let the environment/default decide."
#[derive(Default)]
pub struct ConfigOverrides {
    pub split_bits: Option<u32>,
    pub verbose: bool,
    pub debug: bool,
    pub profile: bool,
}

impl Config {
    /// Builds the resolved configuration for one process invocation.
    /// Missing `BK_DIR`, or a missing `BK_PASSPHRASE` on an encrypted
    /// repository, is a `ConfigError` (checked against the repository by
    /// the caller once `BK_DIR` resolves, since encryption state lives in
    /// the repository, not the environment).
    pub fn resolve(overrides: ConfigOverrides) -> BkResult<Config> {
        let dir = std::env::var("BK_DIR")
            .map_err(|_| BkError::ConfigError("BK_DIR is not set".into()))?;
        let store = parse_store_target(&dir)?;

        let passphrase = std::env::var("BK_PASSPHRASE").ok();

        let verbosity = if overrides.debug {
            Verbosity::Debug
        } else if overrides.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Default
        };

        Ok(Config {
            store,
            passphrase,
            split_bits: overrides.split_bits.unwrap_or(DEFAULT_SPLIT_BITS),
            verbosity,
            profile: overrides.profile,
        })
    }
}

fn parse_store_target(dir: &str) -> BkResult<StoreTarget> {
    if let Some(bucket) = dir.strip_prefix("gs://") {
        let project_id = std::env::var("BK_GCS_PROJECT_ID").ok();
        Ok(StoreTarget::ObjectStore {
            bucket_url: format!("https://storage.googleapis.com/{bucket}/"),
            project_id,
        })
    } else {
        Ok(StoreTarget::LocalDir(std::path::PathBuf::from(dir)))
    }
}
