//! Crate-wide error taxonomy.
//!
//! Every fallible operation in `bk` returns through this enum so callers at
//! the session boundary (see `repo.rs`) can decide how to react: some kinds
//! are retried, some are fatal to the current operation, some abort the
//! whole process immediately.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type BkResult<T> = Result<T, BkError>;

#[derive(Error, Debug)]
pub enum BkError {
    /// Missing environment variables, uninitialized repository, bad KDF
    /// parameters. Exit immediately, never retried.
    #[error("config error: {0}")]
    ConfigError(String),

    /// A named metadata key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Hash mismatch, MAC failure, truncated pack, missing referenced
    /// chunk. Fatal to the current operation, never silently repaired.
    #[error("integrity error: {0}")]
    IntegrityError(String),

    /// Authenticated decryption failed. A specific case of IntegrityError
    /// that callers may want to match on directly.
    #[error("authentication failed decrypting {0}")]
    AuthFailed(String),

    /// Remote backend hiccup, worth retrying with backoff.
    #[error("transient I/O error: {0}")]
    TransientIOError(String),

    /// Unrecoverable storage failure; aborts the session.
    #[error("fatal I/O error: {0}")]
    IOFatal(String),

    /// Bad arguments, duplicate backup name, non-empty restore target.
    #[error("user error: {0}")]
    UserError(String),

    #[error("target already exists: {0}")]
    TargetExists(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bincode serialization/deserialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("malformed hash: {0}")]
    InvalidHash(String),

    #[error("HTTP backend error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

