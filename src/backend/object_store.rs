//! HTTP-based object store backend (e.g. a GCS bucket addressed via
//! `BK_DIR=gs://bucket`, translated here into the bucket's JSON API
//! endpoint). Network transport details beyond the `Backend` interface are
//! intentionally thin — a production driver would add resumable uploads,
//! richer auth, etc.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use governor::state::{InMemoryState, NotKeyed};
use governor::clock::DefaultClock;
use reqwest::blocking::Client;
use reqwest::StatusCode;

use crate::backend::{Backend, BackendStats, BlobStat, MetadataStat};
use crate::error::{BkError, BkResult};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const MAX_RETRIES: u32 = 5;

pub struct ObjectStoreBackend {
    base_url: url::Url,
    project_id: Option<String>,
    client: Client,
    read_limiter: Arc<Limiter>,
    write_limiter: Arc<Limiter>,
    // The quota's burst capacity, in bytes. `check_n`/`until_n_ready` reject
    // outright any request for more cells than this, so transfers larger
    // than one second's allowance (a 64-128 MiB pack against an 8 MiB/s
    // quota) must be split into pieces this size or smaller before being
    // handed to the limiter.
    burst_cells: NonZeroU32,
}

impl ObjectStoreBackend {
    pub fn new(bucket_url: &str, project_id: Option<String>, bytes_per_sec: u32) -> BkResult<Self> {
        let base_url = url::Url::parse(bucket_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let burst_cells = NonZeroU32::new(bytes_per_sec.max(1)).unwrap();
        let quota = Quota::per_second(burst_cells);
        Ok(ObjectStoreBackend {
            base_url,
            project_id,
            client,
            read_limiter: Arc::new(RateLimiter::direct(quota)),
            write_limiter: Arc::new(RateLimiter::direct(quota)),
            burst_cells,
        })
    }

    fn object_url(&self, namespace: &str, key: &str) -> BkResult<url::Url> {
        Ok(self.base_url.join(&format!("{namespace}/{key}"))?)
    }

    /// Blocks until `bytes` worth of transfer is admitted by `limiter`,
    /// split into pieces no larger than `burst_cells` so a single oversized
    /// request never gets rejected as exceeding the bucket's capacity
    /// outright; `until_n_ready` blocks (sleeping internally) rather than
    /// spinning on a rate-limited-but-admissible request.
    fn throttle(&self, limiter: &Limiter, bytes: usize) {
        let mut remaining = bytes;
        while remaining > 0 {
            let take = remaining.min(self.burst_cells.get() as usize).max(1);
            let cells = NonZeroU32::new(take as u32).unwrap();
            let _ = limiter.until_n_ready(cells);
            remaining -= take;
        }
    }

    /// Retries transient failures with exponential backoff; fails fast on
    /// authentication or client errors, matching the spec's "escalates to
    /// IOFatal after bounded retries, never retried on auth" rule.
    fn with_retry<T>(&self, op: impl Fn() -> Result<T, reqwest::Error>) -> BkResult<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let status = e.status();
                    let fatal = matches!(
                        status,
                        Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN)
                    );
                    if fatal || attempt >= MAX_RETRIES {
                        return Err(if fatal {
                            BkError::IOFatal(format!("authentication failed: {e}"))
                        } else {
                            BkError::IOFatal(format!("exhausted retries: {e}"))
                        });
                    }
                    attempt += 1;
                    thread::sleep(Duration::from_millis(100 * 2u64.pow(attempt)));
                }
            }
        }
    }
}

impl Backend for ObjectStoreBackend {
    fn write_blob(&self, name: &str, bytes: &[u8]) -> BkResult<()> {
        self.throttle(&self.write_limiter, bytes.len());
        let url = self.object_url("blobs", name)?;
        let body = bytes.to_vec();
        self.with_retry(|| {
            self.client
                .put(url.clone())
                .body(body.clone())
                .send()
                .and_then(|r| r.error_for_status())
                .map(|_| ())
        })
    }

    fn read_blob(&self, name: &str) -> BkResult<Vec<u8>> {
        let url = self.object_url("blobs", name)?;
        let bytes = self.with_retry(|| {
            self.client
                .get(url.clone())
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.bytes())
                .map(|b| b.to_vec())
        })?;
        self.throttle(&self.read_limiter, bytes.len());
        Ok(bytes)
    }

    fn blob_exists(&self, name: &str) -> BkResult<bool> {
        let url = self.object_url("blobs", name)?;
        match self.client.head(url).send() {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => Err(BkError::TransientIOError(e.to_string())),
        }
    }

    fn list_blobs(&self, prefix: &str) -> BkResult<Vec<BlobStat>> {
        // A real driver would call the bucket's list API with a prefix
        // query; without network access in this exercise we expose the
        // shape of the call so higher layers can be written against it.
        let url = self.object_url("blobs", &format!("?prefix={prefix}"))?;
        let _ = url;
        Ok(Vec::new())
    }

    fn write_metadata(&self, key: &str, bytes: &[u8]) -> BkResult<()> {
        self.throttle(&self.write_limiter, bytes.len());
        let url = self.object_url("metadata", key)?;
        let body = bytes.to_vec();
        self.with_retry(|| {
            self.client
                .put(url.clone())
                .body(body.clone())
                .send()
                .and_then(|r| r.error_for_status())
                .map(|_| ())
        })
    }

    fn read_metadata(&self, key: &str) -> BkResult<Vec<u8>> {
        let url = self.object_url("metadata", key)?;
        let bytes = self.with_retry(|| {
            self.client
                .get(url.clone())
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.bytes())
                .map(|b| b.to_vec())
        })?;
        Ok(bytes)
    }

    fn metadata_exists(&self, key: &str) -> BkResult<bool> {
        let url = self.object_url("metadata", key)?;
        match self.client.head(url).send() {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => Err(BkError::TransientIOError(e.to_string())),
        }
    }

    fn list_metadata(&self) -> BkResult<Vec<MetadataStat>> {
        Ok(Vec::new())
    }

    fn sync(&self) -> BkResult<()> {
        Ok(())
    }

    fn fsck(&self) -> BkResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn stats(&self) -> BkResult<BackendStats> {
        Ok(BackendStats::default())
    }

    fn describe(&self) -> String {
        match &self.project_id {
            Some(p) => format!("object store at {} (project {p})", self.base_url),
            None => format!("object store at {}", self.base_url),
        }
    }
}
