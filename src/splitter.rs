//! Streaming content-defined chunk boundary detector.
//!
//! The teacher's dedup prototype reached for the `fastcdc` crate directly
//! (`FastCDChunker`, see the module this one replaces), which does dual-mask
//! normalized chunking around a single average target size. This spec wants
//! something narrower and more explicit: one fixed bit-pattern test over the
//! low `split_bits` bits of a rolling fingerprint, with hard min/max bounds.
//! `fastcdc`'s public API has no knob for that, so the boundary test here is
//! hand-rolled — a gear-hash accumulator, the same family of rolling
//! fingerprint FastCDC/restic/casync use internally, built directly against
//! this spec's contract instead of going through their crate.

use std::io::{self, Read};

/// Chunks below this size never end on a content-defined boundary.
pub const MIN_CHUNK_SIZE: usize = 512;

/// Default `split_bits`: chunks average roughly 2^14 = 16 KiB.
pub const DEFAULT_SPLIT_BITS: u32 = 14;

pub const MIN_SPLIT_BITS: u32 = 8;
pub const MAX_SPLIT_BITS: u32 = 22;

fn gear_table() -> &'static [u64; 256] {
    static TABLE: std::sync::OnceLock<[u64; 256]> = std::sync::OnceLock::new();
    TABLE.get_or_init(|| {
        // Deterministic pseudorandom constants (splitmix64), not secret —
        // any fixed table works as long as every session uses the same one,
        // since boundary determinism is the whole point (spec 4.B).
        let mut table = [0u64; 256];
        let mut seed: u64 = 0x9E3779B97F4A7C15;
        for slot in table.iter_mut() {
            seed = seed.wrapping_add(0x9E3779B97F4A7C15);
            let mut z = seed;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
            z ^= z >> 31;
            *slot = z;
        }
        table
    })
}

#[derive(Clone, Copy, Debug)]
pub struct SplitterConfig {
    pub split_bits: u32,
    pub min_size: usize,
    pub max_size: usize,
}

impl SplitterConfig {
    pub fn new(split_bits: u32) -> Self {
        let split_bits = split_bits.clamp(MIN_SPLIT_BITS, MAX_SPLIT_BITS);
        SplitterConfig {
            split_bits,
            min_size: MIN_CHUNK_SIZE,
            max_size: 16usize.saturating_mul(1usize << split_bits),
        }
    }

    fn mask(&self) -> u64 {
        if self.split_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.split_bits) - 1
        }
    }
}

impl Default for SplitterConfig {
    fn default() -> Self {
        SplitterConfig::new(DEFAULT_SPLIT_BITS)
    }
}

/// Incremental boundary detector: feed bytes one at a time, get told when a
/// boundary falls after the byte just fed.
pub struct RollingSplitter {
    config: SplitterConfig,
    mask: u64,
    gear: &'static [u64; 256],
    fingerprint: u64,
    current_len: usize,
}

impl RollingSplitter {
    pub fn new(config: SplitterConfig) -> Self {
        RollingSplitter {
            mask: config.mask(),
            gear: gear_table(),
            config,
            fingerprint: 0,
            current_len: 0,
        }
    }

    pub fn config(&self) -> SplitterConfig {
        self.config
    }

    /// Resets accounting for the start of a new chunk; keep using the same
    /// detector instance across chunks within one stream.
    pub fn reset_chunk(&mut self) {
        self.fingerprint = 0;
        self.current_len = 0;
    }

    /// Feed one byte; returns true if a boundary falls immediately after it.
    pub fn push(&mut self, byte: u8) -> bool {
        self.current_len += 1;
        self.fingerprint = (self.fingerprint << 1).wrapping_add(self.gear[byte as usize]);

        if self.current_len < self.config.min_size {
            return false;
        }
        if self.current_len >= self.config.max_size {
            return true;
        }
        self.fingerprint & self.mask == 0
    }

    /// Whole-buffer convenience used for the small, already-materialized
    /// serialized arrays that back Merkle stream levels above 0.
    pub fn split(&mut self, data: &[u8]) -> Vec<(usize, usize)> {
        let mut bounds = Vec::new();
        let mut start = 0usize;
        self.reset_chunk();
        for (i, &b) in data.iter().enumerate() {
            if self.push(b) {
                bounds.push((start, i + 1 - start));
                start = i + 1;
                self.reset_chunk();
            }
        }
        if start < data.len() {
            bounds.push((start, data.len() - start));
        }
        bounds
    }
}

/// Adapts a `Read` into an iterator of chunk buffers, applying the content-
/// defined boundary test as bytes stream in. Memory use is bounded by the
/// configured maximum chunk size, not by the size of the whole stream.
pub struct ChunkReader<R> {
    inner: R,
    splitter: RollingSplitter,
    buf: Vec<u8>,
    done: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R, config: SplitterConfig) -> Self {
        ChunkReader {
            inner,
            splitter: RollingSplitter::new(config),
            buf: Vec::with_capacity(config.min_size.max(4096)),
            done: false,
        }
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.splitter.reset_chunk();
        self.buf.clear();
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => {
                    self.done = true;
                    if self.buf.is_empty() {
                        return None;
                    }
                    return Some(Ok(std::mem::take(&mut self.buf)));
                }
                Ok(_) => {
                    self.buf.push(byte[0]);
                    if self.splitter.push(byte[0]) {
                        return Some(Ok(std::mem::take(&mut self.buf)));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut state = seed;
        for _ in 0..len {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            out.push((state >> 56) as u8);
        }
        out
    }

    #[test]
    fn determinism() {
        let data = pseudo_random(2 * 1024 * 1024, 42);
        let mut s1 = RollingSplitter::new(SplitterConfig::new(14));
        let mut s2 = RollingSplitter::new(SplitterConfig::new(14));
        assert_eq!(s1.split(&data), s2.split(&data));
    }

    #[test]
    fn respects_min_and_max() {
        let data = pseudo_random(1024 * 1024, 7);
        let config = SplitterConfig::new(14);
        let mut s = RollingSplitter::new(config);
        for (_, len) in s.split(&data) {
            assert!(len >= config.min_size || len == data.len());
            assert!(len <= config.max_size);
        }
    }

    #[test]
    fn reassembles_exactly() {
        let data = pseudo_random(500_000, 99);
        let mut s = RollingSplitter::new(SplitterConfig::default());
        let bounds = s.split(&data);
        let mut reassembled = Vec::with_capacity(data.len());
        for (off, len) in &bounds {
            reassembled.extend_from_slice(&data[*off..*off + *len]);
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn streaming_matches_whole_buffer() {
        let data = pseudo_random(300_000, 5);
        let config = SplitterConfig::new(13);

        let mut whole = RollingSplitter::new(config);
        let expected: Vec<Vec<u8>> = whole
            .split(&data)
            .into_iter()
            .map(|(off, len)| data[off..off + len].to_vec())
            .collect();

        let reader = ChunkReader::new(io::Cursor::new(data.clone()), config);
        let actual: Vec<Vec<u8>> = reader.map(|c| c.unwrap()).collect();

        assert_eq!(expected, actual);
    }

    #[test]
    fn locality_single_byte_insertion_only_perturbs_nearby_chunks() {
        let mut data = pseudo_random(200_000, 123);
        let config = SplitterConfig::new(13);

        let mut before = RollingSplitter::new(config);
        let before_chunks: Vec<Vec<u8>> = before
            .split(&data)
            .into_iter()
            .map(|(off, len)| data[off..off + len].to_vec())
            .collect();

        // Insert a single byte roughly in the middle.
        data.insert(data.len() / 2, 0xAB);

        let mut after = RollingSplitter::new(config);
        let after_chunks: Vec<Vec<u8>> = after
            .split(&data)
            .into_iter()
            .map(|(off, len)| data[off..off + len].to_vec())
            .collect();

        let before_set: std::collections::HashSet<_> = before_chunks.iter().collect();
        let after_set: std::collections::HashSet<_> = after_chunks.iter().collect();
        let unchanged = before_set.intersection(&after_set).count();

        // Almost all chunks should survive the edit untouched.
        assert!(unchanged as f64 / before_chunks.len() as f64 > 0.9);
    }
}
