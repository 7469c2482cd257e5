//! Bounded runs of samples in one of two encodings.

use crate::duplicate_policy::DuplicatePolicy;
use crate::encoding::{BitBuf, BitReader, TimestampEncoder, XorEncoder, MAX_COMPRESSED_SAMPLE_BYTES};
use crate::error::DbError;
use crate::types::{Sample, Timestamp};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 4096;
pub const MIN_CHUNK_SIZE_BYTES: usize = 48;
pub const MAX_CHUNK_SIZE_BYTES: usize = 1_048_576;

/// An uncompressed chunk that grows past `budget * SPLIT_FACTOR` through upserts is split in two.
pub const SPLIT_FACTOR: f64 = 1.2;

const RAW_SAMPLE_BYTES: usize = 16;

/// Checks the chunk byte budget: a multiple of 8 within `48..=1_048_576`.
pub fn validate_chunk_size(bytes: usize) -> Result<(), DbError> {
    if !(MIN_CHUNK_SIZE_BYTES..=MAX_CHUNK_SIZE_BYTES).contains(&bytes) || bytes % 8 != 0 {
        return Err(DbError::InvalidArgument(format!(
            "chunk size must be a multiple of 8 in [{MIN_CHUNK_SIZE_BYTES}, {MAX_CHUNK_SIZE_BYTES}], got {bytes}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkEncoding {
    Uncompressed,
    #[default]
    Compressed,
}

impl ChunkEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkEncoding::Uncompressed => "uncompressed",
            ChunkEncoding::Compressed => "compressed",
        }
    }
}

impl fmt::Display for ChunkEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkEncoding {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uncompressed" => Ok(ChunkEncoding::Uncompressed),
            "compressed" => Ok(ChunkEncoding::Compressed),
            other => Err(DbError::InvalidArgument(format!(
                "unknown chunk encoding '{other}'"
            ))),
        }
    }
}

/// Per-chunk statistics reported by debug `info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub start_timestamp: Timestamp,
    pub end_timestamp: Timestamp,
    pub samples: usize,
    pub size_bytes: usize,
    pub bytes_per_sample: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncompressedChunk {
    samples: Vec<Sample>,
}

/// First sample raw, then interleaved delta-of-delta timestamps and XOR values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedChunk {
    first: Sample,
    last: Sample,
    count: usize,
    bits: BitBuf,
    ts_state: TimestampEncoder,
    value_state: XorEncoder,
}

impl CompressedChunk {
    fn new(first: Sample) -> Self {
        Self {
            first,
            last: first,
            count: 1,
            bits: BitBuf::new(),
            ts_state: TimestampEncoder::new(first.timestamp),
            value_state: XorEncoder::new(first.value),
        }
    }

    fn push(&mut self, s: Sample) {
        self.ts_state.push(&mut self.bits, s.timestamp);
        self.value_state.push(&mut self.bits, s.value);
        self.last = s;
        self.count += 1;
    }

    fn decode(&self) -> Result<Vec<Sample>, DbError> {
        let mut out = Vec::with_capacity(self.count);
        out.push(self.first);
        let mut r = BitReader::new(self.bits.as_bytes());
        let mut ts = TimestampEncoder::new(self.first.timestamp);
        let mut val = XorEncoder::new(self.first.value);
        for _ in 1..self.count {
            let t = ts.read(&mut r)?;
            let v = val.read(&mut r)?;
            out.push(Sample::new(t, v));
        }
        Ok(out)
    }

    fn size_bytes(&self) -> usize {
        RAW_SAMPLE_BYTES + self.bits.byte_len()
    }
}

/// A bounded, strictly time-ordered run of samples. Never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Chunk {
    Uncompressed(UncompressedChunk),
    Compressed(CompressedChunk),
}

impl Chunk {
    pub fn new(encoding: ChunkEncoding, first: Sample) -> Self {
        match encoding {
            ChunkEncoding::Uncompressed => Chunk::Uncompressed(UncompressedChunk {
                samples: vec![first],
            }),
            ChunkEncoding::Compressed => Chunk::Compressed(CompressedChunk::new(first)),
        }
    }

    /// Builds a chunk from already-sorted samples; `None` when `samples` is empty.
    pub fn from_samples(encoding: ChunkEncoding, samples: Vec<Sample>) -> Option<Self> {
        let first = *samples.first()?;
        match encoding {
            ChunkEncoding::Uncompressed => Some(Chunk::Uncompressed(UncompressedChunk { samples })),
            ChunkEncoding::Compressed => {
                let mut c = CompressedChunk::new(first);
                for s in samples.into_iter().skip(1) {
                    c.push(s);
                }
                Some(Chunk::Compressed(c))
            }
        }
    }

    pub fn encoding(&self) -> ChunkEncoding {
        match self {
            Chunk::Uncompressed(_) => ChunkEncoding::Uncompressed,
            Chunk::Compressed(_) => ChunkEncoding::Compressed,
        }
    }

    pub fn first_timestamp(&self) -> Timestamp {
        match self {
            Chunk::Uncompressed(c) => c.samples.first().map(|s| s.timestamp).unwrap_or(0),
            Chunk::Compressed(c) => c.first.timestamp,
        }
    }

    pub fn last_sample(&self) -> Sample {
        match self {
            Chunk::Uncompressed(c) => c
                .samples
                .last()
                .copied()
                .unwrap_or(Sample::new(0, 0.0)),
            Chunk::Compressed(c) => c.last,
        }
    }

    pub fn last_timestamp(&self) -> Timestamp {
        self.last_sample().timestamp
    }

    pub fn num_samples(&self) -> usize {
        match self {
            Chunk::Uncompressed(c) => c.samples.len(),
            Chunk::Compressed(c) => c.count,
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Chunk::Uncompressed(c) => c.samples.len() * RAW_SAMPLE_BYTES,
            Chunk::Compressed(c) => c.size_bytes(),
        }
    }

    /// Whether one more appended sample could exceed `budget` bytes.
    pub fn is_full(&self, budget: usize) -> bool {
        match self {
            Chunk::Uncompressed(c) => (c.samples.len() + 1) * RAW_SAMPLE_BYTES > budget,
            Chunk::Compressed(c) => c.size_bytes() + MAX_COMPRESSED_SAMPLE_BYTES > budget,
        }
    }

    /// Appends `s`; the caller guarantees `s.timestamp > self.last_timestamp()`.
    pub fn push(&mut self, s: Sample) {
        match self {
            Chunk::Uncompressed(c) => c.samples.push(s),
            Chunk::Compressed(c) => c.push(s),
        }
    }

    /// Decoded copy of every sample in timestamp order.
    pub fn samples(&self) -> Result<Vec<Sample>, DbError> {
        match self {
            Chunk::Uncompressed(c) => Ok(c.samples.clone()),
            Chunk::Compressed(c) => c.decode(),
        }
    }

    /// Inserts or merges `s`. Returns `true` when a new timestamp was inserted.
    ///
    /// Compressed chunks are rewritten only when `allow_rewrite` is set.
    pub fn upsert(
        &mut self,
        s: Sample,
        policy: DuplicatePolicy,
        allow_rewrite: bool,
    ) -> Result<bool, DbError> {
        match self {
            Chunk::Uncompressed(c) => upsert_sorted(&mut c.samples, s, policy),
            Chunk::Compressed(c) => {
                if !allow_rewrite {
                    return Err(DbError::UpsertUnsupported(ChunkEncoding::Compressed.as_str()));
                }
                let mut samples = c.decode()?;
                let inserted = upsert_sorted(&mut samples, s, policy)?;
                if let Some(rebuilt) = Chunk::from_samples(ChunkEncoding::Compressed, samples) {
                    *self = rebuilt;
                }
                Ok(inserted)
            }
        }
    }

    pub fn needs_split(&self, budget: usize) -> bool {
        self.num_samples() >= 2 && self.size_bytes() as f64 > budget as f64 * SPLIT_FACTOR
    }

    /// Moves the upper half of the samples into a new chunk and returns it.
    pub fn split(&mut self) -> Result<Option<Chunk>, DbError> {
        if self.num_samples() < 2 {
            return Ok(None);
        }
        let encoding = self.encoding();
        let mut lower = self.samples()?;
        let upper = lower.split_off(lower.len() / 2);
        if let Some(rebuilt) = Chunk::from_samples(encoding, lower) {
            *self = rebuilt;
        }
        Ok(Chunk::from_samples(encoding, upper))
    }

    pub fn info(&self) -> ChunkInfo {
        let samples = self.num_samples();
        let size_bytes = self.size_bytes();
        ChunkInfo {
            start_timestamp: self.first_timestamp(),
            end_timestamp: self.last_timestamp(),
            samples,
            size_bytes,
            bytes_per_sample: if samples == 0 {
                0.0
            } else {
                size_bytes as f64 / samples as f64
            },
        }
    }
}

fn upsert_sorted(
    samples: &mut Vec<Sample>,
    s: Sample,
    policy: DuplicatePolicy,
) -> Result<bool, DbError> {
    match samples.binary_search_by_key(&s.timestamp, |x| x.timestamp) {
        Ok(i) => {
            samples[i].value = policy.combine(s.timestamp, samples[i].value, s.value)?;
            Ok(false)
        }
        Err(i) => {
            samples.insert(i, s);
            Ok(true)
        }
    }
}
