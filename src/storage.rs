use crate::chunk::{Chunk, ChunkEncoding, ChunkInfo, DEFAULT_CHUNK_SIZE_BYTES};
use crate::duplicate_policy::DuplicatePolicy;
use crate::error::DbError;
use crate::types::{Sample, Timestamp, Value};

use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;

/// Per-series storage settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub encoding: ChunkEncoding,
    pub chunk_size_bytes: usize,
    /// Retention window in milliseconds; 0 keeps everything.
    pub retention: u64,
    /// Allow upserts into compressed chunks by rewriting the covering chunk.
    pub compressed_upsert: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            encoding: ChunkEncoding::Compressed,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            retention: 0,
            compressed_upsert: false,
        }
    }
}

/// What a retention pass dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trimmed {
    pub chunks: usize,
    pub samples: u64,
}

impl Trimmed {
    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }
}

/// Describes a range read; an iterator is restartable by re-creating it from the same query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeQuery {
    pub start: Timestamp,
    pub end: Timestamp,
    pub reverse: bool,
}

impl RangeQuery {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start,
            end,
            reverse: false,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = !self.reverse;
        self
    }
}

/// Ordered chunk map of a single series, keyed by each chunk's first timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkStore {
    config: StoreConfig,
    chunks: BTreeMap<Timestamp, Chunk>,
    last_timestamp: Timestamp,
    last_value: Value,
    total_samples: u64,
}

impl ChunkStore {
    pub fn new(config: StoreConfig) -> Self {
        ChunkStore {
            config,
            chunks: BTreeMap::new(),
            last_timestamp: 0,
            last_value: 0.0,
            total_samples: 0,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn set_retention(&mut self, retention: u64) {
        self.config.retention = retention;
    }

    /// Applies to chunks opened from now on.
    pub fn set_chunk_size(&mut self, bytes: usize) {
        self.config.chunk_size_bytes = bytes;
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn last_timestamp(&self) -> Timestamp {
        self.last_timestamp
    }

    pub fn last_value(&self) -> Value {
        self.last_value
    }

    pub fn last_sample(&self) -> Option<Sample> {
        if self.is_empty() {
            None
        } else {
            Some(Sample::new(self.last_timestamp, self.last_value))
        }
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.chunks.keys().next().copied()
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .chunks
                .values()
                .map(|c| c.size_bytes() + std::mem::size_of::<Chunk>())
                .sum::<usize>()
    }

    pub fn chunk_infos(&self) -> Vec<ChunkInfo> {
        self.chunks.values().map(Chunk::info).collect()
    }

    /// Appends a sample newer than everything stored, then trims by retention.
    pub fn append(&mut self, ts: Timestamp, value: Value) -> Result<Trimmed, DbError> {
        if !self.is_empty() && ts <= self.last_timestamp {
            return Err(DbError::TimestampNotIncreasing {
                timestamp: ts,
                last: self.last_timestamp,
            });
        }
        let sample = Sample::new(ts, value);
        let budget = self.config.chunk_size_bytes;
        let has_room = self
            .chunks
            .values()
            .next_back()
            .is_some_and(|c| !c.is_full(budget));
        if has_room {
            if let Some(open) = self.chunks.values_mut().next_back() {
                open.push(sample);
            }
        } else {
            self.chunks
                .insert(ts, Chunk::new(self.config.encoding, sample));
        }
        self.last_timestamp = ts;
        self.last_value = value;
        self.total_samples += 1;
        Ok(self.trim(ts))
    }

    /// Inserts or merges a sample at or before the last timestamp.
    ///
    /// Returns `true` when a new timestamp was inserted rather than merged.
    pub fn upsert(
        &mut self,
        ts: Timestamp,
        value: Value,
        policy: DuplicatePolicy,
    ) -> Result<bool, DbError> {
        if self.is_empty() || ts > self.last_timestamp {
            self.append(ts, value)?;
            return Ok(true);
        }

        let key = self
            .chunks
            .range(..=ts)
            .next_back()
            .map(|(k, _)| *k)
            .or_else(|| self.first_timestamp());
        // merging into the newest sample only rewrites the open chunk
        let allow_rewrite = self.config.compressed_upsert || ts == self.last_timestamp;
        let budget = self.config.chunk_size_bytes;

        let Some((key, chunk)) = key.and_then(|k| self.chunks.get_mut(&k).map(|c| (k, c))) else {
            return Err(DbError::Corruption {
                details: format!("no chunk covers timestamp {ts}"),
                series: None,
            });
        };
        let inserted = chunk.upsert(Sample::new(ts, value), policy, allow_rewrite)?;
        let split = if chunk.needs_split(budget) {
            chunk.split()?
        } else {
            None
        };
        let new_key = chunk.first_timestamp();
        if new_key != key {
            if let Some(c) = self.chunks.remove(&key) {
                self.chunks.insert(new_key, c);
            }
        }
        if let Some(upper) = split {
            self.chunks.insert(upper.first_timestamp(), upper);
        }

        if inserted {
            self.total_samples += 1;
        }
        if ts == self.last_timestamp {
            if let Some(last) = self.chunks.values().next_back() {
                self.last_value = last.last_sample().value;
            }
        }
        Ok(inserted)
    }

    /// Drops whole chunks that ended before `now - retention`. The newest chunk always stays.
    pub fn trim(&mut self, now: Timestamp) -> Trimmed {
        let mut out = Trimmed::default();
        if self.config.retention == 0 || self.chunks.len() < 2 {
            return out;
        }
        let min_ts = now.saturating_sub(self.config.retention);
        while self.chunks.len() > 1 {
            let Some(entry) = self.chunks.first_entry() else {
                break;
            };
            if entry.get().last_timestamp() >= min_ts {
                break;
            }
            let dropped = entry.remove();
            out.chunks += 1;
            out.samples += dropped.num_samples() as u64;
        }
        self.total_samples = self.total_samples.saturating_sub(out.samples);
        out
    }

    /// Lazily walks the samples in `[start, end]`, clamped to the retention window.
    pub fn range(&self, query: RangeQuery) -> SampleIter<'_> {
        let mut start = query.start;
        if self.config.retention > 0 && !self.is_empty() {
            start = start.max(self.last_timestamp.saturating_sub(self.config.retention));
        }
        let chunks = if start > query.end {
            None
        } else {
            let seek = self
                .chunks
                .range(..=start)
                .next_back()
                .map(|(k, _)| *k)
                .unwrap_or(start);
            Some(self.chunks.range(seek..=query.end))
        };
        SampleIter {
            chunks,
            current: Vec::new().into_iter(),
            start,
            end: query.end,
            reverse: query.reverse,
        }
    }
}

/// Iterator over the samples of a [`RangeQuery`]. Decodes one chunk at a time.
pub struct SampleIter<'a> {
    chunks: Option<btree_map::Range<'a, Timestamp, Chunk>>,
    current: std::vec::IntoIter<Sample>,
    start: Timestamp,
    end: Timestamp,
    reverse: bool,
}

impl Iterator for SampleIter<'_> {
    type Item = Result<Sample, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for s in self.current.by_ref() {
                if s.timestamp >= self.start && s.timestamp <= self.end {
                    return Some(Ok(s));
                }
            }
            let chunks = self.chunks.as_mut()?;
            let next = if self.reverse {
                chunks.next_back()
            } else {
                chunks.next()
            };
            let (_, chunk) = next?;
            match chunk.samples() {
                Ok(mut samples) => {
                    if self.reverse {
                        samples.reverse();
                    }
                    self.current = samples.into_iter();
                }
                Err(e) => {
                    self.chunks = None;
                    return Some(Err(e));
                }
            }
        }
    }
}
