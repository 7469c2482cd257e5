use crate::chunk::{validate_chunk_size, ChunkEncoding, ChunkInfo};
use crate::compaction::{CompactionRule, PendingFlush};
use crate::duplicate_policy::DuplicatePolicy;
use crate::error::DbError;
use crate::storage::{ChunkStore, RangeQuery, SampleIter, StoreConfig, Trimmed};
use crate::aggregation::AggregationType;
use crate::types::{Labels, Sample, Timestamp, Value};

use serde::{Deserialize, Serialize};

/// Creation options. Unset fields fall back to the engine defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesOptions {
    pub retention: Option<u64>,
    pub chunk_size_bytes: Option<usize>,
    pub encoding: Option<ChunkEncoding>,
    pub duplicate_policy: Option<DuplicatePolicy>,
    pub labels: Labels,
}

impl SeriesOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retention(mut self, ms: u64) -> Self {
        self.retention = Some(ms);
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size_bytes = Some(bytes);
        self
    }

    pub fn encoding(mut self, encoding: ChunkEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = Some(policy);
        self
    }

    pub fn labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

/// Mutable settings of an existing series. The encoding cannot be altered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlterOptions {
    pub retention: Option<u64>,
    pub chunk_size_bytes: Option<usize>,
    pub duplicate_policy: Option<DuplicatePolicy>,
    /// Replaces the whole label set.
    pub labels: Option<Labels>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleInfo {
    pub dest_key: String,
    pub bucket_duration: u64,
    pub aggregation: AggregationType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub key: String,
    pub total_samples: u64,
    pub memory_usage: usize,
    pub first_timestamp: Option<Timestamp>,
    pub last_timestamp: Option<Timestamp>,
    pub retention: u64,
    pub chunk_count: usize,
    pub chunk_size_bytes: usize,
    pub encoding: ChunkEncoding,
    pub duplicate_policy: DuplicatePolicy,
    pub labels: Labels,
    pub source_key: Option<String>,
    pub rules: Vec<RuleInfo>,
    /// Per-chunk statistics, only for debug info requests.
    pub chunks: Option<Vec<ChunkInfo>>,
}

/// How a sample was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Appended,
    /// `inserted` is false when the sample merged into an existing timestamp.
    Upserted { inserted: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddOutcome {
    pub timestamp: Timestamp,
    pub kind: WriteKind,
    pub trimmed: Trimmed,
    /// Closed compaction buckets; the caller applies them after releasing this series.
    pub flushes: Vec<PendingFlush>,
}

pub fn validate_labels(labels: &Labels) -> Result<(), DbError> {
    for (k, v) in labels {
        if k.is_empty() || v.is_empty() {
            return Err(DbError::InvalidArgument(format!(
                "labels must have a non-empty name and value ('{k}'='{v}')"
            )));
        }
    }
    Ok(())
}

/// One logical series: identity, labels, storage and its outgoing compaction rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    key: String,
    labels: Labels,
    duplicate_policy: DuplicatePolicy,
    store: ChunkStore,
    source_key: Option<String>,
    rules: Vec<CompactionRule>,
}

impl Series {
    pub fn new(
        key: impl Into<String>,
        labels: Labels,
        duplicate_policy: DuplicatePolicy,
        config: StoreConfig,
    ) -> Result<Self, DbError> {
        validate_labels(&labels)?;
        validate_chunk_size(config.chunk_size_bytes)?;
        Ok(Series {
            key: key.into(),
            labels,
            duplicate_policy,
            store: ChunkStore::new(config),
            source_key: None,
            rules: Vec::new(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        self.duplicate_policy
    }

    pub fn retention(&self) -> u64 {
        self.store.config().retention
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn last_sample(&self) -> Option<Sample> {
        self.store.last_sample()
    }

    pub fn source_key(&self) -> Option<&str> {
        self.source_key.as_deref()
    }

    pub fn set_source_key(&mut self, source: Option<String>) {
        self.source_key = source;
    }

    pub fn rules(&self) -> &[CompactionRule] {
        &self.rules
    }

    pub fn has_rule_to(&self, dest_key: &str) -> bool {
        self.rules.iter().any(|r| r.dest_key == dest_key)
    }

    pub fn add_rule(&mut self, rule: CompactionRule) {
        self.rules.push(rule);
    }

    pub fn remove_rule(&mut self, dest_key: &str) -> Option<CompactionRule> {
        let idx = self.rules.iter().position(|r| r.dest_key == dest_key)?;
        Some(self.rules.remove(idx))
    }

    /// Applies `opts`; validation happens before anything changes.
    pub fn alter(&mut self, opts: &AlterOptions) -> Result<(), DbError> {
        if let Some(labels) = &opts.labels {
            validate_labels(labels)?;
        }
        if let Some(bytes) = opts.chunk_size_bytes {
            validate_chunk_size(bytes)?;
        }
        if let Some(r) = opts.retention {
            self.store.set_retention(r);
        }
        if let Some(bytes) = opts.chunk_size_bytes {
            self.store.set_chunk_size(bytes);
        }
        if let Some(p) = opts.duplicate_policy {
            self.duplicate_policy = p;
        }
        if let Some(labels) = &opts.labels {
            self.labels = labels.clone();
        }
        Ok(())
    }

    /// Write path: retention check, then upsert for `ts <= last` or append (feeding every rule).
    pub fn add(
        &mut self,
        ts: Timestamp,
        value: Value,
        policy_override: Option<DuplicatePolicy>,
    ) -> Result<AddOutcome, DbError> {
        let last = self.store.last_timestamp();
        let retention = self.retention();
        if !self.store.is_empty() && retention > 0 && ts < last && last - ts > retention {
            return Err(DbError::OutOfRetention {
                timestamp: ts,
                last,
                retention,
            });
        }

        if !self.store.is_empty() && ts <= last {
            let policy = policy_override.unwrap_or(self.duplicate_policy);
            let inserted = self.store.upsert(ts, value, policy)?;
            return Ok(AddOutcome {
                timestamp: ts,
                kind: WriteKind::Upserted { inserted },
                trimmed: Trimmed::default(),
                flushes: Vec::new(),
            });
        }

        let trimmed = self.store.append(ts, value)?;
        let flushes = self
            .rules
            .iter_mut()
            .filter_map(|rule| rule.on_accepted(ts, value))
            .collect();
        Ok(AddOutcome {
            timestamp: ts,
            kind: WriteKind::Appended,
            trimmed,
            flushes,
        })
    }

    /// Appends a compaction result. Destinations never run their own duplicate policy here.
    pub fn append_compacted(&mut self, ts: Timestamp, value: Value) -> Result<Trimmed, DbError> {
        self.store.append(ts, value)
    }

    pub fn range(&self, query: RangeQuery) -> SampleIter<'_> {
        self.store.range(query)
    }

    pub fn info(&self, debug: bool) -> SeriesInfo {
        let cfg = self.store.config();
        SeriesInfo {
            key: self.key.clone(),
            total_samples: self.store.total_samples(),
            memory_usage: self.store.memory_usage()
                + self.key.len()
                + self
                    .labels
                    .iter()
                    .map(|(k, v)| k.len() + v.len())
                    .sum::<usize>(),
            first_timestamp: self.store.first_timestamp(),
            last_timestamp: self.store.last_sample().map(|s| s.timestamp),
            retention: cfg.retention,
            chunk_count: self.store.num_chunks(),
            chunk_size_bytes: cfg.chunk_size_bytes,
            encoding: cfg.encoding,
            duplicate_policy: self.duplicate_policy,
            labels: self.labels.clone(),
            source_key: self.source_key.clone(),
            rules: self
                .rules
                .iter()
                .map(|r| RuleInfo {
                    dest_key: r.dest_key.clone(),
                    bucket_duration: r.bucket_duration,
                    aggregation: r.aggregation,
                })
                .collect(),
            chunks: debug.then(|| self.store.chunk_infos()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::labels_from;

    fn series(retention: u64) -> Series {
        Series::new(
            "s",
            labels_from(&[("sensor", "1")]),
            DuplicatePolicy::Block,
            StoreConfig {
                encoding: ChunkEncoding::Uncompressed,
                chunk_size_bytes: 64,
                retention,
                compressed_upsert: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn rejects_empty_labels() {
        let err = Series::new(
            "s",
            labels_from(&[("k", "")]),
            DuplicatePolicy::Block,
            StoreConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(_)));
    }

    #[test]
    fn out_of_retention_leaves_store_untouched() {
        let mut s = series(100);
        s.add(1000, 1.0, None).unwrap();
        let before = s.store().clone();
        let err = s.add(850, 2.0, None).unwrap_err();
        assert!(matches!(err, DbError::OutOfRetention { .. }));
        assert_eq!(s.store(), &before);
        // exactly at the boundary is an upsert, not a retention failure
        assert!(s.add(900, 2.0, None).is_ok());
    }

    #[test]
    fn upserts_do_not_feed_rules() {
        let mut s = series(0);
        s.add_rule(CompactionRule::new("d", AggregationType::Count, 10).unwrap());
        s.add(0, 1.0, None).unwrap();
        s.add(5, 1.0, None).unwrap();
        let out = s.add(3, 1.0, None).unwrap();
        assert_eq!(out.kind, WriteKind::Upserted { inserted: true });
        let out = s.add(10, 1.0, None).unwrap();
        assert_eq!(out.flushes.len(), 1);
        assert_eq!(out.flushes[0].value, 2.0);
    }

    #[test]
    fn override_policy_wins() {
        let mut s = series(0);
        s.add(1, 1.0, None).unwrap();
        s.add(1, 5.0, Some(DuplicatePolicy::Max)).unwrap();
        assert_eq!(s.last_sample(), Some(Sample::new(1, 5.0)));
    }

    #[test]
    fn alter_validates_before_mutating() {
        let mut s = series(0);
        let bad = AlterOptions {
            retention: Some(5),
            chunk_size_bytes: Some(7),
            ..AlterOptions::default()
        };
        assert!(s.alter(&bad).is_err());
        assert_eq!(s.retention(), 0);

        let good = AlterOptions {
            retention: Some(5),
            labels: Some(labels_from(&[("room", "a")])),
            ..AlterOptions::default()
        };
        s.alter(&good).unwrap();
        assert_eq!(s.retention(), 5);
        assert_eq!(s.labels().get("room").map(String::as_str), Some("a"));
    }

    #[test]
    fn info_reports_rules_and_debug_chunks() {
        let mut s = series(0);
        s.add_rule(CompactionRule::new("d", AggregationType::Max, 60_000).unwrap());
        for i in 0..6u64 {
            s.add(i, 0.0, None).unwrap();
        }
        let info = s.info(true);
        assert_eq!(info.total_samples, 6);
        assert_eq!(info.chunk_count, 2);
        assert_eq!(info.first_timestamp, Some(0));
        assert_eq!(info.last_timestamp, Some(5));
        assert_eq!(info.rules[0].dest_key, "d");
        assert_eq!(info.chunks.as_ref().map(Vec::len), Some(2));
        assert!(s.info(false).chunks.is_none());
    }
}
