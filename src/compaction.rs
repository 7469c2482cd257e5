//! Incremental downsampling rules and the global policies that create them.

use crate::aggregation::{bucket_start, Accumulator, AggregationType};
use crate::error::DbError;
use crate::types::{Timestamp, Value};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A closed bucket waiting to be appended to its destination series.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFlush {
    pub dest_key: String,
    pub timestamp: Timestamp,
    pub value: Value,
}

/// Downsampling rule owned by a source series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionRule {
    pub dest_key: String,
    pub aggregation: AggregationType,
    pub bucket_duration: u64,
    accumulator: Accumulator,
    /// Start of the open bucket; `None` until the first sample arrives.
    bucket_start: Option<Timestamp>,
}

impl CompactionRule {
    pub fn new(
        dest_key: impl Into<String>,
        aggregation: AggregationType,
        bucket_duration: u64,
    ) -> Result<Self, DbError> {
        if bucket_duration == 0 {
            return Err(DbError::InvalidArgument(
                "bucket duration must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            dest_key: dest_key.into(),
            aggregation,
            bucket_duration,
            accumulator: Accumulator::new(aggregation),
            bucket_start: None,
        })
    }

    pub fn open_bucket(&self) -> Option<Timestamp> {
        self.bucket_start
    }

    /// Feeds an appended sample. Returns the aggregate of the previous bucket when `ts`
    /// opens a later one.
    pub fn on_accepted(&mut self, ts: Timestamp, value: Value) -> Option<PendingFlush> {
        let bucket = bucket_start(ts, self.bucket_duration);
        let mut flush = None;
        match self.bucket_start {
            None => self.bucket_start = Some(bucket),
            Some(open) if bucket > open => {
                if let Some(agg) = self.accumulator.finalize() {
                    flush = Some(PendingFlush {
                        dest_key: self.dest_key.clone(),
                        timestamp: open,
                        value: agg,
                    });
                }
                self.accumulator.reset();
                self.bucket_start = Some(bucket);
            }
            Some(_) => {}
        }
        self.accumulator.append(value);
        flush
    }
}

/// Global template for rules created on auto-created series.
///
/// Textual form `agg:bucket:retention`, e.g. `max:1m:1d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    pub aggregation: AggregationType,
    pub bucket_duration: u64,
    pub retention: u64,
}

impl CompactionPolicy {
    /// `<source>_<AGG>_<bucket_ms>`.
    pub fn dest_key_for(&self, source_key: &str) -> String {
        format!(
            "{}_{}_{}",
            source_key,
            self.aggregation.as_str().to_uppercase(),
            self.bucket_duration
        )
    }
}

impl fmt::Display for CompactionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}ms:{}ms",
            self.aggregation, self.bucket_duration, self.retention
        )
    }
}

impl FromStr for CompactionPolicy {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let [agg, bucket, retention] = parts.as_slice() else {
            return Err(DbError::InvalidArgument(format!(
                "compaction policy '{s}' must look like agg:bucket:retention"
            )));
        };
        let aggregation = agg.parse()?;
        let bucket_duration = parse_duration_ms(bucket)?;
        if bucket_duration == 0 {
            return Err(DbError::InvalidArgument(format!(
                "compaction policy '{s}' has a zero bucket"
            )));
        }
        Ok(Self {
            aggregation,
            bucket_duration,
            retention: parse_duration_ms(retention)?,
        })
    }
}

/// Parses `;`-separated policies. Empty input yields no policies.
pub fn parse_policies(s: &str) -> Result<Vec<CompactionPolicy>, DbError> {
    s.split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::parse)
        .collect()
}

/// `<n>[ms|s|m|h|d]` to milliseconds; a bare number is milliseconds.
pub fn parse_duration_ms(s: &str) -> Result<u64, DbError> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num
        .parse()
        .map_err(|_| DbError::InvalidArgument(format!("invalid duration '{s}'")))?;
    let scale = match unit {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => {
            return Err(DbError::InvalidArgument(format!(
                "invalid duration unit in '{s}'"
            )))
        }
    };
    n.checked_mul(scale)
        .ok_or_else(|| DbError::InvalidArgument(format!("duration '{s}' overflows")))
}
