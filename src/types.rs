use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp type (milliseconds since epoch).
pub type Timestamp = u64;

/// Value type.
pub type Value = f64;

/// Label set of a series. Ordered by key so iteration and persistence are deterministic.
pub type Labels = BTreeMap<String, String>;

/// A single `(timestamp, value)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Sample {
    pub fn new(timestamp: Timestamp, value: Value) -> Self {
        Self { timestamp, value }
    }
}

impl From<(Timestamp, Value)> for Sample {
    fn from((timestamp, value): (Timestamp, Value)) -> Self {
        Self { timestamp, value }
    }
}

impl From<Sample> for (Timestamp, Value) {
    fn from(s: Sample) -> Self {
        (s.timestamp, s.value)
    }
}

/// Builds a label set from `(key, value)` pairs.
pub fn labels_from(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
