use crate::error::DbError;
use crate::types::{Timestamp, Value};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a write to an already-present timestamp is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Reject the write.
    #[default]
    Block,
    /// Keep the stored value.
    First,
    /// Replace with the new value.
    Last,
    Min,
    Max,
    /// Add the new value to the stored one.
    Sum,
}

impl DuplicatePolicy {
    /// Resolves a collision at `ts` between the stored value and an incoming one.
    pub fn combine(self, ts: Timestamp, old: Value, new: Value) -> Result<Value, DbError> {
        match self {
            DuplicatePolicy::Block => Err(DbError::DuplicateSample(ts)),
            DuplicatePolicy::First => Ok(old),
            DuplicatePolicy::Last => Ok(new),
            DuplicatePolicy::Min => Ok(if new < old { new } else { old }),
            DuplicatePolicy::Max => Ok(if new > old { new } else { old }),
            DuplicatePolicy::Sum => Ok(old + new),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DuplicatePolicy::Block => "block",
            DuplicatePolicy::First => "first",
            DuplicatePolicy::Last => "last",
            DuplicatePolicy::Min => "min",
            DuplicatePolicy::Max => "max",
            DuplicatePolicy::Sum => "sum",
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicatePolicy {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(DuplicatePolicy::Block),
            "first" => Ok(DuplicatePolicy::First),
            "last" => Ok(DuplicatePolicy::Last),
            "min" => Ok(DuplicatePolicy::Min),
            "max" => Ok(DuplicatePolicy::Max),
            "sum" => Ok(DuplicatePolicy::Sum),
            other => Err(DbError::InvalidArgument(format!(
                "unknown duplicate policy '{other}'"
            ))),
        }
    }
}
