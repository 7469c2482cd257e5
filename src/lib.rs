#![doc = include_str!("../README.md")]
// Declare modules
pub mod aggregation;
pub mod chunk;
pub mod compaction;
pub mod config;
pub mod core;
pub mod duplicate_policy;
pub mod encoding;
pub mod error;
pub mod index;
pub mod persistence;
pub mod query;
pub mod series;
pub mod storage;
pub mod telemetry;
pub mod types;

/// Aggregation kinds for compaction rules and aggregated ranges; cross-series reducers.
pub use crate::aggregation::{AggregationType, Reducer};
/// Chunk encoding chosen per series at creation.
pub use crate::chunk::ChunkEncoding;
/// Global rule templates applied to auto-created series.
pub use crate::compaction::CompactionPolicy;
/// Main entry point and its configuration.
pub use crate::core::{Engine, EngineConfig};
/// Conflict resolution for writes at an existing timestamp.
pub use crate::duplicate_policy::DuplicatePolicy;
/// Error type for engine operations.
pub use crate::error::{DbError, ErrorKind};
/// Label predicates.
pub use crate::index::QueryPredicate;
/// Snapshot manager for point-in-time backups.
pub use crate::persistence::Snapshotter;
/// Query arguments and results.
pub use crate::query::{MRangeArgs, RangeArgs, SeriesResult};
/// Series creation/alteration options and introspection.
pub use crate::series::{AlterOptions, SeriesInfo, SeriesOptions};
/// Structured event hook for observability.
pub use crate::telemetry::{DbEvent, DbEventListener};
/// Core value types.
pub use crate::types::{Labels, Sample, Timestamp, Value};
