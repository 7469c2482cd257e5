use crate::types::Timestamp;
use thiserror::Error;

/// Coarse classification of [`DbError`] values.
///
/// Callers use this to decide how to surface a failure; the core itself never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad argument shape (out of retention, malformed predicates, invalid ranges, ...).
    PreconditionViolation,
    /// The request conflicts with existing state (duplicate sample, existing key or rule).
    StateConflict,
    /// A key or rule does not exist.
    NotFound,
    /// I/O, codec, lock or configuration failure.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PreconditionViolation => "precondition_violation",
            ErrorKind::StateConflict => "state_conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Custom error type for the engine operations.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Timestamp {timestamp} is older than retention (last={last}, retention={retention})")]
    OutOfRetention {
        timestamp: Timestamp,
        last: Timestamp,
        retention: u64,
    },

    #[error("Timestamp {timestamp} must be greater than the last timestamp {last}")]
    TimestampNotIncreasing { timestamp: Timestamp, last: Timestamp },

    #[error("Duplicate sample at {0} rejected by BLOCK policy")]
    DuplicateSample(Timestamp),

    #[error("Upsert is not supported by the {0} chunk encoding")]
    UpsertUnsupported(&'static str),

    #[error("Please provide at least one matcher")]
    NoMatchers,

    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: Timestamp, end: Timestamp },

    #[error("Series not found: {0}")]
    SeriesNotFound(String),

    #[error("Key already exists: {0}")]
    KeyExists(String),

    #[error("The source key and destination key should be different: {0}")]
    SameSourceAndDestination(String),

    #[error("The source key {0} already has a source rule")]
    SourceIsDestination(String),

    #[error("The destination key {0} already has a rule")]
    DestinationHasSource(String),

    #[error("Compaction rule does not exist: {source_key} -> {dest_key}")]
    RuleNotFound { source_key: String, dest_key: String },

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        series: Option<String>,
    },

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::OutOfRetention { .. }
            | DbError::TimestampNotIncreasing { .. }
            | DbError::UpsertUnsupported(_)
            | DbError::NoMatchers
            | DbError::InvalidPredicate(_)
            | DbError::InvalidArgument(_)
            | DbError::InvalidTimeRange { .. }
            | DbError::SameSourceAndDestination(_) => ErrorKind::PreconditionViolation,
            DbError::DuplicateSample(_)
            | DbError::KeyExists(_)
            | DbError::SourceIsDestination(_)
            | DbError::DestinationHasSource(_) => ErrorKind::StateConflict,
            DbError::SeriesNotFound(_) | DbError::RuleNotFound { .. } => ErrorKind::NotFound,
            DbError::Io(_)
            | DbError::Serialization(_)
            | DbError::Corruption { .. }
            | DbError::LockError(_)
            | DbError::ConfigError(_) => ErrorKind::Internal,
        }
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DbError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}
