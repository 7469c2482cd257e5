//! Layered configuration: code defaults < TOML file < `TSCORE_*` environment variables.
//!
//! Nested keys use `__` as the environment separator, e.g. `TSCORE_CHUNK_SIZE_BYTES=8192`.
//! CLI overrides are applied by the caller on the resulting [`EngineConfig`].

use crate::chunk::ChunkEncoding;
use crate::compaction::parse_policies;
use crate::core::EngineConfig;
use crate::duplicate_policy::DuplicatePolicy;
use crate::error::DbError;

use ::config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment variables read by [`load_file_config`].
pub const ENV_PREFIX: &str = "TSCORE";

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "tscored.toml";

/// Engine settings as read from file + env. Every field is optional so layers only override
/// what they set.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct EngineFileConfig {
    /// Default retention in milliseconds.
    pub retention_ms: Option<u64>,
    pub chunk_size_bytes: Option<usize>,
    /// `compressed` or `uncompressed`.
    pub encoding: Option<ChunkEncoding>,
    /// `block`, `first`, `last`, `min`, `max` or `sum`.
    pub duplicate_policy: Option<DuplicatePolicy>,
    pub compressed_upsert: Option<bool>,
    /// `;`-separated `agg:bucket:retention` policies, e.g. `max:1m:1d;avg:1h:30d`.
    pub compaction_policy: Option<String>,
    pub data_dir: Option<String>,
    pub enable_snapshots: Option<bool>,
    pub snapshot_interval_secs: Option<u64>,
    pub snapshots_to_keep: Option<usize>,
}

/// Reads the file layer (unless `no_config`) and the environment layer.
///
/// With `path == None` the file [`DEFAULT_CONFIG_FILE`] is used when it exists.
///
/// # Errors
/// `ConfigError` when an explicit file is missing or a value has the wrong shape.
pub fn load_file_config(path: Option<&Path>, no_config: bool) -> Result<EngineFileConfig, DbError> {
    let mut builder = Config::builder();

    if !no_config {
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(DbError::ConfigError(format!(
                        "config file not found: {}",
                        p.display()
                    )));
                }
                builder = builder.add_source(File::from(p));
            }
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path.as_path()));
                }
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder
        .build()
        .map_err(|e| DbError::ConfigError(e.to_string()))?;
    merged
        .try_deserialize()
        .map_err(|e| DbError::ConfigError(e.to_string()))
}

/// Overwrites the fields of `base` that `partial` sets, validating as it goes.
pub fn merge_into_engine_config(
    base: &mut EngineConfig,
    partial: &EngineFileConfig,
) -> Result<(), DbError> {
    if let Some(ms) = partial.retention_ms {
        base.retention = ms;
    }
    if let Some(bytes) = partial.chunk_size_bytes {
        crate::chunk::validate_chunk_size(bytes)
            .map_err(|e| DbError::ConfigError(format!("chunk_size_bytes: {e}")))?;
        base.chunk_size_bytes = bytes;
    }
    if let Some(enc) = partial.encoding {
        base.encoding = enc;
    }
    if let Some(policy) = partial.duplicate_policy {
        base.duplicate_policy = policy;
    }
    if let Some(b) = partial.compressed_upsert {
        base.compressed_upsert = b;
    }
    if let Some(s) = &partial.compaction_policy {
        base.compaction_policies = parse_policies(s)
            .map_err(|e| DbError::ConfigError(format!("compaction_policy: {e}")))?;
    }
    if let Some(d) = &partial.data_dir {
        base.data_dir = PathBuf::from(d);
    }
    if let Some(b) = partial.enable_snapshots {
        base.enable_snapshots = b;
    }
    if let Some(secs) = partial.snapshot_interval_secs {
        if secs == 0 {
            return Err(DbError::ConfigError(
                "snapshot_interval_secs must be greater than zero".to_string(),
            ));
        }
        base.snapshot_interval = Duration::from_secs(secs);
    }
    if let Some(n) = partial.snapshots_to_keep {
        base.snapshots_to_keep = n.max(1);
    }
    Ok(())
}

/// Defaults merged with the file and environment layers.
pub fn load_engine_config(path: Option<&Path>, no_config: bool) -> Result<EngineConfig, DbError> {
    let partial = load_file_config(path, no_config)?;
    let mut cfg = EngineConfig::default();
    merge_into_engine_config(&mut cfg, &partial)?;
    Ok(cfg)
}
