//! Engine: the key space, per-series locking, the write path with compaction fan-out, rule
//! management, the deletion hook, and snapshot orchestration.

use crate::aggregation::AggregationType;
use crate::chunk::{ChunkEncoding, DEFAULT_CHUNK_SIZE_BYTES};
use crate::compaction::{CompactionPolicy, CompactionRule, PendingFlush};
use crate::duplicate_policy::DuplicatePolicy;
use crate::error::DbError;
use crate::index::{KeyCursor, LabelIndex, QueryPredicate};
use crate::persistence::{decode_series, encode_series, Snapshotter};
use crate::query::{execute_mrange, range_series, MRangeArgs, RangeArgs, SeriesResult};
use crate::series::{AddOutcome, AlterOptions, Series, SeriesInfo, SeriesOptions, WriteKind};
use crate::storage::{StoreConfig, Trimmed};
use crate::telemetry::{db_metrics, noop_event_listener, DbEvent, DbEventListener};
use crate::types::{now_ms, Labels, Sample, Timestamp, Value};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A series plus the lock that orders delivery of its compaction flushes.
#[derive(Debug)]
struct SeriesSlot {
    series: RwLock<Series>,
    /// Taken before `series` and held until the write's flushes are delivered.
    delivery: Mutex<()>,
}

impl SeriesSlot {
    fn new(series: Series) -> Arc<Self> {
        Arc::new(SeriesSlot {
            series: RwLock::new(series),
            delivery: Mutex::new(()),
        })
    }
}

type SeriesHandle = Arc<SeriesSlot>;

/// Configuration options for the [`Engine`].
///
/// Series-level fields are defaults for series created without explicit options.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default retention in milliseconds (0 = unbounded).
    pub retention: u64,
    /// Default chunk byte budget.
    pub chunk_size_bytes: usize,
    /// Default chunk encoding.
    pub encoding: ChunkEncoding,
    /// Default duplicate policy.
    pub duplicate_policy: DuplicatePolicy,
    /// Allow upserts into compressed chunks by rewriting the covering chunk.
    pub compressed_upsert: bool,
    /// Rules created for every auto-created series.
    pub compaction_policies: Vec<CompactionPolicy>,
    /// Directory for snapshots (`<data_dir>/snapshots`).
    pub data_dir: PathBuf,
    /// Whether snapshotting is available.
    pub enable_snapshots: bool,
    /// Interval between automatic snapshots taken by the daemon.
    pub snapshot_interval: Duration,
    /// How many snapshot files to keep after each new one.
    pub snapshots_to_keep: usize,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn DbEventListener>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            retention: 0,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            encoding: ChunkEncoding::Compressed,
            duplicate_policy: DuplicatePolicy::Block,
            compressed_upsert: false,
            compaction_policies: Vec::new(),
            data_dir: PathBuf::from("./data"),
            enable_snapshots: false,
            snapshot_interval: Duration::from_secs(60 * 15),
            snapshots_to_keep: 3,
            event_listener: noop_event_listener(),
        }
    }
}

/// An embeddable time-series engine.
///
/// Holds at most one series lock at a time, except rule creation and deletion which lock both
/// series in key order. Lock order is key space, then series, then label index; a source's
/// delivery lock is only ever taken with nothing else held. Multi-series reads are not
/// transactional across keys.
#[derive(Debug)]
pub struct Engine {
    series: RwLock<HashMap<String, SeriesHandle>>,
    index: LabelIndex,
    snapshotter: Option<Snapshotter>,
    config: EngineConfig,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// An in-memory engine with default configuration and snapshots disabled.
    pub fn new() -> Self {
        Engine {
            series: RwLock::new(HashMap::new()),
            index: LabelIndex::new(),
            snapshotter: None,
            config: EngineConfig::default(),
        }
    }

    /// Creates an engine with the provided configuration.
    ///
    /// # Errors
    /// Returns an error if the snapshot directory cannot be created.
    pub fn with_config(config: EngineConfig) -> Result<Self, DbError> {
        crate::chunk::validate_chunk_size(config.chunk_size_bytes)?;
        let snapshotter = if config.enable_snapshots {
            Some(Snapshotter::new(config.data_dir.join("snapshots"))?)
        } else {
            None
        };
        Ok(Engine {
            series: RwLock::new(HashMap::new()),
            index: LabelIndex::new(),
            snapshotter,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn emit(&self, event: DbEvent) {
        self.config.event_listener.on_event(event);
    }

    fn handle(&self, key: &str) -> Result<Option<SeriesHandle>, DbError> {
        Ok(self.series.read()?.get(key).cloned())
    }

    fn require(&self, key: &str) -> Result<SeriesHandle, DbError> {
        self.handle(key)?
            .ok_or_else(|| DbError::SeriesNotFound(key.to_string()))
    }

    fn store_config(&self, opts: &SeriesOptions) -> StoreConfig {
        StoreConfig {
            encoding: opts.encoding.unwrap_or(self.config.encoding),
            chunk_size_bytes: opts.chunk_size_bytes.unwrap_or(self.config.chunk_size_bytes),
            retention: opts.retention.unwrap_or(self.config.retention),
            compressed_upsert: self.config.compressed_upsert,
        }
    }

    fn insert_series(&self, series: Series) -> Result<(), DbError> {
        let key = series.key().to_string();
        let labels = series.labels().clone();
        {
            let mut map = self.series.write()?;
            if map.contains_key(&key) {
                return Err(DbError::KeyExists(key));
            }
            map.insert(key.clone(), SeriesSlot::new(series));
            self.index.index(&key, &labels)?;
            db_metrics::set_series_count(map.len());
        }
        self.emit(DbEvent::SeriesCreated { key });
        Ok(())
    }

    // --- key space ---

    /// Creates an empty series.
    ///
    /// # Errors
    /// `KeyExists` if the key is taken; `InvalidArgument` for empty keys, empty labels or a bad
    /// chunk size.
    pub fn create_series(&self, key: &str, opts: SeriesOptions) -> Result<(), DbError> {
        if key.is_empty() {
            return Err(DbError::InvalidArgument("series key must not be empty".to_string()));
        }
        let series = Series::new(
            key,
            opts.labels.clone(),
            opts.duplicate_policy.unwrap_or(self.config.duplicate_policy),
            self.store_config(&opts),
        )?;
        self.insert_series(series)
    }

    /// Changes retention, chunk size, duplicate policy or labels. Label changes are re-indexed.
    pub fn alter_series(&self, key: &str, opts: AlterOptions) -> Result<(), DbError> {
        // the key-space read lock keeps a concurrent delete from interleaving with re-indexing
        let map = self.series.read()?;
        let handle = map
            .get(key)
            .ok_or_else(|| DbError::SeriesNotFound(key.to_string()))?;
        let mut s = handle.series.write()?;
        let old_labels = s.labels().clone();
        s.alter(&opts)?;
        if opts.labels.is_some() && s.labels() != &old_labels {
            self.index.remove(key, &old_labels)?;
            self.index.index(key, s.labels())?;
        }
        Ok(())
    }

    /// Removes a series and unlinks it from the rule graph.
    pub fn delete_series(&self, key: &str) -> Result<(), DbError> {
        if self.notify_key_deleted(key)? {
            Ok(())
        } else {
            Err(DbError::SeriesNotFound(key.to_string()))
        }
    }

    /// Deletion hook for keys removed by the host. Returns whether the key was known.
    ///
    /// Purges the index entries, the rule of the source that fed this key, and the source
    /// pointer of every destination this key fed.
    pub fn notify_key_deleted(&self, key: &str) -> Result<bool, DbError> {
        // index purge happens under the key-space lock so a re-created key keeps its postings
        let (source, dests) = {
            let mut map = self.series.write()?;
            let Some(handle) = map.remove(key) else {
                return Ok(false);
            };
            db_metrics::set_series_count(map.len());
            let s = handle.series.read()?;
            self.index.remove(key, s.labels())?;
            let source = s.source_key().map(str::to_string);
            let dests: Vec<String> = s.rules().iter().map(|r| r.dest_key.clone()).collect();
            (source, dests)
        };

        if let Some(src) = source {
            if let Some(h) = self.handle(&src)? {
                h.series.write()?.remove_rule(key);
            }
        }
        for dest in dests {
            if let Some(h) = self.handle(&dest)? {
                let mut d = h.series.write()?;
                if d.source_key() == Some(key) {
                    d.set_source_key(None);
                }
            }
        }
        self.emit(DbEvent::SeriesDeleted {
            key: key.to_string(),
        });
        Ok(true)
    }

    pub fn contains_series(&self, key: &str) -> Result<bool, DbError> {
        Ok(self.series.read()?.contains_key(key))
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>, DbError> {
        let mut keys: Vec<String> = self.series.read()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub fn len(&self) -> Result<usize, DbError> {
        Ok(self.series.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, DbError> {
        Ok(self.len()? == 0)
    }

    // --- write path ---

    /// Runs `write` under the series lock, then delivers closed compaction buckets after the
    /// lock is released. The source's delivery lock spans both steps, so buckets reach their
    /// destination in the order they closed.
    fn write_with<F>(&self, key: &str, write: F) -> Result<Timestamp, DbError>
    where
        F: FnOnce(&mut Series) -> Result<AddOutcome, DbError>,
    {
        let handle = self.require(key)?;
        let _delivery = handle.delivery.lock()?;
        let outcome = {
            let mut s = handle.series.write()?;
            write(&mut *s)
        };
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                db_metrics::record_rejected(e.kind().as_str());
                return Err(e);
            }
        };
        match outcome.kind {
            WriteKind::Appended => db_metrics::record_appended(1),
            WriteKind::Upserted { .. } => db_metrics::record_upserted(),
        }
        self.report_trim(key, outcome.trimmed);
        self.apply_flushes(key, outcome.flushes);
        Ok(outcome.timestamp)
    }

    fn report_trim(&self, key: &str, trimmed: Trimmed) {
        if !trimmed.is_empty() {
            self.emit(DbEvent::ChunksTrimmed {
                key: key.to_string(),
                chunks: trimmed.chunks,
                samples: trimmed.samples,
            });
        }
    }

    /// Best effort: a missing destination or a failed append never fails the source write.
    fn apply_flushes(&self, source_key: &str, flushes: Vec<PendingFlush>) {
        for flush in flushes {
            let handle = match self.handle(&flush.dest_key) {
                Ok(Some(h)) => h,
                Ok(None) => {
                    self.emit(DbEvent::CompactionDestinationMissing {
                        source_key: source_key.to_string(),
                        dest_key: flush.dest_key,
                    });
                    continue;
                }
                Err(e) => {
                    self.emit(DbEvent::CompactionFlushFailed {
                        dest_key: flush.dest_key,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let res = handle
                .series
                .write()
                .map_err(DbError::from)
                .and_then(|mut d| d.append_compacted(flush.timestamp, flush.value));
            match res {
                Ok(trimmed) => {
                    db_metrics::record_compaction_flushes(1);
                    db_metrics::record_appended(1);
                    self.report_trim(&flush.dest_key, trimmed);
                }
                Err(e) => self.emit(DbEvent::CompactionFlushFailed {
                    dest_key: flush.dest_key,
                    error: e.to_string(),
                }),
            }
        }
    }

    /// Adds a sample to an existing series using its duplicate policy.
    ///
    /// # Errors
    /// `SeriesNotFound`, `OutOfRetention`, `DuplicateSample` (block policy) or
    /// `UpsertUnsupported` (compressed chunk without rewrite).
    pub fn add(&self, key: &str, ts: Timestamp, value: Value) -> Result<Timestamp, DbError> {
        self.write_with(key, |s| s.add(ts, value, None))
    }

    /// Like [`Engine::add`] with a per-call duplicate policy.
    pub fn add_with_policy(
        &self,
        key: &str,
        ts: Timestamp,
        value: Value,
        policy: DuplicatePolicy,
    ) -> Result<Timestamp, DbError> {
        self.write_with(key, |s| s.add(ts, value, Some(policy)))
    }

    /// Adds a sample, creating the series from `opts` (plus global compaction policies) if it
    /// does not exist yet.
    pub fn add_or_create(
        &self,
        key: &str,
        ts: Timestamp,
        value: Value,
        opts: SeriesOptions,
    ) -> Result<Timestamp, DbError> {
        self.ensure_series(key, opts)?;
        self.add(key, ts, value)
    }

    /// Adds many samples; each entry gets its own result.
    pub fn madd(&self, samples: &[(&str, Timestamp, Value)]) -> Vec<Result<Timestamp, DbError>> {
        samples
            .iter()
            .map(|&(key, ts, value)| self.add(key, ts, value))
            .collect()
    }

    /// Adds `delta` to the last value and writes the result at `ts` (default: now).
    ///
    /// The timestamp must not be older than the last one; an equal timestamp overwrites.
    pub fn incr_by(
        &self,
        key: &str,
        delta: Value,
        ts: Option<Timestamp>,
        opts: SeriesOptions,
    ) -> Result<Timestamp, DbError> {
        self.ensure_series(key, opts)?;
        let ts = ts.unwrap_or_else(now_ms);
        self.write_with(key, |s| {
            let base = match s.last_sample() {
                Some(last) if ts < last.timestamp => {
                    return Err(DbError::TimestampNotIncreasing {
                        timestamp: ts,
                        last: last.timestamp,
                    })
                }
                Some(last) => last.value,
                None => 0.0,
            };
            s.add(ts, base + delta, Some(DuplicatePolicy::Last))
        })
    }

    pub fn decr_by(
        &self,
        key: &str,
        delta: Value,
        ts: Option<Timestamp>,
        opts: SeriesOptions,
    ) -> Result<Timestamp, DbError> {
        self.incr_by(key, -delta, ts, opts)
    }

    fn ensure_series(&self, key: &str, opts: SeriesOptions) -> Result<(), DbError> {
        if self.contains_series(key)? {
            return Ok(());
        }
        let labels = opts.labels.clone();
        match self.create_series(key, opts) {
            Ok(()) => self.apply_compaction_policies(key, &labels),
            // lost a creation race; the other writer applied the policies
            Err(DbError::KeyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn apply_compaction_policies(&self, key: &str, labels: &Labels) -> Result<(), DbError> {
        for policy in &self.config.compaction_policies {
            let dest = policy.dest_key_for(key);
            if self.contains_series(&dest)? {
                continue;
            }
            let opts = SeriesOptions::new()
                .retention(policy.retention)
                .labels(labels.clone());
            match self.create_series(&dest, opts) {
                Ok(()) => {}
                Err(DbError::KeyExists(_)) => continue,
                Err(e) => return Err(e),
            }
            self.create_rule(key, &dest, policy.aggregation, policy.bucket_duration)?;
        }
        Ok(())
    }

    // --- reads ---

    /// Last sample of a series, if it has any.
    pub fn get(&self, key: &str) -> Result<Option<Sample>, DbError> {
        Ok(self.require(key)?.series.read()?.last_sample())
    }

    pub fn range(&self, key: &str, args: &RangeArgs) -> Result<Vec<Sample>, DbError> {
        let handle = self.require(key)?;
        let s = handle.series.read()?;
        range_series(&s, args)
    }

    /// [`Engine::range`] newest-first.
    pub fn rev_range(&self, key: &str, args: &RangeArgs) -> Result<Vec<Sample>, DbError> {
        let args = RangeArgs {
            reverse: true,
            ..args.clone()
        };
        self.range(key, &args)
    }

    /// Resolves `filters` and opens each key in order. Keys removed between resolution and
    /// opening are skipped and the scan resumes after them on a fresh resolution.
    fn matching_handles(&self, filters: &[QueryPredicate]) -> Result<Vec<SeriesHandle>, DbError> {
        let mut cursor = KeyCursor::new(self.index.resolve(filters)?);
        let mut handles = Vec::new();
        while let Some(key) = cursor.next() {
            match self.handle(&key)? {
                Some(h) => handles.push(h),
                None => {
                    self.emit(DbEvent::SeriesVanishedDuringScan { key });
                    cursor.reseed(self.index.resolve(filters)?);
                }
            }
        }
        Ok(handles)
    }

    /// Multi-series range query.
    ///
    /// # Errors
    /// `NoMatchers` unless a positive equality or list predicate is given; range validation
    /// errors from [`RangeArgs::validate`].
    pub fn mrange(&self, args: &MRangeArgs) -> Result<Vec<SeriesResult>, DbError> {
        let started = Instant::now();
        args.range.validate()?;
        let handles = self.matching_handles(&args.filters)?;
        let locks: Vec<&RwLock<Series>> = handles.iter().map(|h| &h.series).collect();
        let out = execute_mrange(&locks, args);
        db_metrics::record_mrange(started.elapsed());
        out
    }

    /// Last sample of every matching series (empty `samples` for empty series).
    pub fn mget(
        &self,
        filters: &[QueryPredicate],
        with_labels: bool,
    ) -> Result<Vec<SeriesResult>, DbError> {
        self.matching_handles(filters)?
            .iter()
            .map(|h| -> Result<SeriesResult, DbError> {
                let s = h.series.read()?;
                Ok(SeriesResult {
                    key: s.key().to_string(),
                    labels: if with_labels {
                        s.labels().clone()
                    } else {
                        Labels::new()
                    },
                    samples: s.last_sample().into_iter().collect(),
                })
            })
            .collect()
    }

    /// Keys matching `filters`, sorted.
    pub fn query_index(&self, filters: &[QueryPredicate]) -> Result<Vec<String>, DbError> {
        Ok(self.index.resolve(filters)?.into_iter().collect())
    }

    pub fn info(&self, key: &str, debug: bool) -> Result<SeriesInfo, DbError> {
        Ok(self.require(key)?.series.read()?.info(debug))
    }

    // --- rules ---

    fn lock_pair<T>(
        &self,
        src: &SeriesHandle,
        src_key: &str,
        dest: &SeriesHandle,
        dest_key: &str,
        f: impl FnOnce(&mut Series, &mut Series) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        if src_key < dest_key {
            let mut s = src.series.write()?;
            let mut d = dest.series.write()?;
            f(&mut *s, &mut *d)
        } else {
            let mut d = dest.series.write()?;
            let mut s = src.series.write()?;
            f(&mut *s, &mut *d)
        }
    }

    /// Creates a compaction rule from `src` into `dest`.
    ///
    /// # Errors
    /// `SameSourceAndDestination`, `SeriesNotFound`, `SourceIsDestination` (src is already fed
    /// by another series), `DestinationHasSource`, or `InvalidArgument` for a zero bucket.
    pub fn create_rule(
        &self,
        src: &str,
        dest: &str,
        aggregation: AggregationType,
        bucket_duration: u64,
    ) -> Result<(), DbError> {
        if src == dest {
            return Err(DbError::SameSourceAndDestination(src.to_string()));
        }
        let rule = CompactionRule::new(dest, aggregation, bucket_duration)?;
        let src_h = self.require(src)?;
        let dest_h = self.require(dest)?;
        self.lock_pair(&src_h, src, &dest_h, dest, |s, d| {
            if s.source_key().is_some() {
                return Err(DbError::SourceIsDestination(src.to_string()));
            }
            if d.source_key().is_some() {
                return Err(DbError::DestinationHasSource(dest.to_string()));
            }
            s.add_rule(rule);
            d.set_source_key(Some(src.to_string()));
            Ok(())
        })?;
        self.emit(DbEvent::RuleCreated {
            source_key: src.to_string(),
            dest_key: dest.to_string(),
        });
        Ok(())
    }

    /// Deletes the rule `src -> dest`. Both sides are checked before either is changed.
    pub fn delete_rule(&self, src: &str, dest: &str) -> Result<(), DbError> {
        let src_h = self.require(src)?;
        let dest_h = self.require(dest)?;
        self.lock_pair(&src_h, src, &dest_h, dest, |s, d| {
            if !s.has_rule_to(dest) || d.source_key() != Some(src) {
                return Err(DbError::RuleNotFound {
                    source_key: src.to_string(),
                    dest_key: dest.to_string(),
                });
            }
            s.remove_rule(dest);
            d.set_source_key(None);
            Ok(())
        })?;
        self.emit(DbEvent::RuleDeleted {
            source_key: src.to_string(),
            dest_key: dest.to_string(),
        });
        Ok(())
    }

    // --- persistence ---

    /// Serializes one series into an opaque, checksummed blob.
    pub fn save_series(&self, key: &str) -> Result<Vec<u8>, DbError> {
        let handle = self.require(key)?;
        let s = handle.series.read()?;
        encode_series(&s)
    }

    /// Inserts a series decoded from [`Engine::save_series`] output. Returns its key.
    pub fn load_series(&self, bytes: &[u8]) -> Result<String, DbError> {
        let series = decode_series(bytes)?;
        let key = series.key().to_string();
        self.insert_series(series)?;
        Ok(key)
    }

    /// Writes a snapshot of every series and prunes old snapshot files.
    ///
    /// # Errors
    /// `ConfigError` when snapshots are disabled; I/O and serialization errors otherwise.
    pub fn snapshot(&self) -> Result<PathBuf, DbError> {
        let snapshotter = self
            .snapshotter
            .as_ref()
            .ok_or_else(|| DbError::ConfigError("snapshots are disabled".to_string()))?;
        let started = Instant::now();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        let res = self.write_snapshot(snapshotter, timestamp);
        match res {
            Ok((path, size)) => {
                db_metrics::record_snapshot(started.elapsed(), size);
                self.emit(DbEvent::SnapshotCreated {
                    path: path.clone(),
                    timestamp,
                });
                Ok(path)
            }
            Err(e) => {
                self.emit(DbEvent::SnapshotFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn write_snapshot(
        &self,
        snapshotter: &Snapshotter,
        timestamp: u64,
    ) -> Result<(PathBuf, u64), DbError> {
        let mut handles: Vec<(String, SeriesHandle)> = self
            .series
            .read()?
            .iter()
            .map(|(k, h)| (k.clone(), h.clone()))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        let guards = handles
            .iter()
            .map(|(_, h)| h.series.read())
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&Series> = guards.iter().map(|g| &**g).collect();
        let path = snapshotter.create_snapshot(&refs, timestamp)?;
        drop(refs);
        drop(guards);
        let size = std::fs::metadata(&path)?.len();
        snapshotter.prune(self.config.snapshots_to_keep)?;
        Ok((path, size))
    }

    /// Replaces the whole key space with the newest snapshot. Returns the number of series
    /// restored (0 when there is no snapshot, in which case nothing changes).
    pub fn restore_latest_snapshot(&self) -> Result<usize, DbError> {
        let snapshotter = self
            .snapshotter
            .as_ref()
            .ok_or_else(|| DbError::ConfigError("snapshots are disabled".to_string()))?;
        let Some((path, series)) = snapshotter.load_latest_snapshot()? else {
            return Ok(0);
        };
        let count = series.len();
        {
            let mut map = self.series.write()?;
            map.clear();
            self.index.clear()?;
            for s in series {
                let key = s.key().to_string();
                self.index.index(&key, s.labels())?;
                map.insert(key, SeriesSlot::new(s));
            }
            db_metrics::set_series_count(map.len());
        }
        self.emit(DbEvent::SnapshotRestored {
            path,
            series: count,
        });
        Ok(count)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::labels_from;
    use std::sync::Condvar;

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<DbEvent>>);

    impl DbEventListener for Recorder {
        fn on_event(&self, event: DbEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn engine_with_events() -> (Engine, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());
        let cfg = EngineConfig {
            event_listener: rec.clone(),
            ..EngineConfig::default()
        };
        (Engine::with_config(cfg).unwrap(), rec)
    }

    fn p(s: &str) -> QueryPredicate {
        s.parse().unwrap()
    }

    #[test]
    fn create_twice_is_key_exists() {
        let e = Engine::new();
        e.create_series("a", SeriesOptions::new()).unwrap();
        assert!(matches!(
            e.create_series("a", SeriesOptions::new()),
            Err(DbError::KeyExists(_))
        ));
        assert!(matches!(e.create_series("", SeriesOptions::new()), Err(DbError::InvalidArgument(_))));
    }

    #[test]
    fn missing_destination_is_skipped_with_event() {
        let (e, rec) = engine_with_events();
        e.create_series("src", SeriesOptions::new()).unwrap();
        e.create_series("dst", SeriesOptions::new()).unwrap();
        e.create_rule("src", "dst", AggregationType::Sum, 10).unwrap();
        e.add("src", 1, 1.0).unwrap();

        // drop the destination without going through the engine's rule cleanup
        e.series.write().unwrap().remove("dst");
        e.add("src", 11, 1.0).unwrap();
        let events = rec.0.lock().unwrap();
        assert!(events.contains(&DbEvent::CompactionDestinationMissing {
            source_key: "src".into(),
            dest_key: "dst".into()
        }));
    }

    #[test]
    fn failed_flush_does_not_fail_source_write() {
        let (e, rec) = engine_with_events();
        e.create_series("src", SeriesOptions::new()).unwrap();
        e.create_series("dst", SeriesOptions::new()).unwrap();
        e.create_rule("src", "dst", AggregationType::Last, 10).unwrap();
        // a sample newer than any bucket start makes the flush append fail
        e.add("dst", 1_000, 0.0).unwrap();
        e.add("src", 1, 1.0).unwrap();
        assert!(e.add("src", 11, 2.0).is_ok());
        assert!(rec
            .0
            .lock()
            .unwrap()
            .iter()
            .any(|ev| matches!(ev, DbEvent::CompactionFlushFailed { .. })));
    }

    #[test]
    fn incr_by_accumulates_and_rejects_older_timestamps() {
        let e = Engine::new();
        e.incr_by("c", 5.0, Some(100), SeriesOptions::new()).unwrap();
        e.incr_by("c", 2.0, Some(100), SeriesOptions::new()).unwrap();
        assert_eq!(e.get("c").unwrap(), Some(Sample::new(100, 7.0)));
        e.decr_by("c", 10.0, Some(200), SeriesOptions::new()).unwrap();
        assert_eq!(e.get("c").unwrap(), Some(Sample::new(200, -3.0)));
        assert!(matches!(
            e.incr_by("c", 1.0, Some(150), SeriesOptions::new()),
            Err(DbError::TimestampNotIncreasing { .. })
        ));
    }

    #[test]
    fn alter_reindexes_labels() {
        let e = Engine::new();
        e.create_series("a", SeriesOptions::new().label("room", "x"))
            .unwrap();
        e.alter_series(
            "a",
            AlterOptions {
                labels: Some(labels_from(&[("room", "y")])),
                ..AlterOptions::default()
            },
        )
        .unwrap();
        assert!(e.query_index(&[p("room=x")]).unwrap().is_empty());
        assert_eq!(e.query_index(&[p("room=y")]).unwrap(), ["a"]);
    }

    #[test]
    fn mget_reports_last_samples() {
        let e = Engine::new();
        e.create_series("a", SeriesOptions::new().label("t", "1")).unwrap();
        e.create_series("b", SeriesOptions::new().label("t", "1")).unwrap();
        e.add("a", 5, 1.5).unwrap();
        let out = e.mget(&[p("t=1")], true).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].samples, vec![Sample::new(5, 1.5)]);
        assert!(out[1].samples.is_empty());
        assert_eq!(out[0].labels.get("t").map(String::as_str), Some("1"));
    }

    #[test]
    fn snapshot_requires_configuration() {
        let e = Engine::new();
        assert!(matches!(e.snapshot(), Err(DbError::ConfigError(_))));
    }

    /// Stalls the first `ChunksTrimmed` event of `src` until released.
    #[derive(Debug, Default)]
    struct TrimGate {
        /// (stalled, released)
        state: Mutex<(bool, bool)>,
        cv: Condvar,
    }

    impl TrimGate {
        fn wait_stalled(&self) {
            let mut g = self.state.lock().unwrap();
            while !g.0 {
                g = self.cv.wait(g).unwrap();
            }
        }

        fn release(&self) {
            self.state.lock().unwrap().1 = true;
            self.cv.notify_all();
        }
    }

    impl DbEventListener for TrimGate {
        fn on_event(&self, event: DbEvent) {
            if !matches!(&event, DbEvent::ChunksTrimmed { key, .. } if key == "src") {
                return;
            }
            let mut g = self.state.lock().unwrap();
            if g.0 {
                return;
            }
            g.0 = true;
            self.cv.notify_all();
            while !g.1 {
                g = self.cv.wait(g).unwrap();
            }
        }
    }

    #[test]
    fn flushes_reach_destination_in_bucket_order() {
        let gate = Arc::new(TrimGate::default());
        let e = Engine::with_config(EngineConfig {
            event_listener: gate.clone(),
            ..EngineConfig::default()
        })
        .unwrap();
        // 48 bytes hold three uncompressed samples
        e.create_series(
            "src",
            SeriesOptions::new()
                .encoding(ChunkEncoding::Uncompressed)
                .chunk_size(48)
                .retention(5),
        )
        .unwrap();
        e.create_series("dst", SeriesOptions::new()).unwrap();
        e.create_rule("src", "dst", AggregationType::Sum, 10).unwrap();
        for (ts, v) in [(0u64, 1.0), (1, 2.0), (2, 0.0)] {
            e.add("src", ts, v).unwrap();
        }

        std::thread::scope(|scope| {
            // closes bucket 0 and trims the first chunk, then stalls before delivery
            let first = scope.spawn(|| e.add("src", 10, 1.0));
            gate.wait_stalled();
            // closes bucket 10 while bucket 0 is still undelivered
            let second = scope.spawn(|| e.add("src", 20, 5.0));
            std::thread::sleep(Duration::from_millis(50));
            gate.release();
            first.join().unwrap().unwrap();
            second.join().unwrap().unwrap();
        });

        assert_eq!(
            e.range("dst", &RangeArgs::all()).unwrap(),
            vec![Sample::new(0, 3.0), Sample::new(10, 1.0)]
        );
    }

    #[test]
    fn delete_racing_recreate_keeps_new_postings() {
        let e = Engine::new();
        e.create_series("a", SeriesOptions::new().label("region", "eu"))
            .unwrap();
        let old = e.handle("a").unwrap().unwrap();
        let guard = old.series.write().unwrap();

        std::thread::scope(|scope| {
            let deleter = scope.spawn(|| e.delete_series("a"));
            let creator = scope.spawn(|| loop {
                match e.create_series("a", SeriesOptions::new().label("region", "us")) {
                    Err(DbError::KeyExists(_)) => std::thread::sleep(Duration::from_millis(1)),
                    other => break other,
                }
            });
            std::thread::sleep(Duration::from_millis(50));
            drop(guard);
            deleter.join().unwrap().unwrap();
            creator.join().unwrap().unwrap();
        });

        assert_eq!(
            e.info("a", false).unwrap().labels,
            labels_from(&[("region", "us")])
        );
        assert_eq!(e.query_index(&[p("region=us"), p("region!=")]).unwrap(), ["a"]);
        assert!(e.query_index(&[p("region=eu")]).unwrap().is_empty());
    }

    #[test]
    fn alter_racing_delete_leaves_no_stale_postings() {
        let e = Engine::new();
        e.create_series("a", SeriesOptions::new().label("room", "x"))
            .unwrap();
        let h = e.handle("a").unwrap().unwrap();
        let guard = h.series.write().unwrap();

        std::thread::scope(|scope| {
            let alter = scope.spawn(|| {
                e.alter_series(
                    "a",
                    AlterOptions {
                        labels: Some(labels_from(&[("room", "y")])),
                        ..AlterOptions::default()
                    },
                )
            });
            std::thread::sleep(Duration::from_millis(20));
            let deleter = scope.spawn(|| e.delete_series("a"));
            std::thread::sleep(Duration::from_millis(20));
            drop(guard);
            // either order is fine; the alter fails with SeriesNotFound if the delete won
            let _ = alter.join().unwrap();
            deleter.join().unwrap().unwrap();
        });

        assert!(!e.contains_series("a").unwrap());
        assert!(e.query_index(&[p("room=x")]).unwrap().is_empty());
        assert!(e.query_index(&[p("room=y")]).unwrap().is_empty());
        assert!(e.index.is_empty().unwrap());
    }
}
