use std::path::PathBuf;
use std::sync::Arc;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;
use std::time::Duration;

/// Structured, in-process event hook for observability.
///
/// The engine is a library and never prints. Callers provide an implementation that forwards
/// these events to `tracing`, metrics, or custom sinks ([`TracingEventListener`] does the
/// former).
pub trait DbEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: DbEvent);
}

/// Structured events emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum DbEvent {
    SeriesCreated { key: String },
    SeriesDeleted { key: String },

    RuleCreated { source_key: String, dest_key: String },
    RuleDeleted { source_key: String, dest_key: String },

    ChunksTrimmed { key: String, chunks: usize, samples: u64 },

    /// A closed bucket could not be delivered because its destination no longer exists.
    CompactionDestinationMissing { source_key: String, dest_key: String },
    CompactionFlushFailed { dest_key: String, error: String },

    /// A key resolved by the label index disappeared before it could be read.
    SeriesVanishedDuringScan { key: String },

    SnapshotCreated { path: PathBuf, timestamp: u64 },
    SnapshotFailed { error: String },
    SnapshotRestored { path: PathBuf, series: usize },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl DbEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: DbEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn DbEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing` under the `tscore` target.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl DbEventListener for TracingEventListener {
    fn on_event(&self, event: DbEvent) {
        match event {
            DbEvent::SeriesCreated { key } => tracing::debug!(target: "tscore", %key, "series created"),
            DbEvent::SeriesDeleted { key } => tracing::debug!(target: "tscore", %key, "series deleted"),
            DbEvent::RuleCreated { source_key, dest_key } => {
                tracing::info!(target: "tscore", %source_key, %dest_key, "compaction rule created")
            }
            DbEvent::RuleDeleted { source_key, dest_key } => {
                tracing::info!(target: "tscore", %source_key, %dest_key, "compaction rule deleted")
            }
            DbEvent::ChunksTrimmed { key, chunks, samples } => {
                tracing::debug!(target: "tscore", %key, chunks, samples, "retention trimmed chunks")
            }
            DbEvent::CompactionDestinationMissing { source_key, dest_key } => tracing::warn!(
                target: "tscore",
                %source_key,
                %dest_key,
                "compaction destination missing; bucket dropped"
            ),
            DbEvent::CompactionFlushFailed { dest_key, error } => {
                tracing::warn!(target: "tscore", %dest_key, %error, "compaction flush failed")
            }
            DbEvent::SeriesVanishedDuringScan { key } => {
                tracing::debug!(target: "tscore", %key, "series vanished during scan")
            }
            DbEvent::SnapshotCreated { path, timestamp } => tracing::info!(
                target: "tscore",
                path = %path.display(),
                timestamp,
                "snapshot created"
            ),
            DbEvent::SnapshotFailed { error } => {
                tracing::warn!(target: "tscore", %error, "snapshot failed")
            }
            DbEvent::SnapshotRestored { path, series } => tracing::info!(
                target: "tscore",
                path = %path.display(),
                series,
                "snapshot restored"
            ),
        }
    }
}

pub fn tracing_event_listener() -> Arc<dyn DbEventListener> {
    Arc::new(TracingEventListener)
}

/// Metrics instrumentation and in-process scraping.
///
/// ## Key properties
/// - Library-safe: emitting metrics is a no-op until a recorder is installed.
/// - Serverless scraping: callers render Prometheus exposition text in-process.
pub mod db_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.
    // Histograms are exposed as `<name>_bucket`, `<name>_sum`, `<name>_count`.

    pub const SAMPLES_APPENDED: &str = "tscore_samples_appended";
    pub const SAMPLES_UPSERTED: &str = "tscore_samples_upserted";
    pub const WRITES_REJECTED: &str = "tscore_writes_rejected";
    pub const COMPACTION_FLUSHES: &str = "tscore_compaction_flushes";
    pub const SERIES: &str = "tscore_series";

    pub const MRANGE_DURATION_SECONDS: &str = "tscore_mrange_duration_seconds";

    pub const SNAPSHOT_DURATION_SECONDS: &str = "tscore_snapshot_duration_seconds";
    pub const SNAPSHOT_SIZE_BYTES: &str = "tscore_snapshot_size_bytes";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts an upkeep thread
        /// that keeps histogram state bounded.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("tscore-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_appended(samples: u64) {
        if samples > 0 {
            ::metrics::counter!(SAMPLES_APPENDED).increment(samples);
        }
    }

    #[inline]
    pub fn record_upserted() {
        ::metrics::counter!(SAMPLES_UPSERTED).increment(1);
    }

    /// `kind` is the [`crate::error::ErrorKind`] of the rejection, lowercased.
    #[inline]
    pub fn record_rejected(kind: &'static str) {
        ::metrics::counter!(WRITES_REJECTED, "kind" => kind).increment(1);
    }

    #[inline]
    pub fn record_compaction_flushes(n: u64) {
        if n > 0 {
            ::metrics::counter!(COMPACTION_FLUSHES).increment(n);
        }
    }

    #[inline]
    pub fn set_series_count(n: usize) {
        ::metrics::gauge!(SERIES).set(n as f64);
    }

    #[inline]
    pub fn record_mrange(duration: Duration) {
        ::metrics::histogram!(MRANGE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_snapshot(duration: Duration, size_bytes: u64) {
        ::metrics::histogram!(SNAPSHOT_DURATION_SECONDS).record(duration.as_secs_f64());
        ::metrics::gauge!(SNAPSHOT_SIZE_BYTES).set(size_bytes as f64);
    }

    fn describe_all() {
        describe_counter!(
            SAMPLES_APPENDED,
            Unit::Count,
            "Samples appended to series (including compaction results)."
        );
        describe_counter!(
            SAMPLES_UPSERTED,
            Unit::Count,
            "Samples written at or before a series' last timestamp."
        );
        describe_counter!(
            WRITES_REJECTED,
            Unit::Count,
            "Writes rejected, labelled by error kind."
        );
        describe_counter!(
            COMPACTION_FLUSHES,
            Unit::Count,
            "Closed compaction buckets delivered to destination series."
        );

        describe_histogram!(
            MRANGE_DURATION_SECONDS,
            Unit::Seconds,
            "Latency of multi-series range queries."
        );
        describe_histogram!(
            SNAPSHOT_DURATION_SECONDS,
            Unit::Seconds,
            "Time to create and durably install a snapshot."
        );

        describe_gauge!(SERIES, Unit::Count, "Number of series in the engine.");
        describe_gauge!(
            SNAPSHOT_SIZE_BYTES,
            Unit::Bytes,
            "Size of the most recently created snapshot file."
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Collect(Mutex<Vec<DbEvent>>);

    impl DbEventListener for Collect {
        fn on_event(&self, event: DbEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn listeners_are_object_safe() {
        let c = Arc::new(Collect::default());
        let l: Arc<dyn DbEventListener> = c.clone();
        l.on_event(DbEvent::SeriesCreated { key: "a".into() });
        noop_event_listener().on_event(DbEvent::SeriesDeleted { key: "a".into() });
        tracing_event_listener().on_event(DbEvent::SnapshotFailed { error: "x".into() });
        assert_eq!(
            c.0.lock().unwrap().as_slice(),
            &[DbEvent::SeriesCreated { key: "a".into() }]
        );
    }
}
