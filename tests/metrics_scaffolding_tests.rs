#![cfg(feature = "prometheus")]

use std::sync::OnceLock;
use std::time::Duration;

use tempfile::TempDir;
use tscore::telemetry::db_metrics::{self, InProcessPrometheus};
use tscore::{
    AggregationType, ChunkEncoding, Engine, EngineConfig, MRangeArgs, RangeArgs, SeriesOptions,
};

fn install_prometheus_once() -> &'static InProcessPrometheus {
    static PROM: OnceLock<InProcessPrometheus> = OnceLock::new();
    PROM.get_or_init(|| {
        InProcessPrometheus::install(Duration::from_millis(25))
            .expect("failed to install in-process prometheus recorder")
    })
}

fn parse_sample(rendered: &str, metric: &str) -> Option<f64> {
    for line in rendered.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let key = parts.next()?;
        let val = parts.next()?;
        // Support exact match and label form: `name{...} value`.
        if key == metric
            || key.starts_with(metric) && key.as_bytes().get(metric.len()).copied() == Some(b'{')
        {
            if let Ok(v) = val.parse::<f64>() {
                return Some(v);
            }
        }
    }
    None
}

fn parse_counter(rendered: &str, base_name: &str) -> f64 {
    parse_sample(rendered, &format!("{}_total", base_name))
        .or_else(|| parse_sample(rendered, base_name))
        .unwrap_or(0.0)
}

fn extract_tscore_lines(rendered: &str) -> String {
    rendered
        .lines()
        .filter(|l| l.contains("tscore_"))
        .take(200)
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn emits_write_compaction_query_and_snapshot_metrics() {
    let prom = install_prometheus_once();

    let before = prom.render();
    let before_appended = parse_counter(&before, db_metrics::SAMPLES_APPENDED);
    let before_upserted = parse_counter(&before, db_metrics::SAMPLES_UPSERTED);
    let before_rejected = parse_counter(&before, db_metrics::WRITES_REJECTED);
    let before_flushes = parse_counter(&before, db_metrics::COMPACTION_FLUSHES);
    let before_mrange =
        parse_sample(&before, "tscore_mrange_duration_seconds_count").unwrap_or(0.0);
    let before_snapshot =
        parse_sample(&before, "tscore_snapshot_duration_seconds_count").unwrap_or(0.0);

    let dir = TempDir::new().expect("tempdir");
    let db = Engine::with_config(EngineConfig {
        data_dir: dir.path().to_path_buf(),
        enable_snapshots: true,
        ..EngineConfig::default()
    })
    .expect("engine init");

    db.create_series(
        "m",
        SeriesOptions::new()
            .label("host", "test")
            .encoding(ChunkEncoding::Uncompressed),
    )
    .expect("create");
    db.create_series("m_avg", SeriesOptions::new()).expect("create");
    db.create_rule("m", "m_avg", AggregationType::Avg, 10)
        .expect("rule");

    let points = 10u64;
    for i in 0..points {
        db.add("m", i * 5, (i as f64) * 1.25).expect("add");
    }
    db.add("m", 0, 1.0).expect_err("block policy rejects duplicate");
    db.add_with_policy("m", 5, 2.0, tscore::DuplicatePolicy::Last)
        .expect("upsert");

    db.mrange(&MRangeArgs::new(
        RangeArgs::all(),
        vec!["host=test".parse().expect("predicate")],
    ))
    .expect("mrange");
    db.snapshot().expect("snapshot");

    // Give the exporter time to run upkeep at least once.
    std::thread::sleep(Duration::from_millis(60));

    let after = prom.render();
    let after_appended = parse_counter(&after, db_metrics::SAMPLES_APPENDED);
    let after_upserted = parse_counter(&after, db_metrics::SAMPLES_UPSERTED);
    let after_rejected = parse_counter(&after, db_metrics::WRITES_REJECTED);
    let after_flushes = parse_counter(&after, db_metrics::COMPACTION_FLUSHES);
    let after_mrange = parse_sample(&after, "tscore_mrange_duration_seconds_count").unwrap_or(0.0);
    let after_snapshot =
        parse_sample(&after, "tscore_snapshot_duration_seconds_count").unwrap_or(0.0);
    let snapshot_size = parse_sample(&after, db_metrics::SNAPSHOT_SIZE_BYTES).unwrap_or(0.0);

    assert!(
        after_appended >= before_appended + points as f64,
        "expected appended counter to increase by at least {}, before={}, after={}\n\nRendered tscore_* metrics:\n{}",
        points,
        before_appended,
        after_appended,
        extract_tscore_lines(&after)
    );
    assert!(
        after_upserted >= before_upserted + 1.0,
        "expected upserted counter to increase, before={}, after={}",
        before_upserted,
        after_upserted
    );
    assert!(
        after_rejected >= before_rejected + 1.0,
        "expected rejected counter to increase, before={}, after={}",
        before_rejected,
        after_rejected
    );
    // buckets [0,10) .. [30,40) close while appending up to t=45
    assert!(
        after_flushes >= before_flushes + 4.0,
        "expected compaction flushes to increase by at least 4, before={}, after={}",
        before_flushes,
        after_flushes
    );
    assert!(
        after_mrange >= before_mrange + 1.0,
        "expected mrange histogram count to increase, before={}, after={}",
        before_mrange,
        after_mrange
    );
    assert!(
        after_snapshot >= before_snapshot + 1.0,
        "expected snapshot duration histogram count to increase, before={}, after={}",
        before_snapshot,
        after_snapshot
    );
    assert!(snapshot_size > 0.0, "expected snapshot size gauge to be > 0");
}
