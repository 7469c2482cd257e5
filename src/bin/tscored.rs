//! Snapshot keeper for a tscore data directory.
//!
//! The engine is a library and this binary exposes no ingress: it does not accept writes or
//! queries. It validates a layered configuration (defaults, config file, `TSCORE_*` environment
//! variables, CLI flags), restores the newest snapshot, rewrites and rotates snapshots on an
//! interval, and writes a final snapshot on SIGINT/SIGTERM. `--validate-config` checks a
//! deployment's settings without touching the data directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tscore::config::load_engine_config;
use tscore::telemetry::tracing_event_listener;
use tscore::{Engine, EngineConfig};

/// tscore snapshot keeper.
#[derive(Parser, Debug)]
#[command(
    name = "tscored",
    version,
    about = "Snapshot keeper for a tscore data directory; accepts no writes or queries"
)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `tscored.toml` is loaded when it exists.
    #[arg(long, env = "TSCORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override data directory (snapshots live under `<data_dir>/snapshots`).
    #[arg(long, env = "TSCORE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the effective values, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// Override the interval between automatic snapshots.
    #[arg(long)]
    pub snapshot_interval_secs: Option<u64>,
}

/// Merged config; CLI overrides file/env.
fn load_daemon_config(cli: &Cli) -> Result<EngineConfig, String> {
    let mut cfg =
        load_engine_config(cli.config.as_deref(), cli.no_config).map_err(|e| e.to_string())?;

    if let Some(ref d) = cli.data_dir {
        cfg.data_dir = d.clone();
    }
    if let Some(secs) = cli.snapshot_interval_secs {
        if secs == 0 {
            return Err("snapshot_interval_secs must be greater than zero".to_string());
        }
        cfg.snapshot_interval = Duration::from_secs(secs);
    }
    // The daemon's only durability is snapshots.
    cfg.enable_snapshots = true;
    cfg.event_listener = tracing_event_listener();
    Ok(cfg)
}

fn print_effective_config(cfg: &EngineConfig) {
    println!("data_dir={}", cfg.data_dir.display());
    println!("retention_ms={}", cfg.retention);
    println!("chunk_size_bytes={}", cfg.chunk_size_bytes);
    println!("encoding={}", cfg.encoding);
    println!("duplicate_policy={}", cfg.duplicate_policy);
    println!("compressed_upsert={}", cfg.compressed_upsert);
    let policies: Vec<String> = cfg
        .compaction_policies
        .iter()
        .map(ToString::to_string)
        .collect();
    println!("compaction_policy={}", policies.join(";"));
    println!("snapshot_interval_secs={}", cfg.snapshot_interval.as_secs());
    println!("snapshots_to_keep={}", cfg.snapshots_to_keep);
}

/// Ensures `data_dir` exists and is writable.
fn check_data_dir_writable(data_dir: &std::path::Path) -> Result<(), String> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| format!("data_dir {} cannot be created: {}", data_dir.display(), e))?;
    let marker = data_dir.join(".tscore_write_check");
    std::fs::write(&marker, b"")
        .map_err(|e| format!("data_dir {} not writable: {}", data_dir.display(), e))?;
    let _ = std::fs::remove_file(marker);
    Ok(())
}

/// Completes when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn run(engine: Arc<Engine>) {
    let mut ticker = tokio::time::interval(engine.config().snapshot_interval);
    // the first tick fires immediately
    ticker.tick().await;
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let engine = Arc::clone(&engine);
                // failures are reported through the event listener
                let _ = tokio::task::spawn_blocking(move || engine.snapshot()).await;
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    tracing::info!("writing final snapshot");
    let engine_for_snapshot = Arc::clone(&engine);
    match tokio::task::spawn_blocking(move || engine_for_snapshot.snapshot()).await {
        Ok(Ok(path)) => tracing::info!(path = %path.display(), "shutdown complete"),
        Ok(Err(e)) => tracing::error!(error = %e, "final snapshot failed"),
        Err(e) => tracing::error!(error = %e, "final snapshot task panicked"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_daemon_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        print_effective_config(&cfg);
        return Ok(());
    }

    check_data_dir_writable(&cfg.data_dir).map_err(|e| {
        eprintln!("startup check failed: {}", e);
        e
    })?;

    let data_dir = cfg.data_dir.clone();
    let engine = Engine::with_config(cfg).map_err(|e| {
        eprintln!("failed to open engine: {}", e);
        e
    })?;
    let restored = engine.restore_latest_snapshot().map_err(|e| {
        eprintln!("snapshot restore failed: {}", e);
        e
    })?;
    tracing::info!(
        data_dir = %data_dir.display(),
        series = restored,
        "tscored running; press Ctrl+C or send SIGTERM to stop"
    );

    run(Arc::new(engine)).await;
    Ok(())
}
