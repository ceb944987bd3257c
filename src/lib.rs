pub mod agent;
pub mod cache;
pub mod clock;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod merge;
pub mod models;
pub mod poller;
pub mod service;
pub mod settings;
mod utils;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::time::MissedTickBehavior;

use agent::LocalAgent;
use clock::{Clock, SystemClock};
use db::Database;
use models::{SessionId, StreamId};
use service::QueryService;
use settings::SettingsStore;

/// Stream id under which the host machine is registered.
pub const LOCAL_STREAM: StreamId = 1;

const DEFAULT_SETTINGS_FILE: &str = "profrelay.json";
const SUMMARY_INTERVAL: Duration = Duration::from_secs(1);

/// Close sessions an earlier run left open. Their streams are gone, so
/// nothing else would ever end them.
async fn recover_open_sessions(db: &Database, now: i64) -> Result<()> {
    for session in db.list_sessions().await? {
        if session.is_open() {
            warn!(
                "Recovered open session {} for pid {}; closing it",
                session.session_id, session.pid
            );
            db.close_session(session.session_id, now).await?;
        }
    }
    Ok(())
}

async fn log_memory_summary(service: &QueryService, session_id: SessionId, now: i64) {
    let window_start = now.saturating_sub(i64::try_from(SUMMARY_INTERVAL.as_nanos()).unwrap_or(0));
    let samples = service
        .get_memory_samples(session_id, window_start, now.saturating_add(1))
        .await;
    match samples.records.last() {
        Some(sample) => info!(
            "session {session_id}: resident {:.1} MiB, virtual {:.1} MiB ({} sample(s) in the last second)",
            sample.resident_bytes as f64 / 1024.0 / 1024.0,
            sample.virtual_bytes as f64 / 1024.0 / 1024.0,
            samples.records.len()
        ),
        None => info!("session {session_id}: no samples in the last second"),
    }
}

async fn relay(settings_path: PathBuf, pid: i32) -> Result<()> {
    let settings = SettingsStore::new(settings_path)?;
    let config = settings.config();

    let database = match &config.database_path {
        Some(path) => Database::new(path.clone())?,
        None => Database::in_memory()?,
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    recover_open_sessions(&database, clock.now_ns()).await?;

    let service = QueryService::new(database, Arc::clone(&clock), config);
    let host = sysinfo::System::host_name().unwrap_or_else(|| "localhost".into());
    service
        .connect_stream(LOCAL_STREAM, &host, Arc::new(LocalAgent::new()))
        .await?;

    let session = service
        .start_profiling_app(LOCAL_STREAM, pid)
        .await
        .with_context(|| format!("failed to start profiling pid {pid}"))?;
    service.start_monitoring(LOCAL_STREAM).await?;
    info!("Profiling pid {pid} in session {}; Ctrl-C to stop", session.session_id);

    let mut ticker = tokio::time::interval(SUMMARY_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                log_memory_summary(&service, session.session_id, clock.now_ns()).await;
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!("Failed to listen for Ctrl-C: {err}");
                }
                break;
            }
        }
    }

    service.stop_monitoring(LOCAL_STREAM).await?;
    service.stop_profiling_app(LOCAL_STREAM, pid).await?;
    service.shutdown().await;
    info!("profrelay stopped");
    Ok(())
}

/// Entry point of the `profrelay` binary: `profrelay [settings.json] [pid]`.
pub fn run() -> Result<()> {
    let default_level = if std::env::var_os("PROFRELAY_DEBUG").is_some() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    // RUST_LOG, when set, overrides the default level.
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();

    info!("profrelay starting up...");

    let mut args = std::env::args().skip(1);
    let settings_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));
    let pid = match args.next() {
        Some(raw) => raw
            .parse::<i32>()
            .with_context(|| format!("invalid pid {raw}"))?,
        None => i32::try_from(std::process::id()).context("own pid out of range")?,
    };

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(relay(settings_path, pid))
}
