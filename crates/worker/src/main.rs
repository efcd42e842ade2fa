//! Background worker: replays deferred webhook events and prunes the
//! processed-event ledger.

mod replay;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use veridea_billing::store::{BillingStore, PgBillingStore};
use veridea_shared::db;

use replay::{ReplayConfig, ReplayWorker};

struct WorkerConfig {
    database_url: String,
    interval: StdDuration,
    replay: ReplayConfig,
    retention: Duration,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let interval_secs = env_u64("REPLAY_INTERVAL_SECS", 60)?;
        let cooldown_secs = env_u64("REPLAY_COOLDOWN_SECS", 300)?;
        let max_attempts = env_positive_i32("REPLAY_MAX_ATTEMPTS", 5)?;
        let retention_days = env_u64("EVENT_RETENTION_DAYS", 30)?;

        Ok(Self {
            database_url,
            interval: StdDuration::from_secs(interval_secs),
            replay: ReplayConfig {
                cooldown: Duration::seconds(cooldown_secs as i64),
                max_attempts,
                ..ReplayConfig::default()
            },
            retention: Duration::days(retention_days as i64),
        })
    }
}

fn env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("invalid {}: {}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn env_positive_i32(name: &str, default: i32) -> anyhow::Result<i32> {
    match std::env::var(name) {
        Ok(raw) => parse_positive_i32(name, &raw),
        Err(_) => Ok(default),
    }
}

/// A non-positive attempt cap would park every event forever, so reject
/// anything that does not parse as a positive i32.
fn parse_positive_i32(name: &str, raw: &str) -> anyhow::Result<i32> {
    let value = raw
        .parse::<i32>()
        .with_context(|| format!("invalid {}: {}", name, raw))?;
    anyhow::ensure!(value > 0, "invalid {}: must be positive, got {}", name, value);
    Ok(value)
}

/// Cleanup runs once per this many replay ticks.
const CLEANUP_EVERY_TICKS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env()?;

    // Startup often races the database coming up; retry the first
    // connection with backoff.
    let strategy = ExponentialBackoff::from_millis(500).map(jitter).take(5);
    let pool = Retry::spawn(strategy, || db::create_pool(&config.database_url, 3))
        .await
        .context("connecting to database")?;

    let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
    let worker = ReplayWorker::new(store, config.replay.clone());

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        max_attempts = config.replay.max_attempts,
        "Replay worker started"
    );

    let mut ticker = tokio::time::interval(config.interval);
    let mut ticks: u64 = 0;
    loop {
        ticker.tick().await;
        ticks += 1;

        match worker.run_once().await {
            Ok(stats) if stats.fetched > 0 => {
                tracing::info!(
                    fetched = stats.fetched,
                    processed = stats.processed,
                    deferred = stats.deferred,
                    errored = stats.errored,
                    "Replay pass complete"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(error = %err, "Replay pass failed");
            }
        }

        if ticks % CLEANUP_EVERY_TICKS == 0 {
            if let Err(err) = worker.cleanup(config.retention).await {
                tracing::error!(error = %err, "Event cleanup failed");
            }
        }
    }
}
