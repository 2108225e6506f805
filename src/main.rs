mod api;
mod config;
mod db;
mod error;
mod fetcher;
mod indicators;
mod resolver;
mod scheduler;
mod state;
mod strategy;
mod sync;
mod types;
mod vendor;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::routes::{router, ApiState};
use crate::config::Config;
use crate::db::Store;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::state::ListingCache;
use crate::sync::SyncEngine;
use crate::vendor::{MarketData, TushareClient};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let store = Store::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    // --- Vendor client, shared by every dataset task ---
    let latency = Arc::new(LatencyStats::new());
    let vendor: Arc<dyn MarketData> = Arc::new(TushareClient::new(&cfg, Arc::clone(&latency))?);
    let listing_cache = ListingCache::new(Duration::from_secs(cfg.listing_cache_ttl_secs));

    info!(
        indices = cfg.tracked_indices.len(),
        etfs = cfg.etf_pool.len(),
        batch_size = cfg.batch_size,
        workers = cfg.fetch_workers,
        pacing_ms = cfg.pacing_ms,
        max_gap_days = cfg.max_gap_days,
        "Sync engine configured: tracking {}",
        cfg.tracked_indices
            .iter()
            .map(|i| format!("{} {}", i.code, i.name))
            .collect::<Vec<_>>()
            .join(", "),
    );

    let engine = Arc::new(SyncEngine::new(cfg.clone(), vendor, store.clone(), listing_cache));
    let health = Arc::new(HealthState::new());

    // --- Scheduled sync tasks ---
    let scheduler = Arc::new(Scheduler::new(
        engine,
        Arc::clone(&health),
        Duration::from_secs(cfg.sync_interval_secs),
        cfg.startup_mode,
    ));
    let tasks = scheduler.spawn(&cfg.sync_datasets);
    info!(
        "Scheduled {} dataset(s) every {}s, first run {}",
        tasks.len(),
        cfg.sync_interval_secs,
        cfg.startup_mode,
    );

    // --- HTTP API server ---
    let app = router(ApiState {
        store,
        health,
        latency,
        etf_pool: Arc::new(cfg.etf_pool.clone()),
    });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
