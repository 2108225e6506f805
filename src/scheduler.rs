use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::health::HealthState;
use crate::error::{AppError, ErrorKind, Result};
use crate::sync::SyncEngine;
use crate::types::{Dataset, SyncMode, SyncResult};

/// Runs each configured dataset as its own background task on a fixed
/// interval. The first tick fires immediately with the startup mode; later
/// ticks are incremental.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    health: Arc<HealthState>,
    interval: Duration,
    startup_mode: SyncMode,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, health: Arc<HealthState>, interval: Duration, startup_mode: SyncMode) -> Self {
        Self {
            engine,
            health,
            interval,
            startup_mode,
        }
    }

    pub fn spawn(self: Arc<Self>, datasets: &[Dataset]) -> Vec<JoinHandle<()>> {
        datasets
            .iter()
            .map(|&dataset| {
                let scheduler = Arc::clone(&self);
                tokio::spawn(async move { scheduler.run(dataset).await })
            })
            .collect()
    }

    async fn run(&self, dataset: Dataset) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut mode = self.startup_mode;

        loop {
            interval.tick().await;
            self.run_once(dataset, mode).await;
            mode = SyncMode::Incremental;
        }
    }

    /// One scheduled run. Keys with no history are rebuilt in full; an
    /// oversized gap is left for the operator.
    pub async fn run_once(&self, dataset: Dataset, mode: SyncMode) -> Option<SyncResult> {
        self.health.set_running(dataset, true);
        let outcome = match self.engine.run_sync(dataset, mode, None).await {
            Err(AppError::BootstrapRequired { keys, .. }) => self.bootstrap(dataset, &keys).await,
            other => other,
        };
        self.health.set_running(dataset, false);

        match outcome {
            Ok(result) => {
                let total_failure = result.is_total_failure();
                if total_failure {
                    error!(
                        dataset = %dataset,
                        failed = result.failed_count(),
                        "Sync run failed for every unit it attempted"
                    );
                }
                self.health.record_run(dataset, result.rows_written, total_failure);
                Some(result)
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::GapTooLarge => {
                        error!(dataset = %dataset, "{e}. Waiting for an explicit full run or a larger MAX_GAP_DAYS");
                    }
                    _ if e.is_run_fatal() => error!(dataset = %dataset, "Sync run aborted: {e}"),
                    _ => warn!(dataset = %dataset, "Sync run failed: {e}"),
                }
                self.health.record_run(dataset, 0, true);
                None
            }
        }
    }

    /// Full rebuild of `missing`, then the dataset's other keys move forward
    /// incrementally so their history is kept.
    async fn bootstrap(&self, dataset: Dataset, missing: &[String]) -> Result<SyncResult> {
        info!(
            dataset = %dataset,
            keys = %missing.join(","),
            "No history for {} key(s), running full rebuild for them",
            missing.len()
        );
        let mut result = self.engine.run_sync_keys(dataset, SyncMode::Full, None, missing).await?;
        let rest: Vec<String> = self
            .engine
            .dataset_keys(dataset)
            .into_iter()
            .filter(|k| !missing.contains(k))
            .collect();
        if !rest.is_empty() {
            result.merge(self.engine.run_sync_keys(dataset, SyncMode::Incremental, None, &rest).await?);
        }
        Ok(result)
    }
}
