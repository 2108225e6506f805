//! Shared health state for the /health endpoint.
//! Updated by the scheduler after every run, read by the API.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;

use crate::types::Dataset;

/// Run counters for one dataset.
#[derive(Default)]
pub struct DatasetHealth {
    /// True while a sync run is in progress.
    running: AtomicBool,
    /// Unix seconds of the last finished run (0 = never).
    last_run_at: AtomicI64,
    last_rows_written: AtomicU64,
    runs: AtomicU64,
    /// Runs that aborted or wrote nothing while reporting failures.
    failed_runs: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct DatasetHealthSnapshot {
    pub dataset: Dataset,
    pub running: bool,
    pub last_run_at: Option<i64>,
    pub last_rows_written: u64,
    pub runs: u64,
    pub failed_runs: u64,
}

#[derive(Default)]
pub struct HealthState {
    breadth: DatasetHealth,
    sector: DatasetHealth,
    etf: DatasetHealth,
    futures: DatasetHealth,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    fn dataset(&self, dataset: Dataset) -> &DatasetHealth {
        match dataset {
            Dataset::Breadth => &self.breadth,
            Dataset::Sector => &self.sector,
            Dataset::Etf => &self.etf,
            Dataset::Futures => &self.futures,
        }
    }

    pub fn set_running(&self, dataset: Dataset, v: bool) {
        self.dataset(dataset).running.store(v, Ordering::Relaxed);
    }

    pub fn record_run(&self, dataset: Dataset, rows_written: u64, failed: bool) {
        let h = self.dataset(dataset);
        h.last_run_at.store(Utc::now().timestamp(), Ordering::Relaxed);
        h.last_rows_written.store(rows_written, Ordering::Relaxed);
        h.runs.fetch_add(1, Ordering::Relaxed);
        if failed {
            h.failed_runs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Vec<DatasetHealthSnapshot> {
        Dataset::ALL
            .iter()
            .map(|&dataset| {
                let h = self.dataset(dataset);
                let last = h.last_run_at.load(Ordering::Relaxed);
                DatasetHealthSnapshot {
                    dataset,
                    running: h.running.load(Ordering::Relaxed),
                    last_run_at: (last > 0).then_some(last),
                    last_rows_written: h.last_rows_written.load(Ordering::Relaxed),
                    runs: h.runs.load(Ordering::Relaxed),
                    failed_runs: h.failed_runs.load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_are_tracked_per_dataset() {
        let health = HealthState::new();
        health.record_run(Dataset::Etf, 12, false);
        health.record_run(Dataset::Etf, 0, true);

        let snap = health.snapshot();
        let etf = snap.iter().find(|s| s.dataset == Dataset::Etf).unwrap();
        assert_eq!(etf.runs, 2);
        assert_eq!(etf.failed_runs, 1);
        assert_eq!(etf.last_rows_written, 0);
        assert!(etf.last_run_at.is_some());

        let breadth = snap.iter().find(|s| s.dataset == Dataset::Breadth).unwrap();
        assert_eq!(breadth.runs, 0);
        assert_eq!(breadth.last_run_at, None);
    }
}
