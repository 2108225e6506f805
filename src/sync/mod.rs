//! Dataset sync runs: plan the dates, fetch with look-back, compute, persist
//! in chunks. Failures scoped to one batch or one date are recorded in the
//! run's `SyncResult` and the run continues; planning and storage failures
//! abort it.

mod breadth;
mod etf;
mod futures;
pub mod planner;
mod sector;

use std::sync::Arc;
use std::time::Instant;

use chrono::{Local, NaiveDate};
use tracing::{info, warn};

use crate::config::Config;
use crate::db::store::WHOLE_DATASET_KEY;
use crate::db::Store;
use crate::error::Result;
use crate::fetcher::BatchFetcher;
use crate::resolver::ConstituentResolver;
use crate::state::ListingCache;
use crate::types::{fmt_trade_date, Dataset, SyncMode, SyncResult};
use crate::vendor::MarketData;

pub use planner::{FullStart, RangePlan, SyncStateManager};

/// Trading dates fetched and computed together; each window re-fetches its
/// own look-back so memory stays bounded on long rebuilds.
const DATES_PER_WINDOW: usize = 60;

pub struct SyncEngine {
    cfg: Config,
    vendor: Arc<dyn MarketData>,
    store: Store,
    planner: SyncStateManager,
    resolver: ConstituentResolver,
    fetcher: BatchFetcher,
}

impl SyncEngine {
    pub fn new(cfg: Config, vendor: Arc<dyn MarketData>, store: Store, listing_cache: Arc<ListingCache>) -> Self {
        Self {
            planner: SyncStateManager::new(vendor.clone(), store.clone(), cfg.max_gap_days, cfg.lookback_sessions),
            resolver: ConstituentResolver::new(vendor.clone(), listing_cache),
            fetcher: BatchFetcher::new(vendor.clone(), cfg.batch_size, cfg.fetch_workers),
            cfg,
            vendor,
            store,
        }
    }

    /// Watermark keys of a dataset: one per index or ETF, or a single
    /// whole-dataset key.
    pub fn dataset_keys(&self, dataset: Dataset) -> Vec<String> {
        match dataset {
            Dataset::Breadth => self.cfg.tracked_indices.iter().map(|i| i.code.clone()).collect(),
            Dataset::Etf => self.cfg.etf_pool.clone(),
            Dataset::Sector | Dataset::Futures => vec![WHOLE_DATASET_KEY.to_string()],
        }
    }

    /// Safe to re-run with the same arguments: every write is an upsert and
    /// an incremental run after a complete one plans zero dates.
    pub async fn run_sync(&self, dataset: Dataset, mode: SyncMode, as_of: Option<NaiveDate>) -> Result<SyncResult> {
        let keys = self.dataset_keys(dataset);
        self.run_sync_keys(dataset, mode, as_of, &keys).await
    }

    /// `run_sync` restricted to some of the dataset's keys. Keys the dataset
    /// does not track are ignored; a full run clears only the keys it covers.
    pub async fn run_sync_keys(
        &self,
        dataset: Dataset,
        mode: SyncMode,
        as_of: Option<NaiveDate>,
        keys: &[String],
    ) -> Result<SyncResult> {
        let today = as_of.unwrap_or_else(|| Local::now().date_naive());
        let keys: Vec<String> = self
            .dataset_keys(dataset)
            .into_iter()
            .filter(|k| keys.contains(k))
            .collect();
        if keys.is_empty() {
            return Ok(SyncResult::new(dataset, mode));
        }
        let started = Instant::now();
        info!(dataset = %dataset, mode = %mode, as_of = %today, keys = keys.len(), "Sync started");

        if mode == SyncMode::Full {
            self.resolver.listing_cache().invalidate_all();
        }

        let result = match dataset {
            Dataset::Breadth => self.sync_breadth(&keys, mode, today).await?,
            Dataset::Sector => self.sync_sector(mode, today).await?,
            Dataset::Etf => self.sync_etf(&keys, mode, today).await?,
            Dataset::Futures => self.sync_futures(mode, today).await?,
        };

        let failed = result.failed_count();
        let skipped = result.errors.len() - failed;
        if result.is_total_failure() {
            warn!(
                dataset = %dataset,
                failed,
                "Sync wrote nothing: {} units failed",
                failed
            );
        }
        info!(
            dataset = %dataset,
            mode = %mode,
            dates = result.dates_processed,
            rows = result.rows_written,
            skipped,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sync finished: {} dates, {} rows, {} skipped, {} failed",
            result.dates_processed,
            result.rows_written,
            skipped,
            failed,
        );
        Ok(result)
    }
}

/// `dataset/key/YYYYMMDD`, the unit name used in run reports.
fn unit(dataset: Dataset, key: &str, date: NaiveDate) -> String {
    format!("{dataset}/{key}/{}", fmt_trade_date(date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UnitOutcome;
    use crate::vendor::fake::{date, seeded_market, weekdays, FakeVendor};
    use std::time::Duration;

    const CODES: [&str; 5] = ["600000.SH", "600036.SH", "601166.SH", "600519.SH", "000858.SZ"];

    async fn engine(vendor: FakeVendor, cfg: Config) -> (Arc<FakeVendor>, SyncEngine) {
        let vendor = Arc::new(vendor);
        let store = Store::in_memory().await.unwrap();
        let engine = SyncEngine::new(cfg, vendor.clone(), store, ListingCache::new(Duration::from_secs(60)));
        (vendor, engine)
    }

    /// 60 sessions; a full rebuild from session 20 covers 40 dates with a
    /// 20-session look-back in front of it.
    fn forty_day_setup() -> (Vec<NaiveDate>, Config) {
        let cal = weekdays(date(2024, 1, 1), 60);
        let mut cfg = Config::for_tests();
        cfg.history_start = cal[20];
        (cal, cfg)
    }

    #[tokio::test]
    async fn bootstrap_full_writes_exactly_the_requested_window() {
        let (cal, cfg) = forty_day_setup();
        let (_, engine) = engine(seeded_market(&cal, &CODES), cfg).await;

        let result = engine.run_sync(Dataset::Breadth, SyncMode::Full, Some(cal[59])).await.unwrap();
        assert_eq!(result.rows_written, 40, "errors: {:?}", result.errors);
        assert_eq!(result.dates_processed, 40);
        assert!(result.errors.is_empty());

        let rows = engine.store.breadth_series("000300.SH", None, None).await.unwrap();
        assert_eq!(rows.len(), 40);
        assert_eq!(rows[0].trade_date, fmt_trade_date(cal[20]));
        assert_eq!(rows[39].trade_date, fmt_trade_date(cal[59]));
        assert!(rows.iter().all(|r| r.close > 0.0));
        for r in &rows {
            for v in [r.pct_above_ma20, r.pct_down_3days, r.pct_turnover_lt_3, r.pct_turnover_gt_5, r.crowding_index] {
                assert!((0.0..=100.0).contains(&v));
            }
        }
        // Turnover 0.5, 2.0, 3.5, 5.0, 6.5: two below 3, one above 5.
        assert_eq!(rows[0].pct_turnover_lt_3, 40.0);
        assert_eq!(rows[0].pct_turnover_gt_5, 20.0);
    }

    #[tokio::test]
    async fn incremental_rerun_is_a_no_op() {
        let (cal, cfg) = forty_day_setup();
        let (_, engine) = engine(seeded_market(&cal, &CODES), cfg).await;

        engine.run_sync(Dataset::Breadth, SyncMode::Full, Some(cal[59])).await.unwrap();
        let before = engine.store.breadth_series("000300.SH", None, None).await.unwrap();

        let again = engine.run_sync(Dataset::Breadth, SyncMode::Incremental, Some(cal[59])).await.unwrap();
        assert_eq!(again.rows_written, 0);
        assert_eq!(again.dates_processed, 0);
        let after = engine.store.breadth_series("000300.SH", None, None).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn incremental_after_full_extends_the_series() {
        let (cal, cfg) = forty_day_setup();
        let (_, engine) = engine(seeded_market(&cal, &CODES), cfg).await;

        engine.run_sync(Dataset::Breadth, SyncMode::Full, Some(cal[55])).await.unwrap();
        let result = engine.run_sync(Dataset::Breadth, SyncMode::Incremental, Some(cal[59])).await.unwrap();
        assert_eq!(result.rows_written, 4);
        assert_eq!(engine.store.count_rows(Dataset::Breadth).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn incremental_without_history_requires_bootstrap() {
        let (cal, cfg) = forty_day_setup();
        let (vendor, engine) = engine(seeded_market(&cal, &CODES), cfg).await;
        let err = engine
            .run_sync(Dataset::Breadth, SyncMode::Incremental, Some(cal[59]))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::AppError::BootstrapRequired { .. }));
        assert_eq!(vendor.calls("daily"), 0);
    }

    #[tokio::test]
    async fn scoped_full_run_leaves_other_indices_alone() {
        let (cal, mut cfg) = forty_day_setup();
        cfg.tracked_indices = crate::config::parse_index_list("000300.SH:沪深300,399006.SZ:创业板指").unwrap();
        let mut vendor = seeded_market(&cal, &CODES);
        let members = vendor.membership["000300.SH"].clone();
        vendor.membership.insert("399006.SZ".to_string(), members);
        let closes = vendor.index_close["000300.SH"].clone();
        vendor.index_close.insert("399006.SZ".to_string(), closes);
        let (_, engine) = engine(vendor, cfg).await;

        let first = ["000300.SH".to_string()];
        engine.run_sync_keys(Dataset::Breadth, SyncMode::Full, Some(cal[55]), &first).await.unwrap();
        let err = engine
            .run_sync(Dataset::Breadth, SyncMode::Incremental, Some(cal[59]))
            .await
            .unwrap_err();
        match err {
            crate::error::AppError::BootstrapRequired { keys, .. } => assert_eq!(keys, vec!["399006.SZ"]),
            other => panic!("unexpected {other}"),
        }

        let added = ["399006.SZ".to_string()];
        let full = engine.run_sync_keys(Dataset::Breadth, SyncMode::Full, Some(cal[59]), &added).await.unwrap();
        assert_eq!(full.rows_written, 40);
        assert_eq!(engine.store.breadth_series("000300.SH", None, None).await.unwrap().len(), 36);

        let inc = engine.run_sync(Dataset::Breadth, SyncMode::Incremental, Some(cal[59])).await.unwrap();
        assert_eq!(inc.rows_written, 4);
        assert_eq!(engine.store.count_rows(Dataset::Breadth).await.unwrap(), 80);
    }

    #[tokio::test]
    async fn missing_index_close_skips_only_that_date() {
        let (cal, cfg) = forty_day_setup();
        let mut vendor = seeded_market(&cal, &CODES);
        if let Some(rows) = vendor.index_close.get_mut("000300.SH") {
            rows.retain(|r| r.trade_date != cal[30]);
        }
        let (_, engine) = engine(vendor, cfg).await;

        let result = engine.run_sync(Dataset::Breadth, SyncMode::Full, Some(cal[59])).await.unwrap();
        assert_eq!(result.rows_written, 39);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].outcome, UnitOutcome::Skipped);
        assert_eq!(result.errors[0].unit, unit(Dataset::Breadth, "000300.SH", cal[30]));
    }

    #[tokio::test]
    async fn failed_batch_degrades_coverage_without_aborting() {
        let (cal, mut cfg) = forty_day_setup();
        cfg.batch_size = 1;
        let mut vendor = seeded_market(&cal, &CODES);
        vendor.rate_limited_codes.insert("000858.SZ".to_string());
        let (_, engine) = engine(vendor, cfg).await;

        let result = engine.run_sync(Dataset::Breadth, SyncMode::Full, Some(cal[59])).await.unwrap();
        assert_eq!(result.rows_written, 40);
        assert_eq!(result.failed_count(), 1);
        assert!(result.errors[0].unit.contains("batch"));
        assert!(result.errors[0].reason.contains("dropped 000858.SZ"));
        // Four of five constituents remain: 0.5 and 2.0 are below 3.
        let rows = engine.store.breadth_series("000300.SH", None, None).await.unwrap();
        assert_eq!(rows[0].pct_turnover_lt_3, 50.0);
    }

    #[tokio::test]
    async fn crowding_is_fetched_once_per_date_across_indices() {
        let (cal, mut cfg) = forty_day_setup();
        cfg.tracked_indices = crate::config::parse_index_list("000300.SH:沪深300,000001.SH:上证指数").unwrap();
        let mut vendor = seeded_market(&cal, &CODES);
        let listing = CODES
            .iter()
            .map(|c| crate::vendor::ListingRow {
                ts_code: c.to_string(),
                list_date: Some(date(2010, 1, 4)),
                delist_date: None,
            })
            .collect();
        vendor.listing.insert("SSE".to_string(), listing);
        let closes = vendor.index_close["000300.SH"].clone();
        vendor.index_close.insert("000001.SH".to_string(), closes);
        let (vendor, engine) = engine(vendor, cfg).await;

        let result = engine.run_sync(Dataset::Breadth, SyncMode::Full, Some(cal[59])).await.unwrap();
        assert_eq!(result.rows_written, 80);
        assert_eq!(vendor.calls("daily_market"), 40);
        assert_eq!(vendor.calls("stock_basic"), 1);
    }
}
