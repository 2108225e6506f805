use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use tracing::{debug, info};

use crate::config::{CALENDAR_DAYS_PER_SESSION, CALENDAR_EXCHANGE};
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::types::{Dataset, SyncMode};
use crate::vendor::MarketData;

/// Extra calendar days requested on top of the per-session estimate.
const CALENDAR_SLACK_DAYS: i64 = 10;

/// Where a full rebuild starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullStart {
    Date(NaiveDate),
    /// The last `n` sessions up to and including today.
    Sessions(usize),
}

/// Dates to process per key, with the trading calendar they were cut from.
#[derive(Debug, Clone, Default)]
pub struct RangePlan {
    pub ranges: Vec<(String, Vec<NaiveDate>)>,
    calendar: Vec<NaiveDate>,
}

impl RangePlan {
    pub fn total_dates(&self) -> usize {
        self.ranges.iter().map(|(_, d)| d.len()).sum()
    }

    /// The session `sessions` trading days before `first`, or the earliest
    /// known session when the calendar is shorter.
    pub fn lookback_start(&self, first: NaiveDate, sessions: usize) -> NaiveDate {
        let idx = self.calendar.partition_point(|d| *d < first);
        self.calendar
            .get(idx.saturating_sub(sessions))
            .copied()
            .unwrap_or(first)
    }

    /// Trading session immediately before `date`.
    pub fn previous_session(&self, date: NaiveDate) -> Option<NaiveDate> {
        let idx = self.calendar.partition_point(|d| *d < date);
        idx.checked_sub(1).map(|i| self.calendar[i])
    }
}

/// Decides which trading dates a sync run processes.
pub struct SyncStateManager {
    vendor: Arc<dyn MarketData>,
    store: Store,
    max_gap_days: usize,
    lookback_sessions: usize,
}

impl SyncStateManager {
    pub fn new(vendor: Arc<dyn MarketData>, store: Store, max_gap_days: usize, lookback_sessions: usize) -> Self {
        Self {
            vendor,
            store,
            max_gap_days,
            lookback_sessions,
        }
    }

    /// Plan every key of a dataset before anything is written, so a refused
    /// key aborts the whole run. An incremental plan names every key that has
    /// no watermark yet, so the caller can rebuild just those.
    pub async fn plan(
        &self,
        dataset: Dataset,
        keys: &[String],
        mode: SyncMode,
        full_start: FullStart,
        today: NaiveDate,
    ) -> Result<RangePlan> {
        let mut watermarks = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in keys {
            let wm = self.store.latest_date(dataset, key).await?;
            if wm.is_none() {
                missing.push(key.clone());
            }
            watermarks.push(wm);
        }
        if mode == SyncMode::Incremental && !missing.is_empty() {
            return Err(AppError::BootstrapRequired {
                dataset: dataset.to_string(),
                keys: missing,
            });
        }

        let range_start = match mode {
            SyncMode::Incremental => watermarks.iter().flatten().min().copied().unwrap_or(today),
            SyncMode::Full => match full_start {
                FullStart::Date(d) => d,
                FullStart::Sessions(n) => today - sessions_to_days(n),
            },
        };
        let calendar_from = range_start - sessions_to_days(self.lookback_sessions);
        let mut calendar = self.vendor.fetch_calendar(CALENDAR_EXCHANGE, calendar_from, today).await?;
        calendar.sort();
        calendar.dedup();
        debug!(dataset = %dataset, from = %calendar_from, to = %today, sessions = calendar.len(), "Trading calendar loaded");

        let mut ranges = Vec::with_capacity(keys.len());
        for (key, wm) in keys.iter().zip(watermarks) {
            let dates = plan_dates(&calendar, wm, mode, full_start, today, self.max_gap_days, dataset, key)?;
            ranges.push((key.clone(), dates));
        }

        let plan = RangePlan { ranges, calendar };
        info!(
            dataset = %dataset,
            mode = %mode,
            keys = keys.len(),
            dates = plan.total_dates(),
            "Sync range planned"
        );
        Ok(plan)
    }
}

fn sessions_to_days(sessions: usize) -> Duration {
    Duration::days(sessions as i64 * CALENDAR_DAYS_PER_SESSION + CALENDAR_SLACK_DAYS)
}

/// Dates to process for one key.
///
/// Incremental: sessions in `(watermark, today]`, refused with `GapTooLarge`
/// past `max_gap`. Full: sessions in `[start, today]` with no gap guard.
#[allow(clippy::too_many_arguments)]
pub fn plan_dates(
    calendar: &[NaiveDate],
    watermark: Option<NaiveDate>,
    mode: SyncMode,
    full_start: FullStart,
    today: NaiveDate,
    max_gap: usize,
    dataset: Dataset,
    key: &str,
) -> Result<Vec<NaiveDate>> {
    match mode {
        SyncMode::Incremental => {
            let Some(wm) = watermark else {
                return Err(AppError::BootstrapRequired {
                    dataset: dataset.to_string(),
                    keys: vec![key.to_string()],
                });
            };
            let dates: Vec<NaiveDate> = calendar.iter().copied().filter(|d| *d > wm && *d <= today).collect();
            if dates.len() > max_gap {
                return Err(AppError::GapTooLarge {
                    dataset: dataset.to_string(),
                    key: key.to_string(),
                    gap: dates.len(),
                    max: max_gap,
                });
            }
            Ok(dates)
        }
        SyncMode::Full => {
            let upto: Vec<NaiveDate> = calendar.iter().copied().filter(|d| *d <= today).collect();
            Ok(match full_start {
                FullStart::Date(start) => upto.into_iter().filter(|d| *d >= start).collect(),
                FullStart::Sessions(n) => upto[upto.len().saturating_sub(n)..].to_vec(),
            })
        }
    }
}
