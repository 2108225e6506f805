use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use tracing::{debug, warn};

use super::{unit, FullStart, RangePlan, SyncEngine, DATES_PER_WINDOW};
use crate::error::Result;
use crate::fetcher::TurnoverMode;
use crate::indicators::{aggregate_breadth, crowding_index, derive_flags};
use crate::types::{BreadthRecord, Dataset, IndexDefinition, SyncMode, SyncResult};

/// Crowding index per date, shared by every index in one run.
type CrowdingMemo = HashMap<NaiveDate, Option<f64>>;

impl SyncEngine {
    pub(super) async fn sync_breadth(&self, keys: &[String], mode: SyncMode, today: NaiveDate) -> Result<SyncResult> {
        let mut result = SyncResult::new(Dataset::Breadth, mode);
        let plan = self
            .planner
            .plan(Dataset::Breadth, keys, mode, FullStart::Date(self.cfg.history_start), today)
            .await?;

        let mut crowding = CrowdingMemo::new();
        for (code, dates) in &plan.ranges {
            let Some(index) = self.cfg.tracked_indices.iter().find(|i| &i.code == code) else {
                continue;
            };
            if dates.is_empty() {
                debug!(index = %index.code, "Breadth up to date");
                continue;
            }
            if mode == SyncMode::Full {
                self.store.clear(Dataset::Breadth, &index.code).await?;
            }
            for window in dates.chunks(DATES_PER_WINDOW) {
                self.breadth_window(index, window, &plan, &mut crowding, &mut result).await?;
            }
        }
        Ok(result)
    }

    async fn breadth_window(
        &self,
        index: &IndexDefinition,
        window: &[NaiveDate],
        plan: &RangePlan,
        crowding: &mut CrowdingMemo,
        result: &mut SyncResult,
    ) -> Result<()> {
        let (Some(&first), Some(&last)) = (window.first(), window.last()) else {
            return Ok(());
        };
        result.dates_processed += window.len();

        let mut members_by_date: BTreeMap<NaiveDate, BTreeSet<String>> = BTreeMap::new();
        for &d in window {
            match self.resolver.resolve_members(index, d).await {
                Ok(members) if members.is_empty() => {
                    result.skipped(unit(Dataset::Breadth, &index.code, d), "no constituents resolved");
                }
                Ok(members) => {
                    members_by_date.insert(d, members);
                }
                Err(e) => {
                    warn!(index = %index.code, date = %d, "Constituent resolution failed: {e}");
                    result.failed(unit(Dataset::Breadth, &index.code, d), &e);
                }
            }
        }
        if members_by_date.is_empty() {
            return Ok(());
        }

        let closes: HashMap<NaiveDate, f64> = match self.vendor.fetch_index_close(&index.code, first, last).await {
            Ok(rows) => rows.into_iter().map(|r| (r.trade_date, r.close)).collect(),
            Err(e) => {
                warn!(index = %index.code, from = %first, to = %last, "Index close fetch failed: {e}");
                for d in members_by_date.keys() {
                    result.failed(unit(Dataset::Breadth, &index.code, *d), &e);
                }
                return Ok(());
            }
        };

        let universe: Vec<String> = members_by_date
            .values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let fetch_start = plan.lookback_start(first, self.cfg.lookback_sessions);
        let series = self
            .fetcher
            .fetch_universe_series(&universe, fetch_start, last, TurnoverMode::Fetch)
            .await;
        for fb in &series.failed_batches {
            result.failed(format!("{}/{}/batch {}", Dataset::Breadth, index.code, fb.batch), fb.reason());
        }
        let flags = derive_flags(&series.series);

        let mut pending = Vec::new();
        for (&d, members) in &members_by_date {
            let unit = unit(Dataset::Breadth, &index.code, d);
            let Some(&close) = closes.get(&d) else {
                result.skipped(unit, "no index close");
                continue;
            };
            let Some(pcts) = aggregate_breadth(&flags, members, d) else {
                result.skipped(unit, "no constituent with a session and a defined MA20");
                continue;
            };
            let crowding_index = match self.crowding_on(d, crowding).await {
                Ok(Some(c)) => c,
                Ok(None) => {
                    result.skipped(unit, "no market traded value");
                    continue;
                }
                Err(e) => {
                    warn!(date = %d, "Market traded value fetch failed: {e}");
                    result.failed(unit, &e);
                    continue;
                }
            };

            let record = BreadthRecord {
                trade_date: d,
                index_code: index.code.clone(),
                index_name: index.name.clone(),
                close,
                pct_above_ma20: pcts.pct_above_ma20,
                pct_down_3days: pcts.pct_down_3days,
                pct_turnover_lt_3: pcts.pct_turnover_lt_3,
                pct_turnover_gt_5: pcts.pct_turnover_gt_5,
                crowding_index,
            };
            if let Err(e) = record.validate() {
                warn!(index = %index.code, date = %d, "Rejected breadth record: {e}");
                result.failed(unit, &e);
                continue;
            }
            debug!(index = %index.code, date = %d, constituents = pcts.valid, "Breadth computed");
            pending.push(record);

            if pending.len() >= self.cfg.commit_every_dates {
                result.rows_written += self.store.upsert_breadth(&pending).await?;
                pending.clear();
            }
        }
        if !pending.is_empty() {
            result.rows_written += self.store.upsert_breadth(&pending).await?;
        }
        Ok(())
    }

    async fn crowding_on(&self, date: NaiveDate, memo: &mut CrowdingMemo) -> Result<Option<f64>> {
        if let Some(c) = memo.get(&date) {
            return Ok(*c);
        }
        let amounts: Vec<f64> = self
            .vendor
            .fetch_market_amounts(date)
            .await?
            .into_iter()
            .map(|a| a.amount)
            .collect();
        let c = crowding_index(&amounts);
        memo.insert(date, c);
        Ok(c)
    }
}
