use std::collections::BTreeSet;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use super::{unit, FullStart, SyncEngine, DATES_PER_WINDOW};
use crate::db::store::WHOLE_DATASET_KEY;
use crate::error::Result;
use crate::fetcher::TurnoverMode;
use crate::indicators::{derive_flags, sector_breadth, SectorGroups};
use crate::types::{Dataset, SectorBreadthRecord, SectorLevel, SyncMode, SyncResult};

const TAXONOMY_UNIT: &str = "sector/taxonomy";

impl SyncEngine {
    /// Percent above MA20 per SW sector at both levels. Sector membership is
    /// the vendor's current classification.
    pub(super) async fn sync_sector(&self, mode: SyncMode, today: NaiveDate) -> Result<SyncResult> {
        let mut result = SyncResult::new(Dataset::Sector, mode);
        let keys = [WHOLE_DATASET_KEY.to_string()];
        let plan = self
            .planner
            .plan(Dataset::Sector, &keys, mode, FullStart::Date(self.cfg.history_start), today)
            .await?;
        let dates = plan.ranges.first().map(|(_, d)| d.as_slice()).unwrap_or_default();
        if dates.is_empty() {
            debug!("Sector breadth up to date");
            return Ok(result);
        }

        let groups = self.sector_groups(&mut result).await;
        if groups.is_empty() {
            result.skipped(TAXONOMY_UNIT, "no sector members");
            return Ok(result);
        }
        if mode == SyncMode::Full {
            self.store.clear(Dataset::Sector, WHOLE_DATASET_KEY).await?;
        }

        let universe: Vec<String> = groups
            .values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for window in dates.chunks(DATES_PER_WINDOW) {
            let (Some(&first), Some(&last)) = (window.first(), window.last()) else {
                continue;
            };
            result.dates_processed += window.len();

            let fetch_start = plan.lookback_start(first, self.cfg.lookback_sessions);
            let series = self
                .fetcher
                .fetch_universe_series(&universe, fetch_start, last, TurnoverMode::Skip)
                .await;
            for fb in &series.failed_batches {
                result.failed(format!("{}/batch {}", Dataset::Sector, fb.batch), fb.reason());
            }
            let flags = derive_flags(&series.series);

            let mut pending = Vec::new();
            let mut pending_dates = 0usize;
            for &d in window {
                let rows = sector_breadth(&flags, &groups, d);
                if rows.is_empty() {
                    result.skipped(unit(Dataset::Sector, WHOLE_DATASET_KEY, d), "no sector with a defined MA20");
                    continue;
                }
                for (level, sector_name, pct_above_ma20) in rows {
                    let record = SectorBreadthRecord {
                        trade_date: d,
                        sector_name,
                        level,
                        pct_above_ma20,
                    };
                    match record.validate() {
                        Ok(()) => pending.push(record),
                        Err(e) => {
                            warn!(date = %d, "Rejected sector record: {e}");
                            result.failed(unit(Dataset::Sector, &record.sector_name, d), &e);
                        }
                    }
                }
                pending_dates += 1;
                if pending_dates >= self.cfg.commit_every_dates {
                    result.rows_written += self.store.upsert_sector_breadth(&pending).await?;
                    pending.clear();
                    pending_dates = 0;
                }
            }
            if !pending.is_empty() {
                result.rows_written += self.store.upsert_sector_breadth(&pending).await?;
            }
        }
        Ok(result)
    }

    /// Coarse and fine sector member sets. A class whose members cannot be
    /// fetched is recorded as failed and left out.
    async fn sector_groups(&self, result: &mut SyncResult) -> SectorGroups {
        let mut groups = SectorGroups::new();
        let classes = match self.vendor.fetch_sector_classes().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Sector taxonomy fetch failed: {e}");
                result.failed(TAXONOMY_UNIT, &e);
                return groups;
            }
        };

        for class in &classes {
            let members = match self.vendor.fetch_sector_members(&class.index_code).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(sector = %class.name, "Sector member fetch failed: {e}");
                    result.failed(format!("{}/{}", TAXONOMY_UNIT, class.name), &e);
                    continue;
                }
            };
            for m in members {
                groups
                    .entry((SectorLevel::Level1, m.l1_name.clone()))
                    .or_default()
                    .insert(m.ts_code.clone());
                if let Some(l2) = m.l2_name {
                    groups.entry((SectorLevel::Level2, l2)).or_default().insert(m.ts_code);
                }
            }
        }
        info!(
            classes = classes.len(),
            sectors = groups.len(),
            "Sector taxonomy loaded"
        );
        groups
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::Config;
    use crate::db::Store;
    use crate::state::ListingCache;
    use crate::sync::SyncEngine;
    use crate::types::{Dataset, SyncMode};
    use crate::vendor::fake::{date, seeded_market, weekdays};

    #[tokio::test]
    async fn sector_breadth_covers_both_levels_without_turnover() {
        let cal = weekdays(date(2024, 1, 1), 40);
        let mut cfg = Config::for_tests();
        cfg.history_start = cal[30];
        let vendor = Arc::new(seeded_market(&cal, &["600000.SH", "600036.SH", "600519.SH", "000858.SZ"]));
        let store = Store::in_memory().await.unwrap();
        let engine = SyncEngine::new(cfg, vendor.clone(), store.clone(), ListingCache::new(Duration::from_secs(60)));

        let result = engine.run_sync(Dataset::Sector, SyncMode::Full, Some(cal[39])).await.unwrap();
        // Ten dates, two coarse and two fine sectors each.
        assert_eq!(result.rows_written, 40, "errors: {:?}", result.errors);
        assert_eq!(vendor.calls("daily_basic"), 0);

        let fine = store.sector_series(Some("白酒Ⅱ"), Some("level2"), None, None).await.unwrap();
        assert_eq!(fine.len(), 10);
        assert!(fine.iter().all(|r| (0.0..=100.0).contains(&r.pct_above_ma20)));

        let again = engine.run_sync(Dataset::Sector, SyncMode::Incremental, Some(cal[39])).await.unwrap();
        assert_eq!(again.rows_written, 0);
        assert_eq!(store.count_rows(Dataset::Sector).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn empty_taxonomy_writes_nothing_and_reports_the_unit() {
        let cal = weekdays(date(2024, 1, 1), 40);
        let mut cfg = Config::for_tests();
        cfg.history_start = cal[30];
        let mut vendor = seeded_market(&cal, &["600000.SH", "600036.SH"]);
        vendor.sector_classes.clear();
        let store = Store::in_memory().await.unwrap();
        let engine = SyncEngine::new(cfg, Arc::new(vendor), store, ListingCache::new(Duration::from_secs(60)));

        let result = engine.run_sync(Dataset::Sector, SyncMode::Full, Some(cal[39])).await.unwrap();
        assert_eq!(result.rows_written, 0);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].unit, "sector/taxonomy");
    }
}
