use std::collections::HashSet;

use chrono::{Duration, NaiveDate};
use tracing::{debug, warn};

use super::{FullStart, SyncEngine};
use crate::error::Result;
use crate::types::{Dataset, EtfBar, SyncMode, SyncResult};
use crate::vendor::{AdjFactorRow, FundBar};

impl SyncEngine {
    pub(super) async fn sync_etf(&self, keys: &[String], mode: SyncMode, today: NaiveDate) -> Result<SyncResult> {
        let mut result = SyncResult::new(Dataset::Etf, mode);
        let start = today - Duration::days(self.cfg.etf_history_days);
        let plan = self
            .planner
            .plan(Dataset::Etf, keys, mode, FullStart::Date(start), today)
            .await?;

        for (code, dates) in &plan.ranges {
            let (Some(&first), Some(&last)) = (dates.first(), dates.last()) else {
                debug!(etf = %code, "ETF series up to date");
                continue;
            };
            if mode == SyncMode::Full {
                self.store.clear(Dataset::Etf, code).await?;
            }
            result.dates_processed += dates.len();
            let unit = format!("{}/{code}", Dataset::Etf);

            let bars = match self.vendor.fetch_fund_daily(code, first, last).await {
                Ok(b) if b.is_empty() => {
                    result.skipped(unit, "no fund bars in range");
                    continue;
                }
                Ok(b) => b,
                Err(e) => {
                    warn!(etf = %code, "Fund bar fetch failed: {e}");
                    result.failed(unit, &e);
                    continue;
                }
            };
            // Factors from the look-back start seed the forward fill.
            let adj_start = plan.lookback_start(first, self.cfg.lookback_sessions);
            let adj = match self.vendor.fetch_fund_adj(code, adj_start, last).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(etf = %code, "Fund adjustment fetch failed: {e}");
                    result.failed(unit, &e);
                    continue;
                }
            };

            let wanted: HashSet<NaiveDate> = dates.iter().copied().collect();
            let merged: Vec<EtfBar> = etf_bars(&bars, &adj)
                .into_iter()
                .filter(|b| wanted.contains(&b.trade_date))
                .collect();
            for chunk in merged.chunks(self.cfg.commit_every_dates) {
                result.rows_written += self.store.upsert_etf_bars(chunk).await?;
            }
            debug!(etf = %code, bars = merged.len(), "ETF series stored");
        }
        Ok(result)
    }
}

/// Bars in date order with the latest factor on or before each session
/// (1.0 before the first known factor).
pub fn etf_bars(bars: &[FundBar], adj: &[AdjFactorRow]) -> Vec<EtfBar> {
    let mut factors: Vec<(NaiveDate, f64)> = adj.iter().map(|a| (a.trade_date, a.adj_factor)).collect();
    factors.sort_by_key(|(d, _)| *d);
    let mut sorted: Vec<&FundBar> = bars.iter().collect();
    sorted.sort_by_key(|b| b.trade_date);
    sorted.dedup_by_key(|b| b.trade_date);

    let mut next = 0usize;
    let mut current = 1.0;
    sorted
        .into_iter()
        .map(|b| {
            while next < factors.len() && factors[next].0 <= b.trade_date {
                current = factors[next].1;
                next += 1;
            }
            EtfBar {
                ts_code: b.ts_code.clone(),
                trade_date: b.trade_date,
                open: b.open,
                high: b.high,
                low: b.low,
                close: b.close,
                vol: b.vol,
                adj_factor: current,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::db::Store;
    use crate::state::ListingCache;
    use crate::vendor::fake::{date, seeded_market, weekdays};

    fn bar(d: NaiveDate) -> FundBar {
        FundBar {
            ts_code: "510300.SH".to_string(),
            trade_date: d,
            open: 3.9,
            high: 3.95,
            low: 3.88,
            close: 3.92,
            vol: 1.0e6,
        }
    }

    fn adj(d: NaiveDate, f: f64) -> AdjFactorRow {
        AdjFactorRow {
            ts_code: "510300.SH".to_string(),
            trade_date: d,
            adj_factor: f,
        }
    }

    #[test]
    fn factors_forward_fill_with_unit_default() {
        let days = weekdays(date(2024, 5, 6), 5);
        let bars: Vec<FundBar> = days.iter().rev().map(|d| bar(*d)).collect();
        let factors = vec![adj(days[3], 1.2), adj(days[1], 1.1)];

        let merged = etf_bars(&bars, &factors);
        let got: Vec<f64> = merged.iter().map(|b| b.adj_factor).collect();
        assert_eq!(got, vec![1.0, 1.1, 1.1, 1.2, 1.2]);
        assert_eq!(merged[0].trade_date, days[0]);
    }

    #[test]
    fn factor_before_the_window_seeds_the_fill() {
        let days = weekdays(date(2024, 5, 6), 3);
        let merged = etf_bars(&[bar(days[1]), bar(days[2])], &[adj(days[0], 2.5)]);
        assert!(merged.iter().all(|b| b.adj_factor == 2.5));
    }

    #[tokio::test]
    async fn full_rebuild_covers_history_days() {
        let cal = weekdays(date(2024, 1, 1), 60);
        let mut cfg = Config::for_tests();
        cfg.etf_history_days = 13;
        let vendor = Arc::new(seeded_market(&cal, &["600000.SH"]));
        let store = Store::in_memory().await.unwrap();
        let engine = SyncEngine::new(cfg, vendor, store.clone(), ListingCache::new(std::time::Duration::from_secs(60)));

        let result = engine.run_sync(Dataset::Etf, SyncMode::Full, Some(cal[59])).await.unwrap();
        // Thirteen calendar days back from a Friday: 10 sessions.
        assert_eq!(result.rows_written, 10);
        let rows = store.etf_series("510300.SH", None, None).await.unwrap();
        assert_eq!(rows.len(), 10);
        assert!(rows.iter().all(|r| r.adj_factor == 1.0));
        assert_eq!(rows[9].trade_date, crate::types::fmt_trade_date(cal[59]));
    }
}
