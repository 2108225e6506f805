use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use tracing::{debug, warn};

use super::{FullStart, RangePlan, SyncEngine};
use crate::config::FUTURES_EXCHANGE;
use crate::db::store::WHOLE_DATASET_KEY;
use crate::error::Result;
use crate::types::{fmt_trade_date, Dataset, FuturesHolding, SyncMode, SyncResult};
use crate::vendor::FuturesHoldingRow;

/// Net position per contract symbol.
type NetBySymbol = HashMap<String, i64>;

impl SyncEngine {
    pub(super) async fn sync_futures(&self, mode: SyncMode, today: NaiveDate) -> Result<SyncResult> {
        let mut result = SyncResult::new(Dataset::Futures, mode);
        let keys = [WHOLE_DATASET_KEY.to_string()];
        let plan = self
            .planner
            .plan(
                Dataset::Futures,
                &keys,
                mode,
                FullStart::Sessions(self.cfg.futures_history_sessions),
                today,
            )
            .await?;
        let dates = plan.ranges.first().map(|(_, d)| d.as_slice()).unwrap_or_default();
        if dates.is_empty() {
            debug!("Futures holdings up to date");
            return Ok(result);
        }
        if mode == SyncMode::Full {
            self.store.clear(Dataset::Futures, WHOLE_DATASET_KEY).await?;
        }

        let mut prev: Option<NetBySymbol> = None;
        let mut pending = Vec::new();
        let mut pending_dates = 0usize;
        for &d in dates {
            result.dates_processed += 1;
            let unit = format!("{}/{}", Dataset::Futures, fmt_trade_date(d));
            let rows = match self.vendor.fetch_futures_holdings(d, FUTURES_EXCHANGE).await {
                Ok(r) if r.is_empty() => {
                    result.skipped(unit, "no holdings published");
                    prev = None;
                    continue;
                }
                Ok(r) => r,
                Err(e) => {
                    warn!(date = %d, "Futures holdings fetch failed: {e}");
                    result.failed(unit, &e);
                    prev = None;
                    continue;
                }
            };
            // First date, or the session before was lost: look it up again.
            if prev.is_none() {
                prev = self.previous_net(&plan, d).await;
            }

            let positions = futures_positions(
                &rows,
                &self.cfg.futures_varieties,
                &self.cfg.futures_broker,
                d,
                prev.as_ref(),
            );
            prev = Some(positions.iter().map(|p| (p.symbol.clone(), p.net)).collect());
            if positions.is_empty() {
                result.skipped(unit, "no tracked contracts traded");
                continue;
            }
            pending.extend(positions);
            pending_dates += 1;
            if pending_dates >= self.cfg.commit_every_dates {
                result.rows_written += self.store.upsert_futures_holdings(&pending).await?;
                pending.clear();
                pending_dates = 0;
            }
        }
        if !pending.is_empty() {
            result.rows_written += self.store.upsert_futures_holdings(&pending).await?;
        }
        Ok(result)
    }

    /// Nets on the session before `date`: persisted rows when present,
    /// otherwise recomputed from the vendor. None when neither is available.
    async fn previous_net(&self, plan: &RangePlan, date: NaiveDate) -> Option<NetBySymbol> {
        let prev_date = plan.previous_session(date)?;
        match self.store.futures_net_on(prev_date).await {
            Ok(net) if !net.is_empty() => return Some(net),
            Ok(_) => {}
            Err(e) => warn!(date = %prev_date, "Reading previous futures nets failed: {e}"),
        }
        match self.vendor.fetch_futures_holdings(prev_date, FUTURES_EXCHANGE).await {
            Ok(rows) if !rows.is_empty() => {
                let positions = futures_positions(
                    &rows,
                    &self.cfg.futures_varieties,
                    &self.cfg.futures_broker,
                    prev_date,
                    None,
                );
                Some(positions.into_iter().map(|p| (p.symbol, p.net)).collect())
            }
            Ok(_) => None,
            Err(e) => {
                warn!(date = %prev_date, "Previous futures holdings fetch failed: {e}");
                None
            }
        }
    }
}

/// Variety prefix of a contract symbol, e.g. `IF` for `IF2406`.
fn variety_of<'a>(symbol: &str, varieties: &'a [String]) -> Option<&'a str> {
    varieties
        .iter()
        .find(|v| {
            symbol
                .strip_prefix(v.as_str())
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        })
        .map(String::as_str)
}

/// The broker's holdings on `date` for every tracked contract that traded,
/// zero where the broker holds none, plus any contract it had a non-zero net
/// in on the previous session and has since left.
///
/// `change_net` is measured against `prev` for varieties that traded on the
/// previous session; a variety missing there, or an unknown `prev`, gives 0.
pub fn futures_positions(
    rows: &[FuturesHoldingRow],
    varieties: &[String],
    broker: &str,
    date: NaiveDate,
    prev: Option<&NetBySymbol>,
) -> Vec<FuturesHolding> {
    let mut by_contract: BTreeMap<(&str, &str), (i64, i64)> = BTreeMap::new();
    for r in rows.iter().filter(|r| r.trade_date == date) {
        let Some(variety) = variety_of(&r.symbol, varieties) else {
            continue;
        };
        let entry = by_contract.entry((variety, r.symbol.as_str())).or_insert((0, 0));
        if r.broker.contains(broker) {
            entry.0 += r.long_hld;
            entry.1 += r.short_hld;
        }
    }

    let mut prev_varieties: HashSet<&str> = HashSet::new();
    for (symbol, net) in prev.into_iter().flatten() {
        let Some(variety) = variety_of(symbol, varieties) else {
            continue;
        };
        prev_varieties.insert(variety);
        if *net != 0 {
            by_contract.entry((variety, symbol.as_str())).or_insert((0, 0));
        }
    }

    by_contract
        .into_iter()
        .map(|((variety, symbol), (long_hld, short_hld))| {
            let net = long_hld - short_hld;
            let change_net = match prev {
                Some(p) if prev_varieties.contains(variety) => net - p.get(symbol).copied().unwrap_or(0),
                _ => 0,
            };
            FuturesHolding {
                trade_date: date,
                variety: variety.to_string(),
                symbol: symbol.to_string(),
                long_hld,
                short_hld,
                net,
                change_net,
            }
        })
        .collect()
}
