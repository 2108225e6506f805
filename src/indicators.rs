//! Pure, synchronous indicator math over merged per-security series.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;

use crate::config::{moving_average, turnover_thresholds, CROWDING_TOP_SHARE};
use crate::types::{SectorLevel, SeriesPoint};

// ---------------------------------------------------------------------------
// Per-security derivations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionFlags {
    pub adj_close: f64,
    /// None until the window has `MIN_OBSERVATIONS` points.
    pub ma20: Option<f64>,
    pub down: bool,
    pub down_3days: bool,
    pub turnover_lt_3: bool,
    pub turnover_gt_5: bool,
}

impl SessionFlags {
    /// Strictly above the moving average; None when the average is undefined.
    pub fn above_ma(&self) -> Option<bool> {
        self.ma20.map(|ma| self.adj_close > ma)
    }
}

/// Session flags keyed by security, then date.
pub type FlagTable = HashMap<String, BTreeMap<NaiveDate, SessionFlags>>;

pub fn adjusted_closes(points: &[SeriesPoint]) -> Vec<f64> {
    points.iter().map(|p| p.close * p.adj_factor).collect()
}

/// Trailing mean over at most `window` values, emitted once `min_obs` are available.
pub fn rolling_mean(values: &[f64], window: usize, min_obs: usize) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate() {
        sum += v;
        if i >= window {
            sum -= values[i - window];
        }
        let n = (i + 1).min(window);
        out.push(if n >= min_obs { Some(sum / n as f64) } else { None });
    }
    out
}

/// Flags for one security. `points` must be in ascending date order.
pub fn security_flags(points: &[SeriesPoint]) -> BTreeMap<NaiveDate, SessionFlags> {
    let adj = adjusted_closes(points);
    let ma = rolling_mean(&adj, moving_average::WINDOW, moving_average::MIN_OBSERVATIONS);
    let down: Vec<bool> = points.iter().map(|p| p.pct_chg < 0.0).collect();

    points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let down_3days = i >= 2 && down[i] && down[i - 1] && down[i - 2];
            let flags = SessionFlags {
                adj_close: adj[i],
                ma20: ma[i],
                down: down[i],
                down_3days,
                turnover_lt_3: p.turnover_rate < turnover_thresholds::LOW,
                turnover_gt_5: p.turnover_rate > turnover_thresholds::HIGH,
            };
            (p.trade_date, flags)
        })
        .collect()
}

pub fn derive_flags(series: &BTreeMap<String, Vec<SeriesPoint>>) -> FlagTable {
    series
        .iter()
        .map(|(code, points)| (code.clone(), security_flags(points)))
        .collect()
}

// ---------------------------------------------------------------------------
// Cross-sectional aggregation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreadthPercentages {
    pub pct_above_ma20: f64,
    pub pct_down_3days: f64,
    pub pct_turnover_lt_3: f64,
    pub pct_turnover_gt_5: f64,
    /// Members with a session on the date.
    pub valid: usize,
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn pct(hits: usize, of: usize) -> f64 {
    round2(100.0 * hits as f64 / of as f64)
}

/// Percentages over `members` on `date`. The MA flag is measured against members
/// with a defined average; the others against members with a session that day.
/// None when either denominator is zero, so no record is written.
pub fn aggregate_breadth(flags: &FlagTable, members: &BTreeSet<String>, date: NaiveDate) -> Option<BreadthPercentages> {
    let (mut valid, mut with_ma) = (0usize, 0usize);
    let (mut above, mut down3, mut lt3, mut gt5) = (0usize, 0usize, 0usize, 0usize);

    for code in members {
        let Some(f) = flags.get(code).and_then(|s| s.get(&date)) else {
            continue;
        };
        valid += 1;
        down3 += usize::from(f.down_3days);
        lt3 += usize::from(f.turnover_lt_3);
        gt5 += usize::from(f.turnover_gt_5);
        if let Some(is_above) = f.above_ma() {
            with_ma += 1;
            above += usize::from(is_above);
        }
    }

    if valid == 0 || with_ma == 0 {
        return None;
    }
    Some(BreadthPercentages {
        pct_above_ma20: pct(above, with_ma),
        pct_down_3days: pct(down3, valid),
        pct_turnover_lt_3: pct(lt3, valid),
        pct_turnover_gt_5: pct(gt5, valid),
        valid,
    })
}

/// Share of total traded value held by the top 5% (at least one) of securities, x100.
/// None for an empty or zero-value market.
pub fn crowding_index(amounts: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = amounts.iter().copied().filter(|a| a.is_finite() && *a >= 0.0).collect();
    let total: f64 = sorted.iter().sum();
    if sorted.is_empty() || total <= 0.0 {
        return None;
    }
    sorted.sort_by(|a, b| b.total_cmp(a));
    let top_n = ((sorted.len() as f64 * CROWDING_TOP_SHARE) as usize).max(1);
    let top: f64 = sorted.iter().take(top_n).sum();
    Some(round2(top / total * 100.0))
}

/// Sector name and level to its member codes.
pub type SectorGroups = BTreeMap<(SectorLevel, String), BTreeSet<String>>;

/// Percent above MA20 per sector on `date`; sectors without any defined MA are omitted.
pub fn sector_breadth(flags: &FlagTable, groups: &SectorGroups, date: NaiveDate) -> Vec<(SectorLevel, String, f64)> {
    groups
        .iter()
        .filter_map(|((level, name), members)| {
            let mut with_ma = 0usize;
            let mut above = 0usize;
            for code in members {
                if let Some(is_above) = flags.get(code).and_then(|s| s.get(&date)).and_then(|f| f.above_ma()) {
                    with_ma += 1;
                    above += usize::from(is_above);
                }
            }
            (with_ma > 0).then(|| (*level, name.clone(), pct(above, with_ma)))
        })
        .collect()
}
