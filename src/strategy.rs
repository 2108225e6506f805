//! ETF ranking over the stored daily series.
//!
//! Two scores per fund, both on forward-adjusted closes:
//! - a weighted log-linear trend (annualised return scaled by fit quality)
//!   behind a hard risk screen, and
//! - three momentum factors standardised across the pool and blended.

use std::cmp::Ordering;

use serde::Serialize;

use crate::db::models::EtfDailyRow;

/// Sessions in the trend regression.
pub const TREND_DAYS: usize = 25;
/// Trend scores above this read as a blow-off rather than a trend.
pub const OVERHEATED_SCORE: f64 = 6.0;
const TRADING_DAYS_PER_YEAR: f64 = 250.0;

const RISK_MA_DAYS: usize = 20;
const RISK_HIGH_DAYS: usize = 25;
const MAX_DAILY_DROP: f64 = -0.03;
const MAX_DRAWDOWN: f64 = -0.10;

const BIAS_MA_DAYS: usize = 20;
const MOMENTUM_DAYS: usize = 25;
const SLOPE_DAYS: usize = 25;
/// Bias, slope, efficiency.
const FACTOR_WEIGHTS: [f64; 3] = [0.3, 0.3, 0.4];
const STD_FLOOR: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientHistory,
    BelowMa20,
    SharpDrop,
    Drawdown,
    Overheated,
    WeakTrend,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendScore {
    pub score: f64,
    pub annual_return: f64,
    pub r2: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Factors {
    pub bias: f64,
    pub slope: f64,
    pub efficiency: f64,
}

impl Factors {
    fn as_array(&self) -> [f64; 3] {
        [self.bias, self.slope, self.efficiency]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EtfRank {
    pub ts_code: String,
    /// Latest stored session.
    pub trade_date: String,
    pub trend: Option<TrendScore>,
    pub selected: bool,
    pub reject_reason: Option<RejectReason>,
    pub factors: Option<Factors>,
    /// Pool-relative blend of `factors`; None when history is too short.
    pub factor_score: Option<f64>,
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

/// `close * adj / latest adj`, so the latest session keeps its quoted price.
pub fn forward_adjusted_closes(bars: &[EtfDailyRow]) -> Vec<f64> {
    let latest = bars
        .last()
        .map(|b| b.adj_factor)
        .filter(|a| *a > 0.0 && a.is_finite())
        .unwrap_or(1.0);
    bars.iter().map(|b| b.close * b.adj_factor / latest).collect()
}

fn tail(values: &[f64], n: usize) -> &[f64] {
    &values[values.len().saturating_sub(n)..]
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

// ---------------------------------------------------------------------------
// Regression
// ---------------------------------------------------------------------------

struct Fit {
    slope: f64,
    intercept: f64,
}

/// Least squares line minimising `sum(w * residual^2)`.
fn weighted_fit(x: &[f64], y: &[f64], w: &[f64]) -> Option<Fit> {
    let sw: f64 = w.iter().sum();
    let mx = x.iter().zip(w).map(|(x, w)| x * w).sum::<f64>() / sw;
    let my = y.iter().zip(w).map(|(y, w)| y * w).sum::<f64>() / sw;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for ((x, y), w) in x.iter().zip(y).zip(w) {
        sxx += w * (x - mx) * (x - mx);
        sxy += w * (x - mx) * (y - my);
    }
    if sxx == 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    Some(Fit {
        slope,
        intercept: my - slope * mx,
    })
}

/// Weighted coefficient of determination; 0 for a flat series.
fn weighted_r2(fit: &Fit, x: &[f64], y: &[f64], w: &[f64]) -> f64 {
    let my = y.iter().zip(w).map(|(y, w)| y * w).sum::<f64>() / w.iter().sum::<f64>();
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for ((x, y), w) in x.iter().zip(y).zip(w) {
        let predicted = fit.slope * x + fit.intercept;
        ss_res += w * (y - predicted).powi(2);
        ss_tot += w * (y - my).powi(2);
    }
    if ss_tot == 0.0 {
        0.0
    } else {
        1.0 - ss_res / ss_tot
    }
}

// ---------------------------------------------------------------------------
// Trend score
// ---------------------------------------------------------------------------

/// Hard screen shared by both scores: price at or above its MA20, no
/// single-session drop beyond 3%, and within 10% of the 25-session high.
pub fn risk_check(prices: &[f64]) -> Result<(), RejectReason> {
    if prices.len() < RISK_HIGH_DAYS {
        return Err(RejectReason::InsufficientHistory);
    }
    let current = prices[prices.len() - 1];
    let prev = prices[prices.len() - 2];
    if current < mean(tail(prices, RISK_MA_DAYS)) {
        return Err(RejectReason::BelowMa20);
    }
    if current / prev - 1.0 < MAX_DAILY_DROP {
        return Err(RejectReason::SharpDrop);
    }
    let high = tail(prices, RISK_HIGH_DAYS).iter().copied().fold(f64::MIN, f64::max);
    if current / high - 1.0 < MAX_DRAWDOWN {
        return Err(RejectReason::Drawdown);
    }
    Ok(())
}

/// Log-price regression over the last `days` sessions with weights rising
/// linearly from 1 to 2 towards the latest session. A falling trend scores
/// its (negative) annual return; a rising one is scaled by R².
pub fn wls_trend(prices: &[f64], days: usize) -> Option<TrendScore> {
    if days < 2 || prices.len() < days {
        return None;
    }
    let window = tail(prices, days);
    if window.iter().any(|p| *p <= 0.0 || !p.is_finite()) {
        return None;
    }
    let y: Vec<f64> = window.iter().map(|p| p.ln()).collect();
    let x: Vec<f64> = (0..days).map(|i| i as f64).collect();
    let w: Vec<f64> = (0..days).map(|i| 1.0 + i as f64 / (days - 1) as f64).collect();
    // Fit weights apply to the residual before squaring.
    let w_fit: Vec<f64> = w.iter().map(|w| w * w).collect();

    let fit = weighted_fit(&x, &y, &w_fit)?;
    let r2 = weighted_r2(&fit, &x, &y, &w);
    let annual_return = (fit.slope * TRADING_DAYS_PER_YEAR).exp() - 1.0;
    let score = if annual_return < 0.0 {
        annual_return
    } else {
        annual_return * r2
    };
    Some(TrendScore {
        score,
        annual_return,
        r2,
    })
}

/// Selection for the trend strategy: the risk screen first, then the score band.
pub fn trend_verdict(prices: &[f64], trend: Option<&TrendScore>) -> Result<(), RejectReason> {
    risk_check(prices)?;
    match trend {
        None => Err(RejectReason::InsufficientHistory),
        Some(t) if t.score > OVERHEATED_SCORE => Err(RejectReason::Overheated),
        Some(t) if t.score <= 0.0 => Err(RejectReason::WeakTrend),
        Some(_) => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Factor score
// ---------------------------------------------------------------------------

/// Bias momentum, R²-weighted slope and efficiency momentum.
///
/// `closes` are the forward-adjusted closes aligned with `bars`; the
/// efficiency pivot uses the quoted OHLC of the same sessions.
pub fn factor_scores(bars: &[EtfDailyRow], closes: &[f64]) -> Option<Factors> {
    let n = closes.len();
    if n != bars.len() || n < MOMENTUM_DAYS + BIAS_MA_DAYS {
        return None;
    }

    // Close over its trailing mean, rebased to the first of the last MOMENTUM_DAYS.
    let bias: Vec<f64> = (n - MOMENTUM_DAYS..n)
        .map(|j| closes[j] / mean(&closes[(j + 1).saturating_sub(BIAS_MA_DAYS)..=j]))
        .collect();
    let base = *bias.first()?;
    if base == 0.0 || !base.is_finite() {
        return None;
    }
    let y: Vec<f64> = bias.iter().map(|b| b / base).collect();
    let x: Vec<f64> = (0..MOMENTUM_DAYS).map(|i| i as f64).collect();
    let ones = vec![1.0; MOMENTUM_DAYS];
    let bias_score = weighted_fit(&x, &y, &ones)?.slope * 10_000.0;

    let recent = tail(closes, SLOPE_DAYS);
    let start = recent[0];
    if start == 0.0 {
        return None;
    }
    let y: Vec<f64> = recent.iter().map(|p| p / start).collect();
    let x: Vec<f64> = (1..=SLOPE_DAYS).map(|i| i as f64).collect();
    let ones = vec![1.0; SLOPE_DAYS];
    let fit = weighted_fit(&x, &y, &ones)?;
    let slope_score = 10_000.0 * fit.slope * weighted_r2(&fit, &x, &y, &ones);

    let pivots: Vec<f64> = bars[n - MOMENTUM_DAYS..]
        .iter()
        .map(|b| (b.open + b.high + b.low + b.close) / 4.0)
        .collect();
    if pivots.iter().any(|p| *p <= 0.0) {
        return None;
    }
    let logs: Vec<f64> = pivots.iter().map(|p| p.ln()).collect();
    let (first, last) = (logs[0], logs[logs.len() - 1]);
    let momentum = 100.0 * (last - first);
    let volatility: f64 = logs.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    let efficiency_ratio = if volatility > 0.0 {
        (last - first).abs() / volatility
    } else {
        0.0
    };

    let factors = Factors {
        bias: bias_score,
        slope: slope_score,
        efficiency: momentum * efficiency_ratio,
    };
    factors.as_array().iter().all(|v| v.is_finite()).then_some(factors)
}

/// Per-factor z-scores across the pool (population deviation), blended 0.3 /
/// 0.3 / 0.4.
pub fn blend_factors(factors: &[Factors]) -> Vec<f64> {
    if factors.is_empty() {
        return Vec::new();
    }
    let rows: Vec<[f64; 3]> = factors.iter().map(Factors::as_array).collect();
    let mut means = [0.0; 3];
    let mut stds = [0.0; 3];
    for k in 0..3 {
        let column: Vec<f64> = rows.iter().map(|r| r[k]).collect();
        means[k] = mean(&column);
        let variance = column.iter().map(|v| (v - means[k]).powi(2)).sum::<f64>() / column.len() as f64;
        stds[k] = variance.sqrt() + STD_FLOOR;
    }
    rows.iter()
        .map(|r| (0..3).map(|k| FACTOR_WEIGHTS[k] * (r[k] - means[k]) / stds[k]).sum::<f64>())
        .collect()
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Scores every fund with stored bars, ordered by trend score (highest
/// first, unscored last). `series` must be in ascending date order.
pub fn rank_etfs(series: Vec<(String, Vec<EtfDailyRow>)>) -> Vec<EtfRank> {
    let mut ranks: Vec<EtfRank> = series
        .into_iter()
        .filter_map(|(code, bars)| {
            let latest = bars.last()?.trade_date.clone();
            let closes = forward_adjusted_closes(&bars);
            let trend = wls_trend(&closes, TREND_DAYS);
            let verdict = trend_verdict(&closes, trend.as_ref());
            Some(EtfRank {
                ts_code: code,
                trade_date: latest,
                trend,
                selected: verdict.is_ok(),
                reject_reason: verdict.err(),
                factors: factor_scores(&bars, &closes),
                factor_score: None,
            })
        })
        .collect();

    let scored: Vec<(usize, Factors)> = ranks
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.factors.map(|f| (i, f)))
        .collect();
    let blended = blend_factors(&scored.iter().map(|(_, f)| *f).collect::<Vec<_>>());
    for ((i, _), score) in scored.iter().zip(blended) {
        ranks[*i].factor_score = Some(score);
    }

    ranks.sort_by(|a, b| match (&a.trend, &b.trend) {
        (Some(a), Some(b)) => b.score.total_cmp(&a.score),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars_from(closes: &[f64]) -> Vec<EtfDailyRow> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| EtfDailyRow {
                ts_code: "510300.SH".to_string(),
                trade_date: format!("2024{:02}{:02}", 1 + i / 28, 1 + i % 28),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                vol: 1_000.0,
                adj_factor: 1.0,
            })
            .collect()
    }

    fn compounding(start: f64, daily: f64, n: usize) -> Vec<f64> {
        (0..n).map(|t| start * (daily * t as f64).exp()).collect()
    }

    fn close_to(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn forward_adjustment_rebases_to_latest_factor() {
        let mut bars = bars_from(&[10.0, 11.0, 12.0]);
        bars[2].adj_factor = 2.0;
        assert_eq!(forward_adjusted_closes(&bars), vec![5.0, 5.5, 12.0]);
    }

    #[test]
    fn exact_exponential_trend_has_unit_r2() {
        let t = wls_trend(&compounding(100.0, 0.002, 30), TREND_DAYS).unwrap();
        assert!(close_to(t.r2, 1.0));
        assert!(close_to(t.annual_return, 0.5f64.exp() - 1.0));
        assert!(close_to(t.score, t.annual_return));
    }

    #[test]
    fn noisy_rise_is_scaled_by_r2_and_falls_keep_raw_return() {
        let noisy: Vec<f64> = compounding(100.0, 0.002, 25)
            .iter()
            .enumerate()
            .map(|(i, p)| if i % 2 == 0 { p * 1.01 } else { p * 0.99 })
            .collect();
        let t = wls_trend(&noisy, TREND_DAYS).unwrap();
        assert!(t.r2 > 0.0 && t.r2 < 1.0);
        assert!(close_to(t.score, t.annual_return * t.r2));

        let falling = wls_trend(&compounding(100.0, -0.002, 25), TREND_DAYS).unwrap();
        assert!(falling.annual_return < 0.0);
        assert_eq!(falling.score, falling.annual_return);

        assert!(wls_trend(&compounding(100.0, 0.002, 24), TREND_DAYS).is_none());
    }

    #[test]
    fn later_sessions_weigh_more_in_the_fit() {
        // Flat for 20 sessions, then a 5-session climb: the weighted slope is
        // steeper than an equal-weight fit of the same points.
        let mut prices = vec![100.0; 20];
        prices.extend((1..=5).map(|i| 100.0 * (0.01 * i as f64).exp()));
        let y: Vec<f64> = prices.iter().map(|p: &f64| p.ln()).collect();
        let x: Vec<f64> = (0..25).map(|i| i as f64).collect();
        let equal = weighted_fit(&x, &y, &vec![1.0; 25]).unwrap();
        let t = wls_trend(&prices, TREND_DAYS).unwrap();
        assert!(t.annual_return > (equal.slope * TRADING_DAYS_PER_YEAR).exp() - 1.0);
    }

    #[test]
    fn risk_screen_cutoffs() {
        assert_eq!(risk_check(&[100.0; 24]), Err(RejectReason::InsufficientHistory));
        assert_eq!(risk_check(&[100.0; 25]), Ok(()));

        let mut below: Vec<f64> = (0..25).map(|i| 100.0 + i as f64).collect();
        below.push(110.0);
        assert_eq!(risk_check(&below), Err(RejectReason::BelowMa20));

        let mut drop: Vec<f64> = (0..24).map(|i| 100.0 + i as f64).collect();
        drop.push(123.0 * 0.96);
        assert_eq!(risk_check(&drop), Err(RejectReason::SharpDrop));

        // Spike three sessions before the MA window: price sits on its MA20
        // but 13% below the 25-session high.
        let mut drawdown = vec![100.0; 25];
        drawdown[2] = 115.0;
        assert_eq!(risk_check(&drawdown), Err(RejectReason::Drawdown));
    }

    #[test]
    fn verdict_bands() {
        let steady = compounding(100.0, 0.002, 30);
        let t = wls_trend(&steady, TREND_DAYS);
        assert_eq!(trend_verdict(&steady, t.as_ref()), Ok(()));

        let melt_up = compounding(100.0, 0.01, 30);
        let t = wls_trend(&melt_up, TREND_DAYS);
        assert_eq!(trend_verdict(&melt_up, t.as_ref()), Err(RejectReason::Overheated));

        let flat = vec![100.0; 30];
        let t = wls_trend(&flat, TREND_DAYS);
        assert_eq!(trend_verdict(&flat, t.as_ref()), Err(RejectReason::WeakTrend));
    }

    #[test]
    fn steady_climb_is_fully_efficient() {
        let closes = compounding(10.0, 0.01, 45);
        let bars = bars_from(&closes);
        let f = factor_scores(&bars, &closes).unwrap();
        // 24 steps of 1% log growth, no back-and-forth.
        assert!(close_to(f.efficiency, 100.0 * 24.0 * 0.01));
        assert!(f.slope > 0.0);
        // Constant growth holds the price a fixed ratio above its MA20.
        assert!(f.bias.abs() < 1e-6);

        assert!(factor_scores(&bars[1..], &closes[1..]).is_none());
    }

    #[test]
    fn choppy_path_lowers_efficiency() {
        let closes: Vec<f64> = compounding(10.0, 0.01, 45)
            .iter()
            .enumerate()
            .map(|(i, p)| if i % 2 == 0 { p * 1.02 } else { *p })
            .collect();
        let bars = bars_from(&closes);
        let f = factor_scores(&bars, &closes).unwrap();
        assert!(f.efficiency > 0.0);
        assert!(f.efficiency < 100.0 * 24.0 * 0.01);
    }

    #[test]
    fn blend_standardises_each_factor() {
        let f = |bias, slope, efficiency| Factors { bias, slope, efficiency };
        let scores = blend_factors(&[f(1.0, 1.0, 1.0), f(3.0, 3.0, 3.0)]);
        assert!(close_to(scores[0], -1.0));
        assert!(close_to(scores[1], 1.0));

        // Constant factors contribute nothing; only efficiency separates these.
        let scores = blend_factors(&[f(5.0, 2.0, 10.0), f(5.0, 2.0, -10.0)]);
        assert!(close_to(scores[0], 0.4));
        assert!(close_to(scores[1], -0.4));
    }

    #[test]
    fn ranking_orders_by_trend_and_blends_only_full_histories() {
        let strong = bars_from(&compounding(10.0, 0.004, 50));
        let mild = bars_from(&compounding(10.0, 0.001, 50));
        let short = bars_from(&compounding(10.0, 0.003, 30));
        let ranks = rank_etfs(vec![
            ("512100.SH".to_string(), mild),
            ("159915.SZ".to_string(), short),
            ("510300.SH".to_string(), strong),
            ("588000.SH".to_string(), Vec::new()),
        ]);

        let order: Vec<&str> = ranks.iter().map(|r| r.ts_code.as_str()).collect();
        assert_eq!(order, vec!["510300.SH", "159915.SZ", "512100.SH"]);
        assert!(ranks.iter().all(|r| r.selected));
        assert!(ranks[1].factor_score.is_none());
        let strong_b = ranks[0].factor_score.unwrap();
        let mild_b = ranks[2].factor_score.unwrap();
        assert!(strong_b > mild_b);
    }
}
