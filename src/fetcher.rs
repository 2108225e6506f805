use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::SeriesPoint;
use crate::vendor::MarketData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnoverMode {
    Fetch,
    Skip,
}

#[derive(Debug, Default, Clone)]
pub struct FetchStats {
    pub batches: usize,
    pub failed_batches: usize,
    /// Batches whose bulk turnover query came back empty and were refetched per security.
    pub turnover_fallbacks: usize,
    /// Per-security turnover calls that failed; those sessions default to 0.
    pub turnover_misses: usize,
    pub securities_with_data: usize,
}

#[derive(Debug, Clone)]
pub struct FailedBatch {
    pub batch: usize,
    pub codes: Vec<String>,
    pub error: String,
}

impl FailedBatch {
    /// Error text plus the securities the batch dropped from the universe.
    pub fn reason(&self) -> String {
        format!("{} (dropped {})", self.error, self.codes.join(","))
    }
}

/// Merged per-security series for a universe, plus whatever could not be fetched.
#[derive(Debug, Default)]
pub struct UniverseSeries {
    pub series: BTreeMap<String, Vec<SeriesPoint>>,
    pub failed_batches: Vec<FailedBatch>,
    pub stats: FetchStats,
}

struct BatchOutput {
    series: BTreeMap<String, Vec<SeriesPoint>>,
    turnover_fallback: bool,
    turnover_misses: usize,
}

/// Splits a universe into vendor-sized batches and fetches them on a bounded
/// worker pool. Call pacing lives in the vendor client, so every worker draws
/// from the same budget.
pub struct BatchFetcher {
    vendor: Arc<dyn MarketData>,
    batch_size: usize,
    workers: usize,
}

impl BatchFetcher {
    pub fn new(vendor: Arc<dyn MarketData>, batch_size: usize, workers: usize) -> Self {
        Self {
            vendor,
            batch_size: batch_size.max(1),
            workers: workers.max(1),
        }
    }

    /// A failed batch is logged and reported; the rest of the universe still comes back.
    pub async fn fetch_universe_series(
        &self,
        securities: &[String],
        start: NaiveDate,
        end: NaiveDate,
        turnover: TurnoverMode,
    ) -> UniverseSeries {
        let batches: Vec<Vec<String>> = securities.chunks(self.batch_size).map(|c| c.to_vec()).collect();
        let mut out = UniverseSeries::default();
        out.stats.batches = batches.len();

        let results: Vec<(usize, Vec<String>, Result<BatchOutput>)> = stream::iter(batches.into_iter().enumerate())
            .map(|(i, codes)| async move {
                let r = self.fetch_batch(&codes, start, end, turnover).await;
                (i, codes, r)
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for (i, codes, result) in results {
            match result {
                Ok(batch) => {
                    if batch.turnover_fallback {
                        out.stats.turnover_fallbacks += 1;
                    }
                    out.stats.turnover_misses += batch.turnover_misses;
                    out.series.extend(batch.series);
                }
                Err(e) => {
                    warn!(batch = i, securities = codes.len(), "Batch fetch failed, skipping: {e}");
                    out.stats.failed_batches += 1;
                    out.failed_batches.push(FailedBatch {
                        batch: i,
                        codes,
                        error: e.to_string(),
                    });
                }
            }
        }
        out.failed_batches.sort_by_key(|f| f.batch);
        out.stats.securities_with_data = out.series.len();

        info!(
            securities = securities.len(),
            with_data = out.stats.securities_with_data,
            batches = out.stats.batches,
            failed = out.stats.failed_batches,
            turnover_fallbacks = out.stats.turnover_fallbacks,
            "Universe fetch complete: {}/{} securities with data, {} failed batches",
            out.stats.securities_with_data,
            securities.len(),
            out.stats.failed_batches,
        );
        out
    }

    async fn fetch_batch(
        &self,
        codes: &[String],
        start: NaiveDate,
        end: NaiveDate,
        turnover: TurnoverMode,
    ) -> Result<BatchOutput> {
        let mut output = BatchOutput {
            series: BTreeMap::new(),
            turnover_fallback: false,
            turnover_misses: 0,
        };

        let bars = self.vendor.fetch_daily_bars(codes, start, end).await?;
        if bars.is_empty() {
            debug!(securities = codes.len(), "No bars for batch");
            return Ok(output);
        }
        let adj = self.vendor.fetch_adj_factors(codes, start, end).await?;

        let mut turnover_rows = Vec::new();
        if turnover == TurnoverMode::Fetch {
            turnover_rows = self.vendor.fetch_turnover(codes, start, end).await?;
            if turnover_rows.is_empty() && codes.len() > 1 {
                // Bulk turnover queries can silently return nothing.
                output.turnover_fallback = true;
                for code in codes {
                    match self.vendor.fetch_turnover(std::slice::from_ref(code), start, end).await {
                        Ok(rows) => turnover_rows.extend(rows),
                        Err(e) => {
                            output.turnover_misses += 1;
                            warn!(security = %code, "Turnover fetch failed, defaulting to 0: {e}");
                        }
                    }
                }
            }
        }

        let adj_by_key: HashMap<(&str, NaiveDate), f64> = adj
            .iter()
            .map(|a| ((a.ts_code.as_str(), a.trade_date), a.adj_factor))
            .collect();
        let turnover_by_key: HashMap<(&str, NaiveDate), f64> = turnover_rows
            .iter()
            .map(|t| ((t.ts_code.as_str(), t.trade_date), t.turnover_rate))
            .collect();

        for bar in &bars {
            let key = (bar.ts_code.as_str(), bar.trade_date);
            // Inner join: a session without an adjustment factor is dropped.
            let Some(&adj_factor) = adj_by_key.get(&key) else {
                continue;
            };
            output.series.entry(bar.ts_code.clone()).or_default().push(SeriesPoint {
                trade_date: bar.trade_date,
                close: bar.close,
                pct_chg: bar.pct_chg,
                adj_factor,
                turnover_rate: turnover_by_key.get(&key).copied().unwrap_or(0.0),
            });
        }
        for points in output.series.values_mut() {
            points.sort_by_key(|p| p.trade_date);
            points.dedup_by_key(|p| p.trade_date);
        }
        Ok(output)
    }
}
