//! Row types for the persisted tables. Dates are `YYYYMMDD` text.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct BreadthRow {
    pub trade_date: String,
    pub index_code: String,
    pub index_name: String,
    pub close: f64,
    pub pct_above_ma20: f64,
    pub pct_down_3days: f64,
    pub pct_turnover_lt_3: f64,
    pub pct_turnover_gt_5: f64,
    pub crowding_index: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SectorBreadthRow {
    pub trade_date: String,
    pub sector_name: String,
    pub level: String,
    pub pct_above_ma20: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct EtfDailyRow {
    pub ts_code: String,
    pub trade_date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vol: f64,
    pub adj_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct FuturesHoldingDbRow {
    pub trade_date: String,
    pub variety: String,
    pub symbol: String,
    pub long_hld: i64,
    pub short_hld: i64,
    pub net: i64,
    pub change_net: i64,
}

/// Latest persisted date for one dataset key.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct WatermarkRow {
    pub dataset: String,
    pub key: String,
    pub latest_date: String,
}
