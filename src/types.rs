use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::{CALENDAR_EXCHANGE, WHOLE_EXCHANGE_INDEX};
use crate::error::{AppError, Result};

// ---------------------------------------------------------------------------
// Trading dates
// ---------------------------------------------------------------------------

/// Vendor and storage date format.
pub const TRADE_DATE_FMT: &str = "%Y%m%d";

pub fn parse_trade_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), TRADE_DATE_FMT)
        .map_err(|_| AppError::BadRequest(format!("invalid trade date '{s}', expected YYYYMMDD")))
}

pub fn fmt_trade_date(d: NaiveDate) -> String {
    d.format(TRADE_DATE_FMT).to_string()
}

// ---------------------------------------------------------------------------
// Index definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// Every security listed on `exchange` as of the date.
    WholeExchangeListing { exchange: String },
    /// Most recent weighting snapshot on or before the date.
    WeightedMembership,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub code: String,
    pub name: String,
    pub strategy: ResolutionStrategy,
}

impl IndexDefinition {
    pub fn new(code: &str, name: &str) -> Self {
        let strategy = if code == WHOLE_EXCHANGE_INDEX {
            ResolutionStrategy::WholeExchangeListing {
                exchange: CALENDAR_EXCHANGE.to_string(),
            }
        } else {
            ResolutionStrategy::WeightedMembership
        };
        Self {
            code: code.to_string(),
            name: name.to_string(),
            strategy,
        }
    }
}

// ---------------------------------------------------------------------------
// Datasets and modes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Breadth,
    Sector,
    Etf,
    Futures,
}

impl Dataset {
    pub const ALL: [Dataset; 4] = [Dataset::Breadth, Dataset::Sector, Dataset::Etf, Dataset::Futures];
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Dataset::Breadth => "breadth",
            Dataset::Sector => "sector",
            Dataset::Etf => "etf",
            Dataset::Futures => "futures",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Dataset {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "breadth" => Ok(Dataset::Breadth),
            "sector" | "sector_breadth" => Ok(Dataset::Sector),
            "etf" => Ok(Dataset::Etf),
            "futures" => Ok(Dataset::Futures),
            other => Err(AppError::UnknownDataset(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    Full,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Full => "full",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SyncMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" => Ok(SyncMode::Incremental),
            "full" => Ok(SyncMode::Full),
            other => Err(AppError::Config(format!(
                "sync mode must be 'incremental' or 'full', got '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Merged per-security series
// ---------------------------------------------------------------------------

/// One session of a security after joining price, adjustment and turnover.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub trade_date: NaiveDate,
    pub close: f64,
    pub pct_chg: f64,
    pub adj_factor: f64,
    /// 0.0 when the vendor had no turnover row for the session.
    pub turnover_rate: f64,
}

// ---------------------------------------------------------------------------
// Derived records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BreadthRecord {
    pub trade_date: NaiveDate,
    pub index_code: String,
    pub index_name: String,
    pub close: f64,
    pub pct_above_ma20: f64,
    pub pct_down_3days: f64,
    pub pct_turnover_lt_3: f64,
    pub pct_turnover_gt_5: f64,
    pub crowding_index: f64,
}

impl BreadthRecord {
    /// Reject out-of-range or non-finite indicator values before they reach storage.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("pct_above_ma20", self.pct_above_ma20),
            ("pct_down_3days", self.pct_down_3days),
            ("pct_turnover_lt_3", self.pct_turnover_lt_3),
            ("pct_turnover_gt_5", self.pct_turnover_gt_5),
            ("crowding_index", self.crowding_index),
        ];
        for (name, v) in fields {
            check_percentage(name, v).map_err(|e| {
                AppError::InvalidRecord(format!(
                    "{} {}: {e}",
                    self.index_code,
                    fmt_trade_date(self.trade_date)
                ))
            })?;
        }
        if !self.close.is_finite() {
            return Err(AppError::InvalidRecord(format!(
                "{} {}: index close is not finite",
                self.index_code,
                fmt_trade_date(self.trade_date)
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SectorLevel {
    /// Coarse (SW level 1)
    #[serde(rename = "level1")]
    Level1,
    /// Fine (SW level 2)
    #[serde(rename = "level2")]
    Level2,
}

impl std::fmt::Display for SectorLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SectorLevel::Level1 => "level1",
            SectorLevel::Level2 => "level2",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectorBreadthRecord {
    pub trade_date: NaiveDate,
    pub sector_name: String,
    pub level: SectorLevel,
    pub pct_above_ma20: f64,
}

impl SectorBreadthRecord {
    pub fn validate(&self) -> Result<()> {
        check_percentage("pct_above_ma20", self.pct_above_ma20).map_err(|e| {
            AppError::InvalidRecord(format!(
                "{}/{} {}: {e}",
                self.sector_name,
                self.level,
                fmt_trade_date(self.trade_date)
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EtfBar {
    pub ts_code: String,
    pub trade_date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vol: f64,
    pub adj_factor: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuturesHolding {
    pub trade_date: NaiveDate,
    pub variety: String,
    pub symbol: String,
    pub long_hld: i64,
    pub short_hld: i64,
    /// long_hld - short_hld
    pub net: i64,
    /// net minus the previous session's net for the same contract
    pub change_net: i64,
}

fn check_percentage(name: &str, v: f64) -> std::result::Result<(), String> {
    if !v.is_finite() || !(0.0..=100.0).contains(&v) {
        return Err(format!("{name}={v} outside [0, 100]"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    /// No data for a legitimate query; nothing written.
    Skipped,
    /// Vendor or validation failure after retries.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitError {
    pub unit: String,
    pub outcome: UnitOutcome,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub dataset: Dataset,
    pub mode: SyncMode,
    pub dates_processed: usize,
    pub rows_written: u64,
    pub errors: Vec<UnitError>,
}

impl SyncResult {
    pub fn new(dataset: Dataset, mode: SyncMode) -> Self {
        Self {
            dataset,
            mode,
            dates_processed: 0,
            rows_written: 0,
            errors: Vec::new(),
        }
    }

    pub fn skipped(&mut self, unit: impl Into<String>, reason: impl std::fmt::Display) {
        self.errors.push(UnitError {
            unit: unit.into(),
            outcome: UnitOutcome::Skipped,
            reason: reason.to_string(),
        });
    }

    pub fn failed(&mut self, unit: impl Into<String>, reason: impl std::fmt::Display) {
        self.errors.push(UnitError {
            unit: unit.into(),
            outcome: UnitOutcome::Failed,
            reason: reason.to_string(),
        });
    }

    pub fn failed_count(&self) -> usize {
        self.errors.iter().filter(|e| e.outcome == UnitOutcome::Failed).count()
    }

    /// Work was attempted, nothing was written, and at least one unit failed.
    pub fn is_total_failure(&self) -> bool {
        self.rows_written == 0 && self.failed_count() > 0
    }

    pub fn merge(&mut self, other: SyncResult) {
        self.dates_processed += other.dates_processed;
        self.rows_written += other.rows_written;
        self.errors.extend(other.errors);
    }
}
