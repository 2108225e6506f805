use std::str::FromStr;

use chrono::NaiveDate;

use crate::error::{AppError, Result};
use crate::types::{parse_trade_date, Dataset, IndexDefinition, SyncMode};

pub const TUSHARE_API_URL: &str = "http://api.tushare.pro";

/// Exchange whose calendar defines trading dates for every dataset.
pub const CALENDAR_EXCHANGE: &str = "SSE";

/// Index resolved from the whole-exchange listing instead of weighting snapshots.
pub const WHOLE_EXCHANGE_INDEX: &str = "000001.SH";

/// Default tracked indices as `CODE:NAME`.
pub const DEFAULT_TRACKED_INDICES: &str =
    "000300.SH:沪深300,399006.SZ:创业板指,932000.CSI:中证2000,000001.SH:上证指数";

/// Default ETF pool for the momentum input series.
pub const DEFAULT_ETF_POOL: &str = "512890.SH,159949.SZ,513100.SH,518880.SH,510300.SH,\
510500.SH,159915.SZ,512100.SH,511260.SH,513050.SH";

/// Membership snapshot look-back windows in calendar days, narrow then wide.
pub const MEMBERSHIP_LOOKBACK_DAYS: [i64; 2] = [31, 180];

/// Minimum trading sessions fetched ahead of the first requested date to seed the MA.
pub const MIN_LOOKBACK_SESSIONS: usize = 20;

/// Calendar days of trade calendar requested per trading session needed (covers holidays).
pub const CALENDAR_DAYS_PER_SESSION: i64 = 2;

/// Moving-average parameters applied to adjusted closes.
pub mod moving_average {
    pub const WINDOW: usize = 20;
    pub const MIN_OBSERVATIONS: usize = 10;
}

/// Strict turnover-rate thresholds (percent).
pub mod turnover_thresholds {
    pub const LOW: f64 = 3.0;
    pub const HIGH: f64 = 5.0;
}

/// Share of the ranked universe counted as the crowded top slice.
pub const CROWDING_TOP_SHARE: f64 = 0.05;

/// Exchange code for index futures holdings.
pub const FUTURES_EXCHANGE: &str = "CFFEX";

/// SW taxonomy source for sector breadth.
pub const SECTOR_SOURCE: &str = "SW2021";

#[derive(Debug, Clone)]
pub struct Config {
    /// Vendor API token (TUSHARE_TOKEN, required)
    pub tushare_token: String,
    pub tushare_api_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Benchmarks to compute breadth for (TRACKED_INDICES, `CODE:NAME` comma-separated)
    pub tracked_indices: Vec<IndexDefinition>,
    /// First date a full rebuild covers (HISTORY_START, YYYYMMDD)
    pub history_start: NaiveDate,
    /// Securities per vendor batch call (BATCH_SIZE)
    pub batch_size: usize,
    /// Minimum spacing between any two vendor calls in milliseconds (PACING_MS)
    pub pacing_ms: u64,
    /// Concurrent batch workers sharing the pacing budget (FETCH_WORKERS)
    pub fetch_workers: usize,
    /// Largest incremental range accepted without a full rebuild (MAX_GAP_DAYS)
    pub max_gap_days: usize,
    /// Trading sessions fetched before the first requested date (LOOKBACK_SESSIONS, >= 20)
    pub lookback_sessions: usize,
    /// Dates per committed transaction (COMMIT_EVERY_DATES)
    pub commit_every_dates: usize,
    pub request_timeout_secs: u64,
    pub rate_limit_cooldown_secs: u64,
    pub transient_retries: u32,
    pub sync_interval_secs: u64,
    /// Datasets the scheduler runs (SYNC_DATASETS, comma-separated)
    pub sync_datasets: Vec<Dataset>,
    /// Mode of the first scheduled run (SYNC_MODE)
    pub startup_mode: SyncMode,
    pub listing_cache_ttl_secs: u64,
    pub etf_pool: Vec<String>,
    /// Calendar days covered by a full ETF rebuild (ETF_HISTORY_DAYS)
    pub etf_history_days: i64,
    pub futures_varieties: Vec<String>,
    /// Broker name fragment whose holdings are tracked (FUTURES_BROKER)
    pub futures_broker: String,
    /// Trading sessions covered by a full futures rebuild (FUTURES_HISTORY_SESSIONS)
    pub futures_history_sessions: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let tushare_token = std::env::var("TUSHARE_TOKEN").unwrap_or_default();
        if tushare_token.trim().is_empty() {
            return Err(AppError::Config("TUSHARE_TOKEN must be set".to_string()));
        }

        let history_start = parse_trade_date(
            &std::env::var("HISTORY_START").unwrap_or_else(|_| "20200101".to_string()),
        )
        .map_err(|_| AppError::Config("HISTORY_START must be YYYYMMDD".to_string()))?;

        let tracked_indices = parse_index_list(
            &std::env::var("TRACKED_INDICES").unwrap_or_else(|_| DEFAULT_TRACKED_INDICES.to_string()),
        )?;

        let sync_datasets = split_list(&std::env::var("SYNC_DATASETS").unwrap_or_default())
            .iter()
            .map(|s| s.parse::<Dataset>())
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tushare_token,
            tushare_api_url: std::env::var("TUSHARE_API_URL")
                .unwrap_or_else(|_| TUSHARE_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "breadth.db".to_string()),
            api_port: env_parse("API_PORT", 3000u16)?,
            tracked_indices,
            history_start,
            batch_size: env_parse("BATCH_SIZE", 50usize)?.max(1),
            pacing_ms: env_parse("PACING_MS", 300u64)?,
            fetch_workers: env_parse("FETCH_WORKERS", 4usize)?.clamp(1, 10),
            max_gap_days: env_parse("MAX_GAP_DAYS", 7usize)?,
            lookback_sessions: env_parse("LOOKBACK_SESSIONS", 25usize)?.max(MIN_LOOKBACK_SESSIONS),
            commit_every_dates: env_parse("COMMIT_EVERY_DATES", 5usize)?.max(1),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", 30u64)?,
            rate_limit_cooldown_secs: env_parse("RATE_LIMIT_COOLDOWN_SECS", 60u64)?,
            transient_retries: env_parse("TRANSIENT_RETRIES", 3u32)?,
            sync_interval_secs: env_parse("SYNC_INTERVAL_SECS", 3600u64)?,
            sync_datasets: if sync_datasets.is_empty() {
                Dataset::ALL.to_vec()
            } else {
                sync_datasets
            },
            startup_mode: std::env::var("SYNC_MODE")
                .unwrap_or_else(|_| "incremental".to_string())
                .parse::<SyncMode>()?,
            listing_cache_ttl_secs: env_parse("LISTING_CACHE_TTL_SECS", 86_400u64)?,
            etf_pool: split_list(
                &std::env::var("ETF_POOL").unwrap_or_else(|_| DEFAULT_ETF_POOL.to_string()),
            ),
            etf_history_days: env_parse("ETF_HISTORY_DAYS", 550i64)?,
            futures_varieties: split_list(
                &std::env::var("FUTURES_VARIETIES").unwrap_or_else(|_| "IF,IC,IM,IH".to_string()),
            ),
            futures_broker: std::env::var("FUTURES_BROKER").unwrap_or_else(|_| "中信".to_string()),
            futures_history_sessions: env_parse("FUTURES_HISTORY_SESSIONS", 60usize)?.max(1),
        })
    }
}

#[cfg(test)]
impl Config {
    /// Defaults with a single tracked index and no pacing.
    pub fn for_tests() -> Self {
        Self {
            tushare_token: "test-token".to_string(),
            tushare_api_url: TUSHARE_API_URL.to_string(),
            log_level: "debug".to_string(),
            db_path: ":memory:".to_string(),
            api_port: 0,
            tracked_indices: vec![IndexDefinition::new("000300.SH", "沪深300")],
            history_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            batch_size: 50,
            pacing_ms: 0,
            fetch_workers: 2,
            max_gap_days: 7,
            lookback_sessions: MIN_LOOKBACK_SESSIONS,
            commit_every_dates: 5,
            request_timeout_secs: 5,
            rate_limit_cooldown_secs: 0,
            transient_retries: 0,
            sync_interval_secs: 3600,
            sync_datasets: Dataset::ALL.to_vec(),
            startup_mode: SyncMode::Incremental,
            listing_cache_ttl_secs: 60,
            etf_pool: vec!["510300.SH".to_string()],
            etf_history_days: 90,
            futures_varieties: vec!["IF".to_string(), "IC".to_string()],
            futures_broker: "中信".to_string(),
            futures_history_sessions: 10,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw}"))),
        _ => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `CODE:NAME` pairs. A bare code uses itself as the name.
pub fn parse_index_list(raw: &str) -> Result<Vec<IndexDefinition>> {
    let indices: Vec<IndexDefinition> = split_list(raw)
        .into_iter()
        .map(|entry| match entry.split_once(':') {
            Some((code, name)) => IndexDefinition::new(code.trim(), name.trim()),
            None => IndexDefinition::new(&entry, &entry),
        })
        .collect();
    if indices.is_empty() {
        return Err(AppError::Config("TRACKED_INDICES must name at least one index".to_string()));
    }
    Ok(indices)
}
