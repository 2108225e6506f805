use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::api::health::{DatasetHealthSnapshot, HealthState};
use crate::api::latency::{LatencySnapshot, LatencyStats};
use crate::db::models::{BreadthRow, EtfDailyRow, FuturesHoldingDbRow, SectorBreadthRow, WatermarkRow};
use crate::db::Store;
use crate::error::AppError;
use crate::strategy::{rank_etfs, EtfRank};
use crate::types::{parse_trade_date, SectorLevel};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    /// Funds scored by `/etf/rank`.
    pub etf_pool: Arc<Vec<String>>,
}

/// Read-only: there are no write routes.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/breadth", get(get_breadth))
        .route("/sector-breadth", get(get_sector_breadth))
        .route("/etf/rank", get(get_etf_rank))
        .route("/etf/:code", get(get_etf))
        .route("/futures", get(get_futures))
        .route("/watermarks", get(get_watermarks))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

/// Inclusive `YYYYMMDD` bounds shared by every series query.
#[derive(Deserialize, Default)]
pub struct DateRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl DateRange {
    fn parse(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>), AppError> {
        let start = self.start.as_deref().map(parse_trade_date).transpose()?;
        let end = self.end.as_deref().map(parse_trade_date).transpose()?;
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(AppError::BadRequest(format!("start {s} is after end {e}")));
            }
        }
        Ok((start, end))
    }
}

#[derive(Deserialize)]
pub struct BreadthQuery {
    pub index: Option<String>,
    #[serde(flatten)]
    pub range: DateRange,
}

#[derive(Deserialize)]
pub struct SectorQuery {
    pub sector: Option<String>,
    pub level: Option<String>,
    #[serde(flatten)]
    pub range: DateRange,
}

#[derive(Deserialize)]
pub struct FuturesQuery {
    pub variety: Option<String>,
    #[serde(flatten)]
    pub range: DateRange,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub datasets: Vec<DatasetHealthSnapshot>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        datasets: state.health.snapshot(),
    })
}

async fn get_breadth(
    State(state): State<ApiState>,
    Query(params): Query<BreadthQuery>,
) -> Result<Json<Vec<BreadthRow>>, AppError> {
    let index = params
        .index
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("index is required".to_string()))?;
    let (start, end) = params.range.parse()?;
    Ok(Json(state.store.breadth_series(index.trim(), start, end).await?))
}

async fn get_sector_breadth(
    State(state): State<ApiState>,
    Query(params): Query<SectorQuery>,
) -> Result<Json<Vec<SectorBreadthRow>>, AppError> {
    let level = match params.level.as_deref() {
        None => None,
        Some(l) if l == SectorLevel::Level1.to_string() || l == SectorLevel::Level2.to_string() => Some(l),
        Some(other) => {
            return Err(AppError::BadRequest(format!(
                "level must be level1 or level2, got '{other}'"
            )))
        }
    };
    let (start, end) = params.range.parse()?;
    let rows = state
        .store
        .sector_series(params.sector.as_deref(), level, start, end)
        .await?;
    Ok(Json(rows))
}

async fn get_etf(
    State(state): State<ApiState>,
    Path(code): Path<String>,
    Query(range): Query<DateRange>,
) -> Result<Json<Vec<EtfDailyRow>>, AppError> {
    let (start, end) = range.parse()?;
    let rows = state.store.etf_series(&code, start, end).await?;
    if rows.is_empty() && start.is_none() && end.is_none() {
        return Err(AppError::NoData(format!("no series stored for {code}")));
    }
    Ok(Json(rows))
}

/// Every pool fund scored on its full stored history.
async fn get_etf_rank(State(state): State<ApiState>) -> Result<Json<Vec<EtfRank>>, AppError> {
    let mut series = Vec::with_capacity(state.etf_pool.len());
    for code in state.etf_pool.iter() {
        series.push((code.clone(), state.store.etf_series(code, None, None).await?));
    }
    Ok(Json(rank_etfs(series)))
}

async fn get_futures(
    State(state): State<ApiState>,
    Query(params): Query<FuturesQuery>,
) -> Result<Json<Vec<FuturesHoldingDbRow>>, AppError> {
    let (start, end) = params.range.parse()?;
    let rows = state
        .store
        .futures_series(params.variety.as_deref(), start, end)
        .await?;
    Ok(Json(rows))
}

async fn get_watermarks(State(state): State<ApiState>) -> Result<Json<Vec<WatermarkRow>>, AppError> {
    Ok(Json(state.store.watermarks().await?))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySnapshot> {
    Json(state.latency.snapshot())
}
