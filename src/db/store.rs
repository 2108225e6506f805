use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;

use crate::db::models::{BreadthRow, EtfDailyRow, FuturesHoldingDbRow, SectorBreadthRow, WatermarkRow};
use crate::error::{AppError, Result};
use crate::types::{
    fmt_trade_date, parse_trade_date, BreadthRecord, Dataset, EtfBar, FuturesHolding, SectorBreadthRecord,
};

/// Key used by datasets tracked as a single unit (sector, futures).
pub const WHOLE_DATASET_KEY: &str = "all";

const MIN_DATE: &str = "00000000";
const MAX_DATE: &str = "99999999";

// ---------------------------------------------------------------------------
// Table layouts
// ---------------------------------------------------------------------------

struct TableLayout {
    table: &'static str,
    /// Column scoping watermarks and full-rebuild deletes; None = whole table.
    key_column: Option<&'static str>,
    /// Primary key columns. Cannot be added to an existing table.
    primary_key: &'static [&'static str],
    /// Columns added in place on older databases, with their declarations.
    additive: &'static [(&'static str, &'static str)],
}

const BREADTH: TableLayout = TableLayout {
    table: "market_breadth",
    key_column: Some("index_code"),
    primary_key: &["trade_date", "index_code"],
    additive: &[
        ("crowding_index", "REAL NOT NULL DEFAULT 0.0"),
        ("pct_turnover_lt_3", "REAL NOT NULL DEFAULT 0.0"),
        ("pct_turnover_gt_5", "REAL NOT NULL DEFAULT 0.0"),
    ],
};

const SECTOR: TableLayout = TableLayout {
    table: "sector_breadth",
    key_column: None,
    primary_key: &["trade_date", "sector_name", "level"],
    additive: &[],
};

const ETF: TableLayout = TableLayout {
    table: "etf_daily",
    key_column: Some("ts_code"),
    primary_key: &["ts_code", "trade_date"],
    additive: &[("adj_factor", "REAL NOT NULL DEFAULT 1.0")],
};

const FUTURES: TableLayout = TableLayout {
    table: "futures_holdings",
    key_column: None,
    primary_key: &["trade_date", "variety", "symbol"],
    additive: &[("change_net", "INTEGER NOT NULL DEFAULT 0")],
};

const LAYOUTS: [&TableLayout; 4] = [&BREADTH, &SECTOR, &ETF, &FUTURES];

fn layout(dataset: Dataset) -> &'static TableLayout {
    match dataset {
        Dataset::Breadth => &BREADTH,
        Dataset::Sector => &SECTOR,
        Dataset::Etf => &ETF,
        Dataset::Futures => &FUTURES,
    }
}

fn bounds(start: Option<NaiveDate>, end: Option<NaiveDate>) -> (String, String) {
    (
        start.map(fmt_trade_date).unwrap_or_else(|| MIN_DATE.to_string()),
        end.map(fmt_trade_date).unwrap_or_else(|| MAX_DATE.to_string()),
    )
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Idempotent upsert store. Every write is keyed by the table's primary key
/// and replaces the existing row; batches commit in one transaction each.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(opts).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection in-memory database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let store = Self::unmigrated_in_memory().await?;
        store.migrate().await?;
        Ok(store)
    }

    #[cfg(test)]
    async fn unmigrated_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        self.ensure_columns().await
    }

    /// Add missing indicator columns; fail when a key column is absent.
    async fn ensure_columns(&self) -> Result<()> {
        for layout in LAYOUTS {
            let info = sqlx::query(&format!("PRAGMA table_info({})", layout.table))
                .fetch_all(&self.pool)
                .await?;
            let mut columns = HashSet::new();
            let mut pk_columns = HashSet::new();
            for row in &info {
                let name: String = row.try_get("name")?;
                let pk: i64 = row.try_get("pk")?;
                if pk > 0 {
                    pk_columns.insert(name.clone());
                }
                columns.insert(name);
            }

            if let Some(missing) = layout.primary_key.iter().find(|c| !pk_columns.contains(**c)) {
                return Err(AppError::SchemaMismatch(format!(
                    "{}: column '{missing}' is not part of the primary key ({}); rebuild the table",
                    layout.table,
                    layout.primary_key.join(", ")
                )));
            }

            for (column, decl) in layout.additive {
                if columns.contains(*column) {
                    continue;
                }
                sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {column} {decl}", layout.table))
                    .execute(&self.pool)
                    .await?;
                info!(table = layout.table, column = *column, "Added column to existing table");
            }
        }
        Ok(())
    }

    /// Latest persisted trade date for a dataset key.
    pub async fn latest_date(&self, dataset: Dataset, key: &str) -> Result<Option<NaiveDate>> {
        let layout = layout(dataset);
        let latest: Option<String> = match layout.key_column {
            Some(col) => {
                sqlx::query_scalar(&format!("SELECT MAX(trade_date) FROM {} WHERE {col} = ?", layout.table))
                    .bind(key)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar(&format!("SELECT MAX(trade_date) FROM {}", layout.table))
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        latest
            .map(|s| {
                parse_trade_date(&s).map_err(|_| {
                    AppError::SchemaMismatch(format!("{}: unreadable trade_date '{s}'", layout.table))
                })
            })
            .transpose()
    }

    /// Delete every row of a dataset key ahead of a full rebuild.
    pub async fn clear(&self, dataset: Dataset, key: &str) -> Result<u64> {
        let layout = layout(dataset);
        let result = match layout.key_column {
            Some(col) => {
                sqlx::query(&format!("DELETE FROM {} WHERE {col} = ?", layout.table))
                    .bind(key)
                    .execute(&self.pool)
                    .await?
            }
            None => sqlx::query(&format!("DELETE FROM {}", layout.table)).execute(&self.pool).await?,
        };
        info!(dataset = %dataset, key, rows = result.rows_affected(), "Cleared rows for full rebuild");
        Ok(result.rows_affected())
    }

    pub async fn upsert_breadth(&self, records: &[BreadthRecord]) -> Result<u64> {
        for r in records {
            r.validate()?;
        }
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO market_breadth (
                    trade_date, index_code, index_name, close,
                    pct_above_ma20, pct_down_3days, pct_turnover_lt_3, pct_turnover_gt_5,
                    crowding_index
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(trade_date, index_code) DO UPDATE SET
                    index_name = excluded.index_name,
                    close = excluded.close,
                    pct_above_ma20 = excluded.pct_above_ma20,
                    pct_down_3days = excluded.pct_down_3days,
                    pct_turnover_lt_3 = excluded.pct_turnover_lt_3,
                    pct_turnover_gt_5 = excluded.pct_turnover_gt_5,
                    crowding_index = excluded.crowding_index
                "#,
            )
            .bind(fmt_trade_date(r.trade_date))
            .bind(&r.index_code)
            .bind(&r.index_name)
            .bind(r.close)
            .bind(r.pct_above_ma20)
            .bind(r.pct_down_3days)
            .bind(r.pct_turnover_lt_3)
            .bind(r.pct_turnover_gt_5)
            .bind(r.crowding_index)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(records.len() as u64)
    }

    pub async fn upsert_sector_breadth(&self, records: &[SectorBreadthRecord]) -> Result<u64> {
        for r in records {
            r.validate()?;
        }
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO sector_breadth (trade_date, sector_name, level, pct_above_ma20)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(trade_date, sector_name, level) DO UPDATE SET
                    pct_above_ma20 = excluded.pct_above_ma20
                "#,
            )
            .bind(fmt_trade_date(r.trade_date))
            .bind(&r.sector_name)
            .bind(r.level.to_string())
            .bind(r.pct_above_ma20)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(records.len() as u64)
    }

    pub async fn upsert_etf_bars(&self, bars: &[EtfBar]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        for b in bars {
            sqlx::query(
                r#"
                INSERT INTO etf_daily (ts_code, trade_date, open, high, low, close, vol, adj_factor)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(ts_code, trade_date) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    vol = excluded.vol,
                    adj_factor = excluded.adj_factor
                "#,
            )
            .bind(&b.ts_code)
            .bind(fmt_trade_date(b.trade_date))
            .bind(b.open)
            .bind(b.high)
            .bind(b.low)
            .bind(b.close)
            .bind(b.vol)
            .bind(b.adj_factor)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(bars.len() as u64)
    }

    pub async fn upsert_futures_holdings(&self, holdings: &[FuturesHolding]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        for h in holdings {
            sqlx::query(
                r#"
                INSERT INTO futures_holdings (trade_date, variety, symbol, long_hld, short_hld, net, change_net)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(trade_date, variety, symbol) DO UPDATE SET
                    long_hld = excluded.long_hld,
                    short_hld = excluded.short_hld,
                    net = excluded.net,
                    change_net = excluded.change_net
                "#,
            )
            .bind(fmt_trade_date(h.trade_date))
            .bind(&h.variety)
            .bind(&h.symbol)
            .bind(h.long_hld)
            .bind(h.short_hld)
            .bind(h.net)
            .bind(h.change_net)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(holdings.len() as u64)
    }

    /// Net position per contract on one date.
    pub async fn futures_net_on(&self, trade_date: NaiveDate) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT symbol, net FROM futures_holdings WHERE trade_date = ?")
            .bind(fmt_trade_date(trade_date))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Ok((r.try_get::<String, _>("symbol")?, r.try_get::<i64, _>("net")?)))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Read-only queries
    // -----------------------------------------------------------------------

    pub async fn breadth_series(
        &self,
        index_code: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<BreadthRow>> {
        let (start, end) = bounds(start, end);
        let rows = sqlx::query_as::<_, BreadthRow>(
            r#"
            SELECT trade_date, index_code, index_name, close,
                   pct_above_ma20, pct_down_3days, pct_turnover_lt_3, pct_turnover_gt_5,
                   crowding_index
            FROM market_breadth
            WHERE index_code = ? AND trade_date >= ? AND trade_date <= ?
            ORDER BY trade_date
            "#,
        )
        .bind(index_code)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn sector_series(
        &self,
        sector: Option<&str>,
        level: Option<&str>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<SectorBreadthRow>> {
        let (start, end) = bounds(start, end);
        let rows = sqlx::query_as::<_, SectorBreadthRow>(
            r#"
            SELECT trade_date, sector_name, level, pct_above_ma20
            FROM sector_breadth
            WHERE (?1 IS NULL OR sector_name = ?1)
              AND (?2 IS NULL OR level = ?2)
              AND trade_date >= ?3 AND trade_date <= ?4
            ORDER BY trade_date, level, sector_name
            "#,
        )
        .bind(sector)
        .bind(level)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn etf_series(
        &self,
        ts_code: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<EtfDailyRow>> {
        let (start, end) = bounds(start, end);
        let rows = sqlx::query_as::<_, EtfDailyRow>(
            r#"
            SELECT ts_code, trade_date, open, high, low, close, vol, adj_factor
            FROM etf_daily
            WHERE ts_code = ? AND trade_date >= ? AND trade_date <= ?
            ORDER BY trade_date
            "#,
        )
        .bind(ts_code)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn futures_series(
        &self,
        variety: Option<&str>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<FuturesHoldingDbRow>> {
        let (start, end) = bounds(start, end);
        let rows = sqlx::query_as::<_, FuturesHoldingDbRow>(
            r#"
            SELECT trade_date, variety, symbol, long_hld, short_hld, net, change_net
            FROM futures_holdings
            WHERE (?1 IS NULL OR variety = ?1)
              AND trade_date >= ?2 AND trade_date <= ?3
            ORDER BY trade_date, variety, symbol
            "#,
        )
        .bind(variety)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn watermarks(&self) -> Result<Vec<WatermarkRow>> {
        let rows = sqlx::query_as::<_, WatermarkRow>(
            r#"
            SELECT dataset, key, latest_date FROM (
                SELECT 'breadth' AS dataset, index_code AS key, MAX(trade_date) AS latest_date
                FROM market_breadth GROUP BY index_code
                UNION ALL
                SELECT 'sector', 'all', MAX(trade_date) FROM sector_breadth
                UNION ALL
                SELECT 'etf', ts_code, MAX(trade_date) FROM etf_daily GROUP BY ts_code
                UNION ALL
                SELECT 'futures', 'all', MAX(trade_date) FROM futures_holdings
            )
            WHERE latest_date IS NOT NULL
            ORDER BY dataset, key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[cfg(test)]
    pub async fn count_rows(&self, dataset: Dataset) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", layout(dataset).table))
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SectorLevel;
    use crate::vendor::fake::date;

    fn breadth(d: NaiveDate, code: &str, above: f64) -> BreadthRecord {
        BreadthRecord {
            trade_date: d,
            index_code: code.to_string(),
            index_name: "沪深300".to_string(),
            close: 3500.0,
            pct_above_ma20: above,
            pct_down_3days: 12.5,
            pct_turnover_lt_3: 60.0,
            pct_turnover_gt_5: 10.0,
            crowding_index: 41.2,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_instead_of_duplicating() {
        let store = Store::in_memory().await.unwrap();
        let d = date(2024, 3, 1);
        store.upsert_breadth(&[breadth(d, "000300.SH", 40.0)]).await.unwrap();
        store.upsert_breadth(&[breadth(d, "000300.SH", 55.0)]).await.unwrap();

        assert_eq!(store.count_rows(Dataset::Breadth).await.unwrap(), 1);
        let rows = store.breadth_series("000300.SH", None, None).await.unwrap();
        assert_eq!(rows[0].pct_above_ma20, 55.0);
        assert_eq!(rows[0].trade_date, "20240301");
    }

    #[tokio::test]
    async fn invalid_records_are_rejected() {
        let store = Store::in_memory().await.unwrap();
        let err = store
            .upsert_breadth(&[breadth(date(2024, 3, 1), "000300.SH", 140.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidRecord(_)));
        assert_eq!(store.count_rows(Dataset::Breadth).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn latest_date_and_clear_are_scoped_by_key() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_breadth(&[
                breadth(date(2024, 3, 1), "000300.SH", 40.0),
                breadth(date(2024, 3, 4), "000300.SH", 41.0),
                breadth(date(2024, 3, 5), "399006.SZ", 42.0),
            ])
            .await
            .unwrap();

        assert_eq!(
            store.latest_date(Dataset::Breadth, "000300.SH").await.unwrap(),
            Some(date(2024, 3, 4))
        );
        assert_eq!(store.latest_date(Dataset::Breadth, "000905.SH").await.unwrap(), None);

        assert_eq!(store.clear(Dataset::Breadth, "000300.SH").await.unwrap(), 2);
        assert_eq!(store.count_rows(Dataset::Breadth).await.unwrap(), 1);

        let marks = store.watermarks().await.unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].key, "399006.SZ");
        assert_eq!(marks[0].latest_date, "20240305");
    }

    #[tokio::test]
    async fn older_breadth_table_gains_indicator_columns() {
        let store = Store::unmigrated_in_memory().await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE market_breadth (
                trade_date TEXT NOT NULL,
                index_code TEXT NOT NULL,
                index_name TEXT NOT NULL,
                close REAL NOT NULL,
                pct_above_ma20 REAL NOT NULL,
                pct_down_3days REAL NOT NULL,
                PRIMARY KEY (trade_date, index_code)
            )
            "#,
        )
        .execute(&store.pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO market_breadth VALUES ('20230103', '000300.SH', '沪深300', 3887.9, 35.0, 8.0)")
            .execute(&store.pool)
            .await
            .unwrap();

        store.migrate().await.unwrap();

        let rows = store.breadth_series("000300.SH", None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pct_above_ma20, 35.0);
        assert_eq!(rows[0].crowding_index, 0.0);
        assert_eq!(rows[0].pct_turnover_gt_5, 0.0);
    }

    #[tokio::test]
    async fn sector_table_keyed_without_level_is_a_schema_mismatch() {
        let store = Store::unmigrated_in_memory().await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE sector_breadth (
                trade_date TEXT NOT NULL,
                sector_name TEXT NOT NULL,
                level TEXT,
                pct_above_ma20 REAL,
                PRIMARY KEY (trade_date, sector_name)
            )
            "#,
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store.migrate().await.unwrap_err();
        assert!(matches!(err, AppError::SchemaMismatch(_)), "got {err}");
    }

    #[tokio::test]
    async fn sector_and_futures_queries_filter_optionally() {
        let store = Store::in_memory().await.unwrap();
        let d = date(2024, 3, 1);
        store
            .upsert_sector_breadth(&[
                SectorBreadthRecord {
                    trade_date: d,
                    sector_name: "银行".to_string(),
                    level: SectorLevel::Level1,
                    pct_above_ma20: 70.0,
                },
                SectorBreadthRecord {
                    trade_date: d,
                    sector_name: "城商行".to_string(),
                    level: SectorLevel::Level2,
                    pct_above_ma20: 80.0,
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.sector_series(None, None, None, None).await.unwrap().len(), 2);
        let l2 = store.sector_series(None, Some("level2"), None, None).await.unwrap();
        assert_eq!(l2.len(), 1);
        assert_eq!(l2[0].sector_name, "城商行");

        store
            .upsert_futures_holdings(&[FuturesHolding {
                trade_date: d,
                variety: "IF".to_string(),
                symbol: "IF2403".to_string(),
                long_hld: 100,
                short_hld: 350,
                net: -250,
                change_net: -20,
            }])
            .await
            .unwrap();
        assert_eq!(store.futures_series(Some("IF"), None, None).await.unwrap().len(), 1);
        assert!(store.futures_series(Some("IC"), None, None).await.unwrap().is_empty());
        assert_eq!(store.futures_net_on(d).await.unwrap().get("IF2403"), Some(&-250));
    }
}
