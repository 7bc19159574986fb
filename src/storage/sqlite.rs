use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, Row};
use crate::error::{Error, Result};
use crate::interfaces::PriceStore;
use crate::types::{
    AssetClass, DailyMetric, IngestReceipt, JobRun, PriceRecord, Quote, Symbol, UpsertOutcome,
};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS symbols (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol        TEXT NOT NULL UNIQUE,
        display_name  TEXT NOT NULL,
        asset_type    TEXT NOT NULL,
        source        TEXT NOT NULL,
        is_active     INTEGER NOT NULL DEFAULT 1,
        created_at    TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS prices (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol_id     INTEGER NOT NULL REFERENCES symbols(id) ON DELETE CASCADE,
        ts            TEXT NOT NULL,
        open          REAL,
        high          REAL,
        low           REAL,
        close         REAL NOT NULL,
        volume        REAL,
        source        TEXT NOT NULL,
        inserted_at   TEXT NOT NULL,
        UNIQUE (symbol_id, ts)
    );
    CREATE INDEX IF NOT EXISTS ix_prices_ts ON prices (ts);
    CREATE TABLE IF NOT EXISTS daily_metrics (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol_id     INTEGER NOT NULL REFERENCES symbols(id) ON DELETE CASCADE,
        date          TEXT NOT NULL,
        ma_20         REAL,
        ma_50         REAL,
        rsi_14        REAL,
        volatility_20 REAL,
        daily_return  REAL,
        created_at    TEXT NOT NULL,
        UNIQUE (symbol_id, date)
    );
    CREATE TABLE IF NOT EXISTS etl_jobs (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        job_type          TEXT NOT NULL,
        status            TEXT NOT NULL,
        started_at        TEXT,
        finished_at       TEXT,
        error_message     TEXT,
        symbols_processed INTEGER,
        symbols_total     INTEGER
    );
";

/// One `rusqlite` connection behind a mutex, driven from `spawn_blocking`.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file; `:memory:` gives a private in-memory store.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(classify)?;
        conn.execute_batch(SCHEMA).map_err(classify)?;
        tracing::info!(path, "SQLite store ready");
        Ok(SqliteStore { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Storage("sqlite connection poisoned".to_string()))?;
            f(&mut guard).map_err(classify)
        })
        .await
        .map_err(|e| Error::TaskError(e.to_string()))?
    }
}

/// Busy/locked databases are transient; everything else is a hard failure.
fn classify(err: rusqlite::Error) -> Error {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            Error::StorageTransient(err.to_string())
        }
        _ => Error::Storage(err.to_string()),
    }
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn conversion_error(err: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn symbol_from_row(row: &Row<'_>) -> rusqlite::Result<Symbol> {
    let asset_type: String = row.get(3)?;
    let created_at: String = row.get(6)?;
    Ok(Symbol {
        id: row.get(0)?,
        symbol: row.get(1)?,
        display_name: row.get(2)?,
        asset_type: asset_type.parse().map_err(conversion_error)?,
        source: row.get(4)?,
        is_active: row.get(5)?,
        created_at: parse_ts(&created_at)?,
    })
}

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<DailyMetric> {
    let date: String = row.get(1)?;
    Ok(DailyMetric {
        symbol_id: row.get(0)?,
        date: parse_date(&date)?,
        ma_20: row.get(2)?,
        ma_50: row.get(3)?,
        rsi_14: row.get(4)?,
        volatility_20: row.get(5)?,
        daily_return: row.get(6)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    let status: String = row.get(2)?;
    let started_at: String = row.get(3)?;
    let finished_at: Option<String> = row.get(4)?;
    Ok(JobRun {
        id: row.get(0)?,
        job_type: row.get(1)?,
        status: status.parse().map_err(conversion_error)?,
        started_at: parse_ts(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_ts).transpose()?,
        error_message: row.get(5)?,
        symbols_processed: row.get(6)?,
        symbols_total: row.get(7)?,
    })
}

#[async_trait]
impl PriceStore for SqliteStore {
    async fn ingest_quote(&self, quote: &Quote) -> Result<IngestReceipt> {
        let q = quote.clone();
        self.with_conn(move |conn| {
            let now = fmt_ts(&Utc::now());
            let tx = conn.transaction()?;

            let created = tx.execute(
                "INSERT INTO symbols (symbol, display_name, asset_type, source, is_active, created_at)
                 VALUES (?1, ?1, ?2, ?3, 1, ?4)
                 ON CONFLICT (symbol) DO NOTHING",
                params![q.symbol, q.asset_type.as_str(), q.source, now],
            )? == 1;
            let symbol_id: i64 = tx.query_row(
                "SELECT id FROM symbols WHERE symbol = ?1",
                params![q.symbol],
                |row| row.get(0),
            )?;

            let inserted = tx.execute(
                "INSERT INTO prices (symbol_id, ts, open, high, low, close, volume, source, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (symbol_id, ts) DO NOTHING",
                params![symbol_id, fmt_ts(&q.ts), q.open, q.high, q.low, q.price, q.volume, q.source, now],
            )?;
            tx.commit()?;

            Ok(IngestReceipt {
                symbol_id,
                symbol_created: created,
                outcome: if inserted == 1 { UpsertOutcome::Inserted } else { UpsertOutcome::Duplicate },
            })
        })
        .await
    }

    async fn active_symbols(&self, asset_class: Option<AssetClass>) -> Result<Vec<Symbol>> {
        let class = asset_class.map(|c| c.as_str().to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, symbol, display_name, asset_type, source, is_active, created_at
                 FROM symbols
                 WHERE is_active = 1 AND (?1 IS NULL OR asset_type = ?1)
                 ORDER BY symbol",
            )?;
            let rows = stmt.query_map(params![class], symbol_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn latest_closes(&self, symbol_id: i64, limit: usize) -> Result<Vec<f64>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT close FROM prices WHERE symbol_id = ?1 ORDER BY ts DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![symbol_id, limit as i64], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    async fn recent_prices(&self, ticker: &str, limit: usize) -> Result<Vec<PriceRecord>> {
        let ticker = ticker.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT p.ts, p.open, p.high, p.low, p.close, p.volume, p.source
                 FROM prices p
                 JOIN symbols s ON p.symbol_id = s.id
                 WHERE s.symbol = ?1
                 ORDER BY p.ts DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![ticker, limit as i64], |row| {
                let ts: String = row.get(0)?;
                Ok(PriceRecord {
                    ts: parse_ts(&ts)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                    source: row.get(6)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn upsert_daily_metric(&self, metric: &DailyMetric) -> Result<()> {
        let m = metric.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO daily_metrics
                    (symbol_id, date, ma_20, ma_50, rsi_14, volatility_20, daily_return, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (symbol_id, date) DO UPDATE SET
                    ma_20 = excluded.ma_20,
                    ma_50 = excluded.ma_50,
                    rsi_14 = excluded.rsi_14,
                    volatility_20 = excluded.volatility_20,
                    daily_return = excluded.daily_return",
                params![
                    m.symbol_id,
                    m.date.format("%Y-%m-%d").to_string(),
                    m.ma_20,
                    m.ma_50,
                    m.rsi_14,
                    m.volatility_20,
                    m.daily_return,
                    fmt_ts(&Utc::now()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn daily_metrics(&self, symbol_id: i64) -> Result<Vec<DailyMetric>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol_id, date, ma_20, ma_50, rsi_14, volatility_20, daily_return
                 FROM daily_metrics WHERE symbol_id = ?1 ORDER BY date",
            )?;
            let rows = stmt.query_map(params![symbol_id], metric_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn create_job_run(&self, job_type: &str, started_at: DateTime<Utc>) -> Result<JobRun> {
        let job_type = job_type.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO etl_jobs (job_type, status, started_at) VALUES (?1, 'running', ?2)",
                params![job_type, fmt_ts(&started_at)],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                "SELECT id, job_type, status, started_at, finished_at, error_message,
                        symbols_processed, symbols_total
                 FROM etl_jobs WHERE id = ?1",
                params![id],
                job_from_row,
            )
        })
        .await
    }

    async fn finish_job_run(&self, run: &JobRun) -> Result<()> {
        let run = run.clone();
        let updated = self
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE etl_jobs
                     SET status = ?2, finished_at = ?3, error_message = ?4,
                         symbols_processed = ?5, symbols_total = ?6
                     WHERE id = ?1",
                    params![
                        run.id,
                        run.status.as_str(),
                        run.finished_at.as_ref().map(fmt_ts),
                        run.error_message,
                        run.symbols_processed,
                        run.symbols_total,
                    ],
                )
            })
            .await?;
        if updated == 0 {
            return Err(Error::Storage("job run not found".to_string()));
        }
        Ok(())
    }

    async fn job_runs(&self, job_type: &str) -> Result<Vec<JobRun>> {
        let job_type = job_type.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_type, status, started_at, finished_at, error_message,
                        symbols_processed, symbols_total
                 FROM etl_jobs WHERE job_type = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![job_type], job_from_row)?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use crate::types::JobStatus;

    fn quote_at(symbol: &str, minute: u32, price: f64) -> Quote {
        Quote::new(symbol, AssetClass::Crypto, "binance", price)
            .at(Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap())
    }

    #[tokio::test]
    async fn replayed_quote_is_a_duplicate_not_an_error() {
        let store = SqliteStore::in_memory().unwrap();
        let quote = quote_at("BTCUSDT", 0, 43_000.0);

        let first = store.ingest_quote(&quote).await.unwrap();
        let second = store.ingest_quote(&quote).await.unwrap();

        assert!(first.symbol_created);
        assert_eq!(first.outcome, UpsertOutcome::Inserted);
        assert!(!second.symbol_created);
        assert_eq!(second.outcome, UpsertOutcome::Duplicate);
        assert_eq!(first.symbol_id, second.symbol_id);
        assert_eq!(store.recent_prices("BTCUSDT", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn first_quote_creates_symbol_from_message() {
        let store = SqliteStore::in_memory().unwrap();
        let quote = Quote::new("GOLD", AssetClass::Commodity, "yahoo_commodities", 2_050.0);
        store.ingest_quote(&quote).await.unwrap();

        let symbols = store.active_symbols(Some(AssetClass::Commodity)).await.unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].symbol, "GOLD");
        assert_eq!(symbols[0].display_name, "GOLD");
        assert_eq!(symbols[0].source, "yahoo_commodities");
        assert!(store.active_symbols(Some(AssetClass::Crypto)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_prices_are_newest_first_and_limited() {
        let store = SqliteStore::in_memory().unwrap();
        for minute in 0..5 {
            store.ingest_quote(&quote_at("ETHUSDT", minute, 100.0 + minute as f64)).await.unwrap();
        }

        let prices = store.recent_prices("ETHUSDT", 3).await.unwrap();
        assert_eq!(prices.iter().map(|p| p.close).collect::<Vec<_>>(), vec![104.0, 103.0, 102.0]);

        let receipt = store.ingest_quote(&quote_at("ETHUSDT", 0, 100.0)).await.unwrap();
        let closes = store.latest_closes(receipt.symbol_id, 2).await.unwrap();
        assert_eq!(closes, vec![104.0, 103.0]);
        assert!(store.recent_prices("UNKNOWN", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn daily_metric_upsert_overwrites_same_day() {
        let store = SqliteStore::in_memory().unwrap();
        let receipt = store.ingest_quote(&quote_at("BTCUSDT", 0, 1.0)).await.unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let mut metric = DailyMetric {
            symbol_id: receipt.symbol_id,
            date,
            ma_20: 10.0,
            ma_50: None,
            rsi_14: 55.0,
            volatility_20: 1.5,
            daily_return: Some(0.4),
        };
        store.upsert_daily_metric(&metric).await.unwrap();
        metric.ma_20 = 11.0;
        metric.ma_50 = Some(9.0);
        store.upsert_daily_metric(&metric).await.unwrap();

        let stored = store.daily_metrics(receipt.symbol_id).await.unwrap();
        assert_eq!(stored, vec![metric]);
    }

    #[tokio::test]
    async fn job_runs_are_append_only() {
        let store = SqliteStore::in_memory().unwrap();
        let started = Utc::now();
        let mut run = store.create_job_run("metrics_crypto", started).await.unwrap();
        assert_eq!(run.status, JobStatus::Running);

        run.status = JobStatus::Completed;
        run.finished_at = Some(started + Duration::seconds(2));
        run.symbols_processed = Some(3);
        run.symbols_total = Some(4);
        store.finish_job_run(&run).await.unwrap();
        store.create_job_run("metrics_crypto", started).await.unwrap();

        let runs = store.job_runs("metrics_crypto").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, JobStatus::Completed);
        assert_eq!(runs[0].symbols_processed, Some(3));
        assert_eq!(runs[1].status, JobStatus::Running);
    }
}
