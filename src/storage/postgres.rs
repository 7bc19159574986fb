use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod};
use tokio_postgres::{NoTls, Row};
use crate::error::{Error, Result};
use crate::interfaces::PriceStore;
use crate::types::{
    AssetClass, DailyMetric, IngestReceipt, JobRun, PriceRecord, Quote, Symbol, UpsertOutcome,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS symbols (
        id            BIGSERIAL PRIMARY KEY,
        symbol        VARCHAR(50) NOT NULL UNIQUE,
        display_name  VARCHAR(100) NOT NULL,
        asset_type    VARCHAR(20) NOT NULL,
        source        VARCHAR(30) NOT NULL,
        is_active     BOOLEAN NOT NULL DEFAULT TRUE,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    CREATE TABLE IF NOT EXISTS prices (
        id            BIGSERIAL PRIMARY KEY,
        symbol_id     BIGINT NOT NULL REFERENCES symbols(id) ON DELETE CASCADE,
        ts            TIMESTAMPTZ NOT NULL,
        open          DOUBLE PRECISION,
        high          DOUBLE PRECISION,
        low           DOUBLE PRECISION,
        close         DOUBLE PRECISION NOT NULL,
        volume        DOUBLE PRECISION,
        source        VARCHAR(30) NOT NULL,
        inserted_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT uq_symbol_ts UNIQUE (symbol_id, ts)
    );
    CREATE INDEX IF NOT EXISTS ix_prices_ts ON prices (ts);
    CREATE TABLE IF NOT EXISTS daily_metrics (
        id            BIGSERIAL PRIMARY KEY,
        symbol_id     BIGINT NOT NULL REFERENCES symbols(id) ON DELETE CASCADE,
        date          DATE NOT NULL,
        ma_20         DOUBLE PRECISION,
        ma_50         DOUBLE PRECISION,
        rsi_14        DOUBLE PRECISION,
        volatility_20 DOUBLE PRECISION,
        daily_return  DOUBLE PRECISION,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT uq_symbol_date UNIQUE (symbol_id, date)
    );
    CREATE TABLE IF NOT EXISTS etl_jobs (
        id                BIGSERIAL PRIMARY KEY,
        job_type          VARCHAR(50) NOT NULL,
        status            VARCHAR(20) NOT NULL,
        started_at        TIMESTAMPTZ,
        finished_at       TIMESTAMPTZ,
        error_message     TEXT,
        symbols_processed BIGINT,
        symbols_total     BIGINT
    );
"#;

// SQLSTATE classes worth retrying: connection exception, transaction rollback
// (serialization failure, deadlock), insufficient resources, operator intervention.
const TRANSIENT_SQLSTATE_CLASSES: [&str; 4] = ["08", "40", "53", "57"];
const LOCK_NOT_AVAILABLE: &str = "55P03";

const JOB_COLUMNS: &str =
    "id, job_type, status, started_at, finished_at, error_message, symbols_processed, symbols_total";

/// Pooled PostgreSQL / TimescaleDB store; each write is one short transaction.
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: usize) -> Result<Self> {
        let pg_config: tokio_postgres::Config = url
            .parse()
            .map_err(|e: tokio_postgres::Error| Error::ConfigError(format!("invalid postgres url: {}", e)))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .build()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let store = PostgresStore { pool };
        store.ensure_schema().await?;
        tracing::info!(max_connections, "PostgreSQL store ready");
        Ok(store)
    }

    /// Create the core tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.pool.get().await.map_err(classify_pool)?;
        client.batch_execute(SCHEMA).await.map_err(classify)
    }
}

fn classify(err: tokio_postgres::Error) -> Error {
    match err.code() {
        Some(state) => {
            let code = state.code();
            if code == LOCK_NOT_AVAILABLE
                || TRANSIENT_SQLSTATE_CLASSES.iter().any(|class| code.starts_with(class))
            {
                Error::StorageTransient(err.to_string())
            } else {
                Error::Storage(err.to_string())
            }
        }
        // No SQLSTATE means the failure happened below the protocol (socket, TLS, closed).
        None => Error::StorageTransient(err.to_string()),
    }
}

fn classify_pool(err: PoolError) -> Error {
    match err {
        PoolError::Backend(e) => classify(e),
        other => Error::StorageTransient(other.to_string()),
    }
}

fn symbol_from_row(row: &Row) -> Result<Symbol> {
    let asset_type: String = row.get("asset_type");
    Ok(Symbol {
        id: row.get("id"),
        symbol: row.get("symbol"),
        display_name: row.get("display_name"),
        asset_type: asset_type.parse()?,
        source: row.get("source"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    })
}

fn job_from_row(row: &Row) -> Result<JobRun> {
    let status: String = row.get("status");
    Ok(JobRun {
        id: row.get("id"),
        job_type: row.get("job_type"),
        status: status.parse()?,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        error_message: row.get("error_message"),
        symbols_processed: row.get("symbols_processed"),
        symbols_total: row.get("symbols_total"),
    })
}

#[async_trait]
impl PriceStore for PostgresStore {
    async fn ingest_quote(&self, quote: &Quote) -> Result<IngestReceipt> {
        let mut client = self.pool.get().await.map_err(classify_pool)?;
        let tx = client.transaction().await.map_err(classify)?;

        // Concurrent creators of the same ticker serialize on the unique index; the
        // loser's DO NOTHING falls through to the SELECT, which sees the committed row.
        let created = tx
            .query_opt(
                "INSERT INTO symbols (symbol, display_name, asset_type, source)
                 VALUES ($1, $1, $2, $3)
                 ON CONFLICT (symbol) DO NOTHING
                 RETURNING id",
                &[&quote.symbol, &quote.asset_type.as_str(), &quote.source],
            )
            .await
            .map_err(classify)?;
        let (symbol_id, symbol_created) = match created {
            Some(row) => (row.get::<_, i64>(0), true),
            None => {
                let row = tx
                    .query_one("SELECT id FROM symbols WHERE symbol = $1", &[&quote.symbol])
                    .await
                    .map_err(classify)?;
                (row.get::<_, i64>(0), false)
            }
        };

        let inserted = tx
            .execute(
                "INSERT INTO prices (symbol_id, ts, open, high, low, close, volume, source)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (symbol_id, ts) DO NOTHING",
                &[
                    &symbol_id,
                    &quote.ts,
                    &quote.open,
                    &quote.high,
                    &quote.low,
                    &quote.price,
                    &quote.volume,
                    &quote.source,
                ],
            )
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;

        Ok(IngestReceipt {
            symbol_id,
            symbol_created,
            outcome: if inserted == 1 { UpsertOutcome::Inserted } else { UpsertOutcome::Duplicate },
        })
    }

    async fn active_symbols(&self, asset_class: Option<AssetClass>) -> Result<Vec<Symbol>> {
        let client = self.pool.get().await.map_err(classify_pool)?;
        let class = asset_class.map(|c| c.as_str());
        let rows = client
            .query(
                "SELECT id, symbol, display_name, asset_type, source, is_active, created_at
                 FROM symbols
                 WHERE is_active AND ($1::TEXT IS NULL OR asset_type = $1)
                 ORDER BY symbol",
                &[&class],
            )
            .await
            .map_err(classify)?;
        rows.iter().map(symbol_from_row).collect()
    }

    async fn latest_closes(&self, symbol_id: i64, limit: usize) -> Result<Vec<f64>> {
        let client = self.pool.get().await.map_err(classify_pool)?;
        let rows = client
            .query(
                "SELECT close FROM prices WHERE symbol_id = $1 ORDER BY ts DESC LIMIT $2",
                &[&symbol_id, &(limit as i64)],
            )
            .await
            .map_err(classify)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn recent_prices(&self, ticker: &str, limit: usize) -> Result<Vec<PriceRecord>> {
        let client = self.pool.get().await.map_err(classify_pool)?;
        let rows = client
            .query(
                "SELECT p.ts, p.open, p.high, p.low, p.close, p.volume, p.source
                 FROM prices p
                 JOIN symbols s ON p.symbol_id = s.id
                 WHERE s.symbol = $1
                 ORDER BY p.ts DESC
                 LIMIT $2",
                &[&ticker, &(limit as i64)],
            )
            .await
            .map_err(classify)?;
        Ok(rows
            .iter()
            .map(|row| PriceRecord {
                ts: row.get("ts"),
                open: row.get("open"),
                high: row.get("high"),
                low: row.get("low"),
                close: row.get("close"),
                volume: row.get("volume"),
                source: row.get("source"),
            })
            .collect())
    }

    async fn upsert_daily_metric(&self, metric: &DailyMetric) -> Result<()> {
        let client = self.pool.get().await.map_err(classify_pool)?;
        client
            .execute(
                "INSERT INTO daily_metrics
                    (symbol_id, date, ma_20, ma_50, rsi_14, volatility_20, daily_return)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (symbol_id, date) DO UPDATE SET
                    ma_20 = EXCLUDED.ma_20,
                    ma_50 = EXCLUDED.ma_50,
                    rsi_14 = EXCLUDED.rsi_14,
                    volatility_20 = EXCLUDED.volatility_20,
                    daily_return = EXCLUDED.daily_return",
                &[
                    &metric.symbol_id,
                    &metric.date,
                    &metric.ma_20,
                    &metric.ma_50,
                    &metric.rsi_14,
                    &metric.volatility_20,
                    &metric.daily_return,
                ],
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn daily_metrics(&self, symbol_id: i64) -> Result<Vec<DailyMetric>> {
        let client = self.pool.get().await.map_err(classify_pool)?;
        let rows = client
            .query(
                "SELECT symbol_id, date, ma_20, ma_50, rsi_14, volatility_20, daily_return
                 FROM daily_metrics WHERE symbol_id = $1 ORDER BY date",
                &[&symbol_id],
            )
            .await
            .map_err(classify)?;
        Ok(rows
            .iter()
            .map(|row| DailyMetric {
                symbol_id: row.get("symbol_id"),
                date: row.get::<_, NaiveDate>("date"),
                ma_20: row.get("ma_20"),
                ma_50: row.get("ma_50"),
                rsi_14: row.get("rsi_14"),
                volatility_20: row.get("volatility_20"),
                daily_return: row.get("daily_return"),
            })
            .collect())
    }

    async fn create_job_run(&self, job_type: &str, started_at: DateTime<Utc>) -> Result<JobRun> {
        let client = self.pool.get().await.map_err(classify_pool)?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO etl_jobs (job_type, status, started_at)
                     VALUES ($1, 'running', $2)
                     RETURNING {}",
                    JOB_COLUMNS
                ),
                &[&job_type, &started_at],
            )
            .await
            .map_err(classify)?;
        job_from_row(&row)
    }

    async fn finish_job_run(&self, run: &JobRun) -> Result<()> {
        let client = self.pool.get().await.map_err(classify_pool)?;
        let updated = client
            .execute(
                "UPDATE etl_jobs
                 SET status = $2, finished_at = $3, error_message = $4,
                     symbols_processed = $5, symbols_total = $6
                 WHERE id = $1",
                &[
                    &run.id,
                    &run.status.as_str(),
                    &run.finished_at,
                    &run.error_message,
                    &run.symbols_processed,
                    &run.symbols_total,
                ],
            )
            .await
            .map_err(classify)?;
        if updated == 0 {
            return Err(Error::Storage(format!("job run {} not found", run.id)));
        }
        Ok(())
    }

    async fn job_runs(&self, job_type: &str) -> Result<Vec<JobRun>> {
        let client = self.pool.get().await.map_err(classify_pool)?;
        let rows = client
            .query(
                &format!("SELECT {} FROM etl_jobs WHERE job_type = $1 ORDER BY id", JOB_COLUMNS),
                &[&job_type],
            )
            .await
            .map_err(classify)?;
        rows.iter().map(job_from_row).collect()
    }
}
