use crate::error::Result;
use crate::types::{AssetClass, DailyMetric, IngestReceipt, JobRun, PriceRecord, Quote, Symbol};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Time-series storage shared by the ETL consumer, the metrics engine and the
/// query API. Every write method is a single short transaction.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Resolve (or create) the quote's symbol and insert its price row in one
    /// transaction. A `(symbol, ts)` conflict is reported as a duplicate, not an error.
    async fn ingest_quote(&self, quote: &Quote) -> Result<IngestReceipt>;

    /// Active symbols ordered by ticker, optionally limited to one asset class.
    async fn active_symbols(&self, asset_class: Option<AssetClass>) -> Result<Vec<Symbol>>;

    /// Closing prices of the most recent `limit` rows, newest first.
    async fn latest_closes(&self, symbol_id: i64, limit: usize) -> Result<Vec<f64>>;

    /// Most recent `limit` price rows of a ticker, newest first.
    async fn recent_prices(&self, ticker: &str, limit: usize) -> Result<Vec<PriceRecord>>;

    /// Insert or overwrite the `(symbol, date)` metrics row.
    async fn upsert_daily_metric(&self, metric: &DailyMetric) -> Result<()>;

    async fn daily_metrics(&self, symbol_id: i64) -> Result<Vec<DailyMetric>>;

    async fn create_job_run(&self, job_type: &str, started_at: DateTime<Utc>) -> Result<JobRun>;

    /// Persist the final status, finish time, error text and counters of a run.
    async fn finish_job_run(&self, run: &JobRun) -> Result<()>;

    async fn job_runs(&self, job_type: &str) -> Result<Vec<JobRun>>;
}
