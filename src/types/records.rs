use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use crate::error::Error;
use crate::types::asset_class::AssetClass;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub id: i64,
    pub symbol: String,
    pub display_name: String,
    pub asset_type: AssetClass,
    pub source: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Persisted time-series row. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub ts: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: Option<f64>,
    pub source: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyMetric {
    pub symbol_id: i64,
    pub date: NaiveDate,
    pub ma_20: f64,
    pub ma_50: Option<f64>,
    pub rsi_14: f64,
    pub volatility_20: f64,
    pub daily_return: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    /// The `(symbol, ts)` row already existed; nothing was written.
    Duplicate,
}

/// Result of committing one quote.
#[derive(Clone, Debug, PartialEq)]
pub struct IngestReceipt {
    pub symbol_id: i64,
    pub symbol_created: bool,
    pub outcome: UpsertOutcome,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Storage(format!("unknown job status {:?}", other))),
        }
    }
}

/// One invocation of a scheduled batch. Rows are never reused across runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: i64,
    pub job_type: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub symbols_processed: Option<i64>,
    pub symbols_total: Option<i64>,
}
