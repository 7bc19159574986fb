use std::sync::Arc;
use chrono::{NaiveDate, Utc};
use tokio::sync::watch;
use tracing::Instrument;
use crate::analytics::indicators::{self, LOOKBACK};
use crate::error::{Error, Result};
use crate::interfaces::PriceStore;
use crate::jobs::{JobTracker, RetryPolicy};
use crate::observability::metrics::{METRICS_ROWS_WRITTEN, SYMBOLS_SKIPPED};
use crate::observability::tracing::trace_batch;
use crate::types::{AssetClass, DailyMetric, Symbol};

#[derive(Clone, Debug, PartialEq)]
pub enum SymbolOutcome {
    Written(DailyMetric),
    /// Not enough history yet; nothing was written.
    Skipped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchSummary {
    /// Symbols handled without error, written or skipped.
    pub fn processed(&self) -> usize {
        self.written + self.skipped
    }
}

/// Computes and stores one `DailyMetric` row per active symbol of a class.
pub struct MetricsEngine {
    store: Arc<dyn PriceStore>,
    tracker: JobTracker,
    retry: RetryPolicy,
    shutdown: Option<watch::Receiver<bool>>,
}

impl MetricsEngine {
    pub fn new(store: Arc<dyn PriceStore>, retry: RetryPolicy) -> Self {
        MetricsEngine {
            tracker: JobTracker::new(store.clone()),
            store,
            retry,
            shutdown: None,
        }
    }

    /// Stop batches between symbols once `shutdown` flips to true. The
    /// interrupted run is finalized as failed.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn stopping(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    pub async fn calculate_symbol(&self, symbol: &Symbol, date: NaiveDate) -> Result<SymbolOutcome> {
        let mut closes = self.store.latest_closes(symbol.id, LOOKBACK).await?;
        closes.reverse();

        let Some(values) = indicators::compute(&closes) else {
            SYMBOLS_SKIPPED.with_label_values(&[symbol.asset_type.as_str()]).inc();
            tracing::debug!(symbol = %symbol.symbol, samples = closes.len(), "not enough history, skipping");
            return Ok(SymbolOutcome::Skipped);
        };

        let metric = DailyMetric {
            symbol_id: symbol.id,
            date,
            ma_20: values.ma_20,
            ma_50: values.ma_50,
            rsi_14: values.rsi_14,
            volatility_20: values.volatility_20,
            daily_return: values.daily_return,
        };
        self.store.upsert_daily_metric(&metric).await?;
        METRICS_ROWS_WRITTEN.with_label_values(&[symbol.asset_type.as_str()]).inc();
        tracing::info!(
            symbol = %symbol.symbol,
            ma_20 = metric.ma_20,
            rsi_14 = metric.rsi_14,
            volatility_20 = metric.volatility_20,
            "metrics calculated"
        );
        Ok(SymbolOutcome::Written(metric))
    }

    /// One tracked batch for `class` dated `date`. Symbol failures are counted,
    /// not propagated; only a batch-level failure marks the run failed.
    pub async fn run_batch(&self, class: AssetClass, date: NaiveDate) -> Result<BatchSummary> {
        let job_type = class.metrics_job_type();
        let run = self.tracker.start(&job_type).await?;

        match self.process_class(class, date).await {
            Ok(summary) => {
                self.tracker.complete(run, summary.processed(), summary.total).await;
                Ok(summary)
            }
            Err(e) => {
                self.tracker.fail(run, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn process_class(&self, class: AssetClass, date: NaiveDate) -> Result<BatchSummary> {
        let symbols = self.store.active_symbols(Some(class)).await?;
        let mut summary = BatchSummary {
            total: symbols.len(),
            ..BatchSummary::default()
        };

        for symbol in &symbols {
            if self.stopping() {
                tracing::warn!(
                    asset_class = %class,
                    processed = summary.processed(),
                    total = summary.total,
                    "metrics batch interrupted"
                );
                return Err(Error::Interrupted);
            }
            match self.calculate_symbol(symbol, date).await {
                Ok(SymbolOutcome::Written(_)) => summary.written += 1,
                Ok(SymbolOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    tracing::error!(symbol = %symbol.symbol, error = %e, "failed to calculate metrics");
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            asset_class = %class,
            processed = summary.processed(),
            total = summary.total,
            written = summary.written,
            "metrics batch finished"
        );
        Ok(summary)
    }

    /// `run_batch` for today (UTC), retried per the engine's policy. Every
    /// attempt is its own job run. A shutdown ends the retries.
    pub async fn run_with_retry(&self, class: AssetClass) -> Result<BatchSummary> {
        let span = trace_batch(&class.metrics_job_type(), class);
        self.retry
            .run_if(
                |attempt| {
                    let date = Utc::now().date_naive();
                    tracing::debug!(attempt, %date, "starting metrics batch");
                    self.run_batch(class, date)
                },
                |e: &Error| !matches!(e, Error::Interrupted) && !self.stopping(),
            )
            .instrument(span)
            .await
    }
}
