use std::sync::Once;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};
use crate::error::{Error, Result};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Ingestion metrics
    pub static ref QUOTES_FETCHED: IntCounterVec = IntCounterVec::new(
        Opts::new("quotes_fetched_total", "Quotes fetched from upstream providers"),
        &["asset_class"]
    ).unwrap();

    pub static ref FETCH_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("fetch_failures_total", "Symbols that failed to fetch"),
        &["asset_class"]
    ).unwrap();

    pub static ref QUOTES_PUBLISHED: IntCounterVec = IntCounterVec::new(
        Opts::new("quotes_published_total", "Quotes accepted by the broker"),
        &["asset_class"]
    ).unwrap();

    // ETL metrics
    pub static ref MESSAGES_CONSUMED: IntCounterVec = IntCounterVec::new(
        Opts::new("messages_consumed_total", "Queue messages settled by outcome"),
        &["queue", "outcome"]
    ).unwrap();

    pub static ref MESSAGE_PROCESSING_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "message_processing_latency_seconds",
            "Time from receipt to settlement of one queue message"
        ).buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0])
    ).unwrap();

    // Analytics metrics
    pub static ref METRICS_ROWS_WRITTEN: IntCounterVec = IntCounterVec::new(
        Opts::new("daily_metrics_written_total", "Daily metric rows inserted or overwritten"),
        &["asset_class"]
    ).unwrap();

    pub static ref SYMBOLS_SKIPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("metrics_symbols_skipped_total", "Symbols skipped for insufficient history"),
        &["asset_class"]
    ).unwrap();

    pub static ref JOB_RUNS: IntCounterVec = IntCounterVec::new(
        Opts::new("job_runs_total", "Batch job runs by status"),
        &["job_type", "status"]
    ).unwrap();
}

static REGISTER: Once = Once::new();

/// Register every collector with `REGISTRY`. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY.register(Box::new(QUOTES_FETCHED.clone())).unwrap();
        REGISTRY.register(Box::new(FETCH_FAILURES.clone())).unwrap();
        REGISTRY.register(Box::new(QUOTES_PUBLISHED.clone())).unwrap();
        REGISTRY.register(Box::new(MESSAGES_CONSUMED.clone())).unwrap();
        REGISTRY.register(Box::new(MESSAGE_PROCESSING_LATENCY.clone())).unwrap();
        REGISTRY.register(Box::new(METRICS_ROWS_WRITTEN.clone())).unwrap();
        REGISTRY.register(Box::new(SYMBOLS_SKIPPED.clone())).unwrap();
        REGISTRY.register(Box::new(JOB_RUNS.clone())).unwrap();
    });
}

/// Prometheus text exposition of `REGISTRY`.
pub fn encode_metrics() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| Error::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent_and_exposed() {
        register_metrics();
        register_metrics();
        QUOTES_PUBLISHED.with_label_values(&["crypto"]).inc();

        let text = encode_metrics().unwrap();
        assert!(text.contains("quotes_published_total"));
    }
}
