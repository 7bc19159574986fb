use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Upstream Provider Errors
    #[error("[{provider}] {symbol}: {detail}")]
    DataFetch {
        provider: String,
        symbol: String,
        detail: String,
    },

    #[error("Rate limit exceeded for {provider}, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Duration,
    },

    // Queue Errors
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Malformed message: {0}")]
    Parse(String),

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Quote Validation Errors
    #[error("Invalid quote: {0}")]
    InvalidQuote(String),

    #[error("Unknown asset class: {0}")]
    UnknownAssetClass(String),

    // Storage Errors
    #[error("Storage unavailable: {0}")]
    StorageTransient(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // System Errors
    #[error("HTTP client error: {0}")]
    HttpError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Task error: {0}")]
    TaskError(String),

    #[error("interrupted by shutdown")]
    Interrupted,

    // IO Errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Whether the failed unit of work may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DataFetch { .. }
                | Error::RateLimited { .. }
                | Error::Broker(_)
                | Error::StorageTransient(_)
        )
    }

    pub fn fetch(provider: &str, symbol: &str, detail: impl Into<String>) -> Self {
        Error::DataFetch {
            provider: provider.to_string(),
            symbol: symbol.to_string(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
