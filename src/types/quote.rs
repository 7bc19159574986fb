use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use crate::error::{Error, Result};
use crate::types::asset_class::AssetClass;

pub const MAX_SYMBOL_LEN: usize = 50;

/// A single price observation in transit between a fetcher and the ETL consumer.
///
/// This is also the queue wire format: compact JSON with `price` carrying the close
/// and `ts` the UTC observation time assigned at fetch time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub asset_type: AssetClass,
    pub source: String,
    #[serde(deserialize_with = "deserialize_utc")]
    pub ts: DateTime<Utc>,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl Quote {
    /// Build a quote stamped with the current time.
    pub fn new(symbol: impl Into<String>, asset_type: AssetClass, source: impl Into<String>, price: f64) -> Self {
        Quote {
            symbol: symbol.into(),
            asset_type,
            source: source.into(),
            ts: observation_time(),
            price,
            open: None,
            high: None,
            low: None,
            volume: None,
        }
    }

    pub fn with_volume(mut self, volume: Option<f64>) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_range(mut self, open: Option<f64>, high: Option<f64>, low: Option<f64>) -> Self {
        self.open = open;
        self.high = high;
        self.low = low;
        self
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts.trunc_subsecs(6);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let symbol = self.symbol.trim();
        if symbol.is_empty() || symbol.chars().count() > MAX_SYMBOL_LEN {
            return Err(Error::InvalidQuote(format!(
                "symbol must be 1-{} characters, got {:?}",
                MAX_SYMBOL_LEN, self.symbol
            )));
        }
        if self.source.trim().is_empty() {
            return Err(Error::InvalidQuote("source must not be empty".to_string()));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(Error::InvalidQuote(format!("price must be positive, got {}", self.price)));
        }
        if let Some(volume) = self.volume {
            if !volume.is_finite() || volume < 0.0 {
                return Err(Error::InvalidQuote(format!("volume must be non-negative, got {}", volume)));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode and validate a queue payload. Every failure here is a poison message.
    pub fn decode(payload: &[u8]) -> Result<Quote> {
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        let quote: Quote = serde_json::from_slice(payload)
            .map_err(|e| Error::Parse(e.to_string()))?;
        quote.validate().map_err(|e| Error::Parse(e.to_string()))?;
        Ok(quote)
    }
}

/// Fetch-time UTC timestamp at the storage layer's microsecond precision, so a
/// replayed message maps onto the same `(symbol, ts)` key.
pub fn observation_time() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

// Accepts RFC 3339 and offset-less ISO timestamps (taken as UTC).
fn deserialize_utc<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc).trunc_subsecs(6));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc().trunc_subsecs(6))
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {:?}: {}", raw, e)))
}
