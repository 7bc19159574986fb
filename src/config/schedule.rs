use std::time::Duration;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};
use crate::types::AssetClass;

/// Fetch intervals per asset class, in seconds.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub crypto_secs: u64,
    pub equity_secs: u64,
    pub commodity_secs: u64,
    pub bond_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            crypto_secs: 60,
            equity_secs: 300,
            commodity_secs: 900,
            bond_secs: 3600,
        }
    }
}

impl ScheduleConfig {
    pub fn interval_for(&self, class: AssetClass) -> Duration {
        let secs = match class {
            AssetClass::Crypto => self.crypto_secs,
            AssetClass::Equity => self.equity_secs,
            AssetClass::Commodity => self.commodity_secs,
            AssetClass::Bond => self.bond_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub factor: u32,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_delay_secs: 60,
            factor: 2,
            max_delay_secs: 600,
        }
    }
}

/// Daily metrics run times (UTC, `HH:MM`) per asset class.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub crypto_at: String,
    pub equity_at: String,
    pub commodity_at: String,
    pub bond_at: String,
    pub retry: RetryConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            crypto_at: "00:05".to_string(),
            equity_at: "00:15".to_string(),
            commodity_at: "00:25".to_string(),
            bond_at: "00:35".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl MetricsConfig {
    pub fn run_time_for(&self, class: AssetClass) -> Result<NaiveTime> {
        let raw = match class {
            AssetClass::Crypto => &self.crypto_at,
            AssetClass::Equity => &self.equity_at,
            AssetClass::Commodity => &self.commodity_at,
            AssetClass::Bond => &self.bond_at,
        };
        parse_hhmm(raw)
    }
}

pub fn parse_hhmm(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| Error::ConfigError(format!("invalid time of day {:?}: {}", raw, e)))
}
