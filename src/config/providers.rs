use serde::{Deserialize, Serialize};
use crate::types::AssetClass;

/// Upstream endpoints, credentials and symbol universe overrides.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub request_timeout_secs: u64,
    pub binance_url: String,
    pub binance_api_key: Option<String>,
    pub yahoo_url: String,
    pub alpha_vantage_key: Option<String>,
    pub crypto_symbols: Option<Vec<String>>,
    pub equity_symbols: Option<Vec<String>>,
    pub commodity_symbols: Option<Vec<String>>,
    pub bond_symbols: Option<Vec<String>>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        ProvidersConfig {
            request_timeout_secs: 10,
            binance_url: "https://api.binance.com".to_string(),
            binance_api_key: None,
            yahoo_url: "https://query1.finance.yahoo.com".to_string(),
            alpha_vantage_key: None,
            crypto_symbols: None,
            equity_symbols: None,
            commodity_symbols: None,
            bond_symbols: None,
        }
    }
}

impl ProvidersConfig {
    pub fn symbols_for(&self, class: AssetClass) -> Option<&[String]> {
        let symbols = match class {
            AssetClass::Crypto => &self.crypto_symbols,
            AssetClass::Equity => &self.equity_symbols,
            AssetClass::Commodity => &self.commodity_symbols,
            AssetClass::Bond => &self.bond_symbols,
        };
        symbols.as_deref().filter(|s| !s.is_empty())
    }
}
