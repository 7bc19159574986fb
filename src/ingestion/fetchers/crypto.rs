use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use crate::error::{Error, Result};
use crate::ingestion::fetchers::{check_status, Fetcher};
use crate::types::{AssetClass, Quote};

const PROVIDER: &str = "binance";
const DEFAULT_SYMBOLS: [&str; 2] = ["BTCUSDT", "ETHUSDT"];

/// Binance spot 24h ticker.
pub struct CryptoFetcher {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl CryptoFetcher {
    pub fn new(client: Client, base_url: &str, api_key: Option<String>) -> Self {
        CryptoFetcher {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    last_price: String,
    open_price: Option<String>,
    high_price: Option<String>,
    low_price: Option<String>,
    volume: Option<String>,
}

fn decimal(symbol: &str, field: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| Error::fetch(PROVIDER, symbol, format!("invalid {} {:?}", field, raw)))
}

fn optional_decimal(symbol: &str, field: &str, raw: Option<&String>) -> Result<Option<f64>> {
    raw.map(|v| decimal(symbol, field, v)).transpose()
}

#[async_trait]
impl Fetcher for CryptoFetcher {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn asset_class(&self) -> AssetClass {
        AssetClass::Crypto
    }

    fn default_symbols(&self) -> Vec<String> {
        DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()
    }

    async fn fetch_one(&self, symbol: &str) -> Result<Quote> {
        let symbol = symbol.trim().to_uppercase();
        let mut request = self
            .client
            .get(format!("{}/api/v3/ticker/24hr", self.base_url))
            .query(&[("symbol", symbol.as_str())]);
        if let Some(key) = &self.api_key {
            request = request.header("X-MBX-APIKEY", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::fetch(PROVIDER, &symbol, e.to_string()))?;
        let ticker: Ticker24h = check_status(PROVIDER, &symbol, response)?
            .json()
            .await
            .map_err(|e| Error::fetch(PROVIDER, &symbol, format!("malformed ticker: {}", e)))?;

        let quote = Quote::new(
            symbol.as_str(),
            AssetClass::Crypto,
            PROVIDER,
            decimal(&symbol, "lastPrice", &ticker.last_price)?,
        )
        .with_range(
            optional_decimal(&symbol, "openPrice", ticker.open_price.as_ref())?,
            optional_decimal(&symbol, "highPrice", ticker.high_price.as_ref())?,
            optional_decimal(&symbol, "lowPrice", ticker.low_price.as_ref())?,
        )
        .with_volume(optional_decimal(&symbol, "volume", ticker.volume.as_ref())?);

        quote
            .validate()
            .map_err(|e| Error::fetch(PROVIDER, &symbol, e.to_string()))?;
        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use crate::ingestion::fetchers::build_http_client;

    fn fetcher(server: &MockServer, api_key: Option<&str>) -> CryptoFetcher {
        let client = build_http_client(Duration::from_secs(5)).unwrap();
        CryptoFetcher::new(client, &server.uri(), api_key.map(String::from))
    }

    #[tokio::test]
    async fn parses_24h_ticker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/ticker/24hr"))
            .and(query_param("symbol", "BTCUSDT"))
            .and(header("X-MBX-APIKEY", "k3y"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "BTCUSDT",
                "lastPrice": "43250.10000000",
                "openPrice": "42000.00000000",
                "highPrice": "43500.00000000",
                "lowPrice": "41800.50000000",
                "volume": "18234.12000000"
            })))
            .mount(&server)
            .await;

        let quote = fetcher(&server, Some("k3y")).fetch_one("btcusdt").await.unwrap();
        assert_eq!(quote.symbol, "BTCUSDT");
        assert_eq!(quote.source, "binance");
        assert_eq!(quote.asset_type, AssetClass::Crypto);
        assert_eq!(quote.price, 43250.1);
        assert_eq!(quote.low, Some(41800.5));
        assert_eq!(quote.volume, Some(18234.12));
    }

    #[tokio::test]
    async fn throttling_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "42"))
            .mount(&server)
            .await;

        match fetcher(&server, None).fetch_one("ETHUSDT").await {
            Err(Error::RateLimited { provider, retry_after }) => {
                assert_eq!(provider, "binance");
                assert_eq!(retry_after, Duration::from_secs(42));
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ip_ban_is_treated_as_throttling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(418))
            .mount(&server)
            .await;

        assert!(matches!(
            fetcher(&server, None).fetch_one("ETHUSDT").await,
            Err(Error::RateLimited { retry_after, .. }) if retry_after == Duration::from_secs(60)
        ));
    }

    #[tokio::test]
    async fn unknown_symbol_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": -1121, "msg": "Invalid symbol."
            })))
            .mount(&server)
            .await;

        let err = fetcher(&server, None).fetch_one("NOPE").await.unwrap_err();
        assert!(matches!(err, Error::DataFetch { ref symbol, .. } if symbol == "NOPE"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn garbage_price_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "lastPrice": "n/a"
            })))
            .mount(&server)
            .await;

        assert!(matches!(
            fetcher(&server, None).fetch_one("BTCUSDT").await,
            Err(Error::DataFetch { .. })
        ));
    }
}
