pub mod bond;
pub mod commodity;
pub mod crypto;
pub mod equity;
pub mod yahoo;

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use crate::config::ProvidersConfig;
use crate::error::{Error, Result};
use crate::types::{AssetClass, Quote};

pub use bond::BondFetcher;
pub use commodity::CommodityFetcher;
pub use crypto::CryptoFetcher;
pub use equity::EquityFetcher;

/// Used when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Outcome of fetching a symbol universe.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub quotes: Vec<Quote>,
    pub failed: Vec<String>,
    /// Set when the provider throttled us; remaining symbols were not requested.
    pub throttled: Option<Duration>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Source tag stamped on every quote.
    fn provider(&self) -> &'static str;

    fn asset_class(&self) -> AssetClass;

    fn default_symbols(&self) -> Vec<String>;

    async fn fetch_one(&self, symbol: &str) -> Result<Quote>;

    async fn fetch_many(&self, symbols: &[String]) -> FetchBatch {
        fetch_batch(self, symbols).await
    }
}

/// Fetch symbols one at a time, skipping failures. A rate limit ends the batch.
pub async fn fetch_batch<F>(fetcher: &F, symbols: &[String]) -> FetchBatch
where
    F: Fetcher + ?Sized,
{
    let mut batch = FetchBatch::default();
    for (i, symbol) in symbols.iter().enumerate() {
        match fetcher.fetch_one(symbol).await {
            Ok(quote) => {
                tracing::info!(provider = fetcher.provider(), symbol = %quote.symbol, price = quote.price, "fetched quote");
                batch.quotes.push(quote);
            }
            Err(Error::RateLimited { provider, retry_after }) => {
                tracing::warn!(provider = %provider, ?retry_after, "rate limited, abandoning remaining symbols");
                batch.failed.extend(symbols[i..].iter().cloned());
                batch.throttled = Some(retry_after);
                break;
            }
            Err(e) => {
                tracing::error!(provider = fetcher.provider(), symbol = %symbol, error = %e, "failed to fetch quote");
                batch.failed.push(symbol.clone());
            }
        }
    }
    batch
}

pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("marketflow/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::HttpError(e.to_string()))
}

/// `Retry-After` in delta-seconds form, else the default.
pub fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Map throttling statuses to `RateLimited` and other non-2xx to `DataFetch`.
pub(crate) fn check_status(provider: &str, symbol: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::IM_A_TEAPOT {
        return Err(Error::RateLimited {
            provider: provider.to_string(),
            retry_after: retry_after(response.headers()),
        });
    }
    if !status.is_success() {
        return Err(Error::fetch(provider, symbol, format!("HTTP {}", status)));
    }
    Ok(response)
}

/// Every asset class's fetcher, with configured symbol overrides applied.
pub fn build_fetchers(config: &ProvidersConfig) -> Result<Vec<(Arc<dyn Fetcher>, Vec<String>)>> {
    let client = build_http_client(Duration::from_secs(config.request_timeout_secs))?;
    let yahoo = yahoo::YahooChartClient::new(client.clone(), &config.yahoo_url);

    let fetchers: Vec<Arc<dyn Fetcher>> = vec![
        Arc::new(CryptoFetcher::new(client, &config.binance_url, config.binance_api_key.clone())),
        Arc::new(EquityFetcher::new(yahoo.clone())),
        Arc::new(CommodityFetcher::new(yahoo.clone())),
        Arc::new(BondFetcher::new(yahoo)),
    ];

    Ok(fetchers
        .into_iter()
        .map(|fetcher| {
            let symbols = config
                .symbols_for(fetcher.asset_class())
                .map(|s| s.to_vec())
                .unwrap_or_else(|| fetcher.default_symbols());
            (fetcher, symbols)
        })
        .collect())
}
