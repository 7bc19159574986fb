use reqwest::Client;
use serde::Deserialize;
use crate::error::{Error, Result};
use crate::ingestion::fetchers::check_status;
use crate::types::{AssetClass, Quote};

/// Yahoo Finance chart API shared by the equity, commodity and bond fetchers.
#[derive(Clone)]
pub struct YahooChartClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Deserialize)]
struct Chart {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Deserialize)]
struct ChartError {
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    #[serde(default)]
    indicators: Option<Indicators>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default)]
    regular_market_price: Option<f64>,
}

#[derive(Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Bars>,
}

#[derive(Default, Deserialize)]
struct Bars {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

fn at(series: &[Option<f64>], i: usize) -> Option<f64> {
    series.get(i).copied().flatten()
}

impl YahooChartClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        YahooChartClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Latest daily bar for `yahoo_symbol`, published under `symbol`.
    ///
    /// Uses the last bar with a close; falls back to the meta market price when
    /// the session has no bars yet.
    pub async fn latest_quote(
        &self,
        provider: &'static str,
        class: AssetClass,
        symbol: &str,
        yahoo_symbol: &str,
    ) -> Result<Quote> {
        let response = self
            .client
            .get(format!("{}/v8/finance/chart/{}", self.base_url, yahoo_symbol))
            .query(&[("range", "1d"), ("interval", "1d")])
            .send()
            .await
            .map_err(|e| Error::fetch(provider, symbol, e.to_string()))?;
        let chart: ChartResponse = check_status(provider, symbol, response)?
            .json()
            .await
            .map_err(|e| Error::fetch(provider, symbol, format!("malformed chart: {}", e)))?;

        if let Some(error) = chart.chart.error {
            let detail = error.description.unwrap_or_else(|| "chart error".to_string());
            return Err(Error::fetch(provider, symbol, detail));
        }
        let result = chart
            .chart
            .result
            .and_then(|results| results.into_iter().next())
            .ok_or_else(|| Error::fetch(provider, symbol, "No price data available"))?;

        let bars = result
            .indicators
            .and_then(|i| i.quote.into_iter().next())
            .unwrap_or_default();
        let last_bar = (0..bars.close.len()).rev().find(|&i| at(&bars.close, i).is_some());

        let quote = match (last_bar, result.meta.regular_market_price) {
            (Some(i), _) => Quote::new(symbol, class, provider, at(&bars.close, i).unwrap_or_default())
                .with_range(at(&bars.open, i), at(&bars.high, i), at(&bars.low, i))
                .with_volume(at(&bars.volume, i)),
            (None, Some(price)) => Quote::new(symbol, class, provider, price),
            (None, None) => return Err(Error::fetch(provider, symbol, "No price data available")),
        };

        quote
            .validate()
            .map_err(|e| Error::fetch(provider, symbol, e.to_string()))?;
        Ok(quote)
    }
}
