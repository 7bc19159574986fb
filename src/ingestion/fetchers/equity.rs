use async_trait::async_trait;
use crate::error::Result;
use crate::ingestion::fetchers::yahoo::YahooChartClient;
use crate::ingestion::fetchers::Fetcher;
use crate::types::{AssetClass, Quote};

const PROVIDER: &str = "yahoo_stocks";
const DEFAULT_SYMBOLS: [&str; 3] = ["AMZN", "META", "NVDA"];

pub struct EquityFetcher {
    yahoo: YahooChartClient,
}

impl EquityFetcher {
    pub fn new(yahoo: YahooChartClient) -> Self {
        EquityFetcher { yahoo }
    }
}

#[async_trait]
impl Fetcher for EquityFetcher {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn asset_class(&self) -> AssetClass {
        AssetClass::Equity
    }

    fn default_symbols(&self) -> Vec<String> {
        DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()
    }

    async fn fetch_one(&self, symbol: &str) -> Result<Quote> {
        let symbol = symbol.trim().to_uppercase();
        self.yahoo
            .latest_quote(PROVIDER, AssetClass::Equity, &symbol, &symbol)
            .await
    }
}
