use async_trait::async_trait;
use crate::error::Result;
use crate::ingestion::fetchers::yahoo::YahooChartClient;
use crate::ingestion::fetchers::Fetcher;
use crate::types::{AssetClass, Quote};

const PROVIDER: &str = "yahoo_commodities";

/// Published name to front-month futures contract.
const CONTRACTS: [(&str, &str); 2] = [("GOLD", "GC=F"), ("SILVER", "SI=F")];

pub struct CommodityFetcher {
    yahoo: YahooChartClient,
}

impl CommodityFetcher {
    pub fn new(yahoo: YahooChartClient) -> Self {
        CommodityFetcher { yahoo }
    }
}

/// Unknown names pass through as raw Yahoo tickers.
pub fn contract_for(symbol: &str) -> &str {
    CONTRACTS
        .iter()
        .find(|(name, _)| *name == symbol)
        .map(|(_, contract)| *contract)
        .unwrap_or(symbol)
}

#[async_trait]
impl Fetcher for CommodityFetcher {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn asset_class(&self) -> AssetClass {
        AssetClass::Commodity
    }

    fn default_symbols(&self) -> Vec<String> {
        CONTRACTS.iter().map(|(name, _)| name.to_string()).collect()
    }

    async fn fetch_one(&self, symbol: &str) -> Result<Quote> {
        let symbol = symbol.trim().to_uppercase();
        self.yahoo
            .latest_quote(PROVIDER, AssetClass::Commodity, &symbol, contract_for(&symbol))
            .await
    }
}
