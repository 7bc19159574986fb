use async_trait::async_trait;
use crate::error::Result;
use crate::ingestion::fetchers::yahoo::YahooChartClient;
use crate::ingestion::fetchers::Fetcher;
use crate::types::{AssetClass, Quote};

const PROVIDER: &str = "yahoo_bonds";

// Treasury yield indices, quoted in percent. Bonds carry no volume.
const YIELDS: [(&str, &str); 3] = [("US10Y", "^TNX"), ("US30Y", "^TYX"), ("US5Y", "^FVX")];

pub struct BondFetcher {
    yahoo: YahooChartClient,
}

impl BondFetcher {
    pub fn new(yahoo: YahooChartClient) -> Self {
        BondFetcher { yahoo }
    }
}

pub fn index_for(symbol: &str) -> &str {
    YIELDS
        .iter()
        .find(|(name, _)| *name == symbol)
        .map(|(_, index)| *index)
        .unwrap_or(symbol)
}

#[async_trait]
impl Fetcher for BondFetcher {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn asset_class(&self) -> AssetClass {
        AssetClass::Bond
    }

    fn default_symbols(&self) -> Vec<String> {
        YIELDS.iter().map(|(name, _)| name.to_string()).collect()
    }

    async fn fetch_one(&self, symbol: &str) -> Result<Quote> {
        let symbol = symbol.trim().to_uppercase();
        let quote = self
            .yahoo
            .latest_quote(PROVIDER, AssetClass::Bond, &symbol, index_for(&symbol))
            .await?;
        Ok(quote.with_volume(None))
    }
}
