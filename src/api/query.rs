use std::sync::Arc;
use axum::extract::{Json, Path, Query, State};
use serde::Deserialize;
use crate::api::{ApiError, ApiState};
use crate::types::{PriceRecord, Symbol};
use crate::utils::helper::checked_limit;

pub const DEFAULT_PRICE_LIMIT: usize = 200;
pub const MAX_PRICE_LIMIT: usize = 1000;

/// GET /symbols
pub async fn list_symbols(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<Symbol>>, ApiError> {
    let symbols = state.store.active_symbols(None).await?;
    Ok(Json(symbols))
}

#[derive(Debug, Deserialize)]
pub struct PriceHistoryQuery {
    pub limit: Option<i64>,
}

/// GET /prices/:symbol?limit=N, newest first. Unknown tickers yield an empty list.
pub async fn price_history(
    State(state): State<Arc<ApiState>>,
    Path(symbol): Path<String>,
    Query(query): Query<PriceHistoryQuery>,
) -> Result<Json<Vec<PriceRecord>>, ApiError> {
    let requested = query.limit.map(|n| usize::try_from(n).unwrap_or(0));
    let limit = checked_limit(requested, DEFAULT_PRICE_LIMIT, MAX_PRICE_LIMIT).ok_or_else(|| {
        ApiError::Validation(format!("limit must be between 1 and {}", MAX_PRICE_LIMIT))
    })?;

    let prices = state.store.recent_prices(&symbol, limit).await?;
    Ok(Json(prices))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::{Request, StatusCode}};
    use chrono::{Duration, TimeZone, Utc};
    use tower::ServiceExt;
    use crate::api::create_router;
    use crate::api::rest::tests::{body_json, state};
    use crate::broker::InMemoryBroker;
    use crate::interfaces::PriceStore;
    use crate::storage::SqliteStore;
    use crate::types::{AssetClass, Quote};
    use super::*;

    async fn seeded_store() -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        for i in 0..5 {
            let quote = Quote::new("ETHUSDT", AssetClass::Crypto, "binance", 2000.0 + i as f64)
                .at(start + Duration::minutes(i));
            store.ingest_quote(&quote).await.unwrap();
        }
        let gold = Quote::new("GOLD", AssetClass::Commodity, "yahoo_commodities", 2050.0).at(start);
        store.ingest_quote(&gold).await.unwrap();
        store
    }

    async fn get(store: Arc<SqliteStore>, uri: &str) -> axum::response::Response {
        let app = create_router(state(Arc::new(InMemoryBroker::new("market_data")), store));
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn symbols_are_listed_by_ticker() {
        let response = get(seeded_store().await, "/symbols").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let tickers: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["symbol"].as_str().unwrap())
            .collect();
        assert_eq!(tickers, vec!["ETHUSDT", "GOLD"]);
    }

    #[tokio::test]
    async fn prices_come_back_newest_first_and_limited() {
        let response = get(seeded_store().await, "/prices/ETHUSDT?limit=3").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let closes: Vec<f64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["close"].as_f64().unwrap())
            .collect();
        assert_eq!(closes, vec![2004.0, 2003.0, 2002.0]);
    }

    #[tokio::test]
    async fn default_limit_and_unknown_symbol() {
        let store = seeded_store().await;
        let all = body_json(get(store.clone(), "/prices/ETHUSDT").await).await;
        assert_eq!(all.as_array().unwrap().len(), 5);

        let unknown = body_json(get(store, "/prices/DOGEUSDT").await).await;
        assert!(unknown.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_limit_is_422() {
        let store = seeded_store().await;
        for uri in ["/prices/ETHUSDT?limit=0", "/prices/ETHUSDT?limit=1001", "/prices/ETHUSDT?limit=-4"] {
            let response = get(store.clone(), uri).await;
            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY, "{}", uri);
        }
    }
}
