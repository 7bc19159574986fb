use std::sync::Arc;
use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use crate::api::{query, ApiError};
use crate::interfaces::{PriceStore, QuotePublisher};
use crate::observability::metrics::encode_metrics;
use crate::types::{AssetClass, Quote};

pub struct ApiState {
    pub service: String,
    pub publisher: Arc<dyn QuotePublisher>,
    pub store: Arc<dyn PriceStore>,
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/ingest", post(ingest))
        .route("/symbols", get(query::list_symbols))
        .route("/prices/:symbol", get(query::price_history))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    timestamp: DateTime<Utc>,
}

async fn health_check(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.service.clone(),
        timestamp: Utc::now(),
    })
}

async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let body = encode_metrics()?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub symbol: String,
    pub asset_type: String,
    pub source: String,
    pub price: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Serialize)]
struct IngestResponse {
    status: &'static str,
    routing_key: String,
    payload: Quote,
}

/// Manual ingestion: validate, stamp with server time, publish. Returns once the
/// broker has accepted the message.
async fn ingest(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    let asset_type: AssetClass = req.asset_type.parse()?;
    let quote = Quote::new(req.symbol.trim(), asset_type, req.source, req.price).with_volume(req.volume);
    quote.validate()?;

    let routing_key = asset_type.routing_key();
    state.publisher.publish(&routing_key, &quote).await?;
    tracing::info!(symbol = %quote.symbol, %routing_key, price = quote.price, "manual quote queued");

    Ok(Json(IngestResponse {
        status: "queued",
        routing_key,
        payload: quote,
    }))
}
