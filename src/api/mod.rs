pub mod query;
pub mod rest;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use crate::error::Error;

pub use rest::{create_router, ApiState};

/// Handler-level failure mapped onto an HTTP status.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    Unavailable(String),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidQuote(_) | Error::UnknownAssetClass(_) | Error::Parse(_) => {
                ApiError::Validation(e.to_string())
            }
            Error::Broker(_) | Error::StorageTransient(_) => ApiError::Unavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Validation(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
            ApiError::Unavailable(detail) => (StatusCode::SERVICE_UNAVAILABLE, detail),
            ApiError::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), %detail, "request failed");
        }
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}
