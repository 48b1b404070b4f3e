//! Top-level error taxonomy (spec §7) and its axum `IntoResponse` mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            EngineError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request".to_string(), Some(msg.clone()))
            }
            EngineError::Internal(err) => {
                tracing::error!("internal error: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error".to_string(), None)
            }
        };

        (status, Json(ErrorBody { error, details })).into_response()
    }
}
