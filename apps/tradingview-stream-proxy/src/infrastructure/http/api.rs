//! REST handlers for quotes and history.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use super::AppState;
use crate::application::services::{HistoryParams, QuoteParams, ServiceError};

pub(super) async fn quote_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QuoteParams>,
) -> Response {
    match state.service.quote(params).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => e.into_response(),
    }
}

pub(super) async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    match state.service.history(params).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => e.into_response(),
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, body) = match self {
            Self::MissingSymbol | Self::InvalidStart | Self::InvalidEnd => {
                (StatusCode::BAD_REQUEST, json!({ "error": message }))
            }
            Self::Timeout { symbol } => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({ "error": message, "symbol": symbol }),
            ),
            Self::Incomplete { symbol } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": message, "symbol": symbol }),
            ),
            Self::NotFound { symbol, timeframe } => (
                StatusCode::NOT_FOUND,
                json!({ "error": message, "symbol": symbol, "timeframe": timeframe }),
            ),
            Self::Failed { details, .. } => {
                tracing::warn!(error = %message, %details, "Market data request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": message, "details": details }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
