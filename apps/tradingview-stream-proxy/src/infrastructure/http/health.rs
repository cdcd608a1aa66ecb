//! Health check and metrics endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;
use crate::application::ports::UpstreamStatus;
use crate::infrastructure::metrics::get_metrics_handle;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Proxy version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream connection details.
    pub upstream: UpstreamStatus,
    /// Connected `/ws` clients.
    pub socket_clients: usize,
    /// Connected `/ws/debug` clients.
    pub debug_clients: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Upstream session ready.
    Healthy,
    /// Set up, but the upstream session is between connections.
    Degraded,
    /// Upstream client not set up.
    Unhealthy,
}

impl HealthStatus {
    fn of(upstream: &UpstreamStatus) -> Self {
        if upstream.is_ready() {
            Self::Healthy
        } else if upstream.initialized {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }
}

pub(super) async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let upstream = state.port().upstream_status();
    let response = HealthResponse {
        status: HealthStatus::of(&upstream),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        upstream,
        socket_clients: state.socket_clients(),
        debug_clients: state.frame_log.receiver_count(),
    };
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

pub(super) async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub(super) async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.port().upstream_status().is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

pub(super) async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{get, get_json, state};
    use super::*;
    use crate::application::ports::MockMarketDataPort;

    fn port_with(status: UpstreamStatus) -> MockMarketDataPort {
        let mut port = MockMarketDataPort::new();
        port.expect_upstream_status().returning(move || status.clone());
        port
    }

    fn ready() -> UpstreamStatus {
        UpstreamStatus {
            initialized: true,
            state: "ready".to_string(),
            upstream_symbols: 2,
            ..UpstreamStatus::default()
        }
    }

    #[test]
    fn status_follows_upstream() {
        assert_eq!(HealthStatus::of(&ready()), HealthStatus::Healthy);
        let reconnecting = UpstreamStatus {
            state: "connecting".to_string(),
            ..ready()
        };
        assert_eq!(HealthStatus::of(&reconnecting), HealthStatus::Degraded);
        assert_eq!(HealthStatus::of(&UpstreamStatus::default()), HealthStatus::Unhealthy);
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(serde_json::to_string(&HealthStatus::Degraded).unwrap(), "\"degraded\"");
    }

    #[tokio::test]
    async fn health_reports_upstream() {
        let (status, body) = get_json(state(port_with(ready())), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["upstream"]["upstream_symbols"], 2);
        assert_eq!(body["socket_clients"], 0);
    }

    #[tokio::test]
    async fn health_unhealthy_before_setup() {
        let (status, body) = get_json(state(port_with(UpstreamStatus::default())), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
    }

    #[tokio::test]
    async fn readiness_tracks_session() {
        let (status, body) = get(state(port_with(ready())), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"READY");

        let (status, _) = get(state(port_with(UpstreamStatus::default())), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        let (status, _) = get(state(MockMarketDataPort::new()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }
}
