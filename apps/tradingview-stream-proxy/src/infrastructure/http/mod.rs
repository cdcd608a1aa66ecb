//! HTTP Surface
//!
//! REST, WebSocket, health and metrics endpoints over a single port.
//! Handlers only see the [`MarketDataPort`]; the concrete upstream client is
//! wired in by the binary.
//!
//! # Endpoints
//!
//! - `GET /api/v1/quote` - Live quote, or latest bar for intraday timeframes
//! - `GET /api/v1/history` - Historical candles
//! - `GET /ws` - Quote subscriptions over a socket
//! - `GET /ws/debug` - Raw upstream frame log
//! - `GET /health` - JSON health status
//! - `GET /healthz` - Liveness probe
//! - `GET /readyz` - Readiness probe (upstream session ready)
//! - `GET /metrics` - Prometheus metrics in text format

mod api;
mod health;
mod socket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use health::{HealthResponse, HealthStatus};
pub use socket::{ClientMessage, ServerMessage};

use crate::application::ports::MarketDataPort;
use crate::application::services::MarketDataService;
use crate::infrastructure::broadcast::SharedFrameLogHub;
use crate::infrastructure::metrics;

// =============================================================================
// Shared State
// =============================================================================

/// State shared by every handler.
pub struct AppState {
    service: MarketDataService,
    frame_log: SharedFrameLogHub,
    version: String,
    started_at: Instant,
    socket_clients: AtomicUsize,
}

impl AppState {
    /// Create handler state over a market data port.
    #[must_use]
    pub fn new(port: Arc<dyn MarketDataPort>, frame_log: SharedFrameLogHub, version: String) -> Self {
        Self {
            service: MarketDataService::new(port),
            frame_log,
            version,
            started_at: Instant::now(),
            socket_clients: AtomicUsize::new(0),
        }
    }

    /// Connected `/ws` clients.
    #[must_use]
    pub fn socket_clients(&self) -> usize {
        self.socket_clients.load(Ordering::Relaxed)
    }

    fn port(&self) -> &Arc<dyn MarketDataPort> {
        self.service.port()
    }

    fn client_connected(&self) {
        let now = self.socket_clients.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_downstream_clients(now);
    }

    fn client_disconnected(&self) {
        let now = self.socket_clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::set_downstream_clients(now);
    }
}

/// Build the full router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/quote", get(api::quote_handler))
        .route("/api/v1/history", get(api::history_handler))
        .route("/ws", get(socket::quotes_socket_handler))
        .route("/ws/debug", get(socket::debug_socket_handler))
        .route("/health", get(health::health_handler))
        .route("/healthz", get(health::liveness_handler))
        .route("/readyz", get(health::readiness_handler))
        .route("/metrics", get(health::metrics_handler))
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// The proxy's HTTP server.
pub struct HttpServer {
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the server stops with
    /// an I/O error.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError::ServerFailed` on a fatal I/O error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpServerError> {
        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, "HTTP server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::{AppState, router};
    use crate::application::ports::MockMarketDataPort;
    use crate::infrastructure::broadcast::FrameLogHub;

    pub fn state(port: MockMarketDataPort) -> Arc<AppState> {
        Arc::new(AppState::new(
            Arc::new(port),
            Arc::new(FrameLogHub::new(8)),
            "test".to_string(),
        ))
    }

    pub async fn get(state: Arc<AppState>, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        (status, body)
    }

    pub async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let (status, body) = get(state, uri).await;
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }
}
