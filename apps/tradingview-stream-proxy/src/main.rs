//! TradingView Stream Proxy Binary
//!
//! Starts the market data stream proxy.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin tradingview-stream-proxy
//! ```
//!
//! # Environment Variables
//!
//! All settings are optional.
//! - `TV_PROXY_HTTP_PORT`: HTTP port for REST, sockets, health and metrics (default: 3001)
//! - `TV_PROXY_UPSTREAM_URL`: Streaming endpoint (default: TradingView's public socket)
//! - `TV_PROXY_AUTH_TOKEN`: Session token (default: anonymous)
//! - `TV_PROXY_RECONNECT_INTERVAL_SECS`: Periodic reconnection interval (default: 60)
//! - `TV_PROXY_SETUP_RETRY_MAX_ATTEMPTS`: Initial setup attempts, 0 = unlimited (default: 0)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tradingview_stream_proxy::infrastructure::telemetry;
use tradingview_stream_proxy::{
    AppState, ClientError, FrameLogHub, HttpServer, ProxyConfig, TradingViewClient, init_metrics,
};

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "failed to install rustls crypto provider")?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting TradingView Stream Proxy");

    let _metrics_handle = init_metrics();

    let config = ProxyConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    tokio::spawn(await_shutdown(shutdown_token.clone()));

    let frame_log = Arc::new(FrameLogHub::new(config.debug_log_capacity));
    let client = Arc::new(TradingViewClient::new(config.client.clone(), Arc::clone(&frame_log)));

    let state = Arc::new(AppState::new(
        client.clone(),
        frame_log,
        env!("CARGO_PKG_VERSION").to_string(),
    ));
    let http_server = HttpServer::new(config.server.http_port, state, shutdown_token.clone());
    let mut server_task = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    match setup_with_retry(&client, &config, &shutdown_token).await {
        Ok(true) => {
            tracing::info!("Stream proxy ready");
            shutdown_token.cancelled().await;
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(error = %e, "Giving up on TradingView setup");
            shutdown_token.cancel();
            client.cleanup().await;
            return Err(e.into());
        }
    }

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    client.cleanup().await;
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server_task).await.is_err() {
        tracing::warn!("HTTP server did not stop in time");
        server_task.abort();
    }

    tracing::info!("Stream proxy stopped");
    Ok(())
}

/// Run `setup()` until it succeeds, attempts run out or shutdown begins.
///
/// Returns `Ok(false)` when shutdown interrupted the retries.
async fn setup_with_retry(
    client: &TradingViewClient,
    config: &ProxyConfig,
    shutdown: &CancellationToken,
) -> Result<bool, ClientError> {
    let mut backoff = config.setup_retry.backoff();
    loop {
        tracing::info!("Connecting to TradingView");
        let err = match client.setup().await {
            Ok(()) => return Ok(true),
            Err(e) => e,
        };

        let Some(delay) = backoff.next_delay() else {
            return Err(err);
        };
        tracing::warn!(
            error = %err,
            attempt = backoff.attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "TradingView setup failed, retrying"
        );

        tokio::select! {
            () = shutdown.cancelled() => return Ok(false),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ProxyConfig) {
    tracing::info!(
        http_port = config.server.http_port,
        upstream = %config.client.session.url,
        reconnect_interval_secs = config.client.reconnect_interval.as_secs(),
        "Configuration loaded"
    );
    tracing::debug!(
        connect_timeout_ms = u64::try_from(config.client.session.connect_timeout.as_millis()).unwrap_or(u64::MAX),
        fetch_timeout_ms = u64::try_from(config.client.tickers.fetch_timeout.as_millis()).unwrap_or(u64::MAX),
        history_timeout_ms = u64::try_from(config.client.history.history_timeout.as_millis()).unwrap_or(u64::MAX),
        ticker_idle_secs = config.client.tickers.idle_window.as_secs(),
        "Upstream timeouts"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
