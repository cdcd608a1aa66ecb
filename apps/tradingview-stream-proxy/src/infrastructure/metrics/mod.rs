//! Prometheus Metrics Module
//!
//! Exposes proxy metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: Raw frames in each direction, malformed frames
//! - **Upstream**: Connection state, registered symbols, errors, reconnects
//! - **Requests**: Active calls, timeouts by kind, history duration and size
//! - **Downstream**: Ticker subscriptions and WebSocket clients
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::infrastructure::broadcast::Direction;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "tv_proxy_frames_total",
        "Raw frames crossing the upstream socket by direction"
    );
    describe_counter!(
        "tv_proxy_malformed_frames_total",
        "Inbound frames dropped because they could not be decoded"
    );

    describe_gauge!(
        "tv_proxy_upstream_connected",
        "1 when the upstream session is ready, 0 otherwise"
    );
    describe_gauge!(
        "tv_proxy_upstream_symbols",
        "Symbols registered on the upstream quote session"
    );
    describe_counter!(
        "tv_proxy_upstream_errors_total",
        "Upstream connection errors by kind"
    );
    describe_counter!(
        "tv_proxy_reconnects_total",
        "Upstream reconnections by trigger"
    );

    describe_gauge!("tv_proxy_active_calls", "Data calls currently in flight");
    describe_counter!("tv_proxy_timeouts_total", "Request timeouts by kind");
    describe_histogram!(
        "tv_proxy_history_duration_seconds",
        "Wall time of historical retrievals"
    );
    describe_histogram!(
        "tv_proxy_history_candles",
        "Candles returned per historical retrieval"
    );

    describe_gauge!(
        "tv_proxy_ticker_subscriptions",
        "Live ticker subscriptions held by the multiplexer"
    );
    describe_gauge!(
        "tv_proxy_downstream_clients",
        "Connected downstream WebSocket clients"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// What caused a reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectTrigger {
    /// Periodic timer fired while idle.
    Timer,
    /// Deferred reconnection ran when the last call finished.
    Deferred,
}

impl ReconnectTrigger {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Deferred => "deferred",
        }
    }
}

/// Which wait ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Quote registration confirmation.
    Registration,
    /// Ticker fetch.
    Fetch,
    /// Latest candle.
    Candle,
    /// Historical retrieval.
    History,
}

impl TimeoutKind {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Fetch => "fetch",
            Self::Candle => "candle",
            Self::History => "history",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one raw frame.
pub fn record_frame(direction: Direction) {
    counter!("tv_proxy_frames_total", "direction" => direction.as_str()).increment(1);
}

/// Record an inbound frame that failed to decode.
pub fn record_malformed_frame() {
    counter!("tv_proxy_malformed_frames_total").increment(1);
}

/// Update the upstream connection gauge.
pub fn set_upstream_connected(connected: bool) {
    gauge!("tv_proxy_upstream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Update the registered symbol gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_upstream_symbols(count: usize) {
    gauge!("tv_proxy_upstream_symbols").set(count as f64);
}

/// Record an upstream connection error.
pub fn record_upstream_error(kind: &'static str) {
    counter!("tv_proxy_upstream_errors_total", "kind" => kind).increment(1);
}

/// Record a completed reconnection.
pub fn record_reconnect(trigger: ReconnectTrigger) {
    counter!("tv_proxy_reconnects_total", "trigger" => trigger.as_str()).increment(1);
}

/// Update the in-flight call gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_calls(count: usize) {
    gauge!("tv_proxy_active_calls").set(count as f64);
}

/// Record a timeout.
pub fn record_timeout(kind: TimeoutKind) {
    counter!("tv_proxy_timeouts_total", "kind" => kind.as_str()).increment(1);
}

/// Record a finished historical retrieval.
#[allow(clippy::cast_precision_loss)]
pub fn record_history(strategy: &'static str, duration: Duration, candles: usize) {
    histogram!("tv_proxy_history_duration_seconds", "strategy" => strategy)
        .record(duration.as_secs_f64());
    histogram!("tv_proxy_history_candles", "strategy" => strategy).record(candles as f64);
}

/// Update the ticker subscription gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_ticker_subscriptions(count: usize) {
    gauge!("tv_proxy_ticker_subscriptions").set(count as f64);
}

/// Update the downstream client gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_downstream_clients(count: usize) {
    gauge!("tv_proxy_downstream_clients").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_values() {
        assert_eq!(ReconnectTrigger::Timer.as_str(), "timer");
        assert_eq!(ReconnectTrigger::Deferred.as_str(), "deferred");
        assert_eq!(TimeoutKind::Registration.as_str(), "registration");
        assert_eq!(TimeoutKind::History.as_str(), "history");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame(Direction::Rx);
        record_timeout(TimeoutKind::Fetch);
        set_active_calls(3);
        record_history("count", Duration::from_millis(5), 10);
    }
}
