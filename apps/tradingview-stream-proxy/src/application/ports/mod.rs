//! Port Interfaces
//!
//! Contracts between the downstream surface and the upstream client,
//! following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `MarketDataPort`: live quotes, latest candles and history. Implemented
//!   by the TradingView client; the HTTP layer only ever sees this trait.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;

use crate::domain::streaming::{Candle, QuoteSnapshot, Timeframe};

/// Live quote snapshots for one symbol.
pub type QuoteStream = Pin<Box<dyn Stream<Item = QuoteSnapshot> + Send>>;

/// A historical candle request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Symbol, e.g. `BINANCE:BTCUSDT`.
    pub symbol: String,
    /// Bar size.
    pub timeframe: Timeframe,
    /// Bars wanted when no start is given.
    pub count: u64,
    /// Window start.
    pub start: Option<DateTime<Utc>>,
    /// Window end.
    pub end: Option<DateTime<Utc>>,
}

/// Upstream status for health endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpstreamStatus {
    /// Whether the client finished setup.
    pub initialized: bool,
    /// Connection state name.
    pub state: String,
    /// Symbols registered on the quote session.
    pub upstream_symbols: usize,
    /// Data calls in flight.
    pub active_calls: usize,
    /// Whether a reconnection waits on in-flight calls.
    pub pending_reconnect: bool,
    /// Live ticker subscriptions.
    pub ticker_subscriptions: usize,
    /// Frames received since start.
    pub frames_received: u64,
    /// Frames sent since start.
    pub frames_sent: u64,
    /// When the current connection became ready.
    pub connected_at: Option<DateTime<Utc>>,
}

impl UpstreamStatus {
    /// Ready to serve data calls.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.initialized && self.state == "ready"
    }
}

/// Market data errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MarketDataError {
    /// A bounded wait ran out.
    #[error("Market data timed out: {message}")]
    Timeout {
        /// Error details.
        message: String,
    },

    /// The upstream connection is not usable right now.
    #[error("Market data unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },

    /// Any other upstream failure.
    #[error("Market data upstream error: {message}")]
    Upstream {
        /// Error details.
        message: String,
    },
}

/// Port for market data from the streaming upstream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataPort: Send + Sync {
    /// Current quote snapshot, registering the symbol when needed.
    async fn quote(&self, symbol: &str) -> Result<QuoteSnapshot, MarketDataError>;

    /// Most recent candle, `None` when the series is empty.
    async fn latest_candle(
        &self,
        symbol: &str,
        timeframe: &Timeframe,
    ) -> Result<Option<Candle>, MarketDataError>;

    /// Historical candles, ascending by timestamp.
    async fn history(&self, query: &HistoryQuery) -> Result<Vec<Candle>, MarketDataError>;

    /// Live snapshots: the current one (when known) then every update.
    async fn watch(&self, symbol: &str) -> Result<QuoteStream, MarketDataError>;

    /// Upstream status.
    fn upstream_status(&self) -> UpstreamStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_needs_setup_and_ready_state() {
        let mut status = UpstreamStatus {
            initialized: true,
            state: "ready".to_string(),
            ..UpstreamStatus::default()
        };
        assert!(status.is_ready());

        status.state = "open".to_string();
        assert!(!status.is_ready());

        status.state = "ready".to_string();
        status.initialized = false;
        assert!(!status.is_ready());
    }
}
