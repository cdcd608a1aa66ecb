#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! TradingView Stream Proxy - Market Data Multiplexer
//!
//! Keeps one session open against TradingView's streaming socket and serves
//! quotes, latest candles and history to many downstream clients over REST
//! and WebSocket. Every client interested in a symbol shares one upstream
//! registration.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `streaming`: quote snapshots, candles, timeframes
//!   - `subscription`: symbol to subscriber registry
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: `MarketDataPort`, the only thing the HTTP layer sees
//!   - `services`: quote and history use cases, downstream views
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `tradingview`: wire codec, session manager, reconnection,
//!     subscription multiplexer, history retrieval
//!   - `http`: REST, sockets, health and metrics endpoints
//!   - `broadcast`: raw frame fan-out for the debug log
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                           ┌──────────────────┐     ┌──────────────┐
//! TradingView WS ◄────────► │  SessionManager  │────►│ FrameLogHub  │──► /ws/debug
//!                           └────────┬─────────┘     └──────────────┘
//!                     qsd / timescale│
//!                           ┌────────▼─────────┐
//!                           │ TradingViewClient│ (MarketDataPort)
//!                           └────────┬─────────┘
//!                           ┌────────▼─────────┐
//!                           │   HTTP surface   │──► REST, /ws clients
//!                           └──────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{Candle, CandleSeries, QuoteSnapshot, Timeframe};

// Ports
pub use application::ports::{HistoryQuery, MarketDataError, MarketDataPort, UpstreamStatus};

// Upstream client
pub use infrastructure::tradingview::{
    ClientError, ClientSettings, RetryBackoff, SessionConfig, TradingViewClient,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ProxyConfig, ServerSettings, SetupRetrySettings};

// HTTP server
pub use infrastructure::http::{AppState, HttpServer, HttpServerError};

// Frame log
pub use infrastructure::broadcast::{FrameLogEntry, FrameLogHub, SharedFrameLogHub};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
