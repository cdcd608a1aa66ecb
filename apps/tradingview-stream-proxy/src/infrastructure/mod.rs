//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations behind the application ports, plus the
//! process-level plumbing (config, logging, metrics).

/// TradingView streaming client (codec, session, subscriptions, history).
pub mod tradingview;

/// HTTP surface: REST, sockets, health and metrics.
pub mod http;

/// Raw frame fan-out for the debug log.
pub mod broadcast;

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry trace export.
pub mod telemetry;
