//! Domain Layer - Core market data types and bookkeeping.
//!
//! This layer contains the core domain types for quote and candle
//! streaming with no I/O. Everything here is plain data plus pure
//! functions, so it is tested without a runtime.

/// Market data types (quote snapshots, candles, timeframes).
pub mod streaming;

/// Subscriber set tracking per symbol.
pub mod subscription;
