//! Application Layer - Use cases and port definitions.
//!
//! The downstream surface talks to the upstream client only through the
//! ports defined here.

/// Port interfaces for the upstream market data client.
pub mod ports;

/// Quote and history use cases.
pub mod services;
