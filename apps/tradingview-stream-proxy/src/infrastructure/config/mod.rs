//! Configuration Module
//!
//! Configuration loading for the proxy service.

mod settings;

pub use settings::{ConfigError, ProxyConfig, ServerSettings, SetupRetrySettings};
