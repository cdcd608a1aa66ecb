//! Proxy Configuration Settings
//!
//! Configuration types for the stream proxy, loaded from environment variables.

use std::time::Duration;

use crate::infrastructure::broadcast::DEFAULT_FRAME_LOG_CAPACITY;
use crate::infrastructure::tradingview::{
    ClientSettings, HistorySettings, RetryBackoff, SessionConfig, TickerSettings,
};

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// HTTP port serving REST, WebSocket, health and metrics.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 3001 }
    }
}

/// Retry policy for the initial upstream setup.
#[derive(Debug, Clone)]
pub struct SetupRetrySettings {
    /// Delay before the first retry.
    pub delay_initial: Duration,
    /// Ceiling on the delay between retries.
    pub delay_max: Duration,
    /// Growth factor between retries.
    pub delay_multiplier: f64,
    /// Attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for SetupRetrySettings {
    fn default() -> Self {
        Self {
            delay_initial: Duration::from_millis(500),
            delay_max: Duration::from_secs(30),
            delay_multiplier: 2.0,
            max_attempts: 0, // Unlimited
        }
    }
}

impl SetupRetrySettings {
    /// Backoff implementing this policy.
    #[must_use]
    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff::new(self.delay_initial, self.delay_max)
            .with_multiplier(self.delay_multiplier)
            .with_max_attempts(self.max_attempts)
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Upstream client settings.
    pub client: ClientSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Initial setup retry policy.
    pub setup_retry: SetupRetrySettings,
    /// Buffered frames per debug log receiver.
    pub debug_log_capacity: usize,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// Unset or unparsable numeric values fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a string setting is set but empty, or the
    /// upstream URL is not a WebSocket URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`ProxyConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvReader { lookup };
        let session_defaults = SessionConfig::default();
        let ticker_defaults = TickerSettings::default();
        let history_defaults = HistorySettings::default();
        let client_defaults = ClientSettings::default();
        let retry_defaults = SetupRetrySettings::default();

        let url = env.string("TV_PROXY_UPSTREAM_URL", session_defaults.url)?;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                key: "TV_PROXY_UPSTREAM_URL".to_string(),
                reason: "expected a ws:// or wss:// URL".to_string(),
            });
        }

        let session = SessionConfig {
            url,
            origin: env.string("TV_PROXY_ORIGIN", session_defaults.origin)?,
            user_agent: env.string("TV_PROXY_USER_AGENT", session_defaults.user_agent)?,
            auth_token: env.string("TV_PROXY_AUTH_TOKEN", session_defaults.auth_token)?,
            connect_timeout: env.duration_millis(
                "TV_PROXY_CONNECT_TIMEOUT_MS",
                session_defaults.connect_timeout,
            ),
            session_timeout: env.duration_millis(
                "TV_PROXY_SESSION_TIMEOUT_MS",
                session_defaults.session_timeout,
            ),
        };

        let tickers = TickerSettings {
            registration_timeout: env.duration_millis(
                "TV_PROXY_REGISTRATION_TIMEOUT_MS",
                ticker_defaults.registration_timeout,
            ),
            fetch_timeout: env.duration_millis(
                "TV_PROXY_FETCH_TIMEOUT_MS",
                ticker_defaults.fetch_timeout,
            ),
            idle_window: env.duration_secs("TV_PROXY_TICKER_IDLE_SECS", ticker_defaults.idle_window),
        };

        let history = HistorySettings {
            candle_timeout: env.duration_millis(
                "TV_PROXY_CANDLE_TIMEOUT_MS",
                history_defaults.candle_timeout,
            ),
            history_timeout: env.duration_millis(
                "TV_PROXY_HISTORY_TIMEOUT_MS",
                history_defaults.history_timeout,
            ),
            settle_delay: env.duration_millis(
                "TV_PROXY_HISTORY_SETTLE_MS",
                history_defaults.settle_delay,
            ),
        };

        let client = ClientSettings {
            session,
            tickers,
            history,
            reconnect_interval: env.duration_secs(
                "TV_PROXY_RECONNECT_INTERVAL_SECS",
                client_defaults.reconnect_interval,
            ),
        };

        let setup_retry = SetupRetrySettings {
            delay_initial: env.duration_millis(
                "TV_PROXY_SETUP_RETRY_INITIAL_MS",
                retry_defaults.delay_initial,
            ),
            delay_max: env.duration_secs("TV_PROXY_SETUP_RETRY_MAX_SECS", retry_defaults.delay_max),
            delay_multiplier: env.parse(
                "TV_PROXY_SETUP_RETRY_MULTIPLIER",
                retry_defaults.delay_multiplier,
            ),
            max_attempts: env.parse(
                "TV_PROXY_SETUP_RETRY_MAX_ATTEMPTS",
                retry_defaults.max_attempts,
            ),
        };

        let server = ServerSettings {
            http_port: env.parse("TV_PROXY_HTTP_PORT", ServerSettings::default().http_port),
        };

        let debug_log_capacity = env
            .parse("TV_PROXY_DEBUG_LOG_CAPACITY", DEFAULT_FRAME_LOG_CAPACITY)
            .max(1);

        Ok(Self {
            client,
            server,
            setup_retry,
            debug_log_capacity,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable is set but empty.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, key: &str, default: String) -> Result<String, ConfigError> {
        match (self.lookup)(key) {
            None => Ok(default),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v.trim().to_string()),
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
