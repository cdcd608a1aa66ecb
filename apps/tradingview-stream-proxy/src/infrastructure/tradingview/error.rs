//! Client error type.

use std::time::Duration;

use super::session::SessionError;

/// Errors returned by the TradingView client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection or send failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// No confirming quote update arrived after registering the symbol.
    #[error("registration of {symbol} not confirmed within {timeout:?}")]
    RegistrationTimeout {
        /// Symbol being registered.
        symbol: String,
        /// Wait that ran out.
        timeout: Duration,
    },

    /// A ticker fetch did not complete.
    #[error("fetch of {symbol} did not complete within {timeout:?}")]
    FetchTimeout {
        /// Symbol being fetched.
        symbol: String,
        /// Wait that ran out.
        timeout: Duration,
    },

    /// No series batch arrived for a latest-candle request.
    #[error("no candle for {symbol} within {timeout:?}")]
    CandleTimeout {
        /// Requested symbol.
        symbol: String,
        /// Wait that ran out.
        timeout: Duration,
    },

    /// A historical retrieval collected nothing before its deadline.
    #[error("no history for {symbol} within {timeout:?}")]
    HistoryTimeout {
        /// Requested symbol.
        symbol: String,
        /// Wait that ran out.
        timeout: Duration,
    },

    /// The client is not set up, or was cleaned up mid-request.
    #[error("client not initialized")]
    NotInitialized,
}

impl ClientError {
    /// Whether the error is a bounded wait running out.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::RegistrationTimeout { .. }
                | Self::FetchTimeout { .. }
                | Self::CandleTimeout { .. }
                | Self::HistoryTimeout { .. }
                | Self::Session(SessionError::ConnectTimeout(_) | SessionError::SessionTimeout(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_classification() {
        let err = ClientError::FetchTimeout {
            symbol: "AAPL".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("AAPL"));
        assert!(ClientError::from(SessionError::SessionTimeout(Duration::from_secs(3))).is_timeout());
        assert!(!ClientError::from(SessionError::NotConnected).is_timeout());
        assert!(!ClientError::NotInitialized.is_timeout());
    }
}
