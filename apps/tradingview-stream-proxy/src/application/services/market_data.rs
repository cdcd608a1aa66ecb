//! Market data use cases behind the REST surface.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::views::{CandleView, QuoteView, filter_window, parse_date};
use crate::application::ports::{HistoryQuery, MarketDataError, MarketDataPort};
use crate::domain::streaming::{Candle, Timeframe};

/// Bars returned when the caller gives no usable count.
pub const DEFAULT_HISTORY_COUNT: u64 = 100;

/// Query parameters of a quote request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuoteParams {
    /// Symbol, e.g. `NASDAQ:AAPL`.
    pub symbol: Option<String>,
    /// Timeframe, `1D` when absent.
    pub timeframe: Option<String>,
}

/// Query parameters of a history request. Kept as raw strings so bad input
/// becomes a client error instead of a rejected extractor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryParams {
    /// Symbol.
    pub symbol: Option<String>,
    /// Timeframe, `1D` when absent.
    pub timeframe: Option<String>,
    /// Bars wanted when no start is given.
    pub count: Option<String>,
    /// Window start, RFC 3339 or `YYYY-MM-DD`.
    pub start: Option<String>,
    /// Window end, RFC 3339 or `YYYY-MM-DD`.
    pub end: Option<String>,
}

/// Quote payload: live fields for daily requests, one bar otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum QuoteData {
    /// Live ticker snapshot.
    Live(QuoteView),
    /// Latest bar of a chart series.
    Bar(CandleView),
}

/// Response body of a quote request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuoteResponse {
    /// Symbol as requested.
    pub symbol: String,
    /// Timeframe as requested.
    pub timeframe: String,
    /// Snapshot time, or the bar's open time.
    pub timestamp: DateTime<Utc>,
    /// Quote fields.
    pub data: QuoteData,
}

/// Response body of a history request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryResponse {
    /// Symbol as requested.
    pub symbol: String,
    /// Timeframe as requested.
    pub timeframe: String,
    /// Number of bars in `data`.
    pub count: usize,
    /// Bars, ascending by time.
    pub data: Vec<Candle>,
}

/// Use-case failures, each mapped to one HTTP status by the adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// No symbol given.
    #[error("Symbol is required")]
    MissingSymbol,

    /// `start` did not parse.
    #[error("Invalid start date format")]
    InvalidStart,

    /// `end` did not parse.
    #[error("Invalid end date format")]
    InvalidEnd,

    /// The upstream did not answer in time.
    #[error("Timeout waiting for data from TradingView")]
    Timeout {
        /// Requested symbol.
        symbol: String,
    },

    /// The snapshot never received its canonical name.
    #[error("Received incomplete data from source")]
    Incomplete {
        /// Requested symbol.
        symbol: String,
    },

    /// The series came back empty.
    #[error("No data found for symbol/timeframe")]
    NotFound {
        /// Requested symbol.
        symbol: String,
        /// Requested timeframe.
        timeframe: String,
    },

    /// Anything else.
    #[error("{context}")]
    Failed {
        /// What was being fetched.
        context: &'static str,
        /// Underlying error.
        details: String,
    },
}

impl ServiceError {
    fn from_port(error: MarketDataError, symbol: &str, context: &'static str) -> Self {
        match error {
            MarketDataError::Timeout { .. } => Self::Timeout {
                symbol: symbol.to_string(),
            },
            other => Self::Failed {
                context,
                details: other.to_string(),
            },
        }
    }
}

/// Quote and history use cases over a [`MarketDataPort`].
#[derive(Clone)]
pub struct MarketDataService {
    port: Arc<dyn MarketDataPort>,
}

impl std::fmt::Debug for MarketDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataService").finish_non_exhaustive()
    }
}

impl MarketDataService {
    /// Create a service over a market data port.
    #[must_use]
    pub fn new(port: Arc<dyn MarketDataPort>) -> Self {
        Self { port }
    }

    /// The underlying port.
    #[must_use]
    pub fn port(&self) -> &Arc<dyn MarketDataPort> {
        &self.port
    }

    /// Answer a quote request.
    ///
    /// Daily timeframes read the live ticker snapshot; anything else reads the
    /// latest bar of that timeframe's chart series.
    ///
    /// # Errors
    ///
    /// See [`ServiceError`].
    pub async fn quote(&self, params: QuoteParams) -> Result<QuoteResponse, ServiceError> {
        let symbol = required_symbol(params.symbol)?;
        let label = params.timeframe.unwrap_or_else(|| "1D".to_string());
        let timeframe = Timeframe::parse(&label);

        if !timeframe.is_daily() {
            let candle = self
                .port
                .latest_candle(&symbol, &timeframe)
                .await
                .map_err(|e| ServiceError::from_port(e, &symbol, "Failed to fetch chart data"))?;
            let Some(candle) = candle else {
                return Err(ServiceError::NotFound {
                    symbol,
                    timeframe: label,
                });
            };
            let timestamp = DateTime::from_timestamp_millis(candle.timestamp).unwrap_or_else(Utc::now);
            return Ok(QuoteResponse {
                symbol,
                timeframe: label,
                timestamp,
                data: QuoteData::Bar(CandleView::from(&candle)),
            });
        }

        let snapshot = self
            .port
            .quote(&symbol)
            .await
            .map_err(|e| ServiceError::from_port(e, &symbol, "Failed to fetch data"))?;
        if snapshot.canonical_name().is_none() {
            return Err(ServiceError::Incomplete { symbol });
        }

        Ok(QuoteResponse {
            symbol,
            timeframe: label,
            timestamp: Utc::now(),
            data: QuoteData::Live(QuoteView::from_snapshot(&snapshot)),
        })
    }

    /// Answer a history request, trimming the result to the requested window.
    ///
    /// # Errors
    ///
    /// See [`ServiceError`].
    pub async fn history(&self, params: HistoryParams) -> Result<HistoryResponse, ServiceError> {
        let symbol = required_symbol(params.symbol)?;
        let label = params.timeframe.unwrap_or_else(|| "1D".to_string());
        let count = params
            .count
            .as_deref()
            .and_then(|c| c.trim().parse::<u64>().ok())
            .filter(|c| *c > 0)
            .unwrap_or(DEFAULT_HISTORY_COUNT);
        let start = parse_optional(params.start.as_deref(), ServiceError::InvalidStart)?;
        let end = parse_optional(params.end.as_deref(), ServiceError::InvalidEnd)?;

        tracing::debug!(%symbol, timeframe = %label, count, ?start, ?end, "History request");

        let query = HistoryQuery {
            symbol: symbol.clone(),
            timeframe: Timeframe::parse(&label),
            count,
            start,
            end,
        };
        let candles = self
            .port
            .history(&query)
            .await
            .map_err(|e| ServiceError::from_port(e, &symbol, "Failed to fetch history data"))?;
        if candles.is_empty() {
            return Err(ServiceError::NotFound {
                symbol,
                timeframe: label,
            });
        }

        let data = filter_window(candles, start, end);
        Ok(HistoryResponse {
            symbol,
            timeframe: label,
            count: data.len(),
            data,
        })
    }
}

fn required_symbol(symbol: Option<String>) -> Result<String, ServiceError> {
    symbol
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(ServiceError::MissingSymbol)
}

fn parse_optional(
    input: Option<&str>,
    invalid: ServiceError,
) -> Result<Option<DateTime<Utc>>, ServiceError> {
    match input.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => parse_date(raw).map(Some).ok_or(invalid),
    }
}
