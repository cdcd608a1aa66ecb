//! Application Services
//!
//! Use cases that sit between the downstream surface and the market data
//! port.
//!
//! - `MarketDataService`: quote and history requests, input validation and
//!   error classification
//! - `views`: downstream field names for quotes and bars

mod market_data;
mod views;

pub use market_data::{
    DEFAULT_HISTORY_COUNT, HistoryParams, HistoryResponse, MarketDataService, QuoteData,
    QuoteParams, QuoteResponse, ServiceError,
};
pub use views::{CandleView, QuoteView, filter_window, parse_date};
