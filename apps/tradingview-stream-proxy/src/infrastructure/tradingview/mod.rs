//! TradingView Streaming Client
//!
//! Client for TradingView's streaming socket: framing, session handshake,
//! quote subscriptions and chart history.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     TradingViewClient                        │
//! │  get_ticker / get_candle / get_history  (via coordinator)    │
//! └──────┬───────────────────┬──────────────────────┬────────────┘
//!        │                   │                      │
//!        ▼                   ▼                      ▼
//! ┌──────────────┐  ┌──────────────────┐  ┌───────────────────┐
//! │ Subscription │  │ History drivers  │  │ Reconnect         │
//! │ Multiplexer  │  │ (ephemeral chart │  │ Coordinator       │
//! │  + Tickers   │  │  sessions)       │  │  (timer, gate)    │
//! └──────┬───────┘  └────────┬─────────┘  └─────────┬─────────┘
//!        │  qsd events       │ timescale routes     │
//!        └─────────┬─────────┴──────────────────────┘
//!                  ▼
//!         ┌──────────────────┐      ┌──────────────┐
//!         │  SessionManager  │─────▶│ FrameLogHub  │
//!         │  reader / writer │      │ (debug log)  │
//!         └────────┬─────────┘      └──────────────┘
//!                  ▼
//!        wss://data.tradingview.com/socket.io/websocket
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod history;
pub mod messages;
pub mod multiplexer;
pub mod reconnect;
pub mod session;
pub mod ticker;

pub use client::{ClientSettings, ClientStatus, TradingViewClient};
pub use error::ClientError;
pub use history::HistorySettings;
pub use multiplexer::{SubscriptionMultiplexer, TickerSettings};
pub use reconnect::{ReconnectCoordinator, RetryBackoff};
pub use session::{ConnectionState, ConnectionStatus, SessionConfig, SessionError, SessionManager};
pub use ticker::{TickerSubscription, TickerUpdates};
