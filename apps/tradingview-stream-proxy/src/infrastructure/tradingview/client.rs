//! TradingView Client
//!
//! Facade over the session manager, multiplexer and reconnection
//! coordinator. Every data call runs through the coordinator so periodic
//! reconnection never cuts one short.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::ClientError;
use super::history::{self, HistorySettings};
use super::multiplexer::{SubscriptionMultiplexer, TickerSettings};
use super::reconnect::{DEFAULT_RECONNECT_INTERVAL, Reconnect, ReconnectCoordinator};
use super::session::{ConnectionStatus, QuoteEvent, SessionConfig, SessionError, SessionManager};
use super::ticker::TickerSubscription;
use crate::application::ports::{
    HistoryQuery, MarketDataError, MarketDataPort, QuoteStream, UpstreamStatus,
};
use crate::domain::streaming::{Candle, QuoteSnapshot, Timeframe};
use crate::domain::subscription::RegistryStats;
use crate::infrastructure::broadcast::{FrameLogEntry, SharedFrameLogHub};

/// Upstream status value for usable quote data.
const QUOTE_STATUS_OK: &str = "ok";

/// Everything the client needs to run.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Connection and handshake.
    pub session: SessionConfig,
    /// Ticker registration, fetch and eviction.
    pub tickers: TickerSettings,
    /// Candle and history retrieval.
    pub history: HistorySettings,
    /// Periodic reconnection interval.
    pub reconnect_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            tickers: TickerSettings::default(),
            history: HistorySettings::default(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

/// Full client status for health reporting.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    /// Whether `setup()` completed and `cleanup()` has not run.
    pub initialized: bool,
    /// Connection details.
    pub connection: ConnectionStatus,
    /// Data calls in flight.
    pub active_calls: usize,
    /// Whether a reconnection waits on in-flight calls.
    pub pending_reconnect: bool,
    /// Ticker subscription counts.
    pub subscriptions: RegistryStats,
}

struct Background {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Reconnects the session and re-registers every tracked symbol.
struct SessionReconnector {
    session: Arc<SessionManager>,
    multiplexer: Arc<SubscriptionMultiplexer>,
}

#[async_trait]
impl Reconnect for SessionReconnector {
    async fn reconnect(&self) -> Result<(), SessionError> {
        self.session.reconnect().await?;
        let restored = self.multiplexer.restore_registrations()?;
        if restored > 0 {
            tracing::info!(restored, "Restored symbol registrations");
        }
        Ok(())
    }
}

/// TradingView streaming client.
pub struct TradingViewClient {
    session: Arc<SessionManager>,
    multiplexer: Arc<SubscriptionMultiplexer>,
    coordinator: Arc<ReconnectCoordinator>,
    history: HistorySettings,
    reconnect_interval: Duration,
    background: AsyncMutex<Option<Background>>,
    initialized: AtomicBool,
}

impl TradingViewClient {
    /// Create a client. Nothing connects until [`TradingViewClient::setup`].
    #[must_use]
    pub fn new(settings: ClientSettings, frame_log: SharedFrameLogHub) -> Self {
        let session = Arc::new(SessionManager::new(settings.session, frame_log));
        let multiplexer = SubscriptionMultiplexer::new(Arc::clone(&session), settings.tickers);
        let coordinator = Arc::new(ReconnectCoordinator::new(Arc::new(SessionReconnector {
            session: Arc::clone(&session),
            multiplexer: Arc::clone(&multiplexer),
        })));

        Self {
            session,
            multiplexer,
            coordinator,
            history: settings.history,
            reconnect_interval: settings.reconnect_interval,
            background: AsyncMutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect, start quote dispatch and the reconnect timer. Idempotent; a
    /// failed setup leaves nothing running and may be retried.
    ///
    /// # Errors
    ///
    /// Returns the connection failure.
    pub async fn setup(&self) -> Result<(), ClientError> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return Ok(());
        }

        let (quote_tx, quote_rx) = mpsc::unbounded_channel();
        self.session.install_quote_sink(quote_tx);

        if let Err(e) = self.session.connect().await {
            self.session.clear_quote_sink();
            self.session.disconnect();
            return Err(e.into());
        }

        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch_quotes(
            Arc::clone(&self.multiplexer),
            quote_rx,
            cancel.clone(),
        ));
        let timer = self
            .coordinator
            .spawn_timer(self.reconnect_interval, cancel.clone());

        *background = Some(Background {
            cancel,
            tasks: vec![dispatcher, timer],
        });
        self.initialized.store(true, Ordering::Release);

        tracing::info!(
            reconnect_interval_secs = self.reconnect_interval.as_secs(),
            "TradingView client ready"
        );
        Ok(())
    }

    /// Stop background tasks, drop subscriptions and disconnect. Idempotent.
    pub async fn cleanup(&self) {
        let Some(background) = self.background.lock().await.take() else {
            return;
        };
        self.initialized.store(false, Ordering::Release);

        background.cancel.cancel();
        for task in background.tasks {
            if let Err(e) = task.await
                && e.is_panic()
            {
                tracing::error!(error = %e, "Client task panicked");
            }
        }

        self.multiplexer.clear();
        self.session.clear_quote_sink();
        self.session.disconnect();
        tracing::info!("TradingView client stopped");
    }

    /// Whether `setup()` completed and `cleanup()` has not run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    // =========================================================================
    // Data Calls
    // =========================================================================

    /// Shared live subscription for `symbol`. Registration failures are
    /// logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before `setup()`.
    pub async fn get_ticker(&self, symbol: &str) -> Result<Arc<TickerSubscription>, ClientError> {
        self.ensure_initialized()?;
        Ok(self
            .coordinator
            .with_call(self.multiplexer.get_ticker(symbol))
            .await)
    }

    /// Latest candle for `symbol` on its own chart session.
    ///
    /// # Errors
    ///
    /// Returns `CandleTimeout`, a session error, or `NotInitialized`.
    pub async fn get_candle(&self, symbol: &str, timeframe: &Timeframe) -> Result<Option<Candle>, ClientError> {
        self.ensure_initialized()?;
        self.coordinator
            .with_call(history::fetch_latest_candle(
                &self.session,
                &self.history,
                symbol,
                timeframe,
            ))
            .await
    }

    /// Historical candles, ascending. `start`/`end` are Unix seconds.
    ///
    /// # Errors
    ///
    /// Returns `HistoryTimeout` when nothing arrived, a session error, or
    /// `NotInitialized`.
    pub async fn get_history(
        &self,
        symbol: &str,
        timeframe: &Timeframe,
        count: u64,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Candle>, ClientError> {
        self.ensure_initialized()?;
        self.coordinator
            .with_call(history::fetch_history(
                &self.session,
                &self.history,
                symbol,
                timeframe,
                count,
                start,
                end,
            ))
            .await
    }

    /// Subscribe to the raw frame log.
    #[must_use]
    pub fn debug_log(&self) -> broadcast::Receiver<FrameLogEntry> {
        self.session.frame_log().subscribe()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            initialized: self.is_initialized(),
            connection: self.session.status(),
            active_calls: self.coordinator.active_calls(),
            pending_reconnect: self.coordinator.is_pending(),
            subscriptions: self.multiplexer.stats(),
        }
    }

    fn ensure_initialized(&self) -> Result<(), ClientError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(ClientError::NotInitialized)
        }
    }
}

impl std::fmt::Debug for TradingViewClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingViewClient")
            .field("initialized", &self.is_initialized())
            .field("session", &self.session)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

async fn dispatch_quotes(
    multiplexer: Arc<SubscriptionMultiplexer>,
    mut events: mpsc::UnboundedReceiver<QuoteEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,

            event = events.recv() => {
                let Some(event) = event else { break };
                if event.status == QUOTE_STATUS_OK {
                    multiplexer.dispatch(&event.symbol, &event.values);
                } else {
                    tracing::debug!(symbol = %event.symbol, status = %event.status, "Quote not dispatched");
                }
            }
        }
    }
}

// =============================================================================
// Port Adapter
// =============================================================================

impl From<ClientError> for MarketDataError {
    fn from(e: ClientError) -> Self {
        if e.is_timeout() {
            return Self::Timeout {
                message: e.to_string(),
            };
        }
        match e {
            ClientError::NotInitialized
            | ClientError::Session(
                SessionError::NotConnected | SessionError::NotReady | SessionError::UpstreamUnavailable(_),
            ) => Self::Unavailable {
                message: e.to_string(),
            },
            other => Self::Upstream {
                message: other.to_string(),
            },
        }
    }
}

fn unix_seconds(time: Option<DateTime<Utc>>) -> Option<i64> {
    time.map(|t| t.timestamp())
}

#[async_trait]
impl MarketDataPort for TradingViewClient {
    async fn quote(&self, symbol: &str) -> Result<QuoteSnapshot, MarketDataError> {
        let ticker = self.get_ticker(symbol).await?;
        Ok(self.coordinator.with_call(ticker.fetch()).await?)
    }

    async fn latest_candle(&self, symbol: &str, timeframe: &Timeframe) -> Result<Option<Candle>, MarketDataError> {
        Ok(self.get_candle(symbol, timeframe).await?)
    }

    async fn history(&self, query: &HistoryQuery) -> Result<Vec<Candle>, MarketDataError> {
        Ok(self
            .get_history(
                &query.symbol,
                &query.timeframe,
                query.count,
                unix_seconds(query.start),
                unix_seconds(query.end),
            )
            .await?)
    }

    async fn watch(&self, symbol: &str) -> Result<QuoteStream, MarketDataError> {
        let ticker = self.get_ticker(symbol).await?;
        let updates = ticker.updates();
        let initial = ticker.snapshot();
        let initial = (!initial.is_empty()).then_some(initial);
        Ok(futures::stream::iter(initial).chain(updates).boxed())
    }

    fn upstream_status(&self) -> UpstreamStatus {
        let status = self.status();
        UpstreamStatus {
            initialized: status.initialized,
            state: status.connection.state.as_str().to_string(),
            upstream_symbols: status.connection.upstream_symbols,
            active_calls: status.active_calls,
            pending_reconnect: status.pending_reconnect,
            ticker_subscriptions: status.subscriptions.subscribers,
            frames_received: status.connection.frames_received,
            frames_sent: status.connection.frames_sent,
            connected_at: status.connection.connected_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::broadcast::FrameLogHub;

    fn client() -> TradingViewClient {
        TradingViewClient::new(ClientSettings::default(), Arc::new(FrameLogHub::new(8)))
    }

    #[tokio::test]
    async fn calls_before_setup_are_rejected() {
        let client = client();
        assert!(matches!(
            client.get_ticker("AAPL").await,
            Err(ClientError::NotInitialized)
        ));
        assert!(matches!(
            client.get_candle("AAPL", &Timeframe::daily()).await,
            Err(ClientError::NotInitialized)
        ));
        assert!(!client.status().initialized);
    }

    #[tokio::test]
    async fn cleanup_without_setup_is_noop() {
        let client = client();
        client.cleanup().await;
        client.cleanup().await;
        assert_eq!(client.status().connection.state.as_str(), "disconnected");
    }

    #[tokio::test]
    async fn failed_setup_rolls_back() {
        let settings = ClientSettings {
            session: SessionConfig {
                url: "ws://127.0.0.1:1/socket".to_string(),
                connect_timeout: Duration::from_millis(500),
                ..SessionConfig::default()
            },
            ..ClientSettings::default()
        };
        let client = TradingViewClient::new(settings, Arc::new(FrameLogHub::new(8)));

        assert!(client.setup().await.is_err());
        assert!(!client.is_initialized());
        assert!(client.background.lock().await.is_none());
    }

    #[test]
    fn error_mapping() {
        let timeout = MarketDataError::from(ClientError::FetchTimeout {
            symbol: "AAPL".to_string(),
            timeout: Duration::from_secs(10),
        });
        assert!(matches!(timeout, MarketDataError::Timeout { .. }));

        let unavailable = MarketDataError::from(ClientError::Session(SessionError::NotConnected));
        assert!(matches!(unavailable, MarketDataError::Unavailable { .. }));

        let other = MarketDataError::from(ClientError::Session(SessionError::InvalidRequest(
            "bad".to_string(),
        )));
        assert!(matches!(other, MarketDataError::Upstream { .. }));
    }
}
