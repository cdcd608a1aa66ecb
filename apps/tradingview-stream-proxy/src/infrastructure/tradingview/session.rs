//! TradingView Session Manager
//!
//! Owns the single WebSocket connection to TradingView's streaming endpoint,
//! drives the session handshake, and routes inbound packets.
//!
//! # Stream URL
//!
//! - Production: `wss://data.tradingview.com/socket.io/websocket`
//!
//! # Protocol
//!
//! After the socket opens the server sends a handshake packet carrying a
//! `session_id`. The client answers with, in order:
//!
//! 1. `set_auth_token`
//! 2. `quote_create_session`
//! 3. `chart_create_session`
//! 4. `quote_set_fields`
//!
//! From then on `qsd` packets for the active quote session are forwarded to
//! the quote sink, and `timescale_update` packets are routed to whichever
//! chart session they name.
//!
//! # Tasks
//!
//! Each connection runs one reader task (decodes and routes in arrival order)
//! and one writer task (drains the send queue). Sends issued while the socket
//! is still opening wait in the queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::codec;
use super::messages::{Inbound, Method, QUOTE_FIELDS, SessionKind, generate_session_id};
use crate::infrastructure::broadcast::{Direction, SharedFrameLogHub};
use crate::infrastructure::metrics;

/// Default streaming endpoint.
pub const DEFAULT_URL: &str = "wss://data.tradingview.com/socket.io/websocket";

/// Origin header expected by the endpoint.
pub const DEFAULT_ORIGIN: &str = "https://www.tradingview.com";

/// Browser user agent presented during the upgrade.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Token used for anonymous sessions.
pub const UNAUTHORIZED_USER_TOKEN: &str = "unauthorized_user_token";

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the session manager.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The socket did not open in time.
    #[error("socket did not open within {0:?}")]
    ConnectTimeout(Duration),

    /// The socket opened but no handshake packet arrived in time.
    #[error("session handshake not received within {0:?}")]
    SessionTimeout(Duration),

    /// Socket-level failure.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The upgrade request could not be built from the configuration.
    #[error("invalid connection request: {0}")]
    InvalidRequest(String),

    /// No connection exists.
    #[error("not connected")]
    NotConnected,

    /// Connected, but the handshake has not assigned sessions yet.
    #[error("session not ready")]
    NotReady,
}

impl From<tungstenite::Error> for SessionError {
    fn from(e: tungstenite::Error) -> Self {
        Self::UpstreamUnavailable(e.to_string())
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the session manager.
#[derive(Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// `Origin` header.
    pub origin: String,
    /// `User-Agent` header.
    pub user_agent: String,
    /// Token sent with `set_auth_token`.
    pub auth_token: String,
    /// Bound on the socket opening.
    pub connect_timeout: Duration,
    /// Bound on the handshake packet after the socket opened.
    pub session_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            auth_token: UNAUTHORIZED_USER_TOKEN.to_string(),
            connect_timeout: Duration::from_millis(3_000),
            session_timeout: Duration::from_millis(3_000),
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("url", &self.url)
            .field("origin", &self.origin)
            .field("auth_token", &"[REDACTED]")
            .field("connect_timeout", &self.connect_timeout)
            .field("session_timeout", &self.session_timeout)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Events
// =============================================================================

/// A quote data patch for the active quote session.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteEvent {
    /// Symbol name as registered.
    pub symbol: String,
    /// Upstream status (`ok` when usable).
    pub status: String,
    /// Field patch.
    pub values: Map<String, Value>,
}

/// A chart update routed to one chart session.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartUpdate {
    /// Chart session the update was addressed to.
    pub session: String,
    /// Series-keyed payload.
    pub payload: Value,
}

type RouteTable = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<ChartUpdate>>>>;

/// Receiving end of a chart session route. Dropping it detaches the route.
#[derive(Debug)]
pub struct ChartRoute {
    session: String,
    rx: mpsc::UnboundedReceiver<ChartUpdate>,
    routes: RouteTable,
}

impl ChartRoute {
    /// Chart session this route listens on.
    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Next update for the session, `None` once the route is detached.
    pub async fn recv(&mut self) -> Option<ChartUpdate> {
        self.rx.recv().await
    }
}

impl Drop for ChartRoute {
    fn drop(&mut self) {
        self.routes.write().remove(&self.session);
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Upgrade in progress.
    Connecting,
    /// Socket open, waiting for the handshake.
    Open,
    /// Handshake done, sessions assigned.
    Ready,
}

impl ConnectionState {
    /// State name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Ready => "ready",
        }
    }
}

/// Point-in-time view of the connection for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Whether a quote session is assigned.
    pub quote_session: bool,
    /// Symbols registered upstream.
    pub upstream_symbols: usize,
    /// Chart sessions with an attached route.
    pub chart_routes: usize,
    /// Frames received since start.
    pub frames_received: u64,
    /// Frames sent since start.
    pub frames_sent: u64,
    /// When the current connection became ready.
    pub connected_at: Option<DateTime<Utc>>,
}

struct Connection {
    generation: u64,
    state: ConnectionState,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    quote_session: Option<String>,
    chart_session: Option<String>,
    symbols: HashSet<String>,
    ready_tx: Option<oneshot::Sender<()>>,
    connected_at: Option<DateTime<Utc>>,
}

impl Connection {
    fn chart_session(&self, explicit: Option<&str>) -> Result<String, SessionError> {
        explicit
            .map(str::to_string)
            .or_else(|| self.chart_session.clone())
            .ok_or(SessionError::NotReady)
    }
}

// =============================================================================
// Session Manager
// =============================================================================

/// Owner of the upstream connection and all session identifiers.
pub struct SessionManager {
    config: SessionConfig,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    quote_sink: Mutex<Option<mpsc::UnboundedSender<QuoteEvent>>>,
    chart_routes: RouteTable,
    frame_log: SharedFrameLogHub,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
}

impl SessionManager {
    /// Create a disconnected session manager.
    #[must_use]
    pub fn new(config: SessionConfig, frame_log: SharedFrameLogHub) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
            generation: AtomicU64::new(0),
            quote_sink: Mutex::new(None),
            chart_routes: Arc::new(RwLock::new(HashMap::new())),
            frame_log,
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Direct quote events to `sink`, replacing any previous sink.
    pub fn install_quote_sink(&self, sink: mpsc::UnboundedSender<QuoteEvent>) {
        *self.quote_sink.lock() = Some(sink);
    }

    /// Stop forwarding quote events.
    pub fn clear_quote_sink(&self) {
        self.quote_sink.lock().take();
    }

    /// Frame log hub receiving every raw frame.
    #[must_use]
    pub fn frame_log(&self) -> &SharedFrameLogHub {
        &self.frame_log
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open a fresh connection and wait until the session is ready.
    ///
    /// Any existing connection is torn down first.
    ///
    /// # Errors
    ///
    /// Returns `ConnectTimeout` or `SessionTimeout` when the respective wait
    /// runs out, or `UpstreamUnavailable` when the socket fails.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        self.disconnect();

        let request = self.build_request()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        *self.connection.lock() = Some(Connection {
            generation,
            state: ConnectionState::Connecting,
            outbound: outbound_tx,
            cancel: cancel.clone(),
            quote_session: None,
            chart_session: None,
            symbols: HashSet::new(),
            ready_tx: Some(ready_tx),
            connected_at: None,
        });

        tracing::info!(url = %self.config.url, generation, "Connecting to TradingView stream");

        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                self.abandon(generation);
                metrics::record_upstream_error("connect");
                return Err(e.into());
            }
            Err(_) => {
                self.abandon(generation);
                metrics::record_upstream_error("connect_timeout");
                return Err(SessionError::ConnectTimeout(self.config.connect_timeout));
            }
        };

        self.set_state(generation, ConnectionState::Open);

        let (write, read) = stream.split();
        tokio::spawn(write_loop(write, outbound_rx, cancel.clone()));
        tokio::spawn(Arc::clone(self).read_loop(read, generation, cancel));

        match tokio::time::timeout(self.config.session_timeout, ready_rx).await {
            Ok(Ok(())) => {
                metrics::set_upstream_connected(true);
                Ok(())
            }
            Ok(Err(_)) => {
                self.abandon(generation);
                Err(SessionError::UpstreamUnavailable(
                    "connection closed before the session handshake".to_string(),
                ))
            }
            Err(_) => {
                self.abandon(generation);
                metrics::record_upstream_error("session_timeout");
                Err(SessionError::SessionTimeout(self.config.session_timeout))
            }
        }
    }

    /// Close the connection and forget all session state. Idempotent.
    pub fn disconnect(&self) {
        let Some(connection) = self.connection.lock().take() else {
            return;
        };
        connection.cancel.cancel();

        tracing::info!(
            generation = connection.generation,
            symbols = connection.symbols.len(),
            "Disconnected from TradingView stream"
        );
        metrics::set_upstream_connected(false);
        metrics::set_upstream_symbols(0);
    }

    /// Tear down and re-establish the connection.
    ///
    /// # Errors
    ///
    /// Propagates [`SessionManager::connect`] failures.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), SessionError> {
        self.disconnect();
        self.connect().await
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        let guard = self.connection.lock();
        let connection = guard.as_ref();
        ConnectionStatus {
            state: connection.map_or(ConnectionState::Disconnected, |c| c.state),
            quote_session: connection.is_some_and(|c| c.quote_session.is_some()),
            upstream_symbols: connection.map_or(0, |c| c.symbols.len()),
            chart_routes: self.chart_routes.read().len(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            connected_at: connection.and_then(|c| c.connected_at),
        }
    }

    /// Whether the handshake has completed on the current connection.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| c.state == ConnectionState::Ready)
    }

    // =========================================================================
    // Quote Registrations
    // =========================================================================

    /// Register a symbol on the quote session.
    ///
    /// Returns `true` when a `quote_add_symbols` was sent, `false` when the
    /// symbol was already registered.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` / `NotReady` when no quote session exists.
    pub fn register_symbol(&self, symbol: &str) -> Result<bool, SessionError> {
        let mut guard = self.connection.lock();
        let connection = guard.as_mut().ok_or(SessionError::NotConnected)?;
        let quote_session = connection.quote_session.clone().ok_or(SessionError::NotReady)?;

        if !connection.symbols.insert(symbol.to_string()) {
            return Ok(false);
        }

        self.push(
            connection,
            Method::QuoteAddSymbols,
            &[json!(quote_session), json!(symbol)],
        );
        metrics::set_upstream_symbols(connection.symbols.len());
        Ok(true)
    }

    /// Remove a symbol from the quote session.
    ///
    /// Returns `true` when a `quote_remove_symbols` was sent.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` / `NotReady` when no quote session exists.
    pub fn unregister_symbol(&self, symbol: &str) -> Result<bool, SessionError> {
        let mut guard = self.connection.lock();
        let connection = guard.as_mut().ok_or(SessionError::NotConnected)?;
        let quote_session = connection.quote_session.clone().ok_or(SessionError::NotReady)?;

        if !connection.symbols.remove(symbol) {
            return Ok(false);
        }

        self.push(
            connection,
            Method::QuoteRemoveSymbols,
            &[json!(quote_session), json!(symbol)],
        );
        metrics::set_upstream_symbols(connection.symbols.len());
        Ok(true)
    }

    /// Symbols currently registered upstream.
    #[must_use]
    pub fn registered_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<_> = self
            .connection
            .lock()
            .as_ref()
            .map(|c| c.symbols.iter().cloned().collect())
            .unwrap_or_default();
        symbols.sort();
        symbols
    }

    // =========================================================================
    // Chart Sessions
    // =========================================================================

    /// Allocate and announce a new chart session.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` without a connection.
    pub fn create_chart_session(&self) -> Result<String, SessionError> {
        let session = generate_session_id(SessionKind::Chart);
        self.send(Method::ChartCreateSession, &[json!(session), json!("")])?;
        Ok(session)
    }

    /// Tear down a chart session upstream.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` without a connection.
    pub fn delete_chart_session(&self, session: &str) -> Result<(), SessionError> {
        self.send(Method::ChartDeleteSession, &[json!(session)])
    }

    /// Attach a route receiving every `timescale_update` for `session`.
    #[must_use]
    pub fn route_chart_session(&self, session: &str) -> ChartRoute {
        let (tx, rx) = mpsc::unbounded_channel();
        self.chart_routes.write().insert(session.to_string(), tx);
        ChartRoute {
            session: session.to_string(),
            rx,
            routes: Arc::clone(&self.chart_routes),
        }
    }

    /// `resolve_symbol` on `session`, or the default chart session.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` / `NotReady` when no chart session applies.
    pub fn resolve_symbol(
        &self,
        session: Option<&str>,
        symbol_id: &str,
        symbol: &str,
    ) -> Result<(), SessionError> {
        self.send_chart(session, Method::ResolveSymbol, |cs| {
            vec![json!(cs), json!(symbol_id), json!(symbol)]
        })
    }

    /// `create_series` on `session`, or the default chart session.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` / `NotReady` when no chart session applies.
    pub fn create_series(
        &self,
        session: Option<&str>,
        series_id: &str,
        symbol_id: &str,
        resolution: &str,
        count: u64,
    ) -> Result<(), SessionError> {
        self.send_chart(session, Method::CreateSeries, |cs| {
            vec![
                json!(cs),
                json!(series_id),
                json!("s1"),
                json!(symbol_id),
                json!(resolution),
                json!(count),
            ]
        })
    }

    /// `request_more_data` on `session`, or the default chart session.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` / `NotReady` when no chart session applies.
    pub fn request_more_data(
        &self,
        session: Option<&str>,
        series_id: &str,
        count: u64,
    ) -> Result<(), SessionError> {
        self.send_chart(session, Method::RequestMoreData, |cs| {
            vec![json!(cs), json!(series_id), json!(count)]
        })
    }

    /// `set_range` on `session`, or the default chart session. Bounds are
    /// Unix seconds.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` / `NotReady` when no chart session applies.
    pub fn set_range(
        &self,
        session: Option<&str>,
        series_id: &str,
        from: i64,
        to: i64,
    ) -> Result<(), SessionError> {
        self.send_chart(session, Method::SetRange, |cs| {
            vec![json!(cs), json!(series_id), json!(from), json!(to)]
        })
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Queue a method call on the current connection.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` without a connection.
    pub fn send(&self, method: Method, params: &[Value]) -> Result<(), SessionError> {
        let guard = self.connection.lock();
        let connection = guard.as_ref().ok_or(SessionError::NotConnected)?;
        self.push(connection, method, params);
        Ok(())
    }

    fn send_chart(
        &self,
        session: Option<&str>,
        method: Method,
        params: impl FnOnce(&str) -> Vec<Value>,
    ) -> Result<(), SessionError> {
        let guard = self.connection.lock();
        let connection = guard.as_ref().ok_or(SessionError::NotConnected)?;
        let chart_session = connection.chart_session(session)?;
        self.push(connection, method, &params(&chart_session));
        Ok(())
    }

    fn push(&self, connection: &Connection, method: Method, params: &[Value]) {
        self.push_frame(connection, codec::create_message(method.as_str(), params));
    }

    fn push_frame(&self, connection: &Connection, frame: String) {
        self.frame_log.publish(Direction::Tx, &frame);
        tracing::trace!(frame = %frame, "TX");
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        metrics::record_frame(Direction::Tx);

        if connection.outbound.send(Message::Text(frame.into())).is_err() {
            tracing::debug!(generation = connection.generation, "Writer gone, frame dropped");
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    async fn read_loop<S>(self: Arc<Self>, mut read: S, generation: u64, cancel: CancellationToken)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.on_message(generation, text.as_str());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.with_connection(generation, |c| {
                                let _ = c.outbound.send(Message::Pong(data));
                            });
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Server sent close frame");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "TradingView socket error");
                            metrics::record_upstream_error("socket");
                            break;
                        }
                        None => {
                            tracing::info!("WebSocket stream ended");
                            break;
                        }
                    }
                }
            }
        }

        self.on_closed(generation);
    }

    fn on_message(&self, generation: u64, raw: &str) {
        self.frame_log.publish(Direction::Rx, raw);
        tracing::trace!(frame = %raw, "RX");
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        metrics::record_frame(Direction::Rx);

        for frame in codec::decode_frames(raw) {
            match frame {
                Ok(packet) => self.on_packet(generation, Inbound::classify(packet)),
                Err(e) => {
                    tracing::debug!(error = %e, "Dropping malformed frame");
                    metrics::record_malformed_frame();
                }
            }
        }
    }

    fn on_packet(&self, generation: u64, inbound: Inbound) {
        match inbound {
            Inbound::KeepAlive(beat) => {
                self.with_connection(generation, |c| {
                    self.push_frame(c, codec::keepalive_frame(&beat));
                });
            }
            Inbound::Session { session_id } => self.on_handshake(generation, &session_id),
            Inbound::QuoteData {
                session,
                symbol,
                status,
                values,
            } => {
                let active = self.with_connection(generation, |c| {
                    c.quote_session.as_deref() == Some(session.as_str())
                });
                if active != Some(true) {
                    tracing::trace!(session = %session, "Quote data for inactive session");
                    return;
                }
                if let Some(sink) = self.quote_sink.lock().as_ref() {
                    let _ = sink.send(QuoteEvent {
                        symbol,
                        status,
                        values,
                    });
                }
            }
            Inbound::TimescaleUpdate { session, payload } => {
                let routes = self.chart_routes.read();
                match routes.get(&session) {
                    Some(route) => {
                        let _ = route.send(ChartUpdate { session, payload });
                    }
                    None => tracing::trace!(session = %session, "Unrouted chart update"),
                }
            }
            Inbound::Other { method } => {
                tracing::trace!(method = ?method, "Ignoring unhandled message type");
            }
        }
    }

    fn on_handshake(&self, generation: u64, server_session: &str) {
        let mut guard = self.connection.lock();
        let Some(connection) = guard.as_mut().filter(|c| c.generation == generation) else {
            return;
        };

        let quote_session = generate_session_id(SessionKind::Quote);
        let chart_session = generate_session_id(SessionKind::Chart);

        let mut fields = Vec::with_capacity(QUOTE_FIELDS.len() + 1);
        fields.push(json!(quote_session));
        fields.extend(QUOTE_FIELDS.iter().map(|f| json!(f)));

        self.push(connection, Method::SetAuthToken, &[json!(self.config.auth_token)]);
        self.push(connection, Method::QuoteCreateSession, &[json!(quote_session)]);
        self.push(
            connection,
            Method::ChartCreateSession,
            &[json!(chart_session), json!("")],
        );
        self.push(connection, Method::QuoteSetFields, &fields);

        tracing::info!(
            server_session,
            quote_session = %quote_session,
            chart_session = %chart_session,
            "TradingView session ready"
        );

        connection.quote_session = Some(quote_session);
        connection.chart_session = Some(chart_session);
        connection.state = ConnectionState::Ready;
        connection.connected_at = Some(Utc::now());
        if let Some(ready) = connection.ready_tx.take() {
            let _ = ready.send(());
        }
    }

    fn on_closed(&self, generation: u64) {
        let mut guard = self.connection.lock();
        if guard.as_ref().is_some_and(|c| c.generation == generation) {
            if let Some(connection) = guard.take() {
                connection.cancel.cancel();
            }
            tracing::warn!(generation, "TradingView connection lost");
            metrics::set_upstream_connected(false);
            metrics::set_upstream_symbols(0);
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn with_connection<T>(&self, generation: u64, f: impl FnOnce(&Connection) -> T) -> Option<T> {
        self.connection
            .lock()
            .as_ref()
            .filter(|c| c.generation == generation)
            .map(f)
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        if let Some(connection) = self
            .connection
            .lock()
            .as_mut()
            .filter(|c| c.generation == generation)
        {
            connection.state = state;
        }
    }

    fn abandon(&self, generation: u64) {
        let mut guard = self.connection.lock();
        if guard.as_ref().is_some_and(|c| c.generation == generation)
            && let Some(connection) = guard.take()
        {
            connection.cancel.cancel();
        }
    }

    fn build_request(&self) -> Result<Request, SessionError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::InvalidRequest(e.to_string()))?;

        let origin = HeaderValue::from_str(&self.config.origin)
            .map_err(|e| SessionError::InvalidRequest(format!("origin: {e}")))?;
        let user_agent = HeaderValue::from_str(&self.config.user_agent)
            .map_err(|e| SessionError::InvalidRequest(format!("user agent: {e}")))?;

        let headers = request.headers_mut();
        headers.insert(header::ORIGIN, origin);
        headers.insert(header::USER_AGENT, user_agent);
        Ok(request)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

async fn write_loop<W>(
    mut write: W,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) where
    W: SinkExt<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }

            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    let _ = write.close().await;
                    break;
                };
                if let Err(e) = write.send(msg).await {
                    tracing::warn!(error = %e, "Failed to write to TradingView socket");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
impl SessionManager {
    /// A manager whose handshake completed over no socket, with the send
    /// queue handed back for inspection.
    pub(crate) fn ready_for_test() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let manager = Arc::new(Self::new(
            SessionConfig::default(),
            Arc::new(crate::infrastructure::broadcast::FrameLogHub::new(64)),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = manager.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *manager.connection.lock() = Some(Connection {
            generation,
            state: ConnectionState::Open,
            outbound: tx,
            cancel: CancellationToken::new(),
            quote_session: None,
            chart_session: None,
            symbols: HashSet::new(),
            ready_tx: None,
            connected_at: None,
        });
        manager.on_packet(
            generation,
            Inbound::Session {
                session_id: "test".to_string(),
            },
        );
        (manager, rx)
    }

    pub(crate) fn quote_session_for_test(&self) -> Option<String> {
        self.connection
            .lock()
            .as_ref()
            .and_then(|c| c.quote_session.clone())
    }

    /// Feed a raw inbound message as if the reader task had received it.
    pub(crate) fn inject_for_test(&self, raw: &str) {
        let generation = self.generation.load(Ordering::SeqCst);
        self.on_message(generation, raw);
    }
}

// =============================================================================
// Tests
// =============================================================================
