//! Socket endpoints.
//!
//! `/ws` speaks a small JSON event protocol. Clients send
//! `{"type":"subscribe","symbol":"NASDAQ:AAPL"}` or `unsubscribe`; the
//! server answers with `price` events (the current snapshot, then every
//! update) or an `error` event. Each subscription is a task draining the
//! port's quote stream; aborting the task drops the stream, which detaches
//! the ticker listener.
//!
//! `/ws/debug` replays every upstream frame as `{direction, msg, time}`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::AppState;
use crate::application::ports::MarketDataPort;
use crate::application::services::QuoteView;

/// Buffered outbound events per socket.
const OUTBOUND_CAPACITY: usize = 256;

/// Event sent by a socket client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Start receiving prices for a symbol.
    Subscribe {
        /// Symbol to follow.
        symbol: String,
    },
    /// Stop receiving prices for a symbol.
    Unsubscribe {
        /// Symbol to drop.
        symbol: String,
    },
}

/// Event sent to a socket client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// A quote snapshot.
    Price {
        /// Symbol as subscribed.
        symbol: String,
        /// Quote fields.
        data: QuoteView,
    },
    /// A request could not be served.
    Error {
        /// What went wrong.
        message: String,
    },
}

// =============================================================================
// Quote Subscriptions
// =============================================================================

/// Per-socket subscription state.
struct SocketSession {
    port: Arc<dyn MarketDataPort>,
    outbound: mpsc::Sender<ServerMessage>,
    watches: HashMap<String, JoinHandle<()>>,
}

impl SocketSession {
    fn new(port: Arc<dyn MarketDataPort>, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            port,
            outbound,
            watches: HashMap::new(),
        }
    }

    fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Subscribe { symbol }) => self.subscribe(symbol),
            Ok(ClientMessage::Unsubscribe { symbol }) => self.unsubscribe(&symbol),
            Err(e) => {
                tracing::debug!(error = %e, "Unrecognized socket message");
                self.reply_error("Invalid message".to_string());
            }
        }
    }

    /// Never waits on the upstream: the watch is opened inside the
    /// per-symbol task so the socket loop keeps draining `outbound`.
    fn subscribe(&mut self, symbol: String) {
        let symbol = symbol.trim().to_string();
        if symbol.is_empty() {
            return;
        }
        tracing::debug!(%symbol, "Socket client subscribing");

        let port = Arc::clone(&self.port);
        let outbound = self.outbound.clone();
        let task_symbol = symbol.clone();
        let task = tokio::spawn(async move {
            let mut stream = match port.watch(&task_symbol).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(symbol = %task_symbol, error = %e, "Socket subscription failed");
                    let message = format!("Failed to subscribe to {task_symbol}");
                    let _ = outbound.send(ServerMessage::Error { message }).await;
                    return;
                }
            };
            while let Some(snapshot) = stream.next().await {
                let event = ServerMessage::Price {
                    symbol: task_symbol.clone(),
                    data: QuoteView::from_snapshot(&snapshot).stamped(Utc::now()),
                };
                if outbound.send(event).await.is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.watches.insert(symbol, task) {
            previous.abort();
        }
    }

    fn unsubscribe(&mut self, symbol: &str) {
        if let Some(task) = self.watches.remove(symbol.trim()) {
            task.abort();
            tracing::debug!(%symbol, "Socket client unsubscribed");
        }
    }

    /// Dropped when the client is not keeping up.
    fn reply_error(&self, message: String) {
        if let Err(e) = self.outbound.try_send(ServerMessage::Error { message }) {
            tracing::debug!(error = %e, "Socket error reply dropped");
        }
    }

    fn close(&mut self) {
        for (_, task) in self.watches.drain() {
            task.abort();
        }
    }
}

impl Drop for SocketSession {
    fn drop(&mut self) {
        self.close();
    }
}

pub(super) async fn quotes_socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_quotes(socket, state))
}

async fn serve_quotes(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut incoming) = socket.split();
    let (tx, mut rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let mut session = SocketSession::new(Arc::clone(state.port()), tx);

    state.client_connected();
    tracing::info!(clients = state.socket_clients(), "Socket client connected");

    loop {
        tokio::select! {
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()),
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            Some(event) = rx.recv() => {
                let Ok(json) = serde_json::to_string(&event) else {
                    continue;
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close();
    state.client_disconnected();
    tracing::info!(clients = state.socket_clients(), "Socket client disconnected");
}

// =============================================================================
// Frame Log
// =============================================================================

pub(super) async fn debug_socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_frame_log(socket, state))
}

async fn serve_frame_log(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut incoming) = socket.split();
    let mut frames = state.frame_log.subscribe();

    loop {
        tokio::select! {
            entry = frames.recv() => match entry {
                Ok(entry) => {
                    let Ok(json) = serde_json::to_string(&entry) else {
                        continue;
                    };
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Debug log receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;
    use serde_json::json;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::application::ports::{
        HistoryQuery, MarketDataError, MockMarketDataPort, QuoteStream, UpstreamStatus,
    };
    use crate::domain::streaming::{Candle, QuoteSnapshot, Timeframe};

    /// Holds every `watch` until released.
    struct GatedPort {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl MarketDataPort for GatedPort {
        async fn quote(&self, _symbol: &str) -> Result<QuoteSnapshot, MarketDataError> {
            unimplemented!()
        }

        async fn latest_candle(
            &self,
            _symbol: &str,
            _timeframe: &Timeframe,
        ) -> Result<Option<Candle>, MarketDataError> {
            unimplemented!()
        }

        async fn history(&self, _query: &HistoryQuery) -> Result<Vec<Candle>, MarketDataError> {
            unimplemented!()
        }

        async fn watch(&self, _symbol: &str) -> Result<QuoteStream, MarketDataError> {
            self.gate.notified().await;
            Ok(stream::iter(vec![snapshot(7.0)]).boxed())
        }

        fn upstream_status(&self) -> UpstreamStatus {
            UpstreamStatus::default()
        }
    }

    fn snapshot(price: f64) -> QuoteSnapshot {
        let mut snap = QuoteSnapshot::new();
        snap.apply(json!({ "lp": price }).as_object().unwrap());
        snap
    }

    fn session(port: MockMarketDataPort) -> (SocketSession, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (SocketSession::new(Arc::new(port), tx), rx)
    }

    #[test]
    fn client_messages_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","symbol":"NASDAQ:AAPL"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                symbol: "NASDAQ:AAPL".to_string()
            }
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).is_err());
    }

    #[test]
    fn server_messages_are_tagged() {
        let value = serde_json::to_value(ServerMessage::Error {
            message: "nope".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "error", "message": "nope"}));

        let value = serde_json::to_value(ServerMessage::Price {
            symbol: "X".to_string(),
            data: QuoteView::default(),
        })
        .unwrap();
        assert_eq!(value["type"], "price");
        assert_eq!(value["symbol"], "X");
    }

    #[tokio::test]
    async fn subscribe_forwards_every_snapshot() {
        let mut port = MockMarketDataPort::new();
        port.expect_watch()
            .times(1)
            .returning(|_| Ok(stream::iter(vec![snapshot(1.0), snapshot(2.0)]).boxed()));
        let (mut session, mut rx) = session(port);

        session.handle_text(r#"{"type":"subscribe","symbol":"X"}"#);

        for expected in [1, 2] {
            let ServerMessage::Price { symbol, data } = rx.recv().await.unwrap() else {
                panic!("expected price");
            };
            assert_eq!(symbol, "X");
            assert_eq!(data.price, Some(rust_decimal::Decimal::from(expected)));
            assert!(data.timestamp.is_some());
        }
    }

    #[tokio::test]
    async fn failed_subscribe_reports_error() {
        let mut port = MockMarketDataPort::new();
        port.expect_watch().returning(|_| {
            Err(MarketDataError::Unavailable {
                message: "not ready".to_string(),
            })
        });
        let (mut session, mut rx) = session(port);

        session.handle_text(r#"{"type":"subscribe","symbol":"X"}"#);

        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::Error {
                message: "Failed to subscribe to X".to_string()
            }
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.watches["X"].is_finished());
    }

    #[tokio::test]
    async fn unsubscribe_stops_forwarding() {
        let mut port = MockMarketDataPort::new();
        port.expect_watch().returning(|_| Ok(stream::pending::<QuoteSnapshot>().boxed()));
        let (mut session, _rx) = session(port);

        session.handle_text(r#"{"type":"subscribe","symbol":"X"}"#);
        assert_eq!(session.watches.len(), 1);

        session.handle_text(r#"{"type":"unsubscribe","symbol":"X"}"#);
        assert!(session.watches.is_empty());
    }

    #[tokio::test]
    async fn resubscribe_replaces_watch() {
        let mut port = MockMarketDataPort::new();
        port.expect_watch()
            .returning(|_| Ok(stream::pending::<QuoteSnapshot>().boxed()));
        let (mut session, _rx) = session(port);

        session.subscribe("X".to_string());
        let first = session.watches.get("X").unwrap().abort_handle();
        session.subscribe("X".to_string());

        assert_eq!(session.watches.len(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(first.is_finished());
    }

    #[tokio::test]
    async fn garbage_gets_error_reply() {
        let (mut session, mut rx) = session(MockMarketDataPort::new());
        session.handle_text("not json");
        assert!(matches!(rx.recv().await, Some(ServerMessage::Error { .. })));
    }

    #[tokio::test]
    async fn close_aborts_all_watches() {
        let mut port = MockMarketDataPort::new();
        port.expect_watch().returning(|_| Ok(stream::pending::<QuoteSnapshot>().boxed()));
        let (mut session, _rx) = session(port);

        session.subscribe("A".to_string());
        session.subscribe("B".to_string());
        let handles: Vec<_> = session.watches.values().map(JoinHandle::abort_handle).collect();

        session.close();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handles.iter().all(tokio::task::AbortHandle::is_finished));
    }

    #[tokio::test]
    async fn slow_watch_does_not_stall_replies() {
        let gate = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::channel(16);
        let mut session = SocketSession::new(
            Arc::new(GatedPort {
                gate: Arc::clone(&gate),
            }),
            tx,
        );

        session.handle_text(r#"{"type":"subscribe","symbol":"SLOW"}"#);
        session.handle_text("not json");

        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(matches!(reply, Some(ServerMessage::Error { .. })));

        gate.notify_one();
        let Some(ServerMessage::Price { symbol, data }) = rx.recv().await else {
            panic!("expected price");
        };
        assert_eq!(symbol, "SLOW");
        assert_eq!(data.price, Some(rust_decimal::Decimal::from(7)));
    }

    #[tokio::test]
    async fn error_reply_is_dropped_when_outbound_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut session = SocketSession::new(Arc::new(MockMarketDataPort::new()), tx);

        session.handle_text("not json");
        session.handle_text("still not json");

        assert!(matches!(rx.recv().await, Some(ServerMessage::Error { .. })));
        assert!(rx.try_recv().is_err());
    }
}
