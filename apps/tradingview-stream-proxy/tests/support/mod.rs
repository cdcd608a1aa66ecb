//! Stub TradingView upstream for integration tests.
//!
//! Speaks just enough of the protocol: sends the session handshake on
//! connect, confirms `quote_add_symbols` with a `qsd` patch, and answers
//! `create_series`, `request_more_data` and `set_range` with bars from a
//! fixed daily series.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use tradingview_stream_proxy::infrastructure::tradingview::codec::{
    Packet, create_message, parse_messages, prepend_header,
};

/// 2024-01-01T00:00:00Z.
pub const FIRST_BAR: i64 = 1_704_067_200;
pub const DAY: i64 = 86_400;
pub const QUOTE_PRICE: f64 = 100.5;

#[derive(Default)]
struct Recorded {
    calls: Vec<(String, Vec<Value>)>,
}

struct Shared {
    bars: Vec<Vec<Value>>,
    recorded: Mutex<Recorded>,
    connections: AtomicUsize,
    push: broadcast::Sender<String>,
}

pub struct StubUpstream {
    pub url: String,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl StubUpstream {
    /// Start a stub serving `bar_count` consecutive daily bars.
    pub async fn start(bar_count: usize) -> Self {
        let bars = (0..bar_count)
            .map(|i| {
                let i = i64::try_from(i).unwrap();
                let close = 100.0 + f64::from(u32::try_from(i).unwrap());
                vec![
                    json!(FIRST_BAR + i * DAY),
                    json!(close - 1.0),
                    json!(close + 2.0),
                    json!(close - 2.0),
                    json!(close),
                    json!(1_000),
                ]
            })
            .collect();

        let (push, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            bars,
            recorded: Mutex::new(Recorded::default()),
            connections: AtomicUsize::new(0),
            push,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let accept_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, Arc::clone(&accept_shared)));
            }
        });

        Self { url, shared, task }
    }

    /// Params of every call to `method`, in arrival order.
    pub fn calls(&self, method: &str) -> Vec<Vec<Value>> {
        self.shared
            .recorded
            .lock()
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Every method received, in arrival order.
    pub fn methods(&self) -> Vec<String> {
        self.shared
            .recorded
            .lock()
            .calls
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Latest quote session created by the client.
    pub fn quote_session(&self) -> Option<String> {
        self.calls("quote_create_session")
            .last()
            .and_then(|p| p.first())
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Push a quote patch for `symbol` on the current quote session.
    pub fn push_quote(&self, symbol: &str, values: Value) {
        let session = self.quote_session().expect("no quote session yet");
        let frame = create_message(
            "qsd",
            &[json!(session), json!({"n": symbol, "s": "ok", "v": values})],
        );
        let _ = self.shared.push.send(frame);
    }

    /// Wait until `method` has been received `count` times.
    pub async fn wait_for(&self, method: &str, count: usize) -> bool {
        self.wait_until(|stub| stub.calls(method).len() >= count).await
    }

    /// Poll `check` for up to five seconds.
    pub async fn wait_until(&self, check: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..100 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

impl Drop for StubUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(stream: TcpStream, shared: Arc<Shared>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = ws.split();
    let mut pushed = shared.push.subscribe();

    let handshake = prepend_header(
        &json!({"session_id": "<0.17.1>_stub", "timestamp": FIRST_BAR, "release": "stub"})
            .to_string(),
    );
    if sink.send(Message::Text(handshake.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    for reply in handle_text(&shared, text.as_str()) {
                        if sink.send(Message::Text(reply.into())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            frame = pushed.recv() => {
                if let Ok(frame) = frame
                    && sink.send(Message::Text(frame.into())).await.is_err()
                {
                    return;
                }
            }
        }
    }
}

fn handle_text(shared: &Shared, text: &str) -> Vec<String> {
    let mut replies = Vec::new();
    for packet in parse_messages(text) {
        let Packet::Message(value) = packet else {
            continue;
        };
        let method = value["m"].as_str().unwrap_or_default().to_string();
        let params = value["p"].as_array().cloned().unwrap_or_default();
        shared.recorded.lock().calls.push((method.clone(), params.clone()));
        replies.extend(respond(shared, &method, &params));
    }
    replies
}

fn respond(shared: &Shared, method: &str, params: &[Value]) -> Option<String> {
    let text = |idx: usize| params.get(idx).and_then(Value::as_str).unwrap_or_default();
    match method {
        "quote_add_symbols" => {
            let symbol = text(1);
            Some(create_message(
                "qsd",
                &[
                    json!(text(0)),
                    json!({
                        "n": symbol,
                        "s": "ok",
                        "v": {
                            "lp": QUOTE_PRICE,
                            "ch": 1.5,
                            "chp": 1.52,
                            "exchange": "STUB",
                            "type": "stock",
                            "pro_name": symbol,
                        }
                    }),
                ],
            ))
        }
        "create_series" => {
            let count = params.get(5).and_then(Value::as_u64).unwrap_or(0);
            let count = usize::try_from(count).unwrap_or(usize::MAX);
            let skip = shared.bars.len().saturating_sub(count);
            let bars: Vec<_> = shared.bars.iter().skip(skip).collect();
            Some(timescale(text(0), text(1), &bars))
        }
        "request_more_data" => {
            let bars: Vec<_> = shared.bars.iter().collect();
            Some(timescale(text(0), text(1), &bars))
        }
        "set_range" => {
            let from = params.get(2).and_then(Value::as_i64).unwrap_or(i64::MIN);
            let to = params.get(3).and_then(Value::as_i64).unwrap_or(i64::MAX);
            let bars: Vec<_> = shared
                .bars
                .iter()
                .filter(|bar| bar[0].as_i64().is_some_and(|t| t >= from && t <= to))
                .collect();
            Some(timescale(text(0), text(1), &bars))
        }
        _ => None,
    }
}

fn timescale(chart: &str, series: &str, bars: &[&Vec<Value>]) -> String {
    let entries: Vec<Value> = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| json!({"i": i, "v": bar}))
        .collect();
    create_message(
        "timescale_update",
        &[json!(chart), json!({ series: { "s": entries } })],
    )
}
