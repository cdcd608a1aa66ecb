//! TradingView Protocol Messages
//!
//! Outbound method names, the quote field list, session token generation,
//! and classification of decoded inbound packets.
//!
//! # Inbound Shapes
//!
//! ```json
//! {"session_id":"<0.123.456>_sfo","timestamp":1700000000,"release":"..."}
//! {"m":"qsd","p":["qs_xxx",{"n":"BINANCE:BTCUSDT","s":"ok","v":{"lp":43000.5}}]}
//! {"m":"timescale_update","p":["cs_xxx",{"ser_1":{"s":[{"i":0,"v":[1700000000,1,2,0.5,1.5,10]}]}}]}
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use rand::distr::Alphabetic;
use serde_json::{Map, Value};

use super::codec::Packet;
use crate::domain::streaming::Candle;

// =============================================================================
// Outbound Methods
// =============================================================================

/// Methods the client sends upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `[token]`
    SetAuthToken,
    /// `[quote_session]`
    QuoteCreateSession,
    /// `[quote_session, ...fields]`
    QuoteSetFields,
    /// `[quote_session, symbol]`
    QuoteAddSymbols,
    /// `[quote_session, symbol]`
    QuoteRemoveSymbols,
    /// `[chart_session, ""]`
    ChartCreateSession,
    /// `[chart_session]`
    ChartDeleteSession,
    /// `[chart_session, symbol_id, symbol]`
    ResolveSymbol,
    /// `[chart_session, series_id, "s1", symbol_id, resolution, count]`
    CreateSeries,
    /// `[chart_session, series_id, count]`
    RequestMoreData,
    /// `[chart_session, series_id, from, to]`
    SetRange,
}

impl Method {
    /// Wire name of the method.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SetAuthToken => "set_auth_token",
            Self::QuoteCreateSession => "quote_create_session",
            Self::QuoteSetFields => "quote_set_fields",
            Self::QuoteAddSymbols => "quote_add_symbols",
            Self::QuoteRemoveSymbols => "quote_remove_symbols",
            Self::ChartCreateSession => "chart_create_session",
            Self::ChartDeleteSession => "chart_delete_session",
            Self::ResolveSymbol => "resolve_symbol",
            Self::CreateSeries => "create_series",
            Self::RequestMoreData => "request_more_data",
            Self::SetRange => "set_range",
        }
    }
}

/// Quote fields requested for every quote session.
pub const QUOTE_FIELDS: &[&str] = &[
    "base-currency-logoid",
    "ch",
    "chp",
    "currency-logoid",
    "currency_code",
    "current_session",
    "description",
    "exchange",
    "format",
    "fractional",
    "is_tradable",
    "language",
    "local_description",
    "logoid",
    "lp",
    "lp_time",
    "minmov",
    "minmove2",
    "original_name",
    "pricescale",
    "pro_name",
    "short_name",
    "type",
    "update_mode",
    "volume",
    "ask",
    "bid",
    "fundamentals",
    "high_price",
    "low_price",
    "open_price",
    "prev_close_price",
    "rch",
    "rchp",
    "rtc",
    "rtc_time",
    "status",
    "industry",
    "basic_eps_net_income",
    "beta_1_year",
    "market_cap_basic",
    "earnings_per_share_basic_ttm",
    "price_earnings_ttm",
    "sector",
    "dividends_yield",
    "timezone",
    "country_code",
    "provider_id",
];

// =============================================================================
// Session Tokens
// =============================================================================

const SESSION_TOKEN_LEN: usize = 12;

/// Kind of upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Quote session (`qs_` prefix).
    Quote,
    /// Chart session (`cs_` prefix).
    Chart,
}

impl SessionKind {
    const fn prefix(self) -> &'static str {
        match self {
            Self::Quote => "qs_",
            Self::Chart => "cs_",
        }
    }
}

/// Generate a fresh session token: kind prefix plus 12 random letters.
#[must_use]
pub fn generate_session_id(kind: SessionKind) -> String {
    let token: String = rand::rng()
        .sample_iter(Alphabetic)
        .take(SESSION_TOKEN_LEN)
        .map(char::from)
        .collect();
    format!("{}{token}", kind.prefix())
}

static SERIES_SEQ: AtomicU64 = AtomicU64::new(1);

/// Generate a `(symbol_id, series_id)` pair for one chart request, unique
/// for the life of the process.
#[must_use]
pub fn generate_series_ids() -> (String, String) {
    let n = SERIES_SEQ.fetch_add(1, Ordering::Relaxed);
    (format!("sym_{n}"), format!("ser_{n}"))
}

// =============================================================================
// Inbound Classification
// =============================================================================

/// A decoded packet classified by protocol role.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Keepalive beat to echo.
    KeepAlive(String),
    /// Session handshake; the connection is ready for setup messages.
    Session {
        /// Server-assigned session identifier.
        session_id: String,
    },
    /// Quote data patch (`qsd`).
    QuoteData {
        /// Quote session the patch belongs to.
        session: String,
        /// Symbol name as registered.
        symbol: String,
        /// Upstream status, `ok` for usable data.
        status: String,
        /// Field patch.
        values: Map<String, Value>,
    },
    /// Chart series update (`timescale_update`).
    TimescaleUpdate {
        /// Chart session the update belongs to.
        session: String,
        /// Series-keyed payload.
        payload: Value,
    },
    /// Any other method; carried for diagnostics only.
    Other {
        /// Method name, when present.
        method: Option<String>,
    },
}

impl Inbound {
    /// Classify a decoded packet.
    #[must_use]
    pub fn classify(packet: Packet) -> Self {
        let value = match packet {
            Packet::KeepAlive(beat) => return Self::KeepAlive(beat),
            Packet::Message(value) => value,
        };

        if let Some(session_id) = value.get("session_id").and_then(Value::as_str) {
            return Self::Session {
                session_id: session_id.to_string(),
            };
        }

        let method = value.get("m").and_then(Value::as_str);
        let params = value.get("p").and_then(Value::as_array);

        match (method, params) {
            (Some("qsd"), Some(p)) if p.len() > 1 => {
                let Some(session) = p[0].as_str() else {
                    return Self::other(method);
                };
                let data = &p[1];
                Self::QuoteData {
                    session: session.to_string(),
                    symbol: data.get("n").and_then(Value::as_str).unwrap_or_default().to_string(),
                    status: data.get("s").and_then(Value::as_str).unwrap_or_default().to_string(),
                    values: data.get("v").and_then(Value::as_object).cloned().unwrap_or_default(),
                }
            }
            (Some("timescale_update"), Some(p)) if p.len() > 1 => match p[0].as_str() {
                Some(session) => Self::TimescaleUpdate {
                    session: session.to_string(),
                    payload: p[1].clone(),
                },
                None => Self::other(method),
            },
            _ => Self::other(method),
        }
    }

    fn other(method: Option<&str>) -> Self {
        Self::Other {
            method: method.map(str::to_string),
        }
    }
}

/// Extract the bars for one series from a `timescale_update` payload.
///
/// Returns `None` when the payload carries no bar array for the series, which
/// is how upstream signals updates belonging to other series or metadata-only
/// updates. Individual bars that fail to parse are skipped.
#[must_use]
pub fn series_bars(payload: &Value, series_id: &str) -> Option<Vec<Candle>> {
    let bars = payload.get(series_id)?.get("s")?.as_array()?;
    Some(
        bars.iter()
            .filter_map(|bar| bar.get("v").and_then(Value::as_array))
            .filter_map(|values| Candle::from_bar_values(values))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn session_ids_have_prefix_and_letters() {
        let qs = generate_session_id(SessionKind::Quote);
        let cs = generate_session_id(SessionKind::Chart);
        assert!(qs.starts_with("qs_"));
        assert!(cs.starts_with("cs_"));
        assert_eq!(qs.len(), 15);
        assert!(qs[3..].chars().all(|c| c.is_ascii_alphabetic()));
        assert_ne!(generate_session_id(SessionKind::Quote), qs);
    }

    #[test]
    fn series_ids_are_prefixed() {
        let (symbol_id, series_id) = generate_series_ids();
        assert!(symbol_id.starts_with("sym_"));
        assert!(series_id.starts_with("ser_"));
        assert_eq!(symbol_id[4..], series_id[4..]);
    }

    #[test]
    fn series_ids_never_repeat() {
        let ids: std::collections::HashSet<String> =
            (0..200_000).map(|_| generate_series_ids().1).collect();
        assert_eq!(ids.len(), 200_000);
    }

    #[test]
    fn classify_handshake() {
        let inbound = Inbound::classify(Packet::Message(json!({"session_id": "abc", "timestamp": 1})));
        assert_eq!(
            inbound,
            Inbound::Session {
                session_id: "abc".to_string()
            }
        );
    }

    #[test]
    fn classify_quote_data() {
        let inbound = Inbound::classify(Packet::Message(json!({
            "m": "qsd",
            "p": ["qs_abc", {"n": "NASDAQ:AAPL", "s": "ok", "v": {"lp": 190.1}}]
        })));
        let Inbound::QuoteData {
            session,
            symbol,
            status,
            values,
        } = inbound
        else {
            panic!("expected quote data");
        };
        assert_eq!(session, "qs_abc");
        assert_eq!(symbol, "NASDAQ:AAPL");
        assert_eq!(status, "ok");
        assert_eq!(values["lp"], json!(190.1));
    }

    #[test]
    fn classify_short_params_is_other() {
        let inbound = Inbound::classify(Packet::Message(json!({"m": "qsd", "p": ["qs_abc"]})));
        assert_eq!(
            inbound,
            Inbound::Other {
                method: Some("qsd".to_string())
            }
        );
    }

    #[test]
    fn classify_keepalive() {
        assert_eq!(
            Inbound::classify(Packet::KeepAlive("5".to_string())),
            Inbound::KeepAlive("5".to_string())
        );
    }

    #[test]
    fn extracts_series_bars() {
        let payload = json!({
            "ser_1": {"s": [
                {"i": 0, "v": [60, 1, 2, 0.5, 1.5, 10]},
                {"i": 1, "v": [120, 1.5, 2.5, 1, 2]},
                {"i": 2, "v": ["bad"]}
            ]},
            "ser_2": {"s": []}
        });

        let bars = series_bars(&payload, "ser_1").unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].timestamp, 120_000);
        assert!(bars[1].volume.is_none());

        assert_eq!(series_bars(&payload, "ser_2"), Some(vec![]));
        assert_eq!(series_bars(&payload, "ser_3"), None);
        assert_eq!(series_bars(&json!({"ser_1": {"ns": {}}}), "ser_1"), None);
    }

    #[test]
    fn method_names() {
        assert_eq!(Method::QuoteAddSymbols.as_str(), "quote_add_symbols");
        assert_eq!(Method::SetRange.as_str(), "set_range");
        assert_eq!(Method::ChartDeleteSession.as_str(), "chart_delete_session");
    }
}
