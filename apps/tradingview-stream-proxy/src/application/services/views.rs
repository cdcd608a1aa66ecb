//! Response views for downstream clients.
//!
//! Upstream quote fields carry terse names (`lp`, `ch`, `chp`, ...). Clients
//! see the friendlier names below, on both the REST and socket surfaces.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::streaming::{Candle, QuoteSnapshot};

/// A live quote in downstream field names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuoteView {
    /// Last price (`lp`).
    #[serde(with = "rust_decimal::serde::float_option")]
    pub price: Option<Decimal>,
    /// Change since previous close (`ch`).
    #[serde(with = "rust_decimal::serde::float_option")]
    pub change: Option<Decimal>,
    /// Percent change since previous close (`chp`).
    #[serde(with = "rust_decimal::serde::float_option")]
    pub change_percent: Option<Decimal>,
    /// Session open (`open_price`).
    #[serde(with = "rust_decimal::serde::float_option")]
    pub open: Option<Decimal>,
    /// Session high (`high_price`).
    #[serde(with = "rust_decimal::serde::float_option")]
    pub high: Option<Decimal>,
    /// Session low (`low_price`).
    #[serde(with = "rust_decimal::serde::float_option")]
    pub low: Option<Decimal>,
    /// Previous close (`prev_close_price`).
    #[serde(with = "rust_decimal::serde::float_option")]
    pub prev_close: Option<Decimal>,
    /// Session volume.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub volume: Option<Decimal>,
    /// Market status reported upstream.
    pub status: Option<String>,
    /// Listing exchange.
    pub exchange: Option<String>,
    /// Instrument type (`stock`, `crypto`, ...).
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Milliseconds since the epoch when the view was built, for pushed updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl QuoteView {
    /// Map a snapshot's upstream fields.
    #[must_use]
    pub fn from_snapshot(snapshot: &QuoteSnapshot) -> Self {
        let text = |field: &str| snapshot.text(field).map(str::to_string);
        Self {
            price: snapshot.decimal("lp"),
            change: snapshot.decimal("ch"),
            change_percent: snapshot.decimal("chp"),
            open: snapshot.decimal("open_price"),
            high: snapshot.decimal("high_price"),
            low: snapshot.decimal("low_price"),
            prev_close: snapshot.decimal("prev_close_price"),
            volume: snapshot.decimal("volume"),
            status: text("status"),
            exchange: text("exchange"),
            kind: text("type"),
            timestamp: None,
        }
    }

    /// Stamp the view with the current time.
    #[must_use]
    pub fn stamped(mut self, now: DateTime<Utc>) -> Self {
        self.timestamp = Some(now.timestamp_millis());
        self
    }
}

/// A single bar reported as a quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandleView {
    /// Close of the bar.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Open.
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    /// High.
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    /// Low.
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    /// Close.
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    /// Volume, when reported.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub volume: Option<Decimal>,
    /// Close minus open.
    #[serde(with = "rust_decimal::serde::float")]
    pub change: Decimal,
    /// Change relative to the open, in percent.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub change_percent: Option<Decimal>,
}

impl From<&Candle> for CandleView {
    fn from(candle: &Candle) -> Self {
        Self {
            price: candle.close,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            change: candle.change(),
            change_percent: candle.change_percent(),
        }
    }
}

/// Parse a caller-supplied date: RFC 3339, `YYYY-MM-DDTHH:MM:SS` (UTC) or
/// `YYYY-MM-DD` (midnight UTC).
#[must_use]
pub fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Keep candles whose timestamp falls in `[start, end]`; open bounds pass.
#[must_use]
pub fn filter_window(
    candles: Vec<Candle>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Vec<Candle> {
    let from = start.map(|s| s.timestamp_millis());
    let to = end.map(|e| e.timestamp_millis());
    candles
        .into_iter()
        .filter(|c| from.is_none_or(|f| c.timestamp >= f) && to.is_none_or(|t| c.timestamp <= t))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn candle(ts: i64) -> Candle {
        Candle {
            timestamp: ts,
            open: Decimal::from(100),
            high: Decimal::from(110),
            low: Decimal::from(95),
            close: Decimal::from(105),
            volume: Some(Decimal::from(7)),
        }
    }

    #[test]
    fn quote_view_renames_fields() {
        let mut snapshot = QuoteSnapshot::new();
        snapshot.apply(
            json!({
                "lp": 189.5,
                "ch": 1.5,
                "chp": 0.8,
                "open_price": 188,
                "high_price": 190,
                "low_price": 187,
                "prev_close_price": 188,
                "volume": 1000,
                "status": "market",
                "exchange": "NASDAQ",
                "type": "stock",
                "pro_name": "NASDAQ:AAPL"
            })
            .as_object()
            .unwrap(),
        );

        let value = serde_json::to_value(QuoteView::from_snapshot(&snapshot)).unwrap();
        assert_eq!(value["price"], json!(189.5));
        assert_eq!(value["change_percent"], json!(0.8));
        assert_eq!(value["prev_close"], json!(188.0));
        assert_eq!(value["type"], json!("stock"));
        assert_eq!(value["exchange"], json!("NASDAQ"));
        assert!(value.get("timestamp").is_none());
        assert!(value.get("pro_name").is_none());
    }

    #[test]
    fn missing_fields_serialize_as_null() {
        let view = QuoteView::from_snapshot(&QuoteSnapshot::new());
        let value = serde_json::to_value(view).unwrap();
        assert_eq!(value["price"], serde_json::Value::Null);
        assert_eq!(value["status"], serde_json::Value::Null);
    }

    #[test]
    fn stamped_view_carries_millis() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let view = QuoteView::default().stamped(now);
        assert_eq!(view.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn candle_view_derives_change() {
        let view = CandleView::from(&candle(0));
        assert_eq!(view.price, Decimal::from(105));
        assert_eq!(view.change, Decimal::from(5));
        assert_eq!(view.change_percent, Some(Decimal::from(5)));
    }

    #[test_case("2024-01-02", Some(1_704_153_600) ; "plain date")]
    #[test_case("2024-01-02T12:00:00Z", Some(1_704_196_800) ; "rfc3339 utc")]
    #[test_case("2024-01-02T14:00:00+02:00", Some(1_704_196_800) ; "rfc3339 offset")]
    #[test_case("2024-01-02T12:00:00", Some(1_704_196_800) ; "naive datetime")]
    #[test_case("yesterday", None ; "garbage")]
    #[test_case("2024-13-01", None ; "bad month")]
    fn parses_dates(input: &str, expected: Option<i64>) {
        assert_eq!(parse_date(input).map(|d| d.timestamp()), expected);
    }

    #[test]
    fn window_is_inclusive() {
        let candles = (1..=5).map(|i| candle(i * 1000)).collect::<Vec<_>>();
        let start = DateTime::from_timestamp(2, 0);
        let end = DateTime::from_timestamp(4, 0);

        let kept = filter_window(candles.clone(), start, end);
        assert_eq!(kept.iter().map(|c| c.timestamp).collect::<Vec<_>>(), vec![2000, 3000, 4000]);

        assert_eq!(filter_window(candles.clone(), None, None).len(), 5);
        assert_eq!(filter_window(candles, start, None).len(), 4);
    }
}
