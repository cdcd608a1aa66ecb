//! Market Data Streaming Types
//!
//! Core domain types for market data: quote snapshots and OHLCV candles.
//! These types are codec-agnostic and represent the canonical internal
//! representation of what the upstream feed delivers.

mod timeframe;

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use timeframe::{DEFAULT_BAR_SECONDS, Timeframe};

// =============================================================================
// Candle
// =============================================================================

/// A single OHLCV bar.
///
/// Upstream delivers bars as `[time_seconds, open, high, low, close, volume]`;
/// the timestamp is stored in milliseconds. Volume is absent for instruments
/// without traded volume (indices, some FX pairs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Open price.
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    /// High price.
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    /// Low price.
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    /// Close price.
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    /// Traded volume, if the instrument reports one.
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub volume: Option<Decimal>,
}

impl Candle {
    /// Build a candle from an upstream bar value array.
    ///
    /// Returns `None` when the time or any price is missing or not numeric.
    #[must_use]
    pub fn from_bar_values(values: &[Value]) -> Option<Self> {
        let seconds = values.first()?.as_f64()?;
        let price = |idx: usize| values.get(idx).and_then(Value::as_f64).and_then(to_decimal);

        #[allow(clippy::cast_possible_truncation)]
        let timestamp = (seconds * 1000.0).round() as i64;

        Some(Self {
            timestamp,
            open: price(1)?,
            high: price(2)?,
            low: price(3)?,
            close: price(4)?,
            volume: price(5),
        })
    }

    /// Absolute change from open to close.
    #[must_use]
    pub fn change(&self) -> Decimal {
        self.close - self.open
    }

    /// Percentage change from open to close, `None` when the open is zero.
    #[must_use]
    pub fn change_percent(&self) -> Option<Decimal> {
        if self.open.is_zero() {
            return None;
        }
        Some((self.change() / self.open * Decimal::ONE_HUNDRED).round_dp(4))
    }
}

fn to_decimal(value: f64) -> Option<Decimal> {
    Decimal::try_from(value).ok()
}

// =============================================================================
// Candle Series
// =============================================================================

/// Accumulates candle batches keyed by timestamp.
///
/// Merging is last-write-wins per timestamp and iteration is always in
/// ascending time order, so the series never holds duplicates.
#[derive(Debug, Default, Clone)]
pub struct CandleSeries {
    bars: BTreeMap<i64, Candle>,
}

impl CandleSeries {
    /// Create an empty series.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bars: BTreeMap::new(),
        }
    }

    /// Merge a batch, returning how many previously unseen timestamps it added.
    pub fn merge(&mut self, batch: impl IntoIterator<Item = Candle>) -> usize {
        let before = self.bars.len();
        for candle in batch {
            self.bars.insert(candle.timestamp, candle);
        }
        self.bars.len() - before
    }

    /// Number of distinct bars held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    /// Whether no bars have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// The latest `count` bars in ascending order.
    #[must_use]
    pub fn latest(&self, count: usize) -> Vec<Candle> {
        let skip = self.bars.len().saturating_sub(count);
        self.bars.values().skip(skip).cloned().collect()
    }

    /// Consume the series into an ascending vector.
    #[must_use]
    pub fn into_vec(self) -> Vec<Candle> {
        self.bars.into_values().collect()
    }
}

// =============================================================================
// Quote Snapshot
// =============================================================================

/// Field carrying the canonical `EXCHANGE:SYMBOL` name. Its arrival marks a
/// quote registration as confirmed.
pub const CANONICAL_NAME_FIELD: &str = "pro_name";

/// Accumulated quote fields for one symbol.
///
/// Upstream sends partial patches; each patch is merged over the previous
/// snapshot so the snapshot always holds the latest value of every field seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuoteSnapshot(Map<String, Value>);

impl QuoteSnapshot {
    /// Create an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Merge a patch into the snapshot, overwriting fields it carries.
    pub fn apply(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Raw field access.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Numeric field as a decimal.
    #[must_use]
    pub fn decimal(&self, field: &str) -> Option<Decimal> {
        self.0.get(field).and_then(Value::as_f64).and_then(to_decimal)
    }

    /// String field.
    #[must_use]
    pub fn text(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Canonical symbol name, present once the registration is confirmed.
    #[must_use]
    pub fn canonical_name(&self) -> Option<&str> {
        self.text(CANONICAL_NAME_FIELD)
    }

    /// Whether no fields have been received yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Underlying field map.
    #[must_use]
    pub const fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for QuoteSnapshot {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

// =============================================================================
// Tests
// =============================================================================
