//! Broadcast Channel Adapters
//!
//! Fan-out of raw upstream frames for diagnostics.
//!
//! # Architecture
//!
//! Every frame the session manager reads or writes is published to a
//! [`FrameLogHub`] with its direction and timestamp. Receivers (the
//! `/ws/debug` endpoint, tests) subscribe independently; a slow receiver
//! lags and skips entries instead of back-pressuring the socket. Delivery is
//! advisory only and never affects the data path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default number of buffered frame log entries per receiver.
pub const DEFAULT_FRAME_LOG_CAPACITY: usize = 1_024;

// =============================================================================
// Frame Log Entries
// =============================================================================

/// Direction of a logged frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// Received from upstream.
    #[serde(rename = "RX")]
    Rx,
    /// Sent to upstream.
    #[serde(rename = "TX")]
    Tx,
}

impl Direction {
    /// Short label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rx => "RX",
            Self::Tx => "TX",
        }
    }
}

/// One raw frame as seen on the socket.
#[derive(Debug, Clone, Serialize)]
pub struct FrameLogEntry {
    /// Whether the frame was received or sent.
    pub direction: Direction,
    /// Raw frame text.
    #[serde(rename = "msg")]
    pub message: String,
    /// When the frame crossed the socket.
    pub time: DateTime<Utc>,
}

// =============================================================================
// Frame Log Hub
// =============================================================================

/// Shared handle to the frame log hub.
pub type SharedFrameLogHub = Arc<FrameLogHub>;

/// Broadcast hub for raw frame diagnostics.
///
/// # Example
///
/// ```rust
/// use tradingview_stream_proxy::infrastructure::broadcast::{Direction, FrameLogHub};
///
/// let hub = FrameLogHub::new(16);
/// let mut rx = hub.subscribe();
/// hub.publish(Direction::Tx, "~m~4~m~~h~1");
/// assert_eq!(rx.try_recv().unwrap().message, "~m~4~m~~h~1");
/// ```
#[derive(Debug)]
pub struct FrameLogHub {
    tx: broadcast::Sender<FrameLogEntry>,
}

impl FrameLogHub {
    /// Create a hub buffering `capacity` entries per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    /// Publish a frame. Returns the number of receivers reached, or `None`
    /// when nobody is listening.
    pub fn publish(&self, direction: Direction, message: &str) -> Option<usize> {
        if self.tx.receiver_count() == 0 {
            return None;
        }
        self.tx
            .send(FrameLogEntry {
                direction,
                message: message.to_string(),
                time: Utc::now(),
            })
            .ok()
    }

    /// Get a new receiver for frame log entries.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FrameLogEntry> {
        self.tx.subscribe()
    }

    /// Number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for FrameLogHub {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_LOG_CAPACITY)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_receivers_returns_none() {
        let hub = FrameLogHub::default();
        assert!(hub.publish(Direction::Rx, "x").is_none());
    }

    #[test]
    fn receiver_count_tracks_drops() {
        let hub = FrameLogHub::new(4);
        let rx1 = hub.subscribe();
        let rx2 = hub.subscribe();
        assert_eq!(hub.receiver_count(), 2);
        drop(rx1);
        assert_eq!(hub.receiver_count(), 1);
        drop(rx2);
        assert_eq!(hub.receiver_count(), 0);
    }

    #[tokio::test]
    async fn entries_arrive_in_order() {
        let hub = FrameLogHub::new(8);
        let mut rx = hub.subscribe();

        assert_eq!(hub.publish(Direction::Tx, "first"), Some(1));
        hub.publish(Direction::Rx, "second");

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!((a.direction, a.message.as_str()), (Direction::Tx, "first"));
        assert_eq!((b.direction, b.message.as_str()), (Direction::Rx, "second"));
        assert!(a.time <= b.time);
    }

    #[test]
    fn entry_serializes_with_wire_labels() {
        let entry = FrameLogEntry {
            direction: Direction::Rx,
            message: "~m~1~m~x".to_string(),
            time: Utc::now(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["direction"], "RX");
        assert_eq!(value["msg"], "~m~1~m~x");
    }
}
