//! Ticker Subscriptions
//!
//! A [`TickerSubscription`] is one logical subscriber to a symbol's live
//! quote stream. It keeps the merged snapshot, an ordered listener list, and
//! the idle deadline the multiplexer uses to decide eviction.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::error::ClientError;
use super::multiplexer::SubscriptionMultiplexer;
use crate::domain::streaming::{CANONICAL_NAME_FIELD, QuoteSnapshot};
use crate::domain::subscription::SubscriptionId;
use crate::infrastructure::metrics::{self, TimeoutKind};

/// Handle returned when attaching a listener.
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&QuoteSnapshot) + Send + Sync>;

/// One subscriber to a symbol's quote stream.
pub struct TickerSubscription {
    id: SubscriptionId,
    symbol: String,
    snapshot: RwLock<QuoteSnapshot>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    confirmations: Mutex<Vec<oneshot::Sender<()>>>,
    due: Mutex<Instant>,
    idle_window: Duration,
    fetch_timeout: Duration,
    destroyed: AtomicBool,
    multiplexer: Weak<SubscriptionMultiplexer>,
}

impl TickerSubscription {
    pub(super) fn new(
        id: SubscriptionId,
        symbol: &str,
        idle_window: Duration,
        fetch_timeout: Duration,
        multiplexer: Weak<SubscriptionMultiplexer>,
    ) -> Self {
        Self {
            id,
            symbol: symbol.to_string(),
            snapshot: RwLock::new(QuoteSnapshot::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            confirmations: Mutex::new(Vec::new()),
            due: Mutex::new(Instant::now() + idle_window),
            idle_window,
            fetch_timeout,
            destroyed: AtomicBool::new(false),
            multiplexer,
        }
    }

    /// Subscription id, unique per multiplexer.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Symbol this subscription follows.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Copy of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> QuoteSnapshot {
        self.snapshot.read().clone()
    }

    /// Whether the multiplexer evicted this subscription.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Ensure the symbol is registered, then return the freshest snapshot.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationTimeout` or `FetchTimeout` when confirmation does
    /// not arrive, `Session` when registration cannot be sent, and
    /// `NotInitialized` when the owning multiplexer is gone.
    pub async fn fetch(self: &Arc<Self>) -> Result<QuoteSnapshot, ClientError> {
        let multiplexer = self.multiplexer.upgrade().ok_or(ClientError::NotInitialized)?;

        match tokio::time::timeout(self.fetch_timeout, multiplexer.ensure_registered(self)).await {
            Ok(result) => result?,
            Err(_) => {
                metrics::record_timeout(TimeoutKind::Fetch);
                return Err(ClientError::FetchTimeout {
                    symbol: self.symbol.clone(),
                    timeout: self.fetch_timeout,
                });
            }
        }

        self.touch();
        Ok(self.snapshot())
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Attach a listener called synchronously, in attach order, with every
    /// merged snapshot.
    pub fn on_update(&self, listener: impl Fn(&QuoteSnapshot) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        self.touch();
        id
    }

    /// Detach a listener. Returns `false` when it was not attached.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Stream of snapshots. Dropping the stream detaches its listener.
    #[must_use]
    pub fn updates(self: &Arc<Self>) -> TickerUpdates {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.on_update(move |snapshot| {
            let _ = tx.send(snapshot.clone());
        });
        TickerUpdates {
            rx,
            listener,
            ticker: Arc::clone(self),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// No listeners and idle past the due time.
    #[must_use]
    pub fn can_be_destroyed(&self, now: Instant) -> bool {
        self.listeners.lock().is_empty() && now >= *self.due.lock()
    }

    /// Push the idle deadline one window from now.
    pub fn touch(&self) {
        *self.due.lock() = Instant::now() + self.idle_window;
    }

    /// Merge a patch and notify listeners in order.
    pub(super) fn update(&self, patch: &Map<String, Value>) {
        let snapshot = {
            let mut snapshot = self.snapshot.write();
            snapshot.apply(patch);
            snapshot.clone()
        };

        if patch.contains_key(CANONICAL_NAME_FIELD) {
            for confirmation in self.confirmations.lock().drain(..) {
                let _ = confirmation.send(());
            }
        }

        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    pub(super) fn await_confirmation(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.confirmations.lock().push(tx);
        rx
    }

    pub(super) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.confirmations.lock().clear();
    }

    pub(super) fn revive(&self) {
        self.destroyed.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for TickerSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickerSubscription")
            .field("id", &self.id)
            .field("symbol", &self.symbol)
            .field("listeners", &self.listener_count())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

/// Snapshot stream for one ticker.
#[derive(Debug)]
pub struct TickerUpdates {
    rx: mpsc::UnboundedReceiver<QuoteSnapshot>,
    listener: ListenerId,
    ticker: Arc<TickerSubscription>,
}

impl TickerUpdates {
    /// Ticker the stream is attached to.
    #[must_use]
    pub const fn ticker(&self) -> &Arc<TickerSubscription> {
        &self.ticker
    }
}

impl Stream for TickerUpdates {
    type Item = QuoteSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for TickerUpdates {
    fn drop(&mut self) {
        self.ticker.remove_listener(self.listener);
    }
}
