//! Subscription Multiplexer
//!
//! Maps each symbol to the set of [`TickerSubscription`]s interested in it.
//! A symbol is registered on the upstream quote session exactly while its set
//! is non-empty; the registry lock is held across the set change and the
//! matching register/unregister call so the two never drift apart.
//!
//! Quote events are dispatched from a single task. Eviction of idle
//! subscriptions happens during dispatch, before the patch is applied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::time::Instant;

use super::error::ClientError;
use super::session::{SessionError, SessionManager};
use super::ticker::TickerSubscription;
use crate::domain::subscription::{Join, Leave, RegistryStats, SubscriptionRegistry};
use crate::infrastructure::metrics::{self, TimeoutKind};

/// Timing for ticker subscriptions.
#[derive(Debug, Clone, Copy)]
pub struct TickerSettings {
    /// Wait for the confirming update after registering.
    pub registration_timeout: Duration,
    /// Bound on a whole `fetch()`.
    pub fetch_timeout: Duration,
    /// Idle time after which a listener-less subscription may be evicted.
    pub idle_window: Duration,
}

impl Default for TickerSettings {
    fn default() -> Self {
        Self {
            registration_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(10),
            idle_window: Duration::from_secs(10),
        }
    }
}

/// Per-symbol fan-out of quote data.
pub struct SubscriptionMultiplexer {
    session: Arc<SessionManager>,
    registry: Mutex<SubscriptionRegistry<Arc<TickerSubscription>>>,
    next_id: AtomicU64,
    settings: TickerSettings,
    this: Weak<Self>,
}

impl SubscriptionMultiplexer {
    /// Create a multiplexer registering symbols through `session`.
    #[must_use]
    pub fn new(session: Arc<SessionManager>, settings: TickerSettings) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            session,
            registry: Mutex::new(SubscriptionRegistry::new()),
            next_id: AtomicU64::new(1),
            settings,
            this: this.clone(),
        })
    }

    /// Return the shared subscription for `symbol`, creating and fetching a
    /// new one when none exists. A failed initial fetch is logged and the
    /// handle is returned anyway.
    pub async fn get_ticker(&self, symbol: &str) -> Arc<TickerSubscription> {
        if let Some(existing) = self.registry.lock().first(symbol) {
            return Arc::clone(existing);
        }

        let ticker = Arc::new(TickerSubscription::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            symbol,
            self.settings.idle_window,
            self.settings.fetch_timeout,
            self.this.clone(),
        ));

        if let Err(e) = ticker.fetch().await {
            tracing::warn!(symbol, error = %e, "Initial ticker fetch failed");
        }
        ticker
    }

    /// Track `ticker` and wait for the symbol's registration to be confirmed.
    ///
    /// Returns immediately when the ticker is already tracked. A ticker that
    /// joins a symbol whose snapshot already carries the canonical name is
    /// seeded from it and confirmed at once.
    ///
    /// # Errors
    ///
    /// Returns `Session` when the symbol cannot be registered, or
    /// `RegistrationTimeout` when no confirming update arrives.
    pub async fn ensure_registered(&self, ticker: &Arc<TickerSubscription>) -> Result<(), ClientError> {
        let symbol = ticker.symbol();

        let confirmation = {
            let mut registry = self.registry.lock();
            if registry.contains(symbol, ticker.id()) {
                return Ok(());
            }

            let confirmation = ticker.await_confirmation();
            let seed = registry.first(symbol).map(|existing| existing.snapshot());
            ticker.revive();

            match registry.add(symbol, ticker.id(), Arc::clone(ticker)) {
                Join::First => {
                    if let Err(e) = self.session.register_symbol(symbol) {
                        registry.remove(symbol, ticker.id());
                        return Err(e.into());
                    }
                    tracing::debug!(symbol, "Registered symbol upstream");
                }
                Join::Joined => {
                    if let Some(seed) = seed.filter(|s| s.canonical_name().is_some()) {
                        ticker.update(seed.fields());
                    }
                }
                Join::AlreadyTracked => return Ok(()),
            }
            metrics::set_ticker_subscriptions(registry.stats().subscribers);
            confirmation
        };

        match tokio::time::timeout(self.settings.registration_timeout, confirmation).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                metrics::record_timeout(TimeoutKind::Registration);
                Err(ClientError::RegistrationTimeout {
                    symbol: symbol.to_string(),
                    timeout: self.settings.registration_timeout,
                })
            }
        }
    }

    /// Apply a quote patch to every live subscription of `symbol`, evicting
    /// idle ones first.
    pub fn dispatch(&self, symbol: &str, values: &Map<String, Value>) {
        let now = Instant::now();

        let live: Vec<Arc<TickerSubscription>> = {
            let mut registry = self.registry.lock();
            let mut live = Vec::new();

            for (id, ticker) in registry.members(symbol) {
                if !ticker.can_be_destroyed(now) {
                    live.push(ticker);
                    continue;
                }

                ticker.mark_destroyed();
                if let Leave::Last = registry.remove(symbol, id) {
                    match self.session.unregister_symbol(symbol) {
                        Ok(_) => tracing::info!(symbol, "Evicted idle symbol"),
                        Err(e) => tracing::debug!(symbol, error = %e, "Unregister skipped"),
                    }
                }
            }

            metrics::set_ticker_subscriptions(registry.stats().subscribers);
            live
        };

        for ticker in live {
            ticker.update(values);
        }
    }

    /// Register every tracked symbol on the current quote session. Used after
    /// a reconnect. Returns the number of symbols registered.
    ///
    /// # Errors
    ///
    /// Returns the first registration failure.
    pub fn restore_registrations(&self) -> Result<usize, SessionError> {
        let registry = self.registry.lock();
        let mut restored = 0;
        for symbol in registry.symbols() {
            if self.session.register_symbol(&symbol)? {
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Drop every subscription, marking each destroyed.
    pub fn clear(&self) {
        let drained = self.registry.lock().drain();
        for ticker in &drained {
            ticker.mark_destroyed();
        }
        metrics::set_ticker_subscriptions(0);
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Cleared ticker subscriptions");
        }
    }

    /// Symbol and subscriber counts.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.lock().stats()
    }

    /// Tracked symbols, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        self.registry.lock().symbols()
    }

    #[cfg(test)]
    pub(crate) fn track_for_test(&self, symbol: &str) -> Arc<TickerSubscription> {
        let ticker = Arc::new(TickerSubscription::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            symbol,
            self.settings.idle_window,
            self.settings.fetch_timeout,
            self.this.clone(),
        ));
        let mut registry = self.registry.lock();
        if let Join::First = registry.add(symbol, ticker.id(), Arc::clone(&ticker)) {
            let _ = self.session.register_symbol(symbol);
        }
        ticker
    }
}

impl std::fmt::Debug for SubscriptionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMultiplexer")
            .field("stats", &self.stats())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
