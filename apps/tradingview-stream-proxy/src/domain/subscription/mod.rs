//! Subscription Registry
//!
//! Domain bookkeeping for local quote subscribers.
//!
//! # Design
//!
//! The registry maps each symbol to the ordered set of subscribers
//! interested in it:
//! - A symbol is present exactly while its set is non-empty
//! - The first subscriber for a symbol is reported as [`Join::First`], which
//!   is the caller's cue to register the symbol upstream
//! - Removing the last subscriber reports [`Leave::Last`] and drops the entry
//!   in the same step, the cue to unregister upstream
//!
//! Subscriber ids are allocated monotonically, so iterating a set visits
//! subscribers in the order they joined.

use std::collections::{BTreeMap, HashMap};

// =============================================================================
// Types
// =============================================================================

/// A symbol string as requested by callers (`BINANCE:BTCUSDT`, `AAPL`).
pub type Symbol = String;

/// Unique identifier for a local subscription.
pub type SubscriptionId = u64;

/// Outcome of adding a subscriber to a symbol's set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    /// The set was empty; the symbol needs an upstream registration.
    First,
    /// Other subscribers already keep the symbol registered.
    Joined,
    /// The subscriber was already a member.
    AlreadyTracked,
}

/// Outcome of removing a subscriber from a symbol's set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leave {
    /// The set emptied; the symbol needs an upstream unregistration.
    Last,
    /// Subscribers remain.
    Remaining(usize),
    /// The subscriber was not a member.
    NotTracked,
}

/// Aggregate registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Symbols with at least one subscriber.
    pub symbols: usize,
    /// Subscribers across all symbols.
    pub subscribers: usize,
}

// =============================================================================
// Registry
// =============================================================================

/// Symbol to ordered subscriber set.
#[derive(Debug)]
pub struct SubscriptionRegistry<T> {
    sets: HashMap<Symbol, BTreeMap<SubscriptionId, T>>,
}

impl<T> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self {
            sets: HashMap::new(),
        }
    }
}

impl<T: Clone> SubscriptionRegistry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber to a symbol's set.
    pub fn add(&mut self, symbol: &str, id: SubscriptionId, subscriber: T) -> Join {
        let set = self.sets.entry(symbol.to_string()).or_default();
        if set.contains_key(&id) {
            return Join::AlreadyTracked;
        }

        let first = set.is_empty();
        set.insert(id, subscriber);

        if first { Join::First } else { Join::Joined }
    }

    /// Remove a subscriber from a symbol's set.
    pub fn remove(&mut self, symbol: &str, id: SubscriptionId) -> Leave {
        let Some(set) = self.sets.get_mut(symbol) else {
            return Leave::NotTracked;
        };

        if set.remove(&id).is_none() {
            return Leave::NotTracked;
        }

        if set.is_empty() {
            self.sets.remove(symbol);
            Leave::Last
        } else {
            Leave::Remaining(set.len())
        }
    }

    /// Whether the subscriber is a member of the symbol's set.
    #[must_use]
    pub fn contains(&self, symbol: &str, id: SubscriptionId) -> bool {
        self.sets.get(symbol).is_some_and(|set| set.contains_key(&id))
    }

    /// The earliest subscriber still in the symbol's set.
    #[must_use]
    pub fn first(&self, symbol: &str) -> Option<&T> {
        self.sets.get(symbol).and_then(|set| set.values().next())
    }

    /// All subscribers for a symbol in join order.
    #[must_use]
    pub fn members(&self, symbol: &str) -> Vec<(SubscriptionId, T)> {
        self.sets
            .get(symbol)
            .map(|set| set.iter().map(|(id, s)| (*id, s.clone())).collect())
            .unwrap_or_default()
    }

    /// Symbols that currently have subscribers.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<_> = self.sets.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Drop every set, returning the subscribers that were held.
    pub fn drain(&mut self) -> Vec<T> {
        self.sets
            .drain()
            .flat_map(|(_, set)| set.into_values())
            .collect()
    }

    /// Registry counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            symbols: self.sets.len(),
            subscribers: self.sets.values().map(BTreeMap::len).sum(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_subscriber_triggers_registration() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.add("AAPL", 1, "a"), Join::First);
        assert_eq!(registry.add("AAPL", 2, "b"), Join::Joined);
        assert_eq!(registry.add("AAPL", 2, "b"), Join::AlreadyTracked);
        assert_eq!(registry.add("MSFT", 3, "c"), Join::First);
    }

    #[test]
    fn last_subscriber_triggers_unregistration_once() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("AAPL", 1, ());
        registry.add("AAPL", 2, ());

        assert_eq!(registry.remove("AAPL", 1), Leave::Remaining(1));
        assert_eq!(registry.remove("AAPL", 2), Leave::Last);
        assert_eq!(registry.remove("AAPL", 2), Leave::NotTracked);
        assert!(registry.symbols().is_empty());
    }

    #[test]
    fn members_follow_join_order() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("BTC", 7, "late");
        registry.add("BTC", 3, "early");
        registry.add("BTC", 9, "later");

        let ids: Vec<_> = registry.members("BTC").into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![3, 7, 9]);
        assert_eq!(registry.first("BTC"), Some(&"early"));
    }

    #[test]
    fn remove_unknown_symbol_is_noop() {
        let mut registry: SubscriptionRegistry<()> = SubscriptionRegistry::new();
        assert_eq!(registry.remove("NOPE", 1), Leave::NotTracked);
        assert!(!registry.contains("NOPE", 1));
    }

    #[test]
    fn stats_and_drain() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("A", 1, 'a');
        registry.add("A", 2, 'b');
        registry.add("B", 3, 'c');

        assert_eq!(
            registry.stats(),
            RegistryStats {
                symbols: 2,
                subscribers: 3
            }
        );
        assert_eq!(registry.symbols(), vec!["A".to_string(), "B".to_string()]);

        let mut drained = registry.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec!['a', 'b', 'c']);
        assert_eq!(registry.stats(), RegistryStats::default());
    }
}
