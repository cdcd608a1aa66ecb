//! Reconnection
//!
//! Two pieces live here:
//!
//! - [`ReconnectCoordinator`] refreshes the upstream connection on a fixed
//!   interval without ever interleaving with an in-flight data call. Calls
//!   run through [`ReconnectCoordinator::with_call`]; a timer tick that finds
//!   calls active marks a reconnection as pending, and the last call to leave
//!   performs it. Callers arriving while a reconnection runs wait for it.
//! - [`RetryBackoff`] spaces out attempts when initial setup fails.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::session::SessionError;
use crate::infrastructure::metrics::{self, ReconnectTrigger};

/// Default interval between periodic reconnections.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(60);

/// Something that can re-establish the upstream connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reconnect: Send + Sync {
    /// Tear down and rebuild the connection, restoring any registrations.
    async fn reconnect(&self) -> Result<(), SessionError>;
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Debug, Default)]
struct CallState {
    active: usize,
    pending: bool,
}

/// Serializes periodic reconnection against data calls.
pub struct ReconnectCoordinator {
    target: Arc<dyn Reconnect>,
    state: Mutex<CallState>,
    gate: RwLock<()>,
}

impl ReconnectCoordinator {
    /// Create a coordinator driving `target`.
    #[must_use]
    pub fn new(target: Arc<dyn Reconnect>) -> Self {
        Self {
            target,
            state: Mutex::new(CallState::default()),
            gate: RwLock::new(()),
        }
    }

    /// Run a data call. Waits for a running reconnection first; if a
    /// reconnection was deferred and this is the last call out, performs it
    /// before returning.
    pub async fn with_call<F>(self: &Arc<Self>, call: F) -> F::Output
    where
        F: Future,
    {
        let gate = self.gate.read().await;
        let guard = self.enter();

        let output = call.await;

        drop(gate);
        if guard.finish() {
            self.run(ReconnectTrigger::Deferred).await;
        }
        output
    }

    /// Handle one timer tick: reconnect now when idle, otherwise defer.
    pub async fn on_timer(&self) {
        {
            let mut state = self.state.lock();
            if state.active > 0 {
                state.pending = true;
                tracing::debug!(active = state.active, "Reconnection deferred until calls finish");
                return;
            }
        }
        self.run(ReconnectTrigger::Timer).await;
    }

    /// Spawn the periodic timer. The first tick fires one `interval` from now.
    pub fn spawn_timer(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => coordinator.on_timer().await,
                }
            }
            tracing::debug!("Reconnect timer stopped");
        })
    }

    /// Calls currently in flight.
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.state.lock().active
    }

    /// Whether a deferred reconnection is waiting on active calls.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    fn enter(self: &Arc<Self>) -> CallGuard {
        let mut state = self.state.lock();
        state.active += 1;
        metrics::set_active_calls(state.active);
        CallGuard {
            coordinator: Arc::clone(self),
            finished: false,
        }
    }

    /// Returns `true` when the caller should run the deferred reconnection.
    fn leave(&self) -> bool {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        metrics::set_active_calls(state.active);
        if state.active == 0 && state.pending {
            state.pending = false;
            return true;
        }
        false
    }

    async fn run(&self, trigger: ReconnectTrigger) {
        let _exclusive = self.gate.write().await;
        tracing::info!(trigger = trigger.as_str(), "Reconnecting to TradingView");

        match self.target.reconnect().await {
            Ok(()) => {
                metrics::record_reconnect(trigger);
                tracing::info!("Reconnected to TradingView");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reconnection failed, next attempt on the following tick");
            }
        }
    }
}

impl std::fmt::Debug for ReconnectCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReconnectCoordinator")
            .field("active", &state.active)
            .field("pending", &state.pending)
            .finish_non_exhaustive()
    }
}

/// Tracks one in-flight call. A call abandoned mid-flight still leaves, and
/// hands any deferred reconnection to a background task.
struct CallGuard {
    coordinator: Arc<ReconnectCoordinator>,
    finished: bool,
}

impl CallGuard {
    fn finish(mut self) -> bool {
        self.finished = true;
        self.coordinator.leave()
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.finished || !self.coordinator.leave() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let coordinator = Arc::clone(&self.coordinator);
                handle.spawn(async move { coordinator.run(ReconnectTrigger::Deferred).await });
            }
            Err(_) => tracing::warn!("Deferred reconnection dropped outside a runtime"),
        }
    }
}

// =============================================================================
// Setup Backoff
// =============================================================================

/// Exponential backoff with jitter for setup retries.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tradingview_stream_proxy::infrastructure::tradingview::RetryBackoff;
///
/// let mut backoff = RetryBackoff::new(Duration::from_millis(100), Duration::from_secs(1))
///     .with_jitter(0.0)
///     .with_max_attempts(2);
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
/// assert_eq!(backoff.next_delay(), None);
/// ```
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    base: Duration,
    cap: Duration,
    factor: f64,
    jitter: f64,
    max_attempts: u32,
    attempts: u32,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryBackoff {
    /// Doubling backoff from `base` up to `cap`, 10% jitter, unlimited attempts.
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            factor: 2.0,
            jitter: 0.1,
            max_attempts: 0,
            attempts: 0,
        }
    }

    /// Set the jitter fraction (`0.1` is ±10%).
    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the growth factor between attempts. Values below 1 are clamped.
    #[must_use]
    pub fn with_multiplier(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Limit the number of delays handed out (`0` is unlimited).
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempts >= self.max_attempts {
            return None;
        }
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        self.attempts = self.attempts.saturating_add(1);

        let scaled = self.base.as_secs_f64() * self.factor.powi(exponent);
        let capped = scaled.min(self.cap.as_secs_f64());
        Some(self.jittered(capped))
    }

    /// Start over after a success.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delays handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    fn jittered(&self, secs: f64) -> Duration {
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(secs);
        }
        let spread = secs * self.jitter;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((secs + offset).max(0.001))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        count: AtomicUsize,
        log: Mutex<Vec<&'static str>>,
        delay: Duration,
    }

    #[async_trait]
    impl Reconnect for Recorder {
        async fn reconnect(&self) -> Result<(), SessionError> {
            self.log.lock().push("reconnect-start");
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.count.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push("reconnect-end");
            Ok(())
        }
    }

    fn coordinator(recorder: &Arc<Recorder>) -> Arc<ReconnectCoordinator> {
        Arc::new(ReconnectCoordinator::new(Arc::clone(recorder) as Arc<dyn Reconnect>))
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if f() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_tick_reconnects_immediately() {
        let recorder = Arc::new(Recorder::default());
        let coordinator = coordinator(&recorder);

        coordinator.on_timer().await;

        assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_tick_defers_until_last_call_leaves() {
        let recorder = Arc::new(Recorder::default());
        let coordinator = coordinator(&recorder);

        let (release, hold) = oneshot::channel::<()>();
        let call = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.with_call(async { hold.await.is_ok() }).await }
        });
        wait_until(|| coordinator.active_calls() == 1).await;

        coordinator.on_timer().await;
        assert_eq!(recorder.count.load(Ordering::SeqCst), 0);
        assert!(coordinator.is_pending());

        release.send(()).unwrap();
        assert!(call.await.unwrap());

        assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.active_calls(), 0);
        assert!(!coordinator.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn calls_wait_for_running_reconnect() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(200),
            ..Recorder::default()
        });
        let coordinator = coordinator(&recorder);

        let tick = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.on_timer().await }
        });
        wait_until(|| !recorder.log.lock().is_empty()).await;

        let log = Arc::clone(&recorder);
        coordinator
            .with_call(async move { log.log.lock().push("call") })
            .await;
        tick.await.unwrap();

        assert_eq!(
            *recorder.log.lock(),
            vec!["reconnect-start", "reconnect-end", "call"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_still_runs_deferred_reconnect() {
        let recorder = Arc::new(Recorder::default());
        let coordinator = coordinator(&recorder);

        let call = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.with_call(std::future::pending::<()>()).await }
        });
        wait_until(|| coordinator.active_calls() == 1).await;

        coordinator.on_timer().await;
        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());

        wait_until(|| recorder.count.load(Ordering::SeqCst) == 1).await;
        assert_eq!(coordinator.active_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_is_logged_not_fatal() {
        let mut mock = MockReconnect::new();
        mock.expect_reconnect()
            .times(2)
            .returning(|| Err(SessionError::NotConnected));
        let coordinator = Arc::new(ReconnectCoordinator::new(Arc::new(mock)));

        coordinator.on_timer().await;
        coordinator.on_timer().await;
        assert_eq!(coordinator.active_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_on_interval() {
        let recorder = Arc::new(Recorder::default());
        let coordinator = coordinator(&recorder);
        let cancel = CancellationToken::new();

        let timer = coordinator.spawn_timer(Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(recorder.count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(recorder.count.load(Ordering::SeqCst), 2);

        cancel.cancel();
        timer.await.unwrap();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(500), Duration::from_secs(2))
            .with_jitter(0.0);
        let delays: Vec<_> = (0..5).filter_map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(2),
                Duration::from_secs(2),
            ]
        );
    }

    #[test]
    fn backoff_reset_and_limit() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(0.0)
            .with_max_attempts(1);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 1);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        for _ in 0..100 {
            let mut backoff = RetryBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
            let millis = backoff.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "{millis}ms out of band");
        }
    }
}
