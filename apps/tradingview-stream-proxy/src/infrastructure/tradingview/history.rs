//! Historical Retrieval
//!
//! Every chart request runs on its own ephemeral chart session, so any number
//! of retrievals can be in flight on one connection.
//!
//! # Strategies
//!
//! - **Count**: create the series with `count` bars and page backwards with
//!   `request_more_data` until enough bars arrived or a page adds nothing.
//! - **Range**: create the series with a single bar, then `set_range` over the
//!   requested window and resolve once batches stop arriving for the settle
//!   delay. Used when an end is given or more than one page is wanted.
//!
//! [`HistoryMachine`] holds the decisions and is driven by
//! [`fetch_history`]; it performs no I/O of its own.

use std::time::{Duration, Instant as StdInstant};

use chrono::Utc;
use tokio::time::{Instant, sleep, sleep_until};

use super::error::ClientError;
use super::messages::{generate_series_ids, series_bars};
use super::session::{ChartRoute, SessionManager};
use crate::domain::streaming::{Candle, CandleSeries, Timeframe};
use crate::infrastructure::metrics::{self, TimeoutKind};

/// Largest count served by pagination alone, and the page size.
pub const PAGE_SIZE: u64 = 2_000;

/// Bars added on top of the span computed from a start time.
pub const START_PADDING_BARS: u64 = 100;

/// Bars requested for a latest-candle lookup.
const LATEST_CANDLE_BARS: u64 = 10;

/// Pause before paging again while nothing has arrived yet.
pub const EMPTY_PAGE_DELAY: Duration = Duration::from_millis(250);

/// Timing for chart retrievals.
#[derive(Debug, Clone, Copy)]
pub struct HistorySettings {
    /// Bound on a latest-candle lookup.
    pub candle_timeout: Duration,
    /// Bound on a whole historical retrieval.
    pub history_timeout: Duration,
    /// Quiet period after which a range retrieval resolves.
    pub settle_delay: Duration,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            candle_timeout: Duration::from_secs(10),
            history_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_millis(500),
        }
    }
}

// =============================================================================
// Plan
// =============================================================================

/// Retrieval strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Paginate by bar count.
    Count,
    /// Request an explicit time window.
    Range,
}

impl Strategy {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Range => "range",
        }
    }
}

/// Resolved parameters of one retrieval. Times are Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPlan {
    /// Chosen strategy.
    pub strategy: Strategy,
    /// Target bar count.
    pub count: u64,
    /// Window start for the range strategy.
    pub from: i64,
    /// Window end for the range strategy.
    pub to: i64,
}

impl HistoryPlan {
    /// Work out count, strategy and window for a request made at `now`.
    #[must_use]
    pub fn new(timeframe: &Timeframe, count: u64, start: Option<i64>, end: Option<i64>, now: i64) -> Self {
        let bar = i64::try_from(timeframe.bar_seconds()).unwrap_or(i64::MAX).max(1);

        let count = match start {
            Some(start) => {
                let span = end.unwrap_or(now).saturating_sub(start);
                let bars = if span > 0 { span.saturating_add(bar - 1) / bar } else { span / bar };
                u64::try_from(bars.saturating_add(i64::try_from(START_PADDING_BARS).unwrap_or(0))).unwrap_or(0)
            }
            None => count,
        };

        let strategy = if end.is_some() || count > PAGE_SIZE {
            Strategy::Range
        } else {
            Strategy::Count
        };

        let to = end.unwrap_or(now);
        let lookback = i64::try_from(count).unwrap_or(i64::MAX).saturating_mul(bar);
        let from = start.unwrap_or_else(|| to.saturating_sub(lookback)).max(0);

        Self {
            strategy,
            count,
            from,
            to,
        }
    }

    /// Bars to ask for in `create_series`.
    #[must_use]
    pub const fn initial_bars(&self) -> u64 {
        match self.strategy {
            Strategy::Count => self.count,
            Strategy::Range => 1,
        }
    }
}

// =============================================================================
// State Machine
// =============================================================================

/// What the driver does after a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send `set_range` over the window.
    SetRange {
        /// Window start, Unix seconds.
        from: i64,
        /// Window end, Unix seconds.
        to: i64,
    },
    /// (Re)start the settle timer.
    Settle,
    /// Send `request_more_data` for this many bars.
    RequestMore(u64),
    /// Done.
    Resolve(Vec<Candle>),
}

/// Accumulates batches for one retrieval and decides the next step.
#[derive(Debug)]
pub struct HistoryMachine {
    plan: HistoryPlan,
    series: CandleSeries,
    range_sent: bool,
}

impl HistoryMachine {
    /// Start a retrieval following `plan`.
    #[must_use]
    pub const fn new(plan: HistoryPlan) -> Self {
        Self {
            plan,
            series: CandleSeries::new(),
            range_sent: false,
        }
    }

    /// The plan being followed.
    #[must_use]
    pub const fn plan(&self) -> &HistoryPlan {
        &self.plan
    }

    /// Candles collected so far.
    #[must_use]
    pub fn collected(&self) -> usize {
        self.series.len()
    }

    /// Feed one series batch.
    pub fn on_batch(&mut self, batch: Vec<Candle>) -> Step {
        match self.plan.strategy {
            Strategy::Range => {
                self.series.merge(batch);
                if self.range_sent {
                    Step::Settle
                } else {
                    self.range_sent = true;
                    Step::SetRange {
                        from: self.plan.from,
                        to: self.plan.to,
                    }
                }
            }
            Strategy::Count => {
                let before = self.series.len();
                let added = self.series.merge(batch);
                let target = usize::try_from(self.plan.count).unwrap_or(usize::MAX);

                if self.series.len() >= target {
                    Step::Resolve(self.series.latest(target))
                } else if added == 0 && before > 0 {
                    Step::Resolve(std::mem::take(&mut self.series).into_vec())
                } else {
                    Step::RequestMore(PAGE_SIZE)
                }
            }
        }
    }

    /// Whether no bars have been collected yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// The settle timer fired.
    #[must_use]
    pub fn on_settle(self) -> Vec<Candle> {
        self.series.into_vec()
    }

    /// The overall deadline passed: whatever was collected, if anything.
    #[must_use]
    pub fn on_timeout(self) -> Option<Vec<Candle>> {
        (!self.series.is_empty()).then(|| self.series.into_vec())
    }
}

// =============================================================================
// Retrieval
// =============================================================================

/// An ephemeral chart session carrying one series. The route detaches on
/// drop; [`ChartRequest::close`] also deletes the session upstream.
struct ChartRequest<'a> {
    session: &'a SessionManager,
    chart: String,
    series_id: String,
    route: ChartRoute,
}

impl<'a> ChartRequest<'a> {
    fn open(
        session: &'a SessionManager,
        symbol: &str,
        timeframe: &Timeframe,
        bars: u64,
    ) -> Result<Self, ClientError> {
        let chart = session.create_chart_session()?;
        let route = session.route_chart_session(&chart);
        let (symbol_id, series_id) = generate_series_ids();

        let sent = session
            .resolve_symbol(Some(&chart), &symbol_id, symbol)
            .and_then(|()| {
                session.create_series(Some(&chart), &series_id, &symbol_id, timeframe.resolution(), bars)
            });

        let request = Self {
            session,
            chart,
            series_id,
            route,
        };
        match sent {
            Ok(()) => Ok(request),
            Err(e) => {
                request.close();
                Err(e.into())
            }
        }
    }

    async fn next_batch(&mut self) -> Option<Vec<Candle>> {
        loop {
            let update = self.route.recv().await?;
            if let Some(batch) = series_bars(&update.payload, &self.series_id) {
                return Some(batch);
            }
        }
    }

    fn close(self) {
        let Self { session, chart, route, .. } = self;
        drop(route);
        if let Err(e) = session.delete_chart_session(&chart) {
            tracing::debug!(chart = %chart, error = %e, "Chart session not deleted");
        }
    }
}

/// Retrieve historical candles for `symbol`.
///
/// `start`/`end` are Unix seconds. Output is ascending by timestamp with no
/// duplicates.
///
/// # Errors
///
/// Returns `HistoryTimeout` when nothing arrived before the deadline, and
/// `Session` when a request cannot be sent.
pub async fn fetch_history(
    session: &SessionManager,
    settings: &HistorySettings,
    symbol: &str,
    timeframe: &Timeframe,
    count: u64,
    start: Option<i64>,
    end: Option<i64>,
) -> Result<Vec<Candle>, ClientError> {
    let started = StdInstant::now();
    let plan = HistoryPlan::new(timeframe, count, start, end, Utc::now().timestamp());

    tracing::debug!(
        symbol,
        timeframe = %timeframe,
        strategy = plan.strategy.as_str(),
        count = plan.count,
        from = plan.from,
        to = plan.to,
        "Starting history retrieval"
    );

    let mut request = ChartRequest::open(session, symbol, timeframe, plan.initial_bars())?;
    let outcome = drive_history(&mut request, HistoryMachine::new(plan), settings, symbol).await;
    request.close();

    match &outcome {
        Ok(candles) => {
            metrics::record_history(plan.strategy.as_str(), started.elapsed(), candles.len());
            tracing::debug!(symbol, candles = candles.len(), "History retrieval finished");
        }
        Err(ClientError::HistoryTimeout { .. }) => metrics::record_timeout(TimeoutKind::History),
        Err(_) => {}
    }
    outcome
}

async fn drive_history(
    request: &mut ChartRequest<'_>,
    mut machine: HistoryMachine,
    settings: &HistorySettings,
    symbol: &str,
) -> Result<Vec<Candle>, ClientError> {
    let deadline = sleep(settings.history_timeout);
    tokio::pin!(deadline);
    let settle = sleep(settings.settle_delay);
    tokio::pin!(settle);
    let mut settling = false;
    let page = sleep(EMPTY_PAGE_DELAY);
    tokio::pin!(page);
    let mut paging = None;

    loop {
        tokio::select! {
            batch = request.next_batch() => {
                let Some(batch) = batch else {
                    return Err(ClientError::NotInitialized);
                };
                match machine.on_batch(batch) {
                    Step::SetRange { from, to } => {
                        request.session.set_range(Some(&request.chart), &request.series_id, from, to)?;
                    }
                    Step::Settle => {
                        settle.as_mut().reset(Instant::now() + settings.settle_delay);
                        settling = true;
                    }
                    Step::RequestMore(bars) if machine.is_empty() => {
                        page.as_mut().reset(Instant::now() + EMPTY_PAGE_DELAY);
                        paging = Some(bars);
                    }
                    Step::RequestMore(bars) => {
                        request.session.request_more_data(Some(&request.chart), &request.series_id, bars)?;
                    }
                    Step::Resolve(candles) => return Ok(candles),
                }
            }

            () = &mut page, if paging.is_some() => {
                if let Some(bars) = paging.take() {
                    request.session.request_more_data(Some(&request.chart), &request.series_id, bars)?;
                }
            }

            () = &mut settle, if settling => return Ok(machine.on_settle()),

            () = &mut deadline => {
                return machine.on_timeout().ok_or_else(|| ClientError::HistoryTimeout {
                    symbol: symbol.to_string(),
                    timeout: settings.history_timeout,
                });
            }
        }
    }
}

/// Latest candle for `symbol`, or `None` when the first batch is empty.
///
/// # Errors
///
/// Returns `CandleTimeout` when no batch arrived in time, and `Session` when
/// a request cannot be sent.
pub async fn fetch_latest_candle(
    session: &SessionManager,
    settings: &HistorySettings,
    symbol: &str,
    timeframe: &Timeframe,
) -> Result<Option<Candle>, ClientError> {
    let mut request = ChartRequest::open(session, symbol, timeframe, LATEST_CANDLE_BARS)?;
    let deadline = Instant::now() + settings.candle_timeout;

    let outcome = tokio::select! {
        batch = request.next_batch() => batch
            .map(|bars| bars.into_iter().max_by_key(|c| c.timestamp))
            .ok_or(ClientError::NotInitialized),
        () = sleep_until(deadline) => {
            metrics::record_timeout(TimeoutKind::Candle);
            Err(ClientError::CandleTimeout {
                symbol: symbol.to_string(),
                timeout: settings.candle_timeout,
            })
        }
    };

    request.close();
    outcome
}

// =============================================================================
// Tests
// =============================================================================
