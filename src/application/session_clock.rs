// Session clock - Backend-authoritative elapsed time with a single local ticker
use crate::domain::session::{ClockView, format_elapsed};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;

/// Source of wall-clock "now"
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Called on every tick while the clock is armed
pub type TickSink = Arc<dyn Fn() + Send + Sync>;

/// Whole seconds from `from` to `to`, never negative
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_seconds()).unwrap_or(0)
}

pub struct SessionClock {
    time: Arc<dyn TimeSource>,
    tick_interval: Duration,
    on_tick: TickSink,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    frozen_elapsed: u64,
    ticker: Option<JoinHandle<()>>,
}

impl SessionClock {
    pub fn new(time: Arc<dyn TimeSource>, tick_interval: Duration, on_tick: TickSink) -> Self {
        Self {
            time,
            tick_interval,
            on_tick,
            start: None,
            end: None,
            frozen_elapsed: 0,
            ticker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Start ticking from an authoritative start instant.
    ///
    /// No-op while already armed; returns whether a ticker was started.
    pub fn arm(&mut self, start: DateTime<Utc>) -> bool {
        if self.is_running() {
            tracing::debug!(
                "Clock already armed at {:?}, ignoring arm at {}",
                self.start,
                start
            );
            return false;
        }

        self.start = Some(start);
        self.end = None;
        self.frozen_elapsed = 0;

        let sink = self.on_tick.clone();
        let period = self.tick_interval;
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = IntervalStream::new(interval);
            while ticks.next().await.is_some() {
                sink();
            }
        }));

        tracing::info!("Session clock armed at {}", start);
        true
    }

    /// Stop ticking and fix elapsed time from the authoritative end instant
    pub fn freeze(&mut self, end: DateTime<Utc>) {
        self.stop_ticker();
        self.end = Some(end);
        match self.start {
            Some(start) => self.frozen_elapsed = seconds_between(start, end),
            None => tracing::warn!("Freezing clock at {} without a start instant", end),
        }
        tracing::info!("Session clock frozen at {} s", self.frozen_elapsed);
    }

    /// Adopt a start instant reported late, e.g. only in the stop response.
    /// A clock that is already frozen recomputes its elapsed time.
    pub fn backfill_start(&mut self, start: DateTime<Utc>) {
        if self.start.is_some() {
            return;
        }
        self.start = Some(start);
        if let (false, Some(end)) = (self.is_running(), self.end) {
            self.frozen_elapsed = seconds_between(start, end);
        }
    }

    pub fn reset(&mut self) {
        self.stop_ticker();
        self.start = None;
        self.end = None;
        self.frozen_elapsed = 0;
    }

    /// Elapsed seconds: "now minus start" while armed, fixed once frozen
    pub fn elapsed_seconds(&self) -> u64 {
        match (self.is_running(), self.start) {
            (true, Some(start)) => seconds_between(start, self.time.now()),
            _ => self.frozen_elapsed,
        }
    }

    pub fn view(&self) -> ClockView {
        let elapsed_seconds = self.elapsed_seconds();
        ClockView {
            start_instant: self.start,
            end_instant: self.end,
            elapsed_seconds,
            elapsed_display: format_elapsed(elapsed_seconds),
            running: self.is_running(),
        }
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl Drop for SessionClock {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

impl std::fmt::Debug for SessionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClock")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("running", &self.is_running())
            .finish()
    }
}
