//! Periodic status polling.
//!
//! The status task wakes every `status_interval`, takes one counter and
//! timestamp [`Snapshot`] and folds it into the [`RunContext`]. The context
//! produces a [`StatusReport`] for telemetry and decides whether a stop
//! condition has been reached. The task only ever reads from the board;
//! stopping is left to the main loop.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use super::sink::TelemetrySink;
use super::{StopHandle, StopReason};
use crate::clock::ClockSource;
use crate::config::StopConditions;
use crate::tlu::{Counters, Snapshot, Tlu};

/// Trigger totals and rates at one status tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Time since run start
    #[serde(with = "humantime_serde")]
    pub run_time: Duration,
    /// Pre-veto triggers since run start
    pub pre_veto_total: u64,
    /// Post-veto triggers since run start
    pub post_veto_total: u64,
    /// Pre-veto rate over the last interval, Hz
    pub pre_veto_rate: f64,
    /// Post-veto rate over the last interval, Hz
    pub post_veto_rate: f64,
    /// Board timestamp at the tick, 40 MHz ticks
    pub timestamp: u64,
}

/// Per-run bookkeeping, created at run start.
///
/// The hardware counters are 32 bits wide; totals accumulate wrapping
/// deltas so a counter rollover between two ticks is absorbed.
#[derive(Debug, Clone)]
pub struct RunContext {
    started: Duration,
    last_status: Duration,
    last_raw: Counters,
    pre_veto_total: u64,
    post_veto_total: u64,
    stop: StopConditions,
}

impl RunContext {
    /// Context anchored at the baseline snapshot taken before triggers were
    /// released.
    pub fn new(baseline: Snapshot, now: Duration, stop: StopConditions) -> Self {
        Self {
            started: now,
            last_status: now,
            last_raw: baseline.counters,
            pre_veto_total: 0,
            post_veto_total: 0,
            stop,
        }
    }

    /// `(pre_veto, post_veto)` since run start as of the last update.
    pub fn totals(&self) -> (u64, u64) {
        (self.pre_veto_total, self.post_veto_total)
    }

    /// Fold in a snapshot taken at host time `now`.
    pub fn update(&mut self, snapshot: Snapshot, now: Duration) -> StatusReport {
        let d_pre = u64::from(snapshot.counters.pre_veto.wrapping_sub(self.last_raw.pre_veto));
        let d_post = u64::from(snapshot.counters.post_veto.wrapping_sub(self.last_raw.post_veto));
        self.pre_veto_total += d_pre;
        self.post_veto_total += d_post;
        self.last_raw = snapshot.counters;

        let dt = now.saturating_sub(self.last_status).as_secs_f64();
        self.last_status = now;
        let rate = |delta: u64| if dt > 0.0 { delta as f64 / dt } else { 0.0 };

        StatusReport {
            run_time: now.saturating_sub(self.started),
            pre_veto_total: self.pre_veto_total,
            post_veto_total: self.post_veto_total,
            pre_veto_rate: rate(d_pre),
            post_veto_rate: rate(d_post),
            timestamp: snapshot.timestamp,
        }
    }

    /// Stop condition reached by `report`, if any.
    pub fn stop_reason(&self, report: &StatusReport) -> Option<StopReason> {
        if let Some(max) = self.stop.max_trigger_count {
            if report.post_veto_total >= max {
                return Some(StopReason::MaxTriggers);
            }
        }
        if let Some(timeout) = self.stop.timeout {
            if report.run_time >= timeout {
                return Some(StopReason::Timeout);
            }
        }
        None
    }
}

/// Everything the status task needs; moved into the task at run start.
pub(crate) struct StatusTask {
    pub(crate) tlu: Tlu,
    pub(crate) clock: Arc<dyn ClockSource>,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
    pub(crate) stop: StopHandle,
    pub(crate) period: Duration,
    pub(crate) context: RunContext,
}

impl StatusTask {
    /// Poll until `shutdown` fires, then hand the context back.
    pub(crate) async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> RunContext {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the baseline covers it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                _ = &mut shutdown => break,
            }
        }
        self.context
    }

    fn tick(&mut self) {
        match self.tlu.snapshot() {
            Ok(snapshot) => {
                let report = self.context.update(snapshot, self.clock.now());
                self.telemetry.publish(&report);
                if let Some(reason) = self.context.stop_reason(&report) {
                    if self.stop.request(reason) {
                        info!(
                            ?reason,
                            post_veto = report.post_veto_total,
                            run_time_s = report.run_time.as_secs_f64(),
                            "Stop condition reached"
                        );
                    }
                }
            }
            Err(e) if e.is_fatal_to_run() => {
                error!(error = %e, "Protocol fault while reading status; stopping run");
                self.stop.request(StopReason::ProtocolFault);
            }
            Err(e) => warn!(error = %e, "Status read failed"),
        }
    }
}
