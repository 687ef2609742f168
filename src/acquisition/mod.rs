//! Run control and FIFO readout.
//!
//! # State Machine
//!
//! ```text
//! Idle ──configure──> Configuring ──start──> Running ──stop request──> Stopping
//!  ^                   │    ^                                             │
//!  │                   └────┘ configure again                             │
//!  └───────────────────────────────summary────────────────────────────────┘
//! ```
//!
//! A configuration is consumed by the run it was applied for, so every run
//! starts from Configuring. A failed configure returns to Idle.
//!
//! [`RunController::start`] arms the board and spawns two tasks sharing the
//! register bus: the main readout loop and the status task. Either a stop
//! condition seen by the status task, a protocol fault, or
//! [`RunHandle::request_stop`] raises the stop flag. The main loop checks the
//! flag once per iteration, then vetoes triggers, drains what is left in the
//! FIFO and returns a [`RunSummary`].

pub mod sink;
pub mod status;

pub use sink::{
    ChannelEventSink, ChannelTelemetry, EventSink, LogTelemetry, MemoryEventSink, TelemetrySink,
};
pub use status::{RunContext, StatusReport};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::clock::ClockSource;
use crate::config::CompiledConfig;
use crate::error::{Result, TluError};
use crate::event::{decode_block, EventRecord, EVENT_WORDS};
use crate::tlu::{regs, Snapshot, Tlu};
use status::StatusTask;

/// Upper bound on FIFO reads while draining at stop.
const RESIDUAL_DRAIN_LIMIT: usize = 64;

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    /// No run; configuration allowed
    Idle,
    /// Configuration being applied
    Configuring,
    /// Triggers enabled, FIFO being drained
    Running,
    /// Veto set, residual data being drained
    Stopping,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::Configuring => write!(f, "Configuring"),
            RunState::Running => write!(f, "Running"),
            RunState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// Post-veto trigger count reached `max_trigger_count`
    MaxTriggers,
    /// Run time reached `timeout`
    Timeout,
    /// Stop requested through a [`StopHandle`]
    External,
    /// Protocol error on the bus
    ProtocolFault,
    /// The event sink rejected a record
    SinkFailure,
}

/// Result of [`RunController::start`].
#[derive(Debug)]
pub enum StartOutcome {
    /// A new run is active
    Started(RunHandle),
    /// A run was already in progress; nothing changed
    AlreadyRunning,
}

/// Totals of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Wall-clock start time
    pub started_at: DateTime<Utc>,
    /// Host time between start and end of the stop sequence
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Why the run ended
    pub stop_reason: StopReason,
    /// Records appended to the sink
    pub records: u64,
    /// Pre-veto triggers since start
    pub pre_veto_total: u64,
    /// Post-veto triggers since start
    pub post_veto_total: u64,
    /// Fill levels that were not a whole number of frames
    pub misaligned_reads: u64,
    /// Event-number discontinuities
    pub event_number_gaps: u64,
    /// Non-fatal bus errors during readout
    pub read_errors: u64,
}

/// Cloneable stop request. The first reason wins.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl StopHandle {
    fn new() -> (Self, watch::Receiver<Option<StopReason>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Ask the run to stop with [`StopReason::External`].
    pub fn request_stop(&self) -> bool {
        self.request(StopReason::External)
    }

    /// Raise the stop flag. Returns whether this call set it.
    pub fn request(&self, reason: StopReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// Reason recorded so far.
    pub fn reason(&self) -> Option<StopReason> {
        *self.tx.borrow()
    }
}

/// Handle to an active run.
#[derive(Debug)]
pub struct RunHandle {
    stop: StopHandle,
    task: JoinHandle<Result<RunSummary>>,
}

impl RunHandle {
    /// Handle that can stop the run from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Ask the run to stop; see [`StopHandle::request_stop`].
    pub fn request_stop(&self) -> bool {
        self.stop.request_stop()
    }

    /// Whether the run task has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end by itself.
    pub async fn wait(self) -> Result<RunSummary> {
        self.task.await?
    }

    /// Request a stop and wait for the summary.
    pub async fn stop(self) -> Result<RunSummary> {
        self.request_stop();
        self.wait().await
    }
}

/// Returns the shared state to `Idle` when a run task ends, however it ends.
struct IdleOnDrop(Arc<Mutex<RunState>>);

impl Drop for IdleOnDrop {
    fn drop(&mut self) {
        *self.0.lock() = RunState::Idle;
    }
}

/// Drives configuration and runs of one TLU.
pub struct RunController {
    tlu: Tlu,
    clock: Arc<dyn ClockSource>,
    telemetry: Arc<dyn TelemetrySink>,
    state: Arc<Mutex<RunState>>,
    config: Mutex<Option<CompiledConfig>>,
    span: Span,
}

impl RunController {
    /// Controller for `tlu`, logging under `parent`.
    pub fn new(
        tlu: Tlu,
        clock: Arc<dyn ClockSource>,
        telemetry: Arc<dyn TelemetrySink>,
        parent: &Span,
    ) -> Self {
        let span = info_span!(parent: parent, "acquisition");
        Self {
            tlu,
            clock,
            telemetry,
            state: Arc::new(Mutex::new(RunState::Idle)),
            config: Mutex::new(None),
            span,
        }
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// The board controller.
    pub fn tlu(&self) -> &Tlu {
        &self.tlu
    }

    /// Apply a compiled configuration and enter Configuring. Allowed while
    /// Idle or Configuring.
    pub fn configure(&self, config: CompiledConfig) -> Result<()> {
        let _enter = self.span.enter();
        {
            let mut state = self.state.lock();
            match *state {
                RunState::Idle | RunState::Configuring => *state = RunState::Configuring,
                current => {
                    return Err(TluError::config(format!("cannot configure while {current}")));
                }
            }
        }
        if let Err(e) = self.tlu.configure(&config) {
            *self.config.lock() = None;
            *self.state.lock() = RunState::Idle;
            return Err(e);
        }
        *self.config.lock() = Some(config);
        info!("Configuration applied");
        Ok(())
    }

    /// Arm the board and start readout into `sink`. Consumes the applied
    /// configuration.
    pub async fn start(&self, sink: Box<dyn EventSink>) -> Result<StartOutcome> {
        let config = {
            let mut state = self.state.lock();
            match *state {
                RunState::Configuring => {
                    let config = self
                        .config
                        .lock()
                        .take()
                        .ok_or_else(|| TluError::config("configuration still being applied"))?;
                    *state = RunState::Running;
                    config
                }
                RunState::Idle => {
                    return Err(TluError::config("start requested before configure"));
                }
                current => {
                    info!(state = %current, "Run already in progress");
                    return Ok(StartOutcome::AlreadyRunning);
                }
            }
        };
        let idle = IdleOnDrop(Arc::clone(&self.state));

        let span = info_span!(parent: &self.span, "run");
        let baseline = match span.in_scope(|| self.arm()) {
            Ok(baseline) => baseline,
            Err(e) => {
                *self.state.lock() = RunState::Stopping;
                // Leave the board vetoed; the arm error is the one reported.
                if let Err(veto_err) = self.tlu.set_trigger_veto(true) {
                    debug!(error = %veto_err, "Veto after failed start also failed");
                }
                return Err(e);
            }
        };

        let started_at = Utc::now();
        let now = self.clock.now();
        let context = RunContext::new(baseline, now, config.stop);
        let (stop, stop_rx) = StopHandle::new();

        let (status_tx, status_rx) = oneshot::channel();
        let status = StatusTask {
            tlu: self.tlu.clone(),
            clock: Arc::clone(&self.clock),
            telemetry: Arc::clone(&self.telemetry),
            stop: stop.clone(),
            period: config.status_interval,
            context,
        };
        let status_task = tokio::spawn(status.run(status_rx).instrument(span.clone()));

        let main = MainLoop {
            tlu: self.tlu.clone(),
            clock: Arc::clone(&self.clock),
            state: Arc::clone(&self.state),
            sink,
            stop: stop.clone(),
            stop_rx,
            poll_interval: config.poll_interval,
            started: now,
            started_at,
            stats: ReadoutStats::default(),
            last_event: None,
        };
        let task = tokio::spawn(
            async move {
                let _idle = idle;
                main.run(status_tx, status_task).await
            }
            .instrument(span),
        );
        info!(
            pre_veto = baseline.counters.pre_veto,
            post_veto = baseline.counters.post_veto,
            "Run started"
        );
        Ok(StartOutcome::Started(RunHandle { stop, task }))
    }

    /// Start sequence. Triggers stay vetoed until the last write.
    fn arm(&self) -> Result<Snapshot> {
        self.tlu.reset_fifo()?;
        self.tlu.reset_counters()?;
        self.tlu.reset_timestamp()?;
        self.tlu.set_trigger_veto(true)?;
        let baseline = self.tlu.snapshot()?;
        self.tlu.set_run_active(true)?;
        self.tlu.set_trigger_veto(false)?;
        Ok(baseline)
    }
}

#[derive(Debug, Default)]
struct ReadoutStats {
    records: u64,
    misaligned_reads: u64,
    event_number_gaps: u64,
    read_errors: u64,
}

struct MainLoop {
    tlu: Tlu,
    clock: Arc<dyn ClockSource>,
    state: Arc<Mutex<RunState>>,
    sink: Box<dyn EventSink>,
    stop: StopHandle,
    stop_rx: watch::Receiver<Option<StopReason>>,
    poll_interval: Duration,
    started: Duration,
    started_at: DateTime<Utc>,
    stats: ReadoutStats,
    last_event: Option<u32>,
}

impl MainLoop {
    async fn run(
        mut self,
        status_shutdown: oneshot::Sender<()>,
        status_task: JoinHandle<RunContext>,
    ) -> Result<RunSummary> {
        let reason = loop {
            let requested = *self.stop_rx.borrow();
            if let Some(reason) = requested {
                break reason;
            }
            self.iterate().await;
        };
        *self.state.lock() = RunState::Stopping;
        info!(?reason, "Stopping run");

        if let Err(e) = self.tlu.set_trigger_veto(true) {
            error!(error = %e, "Failed to veto triggers at stop");
        }
        if let Err(e) = self.tlu.set_run_active(false) {
            error!(error = %e, "Failed to clear run-active at stop");
        }
        self.drain_residual().await;

        if let Err(e) = self.sink.close().await {
            error!(error = %e, "Failed to close event sink");
        }

        // The receiver only goes away if the task already ended.
        let _ = status_shutdown.send(());
        let mut context = status_task.await?;
        match self.tlu.snapshot() {
            Ok(snapshot) => {
                context.update(snapshot, self.clock.now());
            }
            Err(e) => warn!(error = %e, "Final counter read failed; using last status"),
        }
        let (pre_veto_total, post_veto_total) = context.totals();

        let summary = RunSummary {
            started_at: self.started_at,
            elapsed: self.clock.now().saturating_sub(self.started),
            stop_reason: reason,
            records: self.stats.records,
            pre_veto_total,
            post_veto_total,
            misaligned_reads: self.stats.misaligned_reads,
            event_number_gaps: self.stats.event_number_gaps,
            read_errors: self.stats.read_errors,
        };
        info!(
            ?reason,
            records = summary.records,
            post_veto = summary.post_veto_total,
            misaligned = summary.misaligned_reads,
            gaps = summary.event_number_gaps,
            "Run finished"
        );
        Ok(summary)
    }

    async fn iterate(&mut self) {
        match self.tlu.drain_fifo() {
            Ok(read) if read.fill_level == 0 => self.idle().await,
            Ok(read) if read.fill_level as usize % EVENT_WORDS != 0 => {
                warn!(
                    kind = "DataIntegrityWarning",
                    register = regs::EVENT_FIFO_FILL_LEVEL,
                    fill_level = read.fill_level,
                    expected_multiple = EVENT_WORDS,
                    "FIFO fill level is not a whole number of events; block discarded"
                );
                self.stats.misaligned_reads += 1;
                self.idle().await;
            }
            Ok(read) => {
                for record in decode_block(&read.words) {
                    if let Err(e) = self.deliver(record).await {
                        error!(error = %e, "Event sink failed; stopping run");
                        self.stop.request(StopReason::SinkFailure);
                        break;
                    }
                }
                // Keep the status task scheduled when the FIFO never empties.
                tokio::task::yield_now().await;
            }
            Err(e) if e.is_fatal_to_run() => {
                error!(error = %e, "Protocol fault during readout; stopping run");
                self.stop.request(StopReason::ProtocolFault);
            }
            Err(e) => {
                warn!(error = %e, "FIFO read failed");
                self.stats.read_errors += 1;
                self.idle().await;
            }
        }
    }

    async fn idle(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.stop_rx.changed() => {}
        }
    }

    async fn deliver(&mut self, record: EventRecord) -> Result<()> {
        if let Some(previous) = self.last_event {
            let expected = previous.wrapping_add(1);
            if record.event_number != expected {
                warn!(
                    kind = "DataIntegrityWarning",
                    expected,
                    actual = record.event_number,
                    "Event number gap"
                );
                self.stats.event_number_gaps += 1;
            }
        }
        self.last_event = Some(record.event_number);
        self.sink.append(record).await?;
        self.stats.records += 1;
        Ok(())
    }

    /// Best-effort drain after the veto; misaligned blocks are dropped.
    async fn drain_residual(&mut self) {
        for _ in 0..RESIDUAL_DRAIN_LIMIT {
            let read = match self.tlu.drain_fifo() {
                Ok(read) => read,
                Err(e) => {
                    warn!(error = %e, "Residual FIFO read failed");
                    return;
                }
            };
            if read.fill_level == 0 {
                return;
            }
            if read.fill_level as usize % EVENT_WORDS != 0 {
                debug!(fill_level = read.fill_level, "Dropping misaligned residual block");
                continue;
            }
            for record in decode_block(&read.words) {
                if let Err(e) = self.deliver(record).await {
                    warn!(error = %e, "Event sink failed while draining");
                    return;
                }
            }
        }
        warn!(limit = RESIDUAL_DRAIN_LIMIT, "FIFO still not empty after residual drain");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::synth_frame;
    use crate::bus::{BusFault, MockRegisterBus, MockTlu, SharedBus};
    use crate::clock::{ManualClock, MonotonicClock};
    use crate::config::TluConfig;
    use crate::i2c::I2cConfig;
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tracing_test::traced_test;

    fn controller(parent: &Span) -> (RunController, MockTlu) {
        controller_with(
            Arc::new(MonotonicClock::new()),
            Arc::new(LogTelemetry),
            parent,
        )
    }

    fn controller_with(
        clock: Arc<dyn ClockSource>,
        telemetry: Arc<dyn TelemetrySink>,
        parent: &Span,
    ) -> (RunController, MockTlu) {
        let bus = MockRegisterBus::new();
        let handle = bus.handle();
        let tlu = Tlu::new(SharedBus::new(bus), I2cConfig::default(), parent);
        (RunController::new(tlu, clock, telemetry, parent), handle)
    }

    /// Sink whose close blocks until the test releases it.
    struct GatedSink {
        closing: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl EventSink for GatedSink {
        async fn append(&mut self, _record: EventRecord) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closing.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    fn compiled(edit: impl FnOnce(&mut TluConfig)) -> CompiledConfig {
        let mut config = TluConfig::default();
        config.hardware.skip_i2c = true;
        edit(&mut config);
        config.compile().unwrap()
    }

    fn frames(numbers: impl IntoIterator<Item = u32>) -> Vec<[u32; 6]> {
        numbers
            .into_iter()
            .map(|n| synth_frame(0x3, 0x001, u64::from(n) * 100, n, [0; 6]))
            .collect()
    }

    async fn start(controller: &RunController, sink: &MemoryEventSink) -> RunHandle {
        match controller.start(Box::new(sink.clone())).await.unwrap() {
            StartOutcome::Started(handle) => handle,
            StartOutcome::AlreadyRunning => panic!("run should start"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sequence_releases_veto_last() {
        let (controller, handle) = controller(&Span::none());
        controller.configure(compiled(|_| {})).unwrap();
        let sink = MemoryEventSink::new();
        let run = start(&controller, &sink).await;

        let writes: Vec<String> = handle.write_log().into_iter().map(|(n, _)| n).collect();
        let start = writes
            .iter()
            .position(|n| n == regs::EVENT_FIFO_CSR)
            .unwrap();
        assert_eq!(
            &writes[start..],
            &[
                regs::EVENT_FIFO_CSR,
                regs::RESET_COUNTERS,
                regs::RESET_TIMESTAMP,
                regs::TRIGGER_VETO,
                regs::RUN_ACTIVE,
                regs::TRIGGER_VETO,
            ]
        );
        assert_eq!(handle.register(regs::TRIGGER_VETO), Some(0));
        assert_eq!(handle.register(regs::RUN_ACTIVE), Some(1));

        let summary = run.stop().await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::External);
        assert_eq!(handle.register(regs::TRIGGER_VETO), Some(1));
        assert_eq!(handle.register(regs::RUN_ACTIVE), Some(0));
        assert!(sink.is_closed());
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_running_is_noop() {
        let (controller, _handle) = controller(&Span::none());
        controller.configure(compiled(|_| {})).unwrap();
        let run = start(&controller, &MemoryEventSink::new()).await;
        assert_eq!(controller.state(), RunState::Running);

        let again = controller.start(Box::new(MemoryEventSink::new())).await.unwrap();
        assert!(matches!(again, StartOutcome::AlreadyRunning));
        assert!(controller.configure(compiled(|_| {})).is_err());

        run.stop().await.unwrap();
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_walks_every_state() {
        let (controller, _handle) = controller(&Span::none());
        assert_eq!(controller.state(), RunState::Idle);

        controller.configure(compiled(|_| {})).unwrap();
        assert_eq!(controller.state(), RunState::Configuring);
        controller
            .configure(compiled(|c| c.trigger.rule = "CH2".into()))
            .unwrap();
        assert_eq!(controller.state(), RunState::Configuring);

        let closing = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let sink = GatedSink {
            closing: Arc::clone(&closing),
            release: Arc::clone(&release),
        };
        let run = match controller.start(Box::new(sink)).await.unwrap() {
            StartOutcome::Started(run) => run,
            StartOutcome::AlreadyRunning => panic!("run should start"),
        };
        assert_eq!(controller.state(), RunState::Running);

        run.request_stop();
        closing.notified().await;
        assert_eq!(controller.state(), RunState::Stopping);
        let again = controller.start(Box::new(MemoryEventSink::new())).await.unwrap();
        assert!(matches!(again, StartOutcome::AlreadyRunning));
        assert!(controller.configure(compiled(|_| {})).is_err());

        release.notify_one();
        run.wait().await.unwrap();
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_run_needs_its_own_configure() {
        let (controller, _handle) = controller(&Span::none());
        controller.configure(compiled(|_| {})).unwrap();
        start(&controller, &MemoryEventSink::new())
            .await
            .stop()
            .await
            .unwrap();

        let err = controller.start(Box::new(MemoryEventSink::new())).await.unwrap_err();
        assert!(matches!(err, TluError::Configuration(_)));
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_failed_configure_returns_to_idle() {
        let (controller, handle) = controller(&Span::none());
        handle.fail_always(regs::TRIGGER_PATTERN_LOW, BusFault::Transport);
        assert!(controller.configure(compiled(|_| {})).is_err());
        assert_eq!(controller.state(), RunState::Idle);
        assert!(controller.start(Box::new(MemoryEventSink::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_start_requires_configuration() {
        let (controller, _handle) = controller(&Span::none());
        let err = controller.start(Box::new(MemoryEventSink::new())).await.unwrap_err();
        assert!(matches!(err, TluError::Configuration(_)));
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_misaligned_fill_level_is_discarded_with_warning() {
        let (controller, handle) = controller(&Span::current());
        controller.configure(compiled(|_| {})).unwrap();
        let sink = MemoryEventSink::new();
        let run = start(&controller, &sink).await;

        handle.inject_words(&[1, 2, 3, 4, 5, 6, 7]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.fifo_len(), 0);

        let summary = run.stop().await.unwrap();
        assert_eq!(summary.misaligned_reads, 1);
        assert_eq!(summary.records, 0);
        assert!(sink.is_empty());
        assert!(logs_contain("not a whole number of events"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_misaligned_fill_level_still_reaches_timeout() {
        let (controller, handle) = controller(&Span::none());
        controller
            .configure(compiled(|c| {
                c.run.timeout = Some(Duration::from_millis(300));
                c.run.status_interval = Duration::from_millis(100);
            }))
            .unwrap();
        handle.set_stuck_fill_level(Some(7));
        let run = start(&controller, &MemoryEventSink::new()).await;

        let summary = tokio::time::timeout(Duration::from_secs(5), run.wait())
            .await
            .expect("run never stopped")
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::Timeout);
        assert!(summary.misaligned_reads > 0);
        // One discarded block per poll interval, not a busy loop.
        assert!(summary.misaligned_reads <= 50, "{}", summary.misaligned_reads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_number_gap_is_counted_not_fatal() {
        let (controller, handle) = controller(&Span::none());
        controller.configure(compiled(|_| {})).unwrap();
        let sink = MemoryEventSink::new();
        let run = start(&controller, &sink).await;

        handle.inject_frames(&frames([1, 2, 5, 6]));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let summary = run.stop().await.unwrap();
        assert_eq!(summary.records, 4);
        assert_eq!(summary.event_number_gaps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_trigger_count_stops_run() {
        let (controller, handle) = controller(&Span::none());
        controller
            .configure(compiled(|c| c.run.max_trigger_count = Some(3)))
            .unwrap();
        let sink = MemoryEventSink::new();
        let run = start(&controller, &sink).await;

        handle.inject_frames(&frames(1..=4));
        let summary = run.wait().await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::MaxTriggers);
        assert_eq!(summary.records, 4);
        assert_eq!(summary.post_veto_total, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_run() {
        let (controller, _handle) = controller(&Span::none());
        controller
            .configure(compiled(|c| c.run.timeout = Some(Duration::from_secs(3))))
            .unwrap();
        let run = start(&controller, &MemoryEventSink::new()).await;

        let summary = run.wait().await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::Timeout);
        assert!(summary.elapsed >= Duration::from_secs(3));
        assert!(summary.elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_fault_in_readout_stops_run() {
        let (controller, handle) = controller(&Span::none());
        controller.configure(compiled(|_| {})).unwrap();
        let sink = MemoryEventSink::new();
        let run = start(&controller, &sink).await;

        handle.fail_always(regs::EVENT_FIFO_FILL_LEVEL, BusFault::Protocol);
        let summary = run.wait().await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::ProtocolFault);
        assert!(sink.is_closed());
        assert_eq!(handle.register(regs::TRIGGER_VETO), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_fault_in_status_read_stops_run() {
        let (controller, handle) = controller(&Span::none());
        controller
            .configure(compiled(|c| c.run.status_interval = Duration::from_millis(50)))
            .unwrap();
        let run = start(&controller, &MemoryEventSink::new()).await;

        handle.fail_always(regs::PRE_VETO_TRIGGERS, BusFault::Protocol);
        let summary = run.wait().await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::ProtocolFault);
        assert_eq!(handle.register(regs::TRIGGER_VETO), Some(1));
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_uses_injected_clock() {
        let clock = ManualClock::new();
        let (telemetry, mut reports) = ChannelTelemetry::new(8);
        let (controller, handle) = controller_with(
            Arc::new(clock.clone()),
            Arc::new(telemetry),
            &Span::none(),
        );
        controller
            .configure(compiled(|c| {
                c.run.status_interval = Duration::from_secs(1);
                c.run.timeout = Some(Duration::from_secs(5));
            }))
            .unwrap();
        let run = start(&controller, &MemoryEventSink::new()).await;

        handle.inject_frames(&frames(1..=4));
        clock.advance(Duration::from_secs(2));
        let report = reports.recv().await.unwrap();
        assert_eq!(report.run_time, Duration::from_secs(2));
        assert_eq!(report.post_veto_total, 4);
        assert_eq!(report.post_veto_rate, 2.0);

        clock.set(Duration::from_secs(10));
        let summary = run.wait().await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::Timeout);
        assert_eq!(summary.elapsed, Duration::from_secs(10));
        assert_eq!(summary.records, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_bus_error_is_survived() {
        let (controller, handle) = controller(&Span::none());
        controller.configure(compiled(|_| {})).unwrap();
        let sink = MemoryEventSink::new();
        let run = start(&controller, &sink).await;

        handle.fail_next(regs::EVENT_FIFO_FILL_LEVEL, BusFault::Transport);
        handle.inject_frames(&frames(1..=2));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let summary = run.stop().await.unwrap();
        assert_eq!(summary.read_errors, 1);
        assert_eq!(summary.records, 2);
    }

    #[test]
    fn test_first_stop_reason_wins() {
        let (stop, _rx) = StopHandle::new();
        assert!(stop.request(StopReason::Timeout));
        assert!(!stop.request_stop());
        assert_eq!(stop.reason(), Some(StopReason::Timeout));
    }
}
