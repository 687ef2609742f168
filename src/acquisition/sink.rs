//! Destinations for decoded events and status reports.
//!
//! [`EventSink`] receives every [`EventRecord`] in FIFO order and is closed
//! once at the end of a run. [`TelemetrySink`] receives [`StatusReport`]s
//! and must never block the status task; implementations drop reports
//! rather than wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::status::StatusReport;
use crate::error::{Result, TluError};
use crate::event::EventRecord;

/// Consumer of decoded events.
#[async_trait]
pub trait EventSink: Send {
    /// Append one record.
    async fn append(&mut self, record: EventRecord) -> Result<()>;

    /// Flush and release the sink. Called once when the run ends.
    async fn close(&mut self) -> Result<()>;
}

/// Best-effort publisher of status reports.
pub trait TelemetrySink: Send + Sync {
    /// Publish a report without blocking.
    fn publish(&self, report: &StatusReport);
}

/// Keeps records in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    records: Arc<Mutex<Vec<EventRecord>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryEventSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records appended so far.
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().clone()
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no record has been appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`EventSink::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn append(&mut self, record: EventRecord) -> Result<()> {
        if self.is_closed() {
            return Err(TluError::Sink("append after close".to_string()));
        }
        self.records.lock().push(record);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Forwards records to an unbounded channel. Closing drops the sender, so
/// the receiver sees the end of the stream.
#[derive(Debug)]
pub struct ChannelEventSink {
    tx: Option<mpsc::UnboundedSender<EventRecord>>,
}

impl ChannelEventSink {
    /// Sink and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn append(&mut self, record: EventRecord) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TluError::Sink("append after close".to_string()))?;
        tx.send(record)
            .map_err(|_| TluError::Sink("event receiver dropped".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// Writes each report as an `info` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn publish(&self, report: &StatusReport) {
        info!(
            run_time_s = report.run_time.as_secs_f64(),
            pre_veto = report.pre_veto_total,
            post_veto = report.post_veto_total,
            pre_veto_rate_hz = report.pre_veto_rate,
            post_veto_rate_hz = report.post_veto_rate,
            timestamp = report.timestamp,
            "Run status"
        );
    }
}

/// Sends reports to a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelTelemetry {
    tx: mpsc::Sender<StatusReport>,
}

impl ChannelTelemetry {
    /// Publisher and the receiving end of a channel holding `capacity`
    /// reports.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StatusReport>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelTelemetry {
    fn publish(&self, report: &StatusReport) {
        if let Err(e) = self.tx.try_send(report.clone()) {
            debug!(error = %e, "Status report dropped");
        }
    }
}
