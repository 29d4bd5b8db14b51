//! Telemetry sinks
//!
//! The tracker hands every finished record to a [`TelemetrySink`] exactly once.
//! Sending is fire-and-forget: a sink must never block or fail the caller.

use crate::record::CallRecord;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

/// Accepts finished call records for further pipeline processing
pub trait TelemetrySink: Send + Sync {
    fn send(&self, record: CallRecord);
}

/// Forwards records into a bounded channel owned by the surrounding pipeline
///
/// When the channel is full or closed the record is dropped and counted.
pub struct ChannelSink {
    tx: mpsc::Sender<CallRecord>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<CallRecord>) -> Self {
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a sink together with the receiving end
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<CallRecord>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    /// Records dropped because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for ChannelSink {
    fn send(&self, record: CallRecord) {
        if let Err(e) = self.tx.try_send(record) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("Telemetry channel full, dropped record ({} total)", dropped)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    warn!("Telemetry channel closed, dropped record ({} total)", dropped)
                }
            }
        }
    }
}

/// Keeps every record in memory
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<CallRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Snapshot of all records sent so far
    pub fn records(&self) -> Vec<CallRecord> {
        self.records.lock().clone()
    }

    /// Remove and return all records
    pub fn drain(&self) -> Vec<CallRecord> {
        std::mem::take(&mut *self.records.lock())
    }
}

impl TelemetrySink for MemorySink {
    fn send(&self, record: CallRecord) {
        self.records.lock().push(record);
    }
}
