use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
    pub dropped_timestamp: AtomicU64,
    pub dropped_rejected: AtomicU64,
    pub ack_failures: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dropped_timestamp: u64,
    pub dropped_rejected: u64,
    pub ack_failures: u64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            dropped_timestamp: self.dropped_timestamp.load(Ordering::Relaxed),
            dropped_rejected: self.dropped_rejected.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }

    pub fn log_snapshot(&self, label: &str) {
        let snap = self.snapshot();
        let last_error = self.last_error().unwrap_or_default();
        tracing::info!(
            received = snap.received,
            acked = snap.acked,
            nacked = snap.nacked,
            dropped_timestamp = snap.dropped_timestamp,
            dropped_rejected = snap.dropped_rejected,
            ack_failures = snap.ack_failures,
            last_error = %last_error,
            "{label}"
        );
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
