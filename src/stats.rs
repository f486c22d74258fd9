use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker counters, shared between the worker task and whoever
/// monitors it.
#[derive(Debug, Default)]
pub struct WorkerStats {
    entries_applied: AtomicU64,
    entries_skipped: AtomicU64,
    documents_dumped: AtomicU64,
    resyncs: AtomicU64,
    rollbacks: AtomicU64,
    transient_errors: AtomicU64,
    checkpoints_persisted: AtomicU64,
    lag_seconds: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub entries_applied: u64,
    pub entries_skipped: u64,
    pub documents_dumped: u64,
    /// Full dumps forced because a resume point was no longer usable.
    pub resyncs: u64,
    pub rollbacks: u64,
    pub transient_errors: u64,
    pub checkpoints_persisted: u64,
    /// Seconds between the newest oplog entry and the checkpoint, as of the
    /// last checkpoint flush.
    pub lag_seconds: u64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_applied(&self) {
        self.entries_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.entries_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dumped(&self, documents: u64) {
        self.documents_dumped.fetch_add(documents, Ordering::Relaxed);
    }

    pub(crate) fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transient_error(&self) {
        self.transient_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_lag_seconds(&self, lag: u64) {
        self.lag_seconds.store(lag, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
            entries_skipped: self.entries_skipped.load(Ordering::Relaxed),
            documents_dumped: self.documents_dumped.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            checkpoints_persisted: self.checkpoints_persisted.load(Ordering::Relaxed),
            lag_seconds: self.lag_seconds.load(Ordering::Relaxed),
        }
    }
}
