use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Mutable flush bookkeeping. Written only by the owning worker loop and read
/// by concurrent status queries and submissions.
#[derive(Debug, Default, Clone, Copy)]
struct FlushState {
    failure_count: u32,
    last_flush_time: Option<DateTime<Utc>>,
}

/// Operational telemetry for one worker. Not persisted.
#[derive(Debug, Default)]
pub struct WorkerStats {
    total_processed: AtomicU64,
    total_dropped: AtomicU64,
    flush: RwLock<FlushState>,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub total_processed: u64,
    pub total_dropped: u64,
    pub failure_count: u32,
    pub last_flush_time: Option<DateTime<Utc>>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::SeqCst)
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u32 {
        self.flush.read().failure_count
    }

    pub fn last_flush_time(&self) -> Option<DateTime<Utc>> {
        self.flush.read().last_flush_time
    }

    /// True while consecutive failures have reached `max_failures`.
    pub fn gate_open(&self, max_failures: u32) -> bool {
        self.failure_count() >= max_failures
    }

    pub(crate) fn record_dropped(&self) {
        self.total_dropped.fetch_add(1, Ordering::SeqCst);
    }

    /// A flush succeeded: close the gate and count what the sink reported.
    pub(crate) fn record_flush_success(&self, written: usize) {
        {
            let mut flush = self.flush.write();
            flush.failure_count = 0;
            flush.last_flush_time = Some(Utc::now());
        }
        self.total_processed
            .fetch_add(written as u64, Ordering::SeqCst);
    }

    /// A flush exhausted its retries. Returns the new consecutive count.
    pub(crate) fn record_flush_failure(&self) -> u32 {
        let mut flush = self.flush.write();
        flush.failure_count = flush.failure_count.saturating_add(1);
        flush.failure_count
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        let flush = *self.flush.read();
        WorkerStatsSnapshot {
            total_processed: self.total_processed(),
            total_dropped: self.total_dropped(),
            failure_count: flush.failure_count,
            last_flush_time: flush.last_flush_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_resets_failures_and_counts_reported_writes() {
        let stats = WorkerStats::new();
        assert_eq!(stats.record_flush_failure(), 1);
        assert_eq!(stats.record_flush_failure(), 2);
        assert!(stats.gate_open(2));

        stats.record_flush_success(3);

        assert_eq!(stats.failure_count(), 0);
        assert!(!stats.gate_open(2));
        assert_eq!(stats.total_processed(), 3);
        assert!(stats.last_flush_time().is_some());
    }

    #[test]
    fn failure_does_not_touch_last_flush_time() {
        let stats = WorkerStats::new();
        stats.record_flush_failure();
        assert!(stats.last_flush_time().is_none());
        assert_eq!(stats.total_processed(), 0);
    }
}
