//! In-memory sink for tests.
//!
//! Behaves like the SQL sinks (hash dedup for audit rows, retention deletes by
//! timestamp) and can be scripted to fail, stall, or slow down writes.

use super::manager::{retention_column, RecordSink, AUDIT_TABLE, HEALTH_TABLE};
use crate::workers::{AuditEvent, HealthMetricSnapshot};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct WriteGate {
    held: AtomicBool,
    allowed: AtomicUsize,
    notify: Notify,
}

impl WriteGate {
    async fn admit(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent release is not missed
            notified.as_mut().enable();

            if !self.held.load(Ordering::SeqCst) {
                return;
            }
            if self
                .allowed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return;
            }
            notified.await;
        }
    }
}

/// Mock sink that records rows in memory.
#[derive(Debug, Default)]
pub struct MockSink {
    audit: Mutex<Vec<AuditEvent>>,
    health: Mutex<Vec<HealthMetricSnapshot>>,
    write_calls: AtomicUsize,
    fail_next: AtomicU32,
    fail_always: AtomicBool,
    write_delay: Mutex<Duration>,
    gate: WriteGate,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` write calls.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Park every write call until it is allowed through.
    pub fn hold_writes(&self) {
        self.gate.held.store(true, Ordering::SeqCst);
    }

    /// Let `n` held write calls proceed.
    pub fn allow_writes(&self, n: usize) {
        self.gate.allowed.fetch_add(n, Ordering::SeqCst);
        self.gate.notify.notify_waiters();
    }

    /// Stop holding writes and wake everything parked.
    pub fn release_writes(&self) {
        self.gate.held.store(false, Ordering::SeqCst);
        self.gate.notify.notify_waiters();
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Write calls started, including failed and still-held ones.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn audit_count(&self) -> usize {
        self.audit.lock().len()
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit.lock().clone()
    }

    pub fn health_count(&self) -> usize {
        self.health.lock().len()
    }

    pub fn health_metrics(&self) -> Vec<HealthMetricSnapshot> {
        self.health.lock().clone()
    }

    /// Insert audit rows directly, bypassing failure scripting and holds.
    pub fn seed_audit_events(&self, events: Vec<AuditEvent>) -> usize {
        Self::insert_deduplicated(&mut self.audit.lock(), &events)
    }

    fn insert_deduplicated(rows: &mut Vec<AuditEvent>, events: &[AuditEvent]) -> usize {
        let mut seen: HashSet<String> = rows.iter().map(|e| e.entry_hash.clone()).collect();
        let mut written = 0;
        for event in events {
            if seen.insert(event.entry_hash.clone()) {
                rows.push(event.clone());
                written += 1;
            }
        }
        written
    }

    /// Shared preamble of every write call.
    async fn begin_write(&self) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.gate.admit().await;

        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_always.load(Ordering::SeqCst) {
            return Err(anyhow!("mock sink: write failed"));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("mock sink: scripted write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordSink for MockSink {
    async fn run_migrations(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_audit_events(&self, _table: &str, events: &[AuditEvent]) -> Result<usize> {
        self.begin_write().await?;
        Ok(Self::insert_deduplicated(&mut self.audit.lock(), events))
    }

    async fn insert_health_metrics(
        &self,
        _table: &str,
        metrics: &[HealthMetricSnapshot],
    ) -> Result<usize> {
        self.begin_write().await?;
        self.health.lock().extend_from_slice(metrics);
        Ok(metrics.len())
    }

    async fn delete_before(&self, table: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        retention_column(table)?;
        let deleted = match table {
            AUDIT_TABLE => {
                let mut rows = self.audit.lock();
                let before = rows.len();
                rows.retain(|e| e.timestamp >= cutoff);
                before - rows.len()
            }
            HEALTH_TABLE => {
                let mut rows = self.health.lock();
                let before = rows.len();
                rows.retain(|m| m.recorded_at >= cutoff);
                before - rows.len()
            }
            _ => 0,
        };
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn duplicate_hashes_are_not_written_twice() {
        let sink = MockSink::new();
        let event = AuditEvent::new("ERROR", "quota exceeded");
        let written = sink
            .insert_audit_events(AUDIT_TABLE, &[event.clone(), event.clone()])
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(sink.insert_audit_events(AUDIT_TABLE, &[event]).await.unwrap(), 0);
        assert_eq!(sink.write_calls(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let sink = MockSink::new();
        sink.fail_next(2);
        let batch = [AuditEvent::new("INFO", "x")];
        assert!(sink.insert_audit_events(AUDIT_TABLE, &batch).await.is_err());
        assert!(sink.insert_audit_events(AUDIT_TABLE, &batch).await.is_err());
        assert_eq!(sink.insert_audit_events(AUDIT_TABLE, &batch).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn held_writes_wait_for_permits() {
        let sink = Arc::new(MockSink::new());
        sink.hold_writes();

        let writer = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                sink.insert_audit_events(AUDIT_TABLE, &[AuditEvent::new("INFO", "held")])
                    .await
            })
        };

        for _ in 0..100 {
            if sink.write_calls() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.audit_count(), 0);

        sink.allow_writes(1);
        let written = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("held write should be admitted")
            .unwrap()
            .unwrap();
        assert_eq!(written, 1);
    }

    #[tokio::test]
    async fn unknown_table_cannot_be_cleaned() {
        let sink = MockSink::new();
        assert!(sink.delete_before("sessions", Utc::now()).await.is_err());
    }
}
