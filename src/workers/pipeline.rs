//! Bounded queue → batch → retrying sink write.
//!
//! One [`Pipeline`] backs each queue-driven worker. Producers call
//! [`Pipeline::submit`], which never blocks: it either enqueues with
//! `try_send` or drops the record and counts it. A single loop task owns the
//! receiver and the batch, flushing when the batch fills, when the flush timer
//! fires, and once more while draining at shutdown.

use super::dead_letter::DeadLetterHook;
use super::error::WorkerError;
use super::retry::RetryPolicy;
use super::stats::WorkerStats;
use crate::sink::RecordSink;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A record type that can travel through a [`Pipeline`].
#[async_trait]
pub trait PipelineRecord: Send + Sync + Sized + 'static {
    /// Records failing this check are skipped before reaching the sink.
    fn is_valid(&self) -> bool {
        true
    }

    /// Write a non-empty batch, returning how many rows the sink accepted.
    async fn persist(sink: &dyn RecordSink, table: &str, batch: &[Self]) -> Result<usize>;
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub worker: &'static str,
    pub table: String,
    pub batch_size: usize,
    pub channel_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
    pub max_failures: u32,
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<(), WorkerError> {
        let invalid = |reason: &str| WorkerError::InvalidConfig {
            worker: self.worker,
            reason: reason.to_string(),
        };
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be greater than zero"));
        }
        if self.channel_size == 0 {
            return Err(invalid("channel_size must be greater than zero"));
        }
        if self.flush_interval.is_zero() {
            return Err(invalid("flush_interval must be greater than zero"));
        }
        if self.max_failures == 0 {
            return Err(invalid("max_failures must be greater than zero"));
        }
        if self.table.is_empty() {
            return Err(invalid("table must not be empty"));
        }
        Ok(())
    }
}

/// What happened to a submitted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Rejected at the boundary (e.g. empty message); nothing is counted.
    Invalid,
    /// Pipeline stopped; nothing is counted.
    NotRunning,
    /// Consecutive flush failures reached `max_failures`.
    GateOpen,
    QueueFull,
}

/// Queue and flush telemetry for one pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub enabled: bool,
    pub running: bool,
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub last_flush_time: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub max_failures: u32,
    pub total_processed: u64,
    pub total_dropped: u64,
    pub healthy: bool,
}

pub struct Pipeline<T: PipelineRecord> {
    settings: PipelineSettings,
    sink: Arc<dyn RecordSink>,
    stats: Arc<WorkerStats>,
    dead_letter: Arc<dyn DeadLetterHook<T>>,
    /// Present only while running; taking it is what stops new submissions.
    sender: RwLock<Option<mpsc::Sender<T>>>,
}

impl<T: PipelineRecord> Pipeline<T> {
    pub fn new(
        settings: PipelineSettings,
        sink: Arc<dyn RecordSink>,
        dead_letter: Arc<dyn DeadLetterHook<T>>,
    ) -> Self {
        Self {
            settings,
            sink,
            stats: Arc::new(WorkerStats::new()),
            dead_letter,
            sender: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// True while accepting submissions and the loop still holds the receiver.
    pub fn is_running(&self) -> bool {
        self.sender.read().as_ref().is_some_and(|s| !s.is_closed())
    }

    pub fn queue_len(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0)
    }

    /// Non-blocking submission. Checks, in order: running, failure gate,
    /// queue capacity.
    pub fn submit(&self, record: T) -> SubmitOutcome {
        let worker = self.settings.worker;
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            debug!(worker, "Worker not running, discarding record");
            return SubmitOutcome::NotRunning;
        };

        if self.stats.gate_open(self.settings.max_failures) {
            self.stats.record_dropped();
            warn!(
                worker,
                failure_count = self.stats.failure_count(),
                "Failure gate open, dropping record"
            );
            return SubmitOutcome::GateOpen;
        }

        match sender.try_send(record) {
            Ok(()) => SubmitOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                self.stats.record_dropped();
                warn!(
                    worker,
                    capacity = self.settings.channel_size,
                    "Queue full, dropping record"
                );
                SubmitOutcome::QueueFull
            }
            Err(TrySendError::Closed(_)) => {
                debug!(worker, "Queue closed, discarding record");
                SubmitOutcome::NotRunning
            }
        }
    }

    /// Create the queue and spawn the loop task. The loop exits when `token`
    /// is cancelled or every sender is gone, draining before it returns.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> Result<JoinHandle<()>, WorkerError> {
        self.settings.validate()?;

        let mut slot = self.sender.write();
        if slot.is_some() {
            return Err(WorkerError::AlreadyRunning {
                worker: self.settings.worker,
            });
        }
        let (tx, rx) = mpsc::channel(self.settings.channel_size);
        *slot = Some(tx);
        drop(slot);

        let pipeline = Arc::clone(self);
        Ok(tokio::spawn(async move { pipeline.run(rx, token).await }))
    }

    /// Stop accepting submissions. Returns false if it was not running.
    pub fn close(&self) -> bool {
        self.sender.write().take().is_some()
    }

    /// `tasks_alive` is the owning worker's view of its loop tasks.
    pub fn status(&self, enabled: bool, tasks_alive: bool) -> PipelineStatus {
        let stats = self.stats.snapshot();
        let running = tasks_alive && self.is_running();
        PipelineStatus {
            enabled,
            running,
            queue_len: self.queue_len(),
            queue_capacity: self.settings.channel_size,
            last_flush_time: stats.last_flush_time,
            failure_count: stats.failure_count,
            max_failures: self.settings.max_failures,
            total_processed: stats.total_processed,
            total_dropped: stats.total_dropped,
            healthy: enabled && running && stats.failure_count < self.settings.max_failures,
        }
    }

    async fn run(&self, mut receiver: mpsc::Receiver<T>, token: CancellationToken) {
        let worker = self.settings.worker;
        let mut batch: Vec<T> = Vec::with_capacity(self.settings.batch_size);
        let mut flush_interval = interval(self.settings.flush_interval);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the immediate first tick so we don't flush an empty batch on startup.
        flush_interval.tick().await;

        info!(worker, "Worker started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = receiver.recv() => match received {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= self.settings.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = flush_interval.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }

        self.drain(receiver, batch).await;
        info!(worker, "Worker stopped");
    }

    /// Flush the in-memory batch, then everything still buffered in the queue.
    async fn drain(&self, mut receiver: mpsc::Receiver<T>, mut batch: Vec<T>) {
        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }

        receiver.close();
        let mut drained = 0usize;
        while let Ok(record) = receiver.try_recv() {
            drained += 1;
            batch.push(record);
            if batch.len() >= self.settings.batch_size {
                self.flush(&mut batch).await;
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }

        if drained > 0 {
            debug!(worker = self.settings.worker, drained, "Drained queue on shutdown");
        }
    }

    async fn flush(&self, batch: &mut Vec<T>) {
        let worker = self.settings.worker;
        let records: Vec<T> = batch.drain(..).filter(|r| r.is_valid()).collect();
        if records.is_empty() {
            return;
        }

        let sink = self.sink.as_ref();
        let table = self.settings.table.as_str();
        let slice = records.as_slice();

        let result = self
            .settings
            .retry
            .run(|attempt| async move {
                T::persist(sink, table, slice).await.inspect_err(|e| {
                    warn!(worker, table, attempt = attempt + 1, error = %e, "Flush attempt failed");
                })
            })
            .await;

        match result {
            Ok(written) => {
                self.stats.record_flush_success(written);
                debug!(worker, table, batch_size = records.len(), written, "Flushed batch");
            }
            Err(exhausted) => {
                let failure_count = self.stats.record_flush_failure();
                error!(
                    worker,
                    table,
                    batch_size = records.len(),
                    attempts = exhausted.attempts,
                    failure_count,
                    error = %exhausted.last_error,
                    "Dropping batch after exhausting retries"
                );
                self.dead_letter
                    .on_exhausted(table, &records, &exhausted.last_error);
            }
        }
    }
}
