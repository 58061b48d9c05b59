use super::error::WorkerError;
use super::{StopHandle, TaskSlot};
use crate::sink::RecordSink;
use chrono::{DateTime, Local, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest retention window accepted, about one hundred years.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Oldest timestamp kept for a retention window ending at `now`.
pub fn retention_cutoff(
    now: DateTime<Utc>,
    retention_days: i64,
) -> Result<DateTime<Utc>, WorkerError> {
    let out_of_range = || WorkerError::InvalidConfig {
        worker: CleanupWorker::NAME,
        reason: format!(
            "retention_days must be at most {}, got {}",
            MAX_RETENTION_DAYS, retention_days
        ),
    };
    if retention_days > MAX_RETENTION_DAYS {
        return Err(out_of_range());
    }
    chrono::Duration::try_days(retention_days)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(out_of_range)
}

/// Time from `now` until the next local midnight in `now`'s timezone.
///
/// Falls back to a full day if that midnight does not exist locally.
pub fn duration_until_next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> Duration {
    let tz = now.timezone();
    let next = now
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| tz.from_local_datetime(&midnight).earliest());

    match next {
        Some(next) => (next - now.clone()).to_std().unwrap_or(ONE_DAY),
        None => ONE_DAY,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupStatus {
    pub enabled: bool,
    pub running: bool,
    pub retention_days: i64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_deleted: Option<u64>,
    pub healthy: bool,
}

#[derive(Debug, Clone, Copy)]
struct CleanupRun {
    finished_at: DateTime<Utc>,
    deleted: u64,
}

struct CleanupJob {
    table: String,
    retention_days: i64,
    sink: Arc<dyn RecordSink>,
    last_run: RwLock<Option<CleanupRun>>,
}

impl CleanupJob {
    async fn run_once(&self) -> Result<u64, WorkerError> {
        let cutoff = retention_cutoff(Utc::now(), self.retention_days)?;
        let deleted = self.sink.delete_before(&self.table, cutoff).await?;
        *self.last_run.write() = Some(CleanupRun {
            finished_at: Utc::now(),
            deleted,
        });
        info!(
            worker = CleanupWorker::NAME,
            table = %self.table,
            cutoff = %cutoff,
            deleted,
            "Retention cleanup finished"
        );
        Ok(deleted)
    }
}

/// Deletes audit rows older than the retention window once a day, at local
/// midnight.
pub struct CleanupWorker {
    enabled: bool,
    job: Arc<CleanupJob>,
    tasks: TaskSlot,
}

impl CleanupWorker {
    pub const NAME: &'static str = "cleanup";

    /// Disabled when retention is not positive or audit logging is off.
    pub fn new(
        retention_days: i64,
        audit_enabled: bool,
        table: impl Into<String>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            enabled: audit_enabled && retention_days > 0,
            job: Arc::new(CleanupJob {
                table: table.into(),
                retention_days,
                sink,
                last_run: RwLock::new(None),
            }),
            tasks: TaskSlot::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    /// Run the retention delete immediately, outside the schedule.
    pub async fn run_now(&self) -> Result<u64, WorkerError> {
        if !self.enabled {
            return Err(WorkerError::CleanupDisabled);
        }
        self.job.run_once().await
    }

    pub fn start(&self) -> Result<(), WorkerError> {
        if !self.enabled {
            return Err(WorkerError::CleanupDisabled);
        }
        retention_cutoff(Utc::now(), self.job.retention_days)?;
        self.tasks.start(Self::NAME, |token| {
            Ok(vec![tokio::spawn(cleanup_loop(Arc::clone(&self.job), token))])
        })
    }

    pub fn begin_stop(&self) -> Result<StopHandle, WorkerError> {
        self.tasks.stop(Self::NAME)
    }

    pub async fn stop(&self) -> Result<(), WorkerError> {
        self.begin_stop()?.join().await
    }

    pub fn status(&self) -> CleanupStatus {
        let last_run = *self.job.last_run.read();
        let running = self.is_running();
        CleanupStatus {
            enabled: self.enabled,
            running,
            retention_days: self.job.retention_days,
            last_run: last_run.map(|run| run.finished_at),
            last_deleted: last_run.map(|run| run.deleted),
            healthy: !self.enabled || running,
        }
    }
}

async fn cleanup_loop(job: Arc<CleanupJob>, token: CancellationToken) {
    info!(worker = CleanupWorker::NAME, retention_days = job.retention_days, "Worker started");
    loop {
        let wait = duration_until_next_midnight(&Local::now());
        debug!(worker = CleanupWorker::NAME, wait_secs = wait.as_secs(), "Sleeping until midnight");

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                if let Err(e) = job.run_once().await {
                    error!(worker = CleanupWorker::NAME, error = %e, "Retention cleanup failed");
                }
            }
        }
    }
    info!(worker = CleanupWorker::NAME, "Worker stopped");
}
