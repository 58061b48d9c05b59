//! Background ingestion workers.
//!
//! The audit and health workers each own a bounded [`Pipeline`]; the
//! cleanup worker runs a daily retention delete. [`WorkerManager`] owns all
//! three and is the entry point the rest of the application talks to.

mod audit;
mod cleanup;
mod dead_letter;
mod error;
mod health;
mod manager;
mod pipeline;
mod retry;
mod stats;

pub use audit::{AuditEvent, AuditEventSink, AuditWorker};
pub use cleanup::{
    duration_until_next_midnight, retention_cutoff, CleanupStatus, CleanupWorker,
    MAX_RETENTION_DAYS,
};
pub use dead_letter::{DeadLetterHook, NoopDeadLetter};
pub use error::WorkerError;
pub use health::{
    discover_services, service_for_route, HealthMetricSnapshot, HealthWorker, ServiceRegistry,
    RESERVED_SERVICE_NAMES,
};
pub use manager::{HealthStatus, ManagerState, WorkerManager};
pub use pipeline::{Pipeline, PipelineRecord, PipelineSettings, PipelineStatus, SubmitOutcome};
pub use retry::{RetryExhausted, RetryPolicy};
pub use stats::{WorkerStats, WorkerStatsSnapshot};

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Tracing target prefix of everything logged from this module. Events under
/// it are never forwarded back into the audit pipeline.
pub const WORKERS_TARGET: &str = module_path!();

struct RunningTasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Cancellation scope and task handles of one running worker.
#[derive(Default)]
pub(crate) struct TaskSlot {
    inner: Mutex<Option<RunningTasks>>,
    /// Tasks of earlier runs that were cancelled but may still be draining.
    stopping: Mutex<Vec<AbortHandle>>,
}

impl TaskSlot {
    /// True while started and every task is still alive.
    pub(crate) fn is_running(&self) -> bool {
        self.inner
            .lock()
            .as_ref()
            .is_some_and(|tasks| tasks.handles.iter().all(|h| !h.is_finished()))
    }

    /// True while tasks from an earlier run have not finished draining.
    pub(crate) fn is_draining(&self) -> bool {
        let mut stopping = self.stopping.lock();
        stopping.retain(|h| !h.is_finished());
        !stopping.is_empty()
    }

    /// Spawn the worker's tasks under a fresh cancellation token.
    pub(crate) fn start<F>(&self, worker: &'static str, spawn: F) -> Result<(), WorkerError>
    where
        F: FnOnce(CancellationToken) -> Result<Vec<JoinHandle<()>>, WorkerError>,
    {
        let mut slot = self.inner.lock();
        if slot.is_some() {
            return Err(WorkerError::AlreadyRunning { worker });
        }
        if self.is_draining() {
            return Err(WorkerError::StillDraining { worker });
        }
        let token = CancellationToken::new();
        let handles = spawn(token.clone())?;
        *slot = Some(RunningTasks { token, handles });
        Ok(())
    }

    /// Cancel the worker's scope and hand back its tasks for joining.
    pub(crate) fn stop(&self, worker: &'static str) -> Result<StopHandle, WorkerError> {
        let tasks = self
            .inner
            .lock()
            .take()
            .ok_or(WorkerError::NotRunning { worker })?;
        tasks.token.cancel();

        let mut stopping = self.stopping.lock();
        stopping.retain(|h| !h.is_finished());
        stopping.extend(tasks.handles.iter().map(JoinHandle::abort_handle));
        drop(stopping);

        Ok(StopHandle {
            worker,
            handles: tasks.handles,
        })
    }
}

/// Tasks of a worker that has been told to stop.
#[derive(Debug)]
pub struct StopHandle {
    worker: &'static str,
    handles: Vec<JoinHandle<()>>,
}

impl StopHandle {
    pub fn worker(&self) -> &'static str {
        self.worker
    }

    /// Wait for every task to finish draining.
    pub async fn join(self) -> Result<(), WorkerError> {
        let worker = self.worker;
        for handle in self.handles {
            handle.await.map_err(|e| WorkerError::WorkerFailed {
                worker,
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn finished_task_is_not_running() {
        let slot = TaskSlot::default();
        slot.start("audit", |_token| Ok(vec![tokio::spawn(async {})])).unwrap();

        for _ in 0..200 {
            if !slot.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!slot.is_running());
        slot.stop("audit").unwrap().join().await.unwrap();
    }

    #[tokio::test]
    async fn restart_waits_for_previous_drain() {
        let slot = TaskSlot::default();
        let (release, released) = oneshot::channel::<()>();
        slot.start("audit", |token| {
            Ok(vec![tokio::spawn(async move {
                token.cancelled().await;
                let _ = released.await;
            })])
        })
        .unwrap();

        // Dropping the stop handle leaves the task draining in the background
        drop(slot.stop("audit").unwrap());
        assert!(slot.is_draining());
        assert!(matches!(
            slot.start("audit", |_token| Ok(Vec::new())),
            Err(WorkerError::StillDraining { worker: "audit" })
        ));

        release.send(()).unwrap();
        for _ in 0..200 {
            if !slot.is_draining() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        slot.start("audit", |_token| Ok(Vec::new())).unwrap();
        assert!(slot.is_running());
    }
}
