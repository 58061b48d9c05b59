//! Error types for worker lifecycle operations

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced synchronously by worker and manager lifecycle calls.
///
/// Data-level problems (bad events, sink outages) never show up here; they are
/// counted and logged by the pipelines instead.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// `start()` called on a worker or manager that is already running
    #[error("{worker} is already running")]
    AlreadyRunning { worker: &'static str },

    /// `stop()` called on a worker or manager that was never started
    #[error("{worker} is not running")]
    NotRunning { worker: &'static str },

    /// `start()` called while tasks from a timed-out stop are still draining
    #[error("{worker} is still draining from a previous run")]
    StillDraining { worker: &'static str },

    /// Lifecycle call made while a stop is in progress
    #[error("worker manager is shutting down")]
    ShuttingDown,

    /// Worker settings rejected at start time
    #[error("invalid configuration for {worker} worker: {reason}")]
    InvalidConfig {
        worker: &'static str,
        reason: String,
    },

    /// Workers did not acknowledge cancellation before the deadline
    #[error("workers did not stop within {timeout:?}")]
    ShutdownTimeout { timeout: Duration },

    /// A worker task failed while stopping (panicked or was aborted)
    #[error("{worker} worker failed: {reason}")]
    WorkerFailed {
        worker: &'static str,
        reason: String,
    },

    /// Manual cleanup requested while retention cleanup is disabled
    #[error("retention cleanup is disabled")]
    CleanupDisabled,

    /// The persistence sink rejected an operation
    #[error("sink operation failed: {0}")]
    Sink(#[from] anyhow::Error),
}

impl WorkerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WorkerError::ShutdownTimeout { .. })
    }
}
