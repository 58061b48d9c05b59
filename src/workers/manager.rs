use super::audit::{AuditEvent, AuditEventSink, AuditWorker};
use super::cleanup::{CleanupStatus, CleanupWorker};
use super::dead_letter::{DeadLetterHook, NoopDeadLetter};
use super::error::WorkerError;
use super::health::{HealthMetricSnapshot, HealthWorker};
use super::pipeline::{PipelineStatus, SubmitOutcome};
use super::StopHandle;
use crate::config::WorkersConfig;
use crate::sink::{RecordSink, AUDIT_TABLE, HEALTH_TABLE};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const MANAGER: &str = "worker manager";

/// Lifecycle of a [`WorkerManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Aggregate status of all workers. Safe to build in any state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub state: ManagerState,
    pub running: bool,
    pub healthy: bool,
    pub audit: PipelineStatus,
    pub health: PipelineStatus,
    pub cleanup: CleanupStatus,
}

/// Owns the audit, health and cleanup workers and their lifecycle.
///
/// Construct one at startup and share it (usually behind an `Arc`) with
/// anything that submits events. `start` must be called from within a Tokio
/// runtime.
pub struct WorkerManager {
    state: RwLock<ManagerState>,
    routes: Vec<String>,
    audit: AuditWorker,
    health: HealthWorker,
    cleanup: CleanupWorker,
}

impl WorkerManager {
    pub fn new(config: &WorkersConfig, sink: Arc<dyn RecordSink>) -> Self {
        Self::with_dead_letter(config, sink, Arc::new(NoopDeadLetter))
    }

    /// Like [`WorkerManager::new`], installing `audit_dead_letter` on the
    /// audit worker.
    pub fn with_dead_letter(
        config: &WorkersConfig,
        sink: Arc<dyn RecordSink>,
        audit_dead_letter: Arc<dyn DeadLetterHook<AuditEvent>>,
    ) -> Self {
        let health_dead_letter: Arc<dyn DeadLetterHook<HealthMetricSnapshot>> =
            Arc::new(NoopDeadLetter);

        Self {
            state: RwLock::new(ManagerState::Stopped),
            routes: Vec::new(),
            audit: AuditWorker::new(
                config.audit.settings(AuditWorker::NAME, AUDIT_TABLE),
                config.audit.enabled,
                Arc::clone(&sink),
                audit_dead_letter,
            ),
            health: HealthWorker::new(
                config.health.settings(HealthWorker::NAME, HEALTH_TABLE),
                config.health.enabled,
                config.health.report_interval(),
                Arc::clone(&sink),
                health_dead_letter,
            ),
            cleanup: CleanupWorker::new(
                config.cleanup.retention_days,
                config.audit.enabled,
                AUDIT_TABLE,
                sink,
            ),
        }
    }

    /// Route templates used to seed the health service registry on start.
    pub fn with_routes<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes = routes.into_iter().map(Into::into).collect();
        self
    }

    pub fn state(&self) -> ManagerState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    pub fn audit_worker(&self) -> &AuditWorker {
        &self.audit
    }

    pub fn health_worker(&self) -> &HealthWorker {
        &self.health
    }

    pub fn cleanup_worker(&self) -> &CleanupWorker {
        &self.cleanup
    }

    /// Start every enabled worker. If any fails, the ones already started are
    /// cancelled and the error is returned.
    pub fn start(&self) -> Result<(), WorkerError> {
        {
            let mut state = self.state.write();
            match *state {
                ManagerState::Stopped => *state = ManagerState::Starting,
                ManagerState::Starting | ManagerState::Running => {
                    return Err(WorkerError::AlreadyRunning { worker: MANAGER })
                }
                ManagerState::Stopping => return Err(WorkerError::ShuttingDown),
            }
        }

        match self.start_workers() {
            Ok(()) => {
                *self.state.write() = ManagerState::Running;
                info!(
                    audit = self.audit.is_running(),
                    health = self.health.is_running(),
                    cleanup = self.cleanup.is_running(),
                    "Worker manager started"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Worker manager failed to start");
                for handle in self.begin_stop_all() {
                    warn!(worker = handle.worker(), "Cancelled worker after failed start");
                }
                *self.state.write() = ManagerState::Stopped;
                Err(e)
            }
        }
    }

    fn start_workers(&self) -> Result<(), WorkerError> {
        if self.audit.is_enabled() {
            self.audit.start()?;
        }
        if self.health.is_enabled() {
            self.health.register_routes(&self.routes);
            self.health.start()?;
        }
        if self.cleanup.is_enabled() {
            self.cleanup.start()?;
        }
        Ok(())
    }

    /// Signal every running worker to stop.
    fn begin_stop_all(&self) -> Vec<StopHandle> {
        [
            self.audit.begin_stop(),
            self.health.begin_stop(),
            self.cleanup.begin_stop(),
        ]
        .into_iter()
        .filter_map(Result::ok)
        .collect()
    }

    /// Cancel all workers concurrently and wait up to `timeout` for them to
    /// drain. On timeout the manager is still considered stopped; unfinished
    /// tasks complete their bounded drain in the background and `start`
    /// returns [`WorkerError::StillDraining`] until they are done.
    pub async fn stop(&self, timeout: Duration) -> Result<(), WorkerError> {
        {
            let mut state = self.state.write();
            match *state {
                ManagerState::Running => *state = ManagerState::Stopping,
                ManagerState::Stopping => return Err(WorkerError::ShuttingDown),
                ManagerState::Stopped | ManagerState::Starting => {
                    return Err(WorkerError::NotRunning { worker: MANAGER })
                }
            }
        }

        info!(timeout_ms = timeout.as_millis() as u64, "Stopping worker manager");
        let handles = self.begin_stop_all();
        let joined =
            tokio::time::timeout(timeout, join_all(handles.into_iter().map(StopHandle::join)))
                .await;
        *self.state.write() = ManagerState::Stopped;

        match joined {
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Workers did not stop before the deadline"
                );
                Err(WorkerError::ShutdownTimeout { timeout })
            }
            Ok(results) => {
                results.into_iter().collect::<Result<Vec<()>, _>>()?;
                info!("Worker manager stopped");
                Ok(())
            }
        }
    }

    /// Non-blocking; never fails the caller.
    pub fn submit_audit_event(&self, event: AuditEvent) -> SubmitOutcome {
        self.audit.submit(event)
    }

    /// Non-blocking; a no-op for services never registered.
    pub fn record_health_request(&self, service: &str, status_code: u16, latency: Duration) -> bool {
        self.health.record_request(service, status_code, latency)
    }

    /// Run the retention delete now, outside the daily schedule.
    pub async fn run_cleanup_now(&self) -> Result<u64, WorkerError> {
        self.cleanup.run_now().await
    }

    pub fn health_status(&self) -> HealthStatus {
        let state = self.state();
        let audit = self.audit.status();
        let health = self.health.status();
        let cleanup = self.cleanup.status();
        let running = state == ManagerState::Running;
        let healthy = running
            && [&audit, &health]
                .iter()
                .all(|pipeline| !pipeline.enabled || pipeline.healthy)
            && cleanup.healthy;

        HealthStatus {
            state,
            running,
            healthy,
            audit,
            health,
            cleanup,
        }
    }
}

impl AuditEventSink for WorkerManager {
    fn submit_audit_event(&self, event: AuditEvent) {
        WorkerManager::submit_audit_event(self, event);
    }
}
