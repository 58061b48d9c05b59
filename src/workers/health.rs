use super::dead_letter::DeadLetterHook;
use super::error::WorkerError;
use super::pipeline::{Pipeline, PipelineRecord, PipelineSettings, PipelineStatus, SubmitOutcome};
use super::{StopHandle, TaskSlot};
use crate::sink::RecordSink;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// First path segments that never name a service.
pub const RESERVED_SERVICE_NAMES: &[&str] = &["health", "metrics", "logs"];

/// Service name for a route template: its first path segment, unless that
/// segment is empty, reserved, or a path parameter.
pub fn service_for_route(path: &str) -> Option<String> {
    let first = path.trim_start_matches('/').split('/').next()?;
    let parameterized = first.starts_with(':') || first.starts_with('{') || first.starts_with('*');
    if first.is_empty() || parameterized || RESERVED_SERVICE_NAMES.contains(&first) {
        return None;
    }
    Some(first.to_string())
}

/// Distinct service names across a route table.
pub fn discover_services<I, S>(routes: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    routes
        .into_iter()
        .filter_map(|route| service_for_route(route.as_ref()))
        .collect()
}

/// Per-service request metrics at one report tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetricSnapshot {
    pub service: String,
    /// Last observed status, 0 when no request has been recorded yet.
    pub status_code: u16,
    pub request_count: u64,
    pub error_count: u64,
    pub average_latency: Duration,
    /// Time covered since the previous snapshot (or registration).
    pub time_span: Duration,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
impl PipelineRecord for HealthMetricSnapshot {
    fn is_valid(&self) -> bool {
        !self.service.is_empty()
    }

    async fn persist(sink: &dyn RecordSink, table: &str, batch: &[Self]) -> Result<usize> {
        sink.insert_health_metrics(table, batch).await
    }
}

#[derive(Debug)]
struct ServiceCounters {
    request_count: u64,
    error_count: u64,
    total_latency: Duration,
    last_status: u16,
    window_start: Instant,
}

impl ServiceCounters {
    fn new() -> Self {
        Self {
            request_count: 0,
            error_count: 0,
            total_latency: Duration::ZERO,
            last_status: 0,
            window_start: Instant::now(),
        }
    }

    fn record(&mut self, status_code: u16, latency: Duration) {
        self.request_count += 1;
        if status_code >= 400 {
            self.error_count += 1;
        }
        self.total_latency = self.total_latency.saturating_add(latency);
        self.last_status = status_code;
    }

    /// Counters are cumulative; only the time window restarts.
    fn snapshot(
        &mut self,
        service: &str,
        now: Instant,
        recorded_at: DateTime<Utc>,
    ) -> HealthMetricSnapshot {
        let average_latency = if self.request_count == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total_latency.as_nanos() / u128::from(self.request_count);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        };
        let time_span = now.saturating_duration_since(self.window_start);
        self.window_start = now;
        HealthMetricSnapshot {
            service: service.to_string(),
            status_code: self.last_status,
            request_count: self.request_count,
            error_count: self.error_count,
            average_latency,
            time_span,
            recorded_at,
        }
    }
}

/// Concurrent per-service counters. The map lock is only taken for lookups
/// and registration; each service's counters sit behind their own mutex.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<Mutex<ServiceCounters>>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. Returns false if it was already known, in which
    /// case its counters are left untouched.
    pub fn register(&self, service: &str) -> bool {
        if self.services.read().contains_key(service) {
            return false;
        }
        let mut services = self.services.write();
        if services.contains_key(service) {
            return false;
        }
        services.insert(
            service.to_string(),
            Arc::new(Mutex::new(ServiceCounters::new())),
        );
        true
    }

    pub fn is_registered(&self, service: &str) -> bool {
        self.services.read().contains_key(service)
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Record one request. No-op (returns false) for unregistered services.
    pub fn record_request(&self, service: &str, status_code: u16, latency: Duration) -> bool {
        let counters = match self.services.read().get(service) {
            Some(counters) => Arc::clone(counters),
            None => return false,
        };
        counters.lock().record(status_code, latency);
        true
    }

    /// Snapshot every registered service, sorted by name, and restart each
    /// service's time window.
    pub fn snapshot_all(&self) -> Vec<HealthMetricSnapshot> {
        let mut entries: Vec<(String, Arc<Mutex<ServiceCounters>>)> = self
            .services
            .read()
            .iter()
            .map(|(name, counters)| (name.clone(), Arc::clone(counters)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let now = Instant::now();
        let recorded_at = Utc::now();
        entries
            .iter()
            .map(|(name, counters)| counters.lock().snapshot(name, now, recorded_at))
            .collect()
    }
}

/// Turns request counters into periodic metric snapshots.
pub struct HealthWorker {
    enabled: bool,
    report_interval: Duration,
    registry: Arc<ServiceRegistry>,
    pipeline: Arc<Pipeline<HealthMetricSnapshot>>,
    tasks: TaskSlot,
}

impl HealthWorker {
    pub const NAME: &'static str = "health";

    pub fn new(
        settings: PipelineSettings,
        enabled: bool,
        report_interval: Duration,
        sink: Arc<dyn RecordSink>,
        dead_letter: Arc<dyn DeadLetterHook<HealthMetricSnapshot>>,
    ) -> Self {
        Self {
            enabled,
            report_interval,
            registry: Arc::new(ServiceRegistry::new()),
            pipeline: Arc::new(Pipeline::new(settings, sink, dead_letter)),
            tasks: TaskSlot::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running() && self.pipeline.is_running()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<Pipeline<HealthMetricSnapshot>> {
        &self.pipeline
    }

    /// Seed the registry from a route table. Returns the number of newly
    /// registered services.
    pub fn register_routes<I, S>(&self, routes: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let services = discover_services(routes);
        let added = services
            .iter()
            .filter(|service| self.registry.register(service))
            .count();
        info!(
            worker = Self::NAME,
            services = ?services,
            added,
            "Registered services for health metrics"
        );
        added
    }

    pub fn record_request(&self, service: &str, status_code: u16, latency: Duration) -> bool {
        self.registry.record_request(service, status_code, latency)
    }

    /// Snapshot all services and enqueue them now. Returns how many were queued.
    pub fn report_now(&self) -> usize {
        enqueue_snapshots(&self.registry, &self.pipeline)
    }

    pub fn start(&self) -> Result<(), WorkerError> {
        if self.report_interval.is_zero() {
            return Err(WorkerError::InvalidConfig {
                worker: Self::NAME,
                reason: "report_interval must be greater than zero".to_string(),
            });
        }
        self.tasks.start(Self::NAME, |token| {
            let flush = self.pipeline.start(token.clone())?;
            let reporter = tokio::spawn(report_loop(
                Arc::clone(&self.registry),
                Arc::clone(&self.pipeline),
                self.report_interval,
                token,
            ));
            Ok(vec![flush, reporter])
        })
    }

    pub fn begin_stop(&self) -> Result<StopHandle, WorkerError> {
        self.pipeline.close();
        self.tasks.stop(Self::NAME)
    }

    pub async fn stop(&self) -> Result<(), WorkerError> {
        self.begin_stop()?.join().await
    }

    pub fn status(&self) -> PipelineStatus {
        self.pipeline.status(self.enabled, self.is_running())
    }
}

fn enqueue_snapshots(
    registry: &ServiceRegistry,
    pipeline: &Pipeline<HealthMetricSnapshot>,
) -> usize {
    let snapshots = registry.snapshot_all();
    let total = snapshots.len();
    let queued = snapshots
        .into_iter()
        .map(|snapshot| pipeline.submit(snapshot))
        .filter(|outcome| *outcome == SubmitOutcome::Queued)
        .count();
    if queued < total {
        warn!(
            worker = HealthWorker::NAME,
            total,
            dropped = total - queued,
            "Health queue full, dropping snapshots"
        );
    } else {
        debug!(worker = HealthWorker::NAME, total, queued, "Generated health snapshots");
    }
    queued
}

async fn report_loop(
    registry: Arc<ServiceRegistry>,
    pipeline: Arc<Pipeline<HealthMetricSnapshot>>,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                enqueue_snapshots(&registry, &pipeline);
            }
        }
    }
}
