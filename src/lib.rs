pub mod config;
pub mod http;
pub mod sink;
pub mod telemetry;
pub mod workers;

pub use workers::{AuditEvent, HealthStatus, WorkerError, WorkerManager};
