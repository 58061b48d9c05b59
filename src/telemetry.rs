//! Tracing initialization.
//!
//! Provides `init_telemetry()` for tracing setup and `shutdown_telemetry()` for cleanup.
//! When `OTEL_EXPORTER_OTLP_ENDPOINT` is set, traces are exported via OTLP.
//! Otherwise, only console logging is enabled. An [`AuditLayer`] can be added
//! to forward warnings and errors to the audit worker.

use crate::sink::SINK_TARGET;
use crate::workers::{AuditEvent, AuditEventSink, WORKERS_TARGET};
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Targets never forwarded to the audit worker: the worker subsystem and its
/// sink would otherwise feed their own failure logs back into the queue.
const SKIPPED_TARGETS: &[&str] = &[WORKERS_TARGET, SINK_TARGET, "sqlx"];

/// Initialize telemetry with optional OTLP export and audit forwarding.
///
/// # Environment Variables
/// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint URL (enables export when set)
/// - `OTEL_SERVICE_NAME`: Service name in traces (default: "coursehub")
/// - `RUST_LOG`: extra filter directives on top of the INFO default
pub fn init_telemetry(
    audit: Option<AuditLayer>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Set global propagator for W3C Trace Context
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let env_filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());

    let fmt_layer = tracing_subscriber::fmt::layer();

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&endpoint)
            .build()?;

        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .build();

        // Store provider for shutdown
        let _ = TRACER_PROVIDER.set(tracer_provider.clone());

        let tracer = tracer_provider.tracer("coursehub");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(audit)
            .with(otel_layer)
            .init();

        tracing::info!(endpoint = %endpoint, "OpenTelemetry OTLP export enabled");
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(audit)
            .init();
    }

    Ok(())
}

/// Shutdown telemetry and flush pending spans.
pub fn shutdown_telemetry() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Error shutting down tracer provider: {:?}", e);
        }
    }
}

/// Tracing layer that turns log events into [`AuditEvent`]s.
///
/// The `message` field becomes the event message, every other field an
/// attribute, and the call site `file:line` the source. Only events at or
/// above the minimum level (WARN by default) are forwarded.
pub struct AuditLayer {
    sink: Arc<dyn AuditEventSink>,
    min_level: Level,
}

impl AuditLayer {
    pub fn new(sink: Arc<dyn AuditEventSink>) -> Self {
        Self {
            sink,
            min_level: Level::WARN,
        }
    }

    pub fn with_min_level(mut self, min_level: Level) -> Self {
        self.min_level = min_level;
        self
    }

    fn forwards(&self, metadata: &Metadata<'_>) -> bool {
        // More verbose levels compare greater
        *metadata.level() <= self.min_level
            && !SKIPPED_TARGETS
                .iter()
                .any(|skipped| metadata.target().starts_with(skipped))
    }
}

impl<S: Subscriber> Layer<S> for AuditLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !self.forwards(metadata) {
            return;
        }

        let mut visitor = AuditFieldVisitor::default();
        event.record(&mut visitor);
        visitor
            .attributes
            .insert("target".to_string(), Value::from(metadata.target()));

        let mut audit = AuditEvent::new(metadata.level().as_str(), visitor.message.unwrap_or_default())
            .with_attributes(visitor.attributes);
        if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
            audit = audit.with_source(format!("{}:{}", file, line));
        }
        self.sink.submit_audit_event(audit);
    }
}

#[derive(Default)]
struct AuditFieldVisitor {
    message: Option<String>,
    attributes: BTreeMap<String, Value>,
}

impl AuditFieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.attributes.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for AuditFieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::String(format!("{:?}", value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl AuditEventSink for Recorder {
        fn submit_audit_event(&self, event: AuditEvent) {
            self.events.lock().push(event);
        }
    }

    fn capture(min_level: Level, emit: impl FnOnce()) -> Vec<AuditEvent> {
        let recorder = Arc::new(Recorder::default());
        let layer = AuditLayer::new(recorder.clone()).with_min_level(min_level);
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, emit);
        let events = recorder.events.lock().clone();
        events
    }

    #[test]
    fn warnings_become_audit_events() {
        let events = capture(Level::WARN, || {
            tracing::warn!(user_id = 42, file_name = "notes.pdf", "Upload rejected");
            tracing::info!("Not forwarded");
        });

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.level, "WARN");
        assert_eq!(event.message, "Upload rejected");
        assert_eq!(event.attributes["user_id"], Value::from(42));
        assert_eq!(event.attributes["file_name"], Value::from("notes.pdf"));
        assert!(event.source.as_deref().unwrap().contains("telemetry.rs:"));
        assert!(!event.entry_hash.is_empty());
    }

    #[test]
    fn worker_and_sqlx_targets_are_skipped() {
        let events = capture(Level::WARN, || {
            tracing::error!(target: "coursehub::workers::pipeline", "Dropping batch");
            tracing::warn!(target: "coursehub::sink::sqlite_sink", "slow insert");
            tracing::warn!(target: "sqlx::query", "slow statement");
            tracing::error!("Deadline store unavailable");
        });

        let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["Deadline store unavailable"]);
    }

    #[test]
    fn min_level_is_configurable() {
        let events = capture(Level::ERROR, || {
            tracing::warn!("quiet");
            tracing::error!("loud");
        });
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, "ERROR");
    }
}
