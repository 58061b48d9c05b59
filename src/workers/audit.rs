use super::dead_letter::DeadLetterHook;
use super::error::WorkerError;
use super::pipeline::{Pipeline, PipelineRecord, PipelineSettings, PipelineStatus, SubmitOutcome};
use super::{StopHandle, TaskSlot};
use crate::sink::RecordSink;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A structured audit/log record bound for the audit table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub attributes: BTreeMap<String, Value>,
    /// `file:line` provenance, informational only.
    pub source: Option<String>,
    /// Content hash used by the sink for deduplication.
    pub entry_hash: String,
}

impl AuditEvent {
    /// Create an event stamped with the current time.
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        let mut event = Self {
            timestamp: Utc::now(),
            level: level.into(),
            message: message.into(),
            attributes: BTreeMap::new(),
            source: None,
            entry_hash: String::new(),
        };
        event.rehash();
        event
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self.rehash();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self.rehash();
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, Value>) -> Self {
        self.attributes.extend(attributes);
        self.rehash();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Hex SHA-256 over the timestamp (whole seconds), level, message and
    /// attributes. `source` is deliberately left out.
    pub fn compute_hash(
        timestamp: DateTime<Utc>,
        level: &str,
        message: &str,
        attributes: &BTreeMap<String, Value>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(timestamp.timestamp().to_be_bytes());
        hasher.update([0x1f]);
        hasher.update(level.as_bytes());
        hasher.update([0x1f]);
        hasher.update(message.as_bytes());
        hasher.update([0x1f]);
        // BTreeMap keys and serde_json object keys both serialize in sorted order
        hasher.update(serde_json::to_vec(attributes).unwrap_or_default());
        hex::encode(hasher.finalize())
    }

    fn rehash(&mut self) {
        self.entry_hash =
            Self::compute_hash(self.timestamp, &self.level, &self.message, &self.attributes);
    }
}

#[async_trait]
impl PipelineRecord for AuditEvent {
    fn is_valid(&self) -> bool {
        !self.message.is_empty()
    }

    async fn persist(sink: &dyn RecordSink, table: &str, batch: &[Self]) -> Result<usize> {
        sink.insert_audit_events(table, batch).await
    }
}

/// Capability to accept audit events, handed to logging components at
/// construction time.
pub trait AuditEventSink: Send + Sync {
    fn submit_audit_event(&self, event: AuditEvent);
}

/// Batches audit events into the audit table.
pub struct AuditWorker {
    enabled: bool,
    pipeline: Arc<Pipeline<AuditEvent>>,
    tasks: TaskSlot,
}

impl AuditWorker {
    pub const NAME: &'static str = "audit";

    pub fn new(
        settings: PipelineSettings,
        enabled: bool,
        sink: Arc<dyn RecordSink>,
        dead_letter: Arc<dyn DeadLetterHook<AuditEvent>>,
    ) -> Self {
        Self {
            enabled,
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

    pub fn pipeline(&self) -> &Arc<Pipeline<AuditEvent>> {
        &self.pipeline
    }

    /// Events with an empty message are discarded here and never counted.
    pub fn submit(&self, event: AuditEvent) -> SubmitOutcome {
        if !event.is_valid() {
            return SubmitOutcome::Invalid;
        }
        self.pipeline.submit(event)
    }

    pub fn start(&self) -> Result<(), WorkerError> {
        self.tasks.start(Self::NAME, |token| {
            Ok(vec![self.pipeline.start(token)?])
        })
    }

    /// Stop accepting events and signal the loop to drain.
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
