use crate::workers::{AuditEvent, HealthMetricSnapshot};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Debug;

/// Table receiving audit events.
pub const AUDIT_TABLE: &str = "audit_logs";
/// Table receiving health metric snapshots.
pub const HEALTH_TABLE: &str = "health_metrics";

/// Async persistence boundary used by the worker pipelines.
///
/// Inserts report the number of rows actually written, which may be lower than
/// the batch length when the backend deduplicates.
#[async_trait]
pub trait RecordSink: Debug + Send + Sync {
    /// Close the underlying pool. Idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Apply any pending schema migrations. Should be idempotent.
    async fn run_migrations(&self) -> Result<()>;

    async fn insert_audit_events(&self, table: &str, events: &[AuditEvent]) -> Result<usize>;

    async fn insert_health_metrics(
        &self,
        table: &str,
        metrics: &[HealthMetricSnapshot],
    ) -> Result<usize>;

    /// Delete rows of `table` whose retention timestamp is older than `cutoff`.
    async fn delete_before(&self, table: &str, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Column holding the retention timestamp for each known table.
pub fn retention_column(table: &str) -> Result<&'static str> {
    match table {
        AUDIT_TABLE => Ok("occurred_at"),
        HEALTH_TABLE => Ok("recorded_at"),
        other => Err(anyhow!("Unknown sink table: {}", other)),
    }
}

/// Fixed-width UTC text so stored timestamps order lexicographically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_as_text() {
        let early = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert!(format_timestamp(early) < format_timestamp(late));
        assert_eq!(format_timestamp(late), "2026-01-10T00:00:00.000000Z");
    }

    #[test]
    fn unknown_table_has_no_retention_column() {
        assert_eq!(retention_column(AUDIT_TABLE).unwrap(), "occurred_at");
        assert!(retention_column("users; DROP TABLE users").is_err());
    }
}
