//! Per-database SQL text for the sink tables.
//!
//! Both backends store timestamps as fixed-width RFC 3339 text (see
//! [`format_timestamp`](super::format_timestamp)), so the statements here only
//! differ in parameter placeholders and the primary key column.

use super::manager::{retention_column, AUDIT_TABLE, HEALTH_TABLE};
use crate::workers::HealthMetricSnapshot;
use anyhow::{anyhow, Result};
use sqlx::{Database, Postgres, Sqlite};
use std::borrow::Cow;

/// Extension trait for sqlx databases that the sink can write to.
pub trait SinkDialect: Database {
    /// Returns the parameter placeholder for the given 1-based index.
    ///
    /// - Postgres uses `$1`, `$2`, etc.
    /// - SQLite uses `?` for all parameters (index is ignored).
    fn bind_param(index: usize) -> Cow<'static, str>;

    /// Column definition for an auto-incrementing row id.
    fn id_column() -> &'static str;
}

impl SinkDialect for Postgres {
    fn bind_param(index: usize) -> Cow<'static, str> {
        Cow::Owned(format!("${}", index))
    }

    fn id_column() -> &'static str {
        "id BIGSERIAL PRIMARY KEY"
    }
}

impl SinkDialect for Sqlite {
    fn bind_param(_: usize) -> Cow<'static, str> {
        Cow::Borrowed("?")
    }

    fn id_column() -> &'static str {
        "id INTEGER PRIMARY KEY AUTOINCREMENT"
    }
}

fn placeholders<DB: SinkDialect>(count: usize) -> String {
    (1..=count)
        .map(DB::bind_param)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn checked_table(table: &str) -> Result<&str> {
    let mut chars = table.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(table)
    } else {
        Err(anyhow!("Invalid sink table name: {:?}", table))
    }
}

pub fn create_audit_table<DB: SinkDialect>() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {AUDIT_TABLE} (
            {},
            occurred_at TEXT NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            attributes TEXT NOT NULL,
            source TEXT,
            entry_hash TEXT NOT NULL UNIQUE,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        DB::id_column()
    )
}

pub fn create_health_table<DB: SinkDialect>() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {HEALTH_TABLE} (
            {},
            service TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            request_count BIGINT NOT NULL,
            error_count BIGINT NOT NULL,
            average_latency_us BIGINT NOT NULL,
            time_span_ms BIGINT NOT NULL,
            recorded_at TEXT NOT NULL
        )",
        DB::id_column()
    )
}

/// Indexes backing the retention delete and per-service lookups.
pub fn create_indexes() -> [String; 2] {
    [
        format!("CREATE INDEX IF NOT EXISTS idx_{AUDIT_TABLE}_occurred_at ON {AUDIT_TABLE} (occurred_at)"),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{HEALTH_TABLE}_service_recorded_at ON {HEALTH_TABLE} (service, recorded_at)"
        ),
    ]
}

/// Single-row insert; duplicates by `entry_hash` affect zero rows.
pub fn insert_audit_event<DB: SinkDialect>(table: &str) -> Result<String> {
    Ok(format!(
        "INSERT INTO {} (occurred_at, level, message, attributes, source, entry_hash) VALUES ({}) ON CONFLICT (entry_hash) DO NOTHING",
        checked_table(table)?,
        placeholders::<DB>(6)
    ))
}

pub fn insert_health_metric<DB: SinkDialect>(table: &str) -> Result<String> {
    Ok(format!(
        "INSERT INTO {} (service, status_code, request_count, error_count, average_latency_us, time_span_ms, recorded_at) VALUES ({})",
        checked_table(table)?,
        placeholders::<DB>(7)
    ))
}

/// Only tables with a known retention column can be cleaned up.
pub fn delete_before<DB: SinkDialect>(table: &str) -> Result<String> {
    let column = retention_column(table)?;
    Ok(format!(
        "DELETE FROM {} WHERE {} < {}",
        table,
        column,
        DB::bind_param(1)
    ))
}

/// Integer columns of a health metric row.
pub struct MetricRow {
    pub status_code: i32,
    pub request_count: i64,
    pub error_count: i64,
    pub average_latency_us: i64,
    pub time_span_ms: i64,
}

impl From<&HealthMetricSnapshot> for MetricRow {
    fn from(metric: &HealthMetricSnapshot) -> Self {
        let clamp = |v: u128| i64::try_from(v).unwrap_or(i64::MAX);
        Self {
            status_code: i32::from(metric.status_code),
            request_count: clamp(u128::from(metric.request_count)),
            error_count: clamp(u128::from(metric.error_count)),
            average_latency_us: clamp(metric.average_latency.as_micros()),
            time_span_ms: clamp(metric.time_span.as_millis()),
        }
    }
}
