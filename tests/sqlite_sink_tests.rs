use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use coursehub::config::WorkersConfig;
use coursehub::sink::{RecordSink, SqliteSink, AUDIT_TABLE, HEALTH_TABLE};
use coursehub::workers::{AuditEvent, HealthMetricSnapshot, WorkerManager};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn open_sink() -> Result<(SqliteSink, TempDir)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("coursehub.db");
    let sink = SqliteSink::new(path.to_str().unwrap()).await?;
    sink.run_migrations().await?;
    Ok((sink, dir))
}

async fn count(sink: &SqliteSink, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", table);
    Ok(sqlx::query_scalar(&sql).fetch_one(sink.pool()).await?)
}

fn snapshot(service: &str, recorded_at: chrono::DateTime<Utc>) -> HealthMetricSnapshot {
    HealthMetricSnapshot {
        service: service.to_string(),
        status_code: 200,
        request_count: 3,
        error_count: 0,
        average_latency: Duration::from_millis(20),
        time_span: Duration::from_secs(60),
        recorded_at,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_migrations_are_idempotent() -> Result<()> {
    let (sink, _dir) = open_sink().await?;
    sink.run_migrations().await?;

    let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(sink.pool())
        .await?;
    assert_eq!(version, 2);
    assert_eq!(count(&sink, AUDIT_TABLE).await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_entries_are_ignored() -> Result<()> {
    let (sink, _dir) = open_sink().await?;
    let event = AuditEvent::new("ERROR", "grade export failed")
        .with_attribute("course", "MATH101")
        .with_source("src/grades.rs:88");

    let written = sink
        .insert_audit_events(AUDIT_TABLE, &[event.clone(), event.clone()])
        .await?;
    assert_eq!(written, 1);
    assert_eq!(sink.insert_audit_events(AUDIT_TABLE, &[event]).await?, 0);
    assert_eq!(count(&sink, AUDIT_TABLE).await?, 1);

    let (attributes, source): (String, Option<String>) =
        sqlx::query_as("SELECT attributes, source FROM audit_logs")
            .fetch_one(sink.pool())
            .await?;
    assert_eq!(attributes, r#"{"course":"MATH101"}"#);
    assert_eq!(source.as_deref(), Some("src/grades.rs:88"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cleanup_twice_deletes_once() -> Result<()> {
    let (sink, _dir) = open_sink().await?;
    let old = Utc::now() - ChronoDuration::days(40);
    sink.insert_audit_events(
        AUDIT_TABLE,
        &[
            AuditEvent::new("INFO", "old a").with_timestamp(old),
            AuditEvent::new("INFO", "old b").with_timestamp(old),
            AuditEvent::new("INFO", "recent"),
        ],
    )
    .await?;

    let cutoff = Utc::now() - ChronoDuration::days(30);
    assert_eq!(sink.delete_before(AUDIT_TABLE, cutoff).await?, 2);
    assert_eq!(sink.delete_before(AUDIT_TABLE, cutoff).await?, 0);
    assert_eq!(count(&sink, AUDIT_TABLE).await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_metrics_round_trip_retention() -> Result<()> {
    let (sink, _dir) = open_sink().await?;
    let now = Utc::now();
    let written = sink
        .insert_health_metrics(
            HEALTH_TABLE,
            &[
                snapshot("files", now - ChronoDuration::days(10)),
                snapshot("subjects", now),
            ],
        )
        .await?;
    assert_eq!(written, 2);

    let latency: i64 =
        sqlx::query_scalar("SELECT average_latency_us FROM health_metrics WHERE service = 'subjects'")
            .fetch_one(sink.pool())
            .await?;
    assert_eq!(latency, 20_000);

    assert_eq!(
        sink.delete_before(HEALTH_TABLE, now - ChronoDuration::days(1))
            .await?,
        1
    );
    assert!(sink.delete_before("users", now).await.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manager_persists_all_events_on_stop() -> Result<()> {
    let (sink, _dir) = open_sink().await?;
    let sink = Arc::new(sink);
    let manager = WorkerManager::new(&WorkersConfig::default(), sink.clone());
    manager.start()?;

    for i in 0..120 {
        manager.submit_audit_event(AuditEvent::new("WARN", format!("late submission {}", i)));
    }
    manager.stop(Duration::from_secs(10)).await?;

    assert_eq!(count(&sink, AUDIT_TABLE).await?, 120);
    assert_eq!(manager.health_status().audit.total_processed, 120);
    sink.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_in_memory_sink() -> Result<()> {
    let sink = SqliteSink::in_memory().await?;
    sink.run_migrations().await?;
    let written = sink
        .insert_audit_events(AUDIT_TABLE, &[AuditEvent::new("INFO", "memory")])
        .await?;
    assert_eq!(written, 1);
    Ok(())
}
