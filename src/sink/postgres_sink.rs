use super::dialect::{self, MetricRow};
use super::manager::{format_timestamp, RecordSink};
use super::migrations::{run_migrations, SinkMigrations};
use crate::workers::{AuditEvent, HealthMetricSnapshot};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use std::fmt::{self, Debug, Formatter};

pub struct PostgresSink {
    pool: PgPool,
}

impl Debug for PostgresSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresSink").finish_non_exhaustive()
    }
}

struct PostgresMigrationBackend;

impl PostgresSink {
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await
            .context("Failed to connect to Postgres sink")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordSink for PostgresSink {
    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn run_migrations(&self) -> Result<()> {
        run_migrations::<PostgresMigrationBackend>(&self.pool).await
    }

    async fn insert_audit_events(&self, table: &str, events: &[AuditEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let sql = dialect::insert_audit_event::<Postgres>(table)?;

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for event in events {
            let attributes = serde_json::to_string(&event.attributes)?;
            written += sqlx::query(&sql)
                .bind(format_timestamp(event.timestamp))
                .bind(event.level.as_str())
                .bind(event.message.as_str())
                .bind(attributes)
                .bind(event.source.as_deref())
                .bind(event.entry_hash.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        Ok(written as usize)
    }

    async fn insert_health_metrics(
        &self,
        table: &str,
        metrics: &[HealthMetricSnapshot],
    ) -> Result<usize> {
        if metrics.is_empty() {
            return Ok(0);
        }
        let sql = dialect::insert_health_metric::<Postgres>(table)?;

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for metric in metrics {
            let row = MetricRow::from(metric);
            written += sqlx::query(&sql)
                .bind(metric.service.as_str())
                .bind(row.status_code)
                .bind(row.request_count)
                .bind(row.error_count)
                .bind(row.average_latency_us)
                .bind(row.time_span_ms)
                .bind(format_timestamp(metric.recorded_at))
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        Ok(written as usize)
    }

    async fn delete_before(&self, table: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let sql = dialect::delete_before::<Postgres>(table)?;
        let result = sqlx::query(&sql)
            .bind(format_timestamp(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

impl SinkMigrations for PostgresMigrationBackend {
    type Pool = PgPool;

    fn ensure_migrations_table(pool: &Self::Pool) -> BoxFuture<'_, Result<()>> {
        async move {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version BIGINT PRIMARY KEY,
                    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                )",
            )
            .execute(pool)
            .await?;
            Ok(())
        }
        .boxed()
    }

    fn current_version(pool: &Self::Pool) -> BoxFuture<'_, Result<i64>> {
        async move {
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(pool)
                .await
                .map_err(Into::into)
        }
        .boxed()
    }

    fn record_version(pool: &Self::Pool, version: i64) -> BoxFuture<'_, Result<()>> {
        async move {
            sqlx::query("INSERT INTO schema_migrations (version) VALUES ($1)")
                .bind(version)
                .execute(pool)
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn migrate_v1(pool: &Self::Pool) -> BoxFuture<'_, Result<()>> {
        async move {
            sqlx::query(&dialect::create_audit_table::<Postgres>())
                .execute(pool)
                .await?;
            sqlx::query(&dialect::create_health_table::<Postgres>())
                .execute(pool)
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn migrate_v2(pool: &Self::Pool) -> BoxFuture<'_, Result<()>> {
        async move {
            for statement in dialect::create_indexes() {
                sqlx::query(&statement).execute(pool).await?;
            }
            Ok(())
        }
        .boxed()
    }
}
