use crate::workers::{PipelineSettings, RetryPolicy, MAX_RETENTION_DAYS};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub database_type: String,
    /// SQLite database file. Defaults to `coursehub.db`.
    pub path: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl DatabaseConfig {
    pub fn sqlite_path(&self) -> &str {
        self.path.as_deref().unwrap_or("coursehub.db")
    }

    /// Connection string for the Postgres sink. Call after [`AppConfig::validate`].
    pub fn postgres_url(&self) -> Result<String> {
        let field = |value: &Option<String>, name: &str| {
            value
                .clone()
                .with_context(|| format!("Postgres database requires '{}'", name))
        };
        Ok(format!(
            "postgres://{}:{}@{}:{}/{}",
            field(&self.user, "user")?,
            field(&self.password, "password")?,
            field(&self.host, "host")?,
            self.port.unwrap_or(5432),
            field(&self.database, "database")?,
        ))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkersConfig {
    #[serde(default)]
    pub audit: AuditWorkerConfig,
    #[serde(default)]
    pub health: HealthWorkerConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditWorkerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_audit_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_audit_channel_size")]
    pub channel_size: usize,
    #[serde(default = "default_audit_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl Default for AuditWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            batch_size: default_audit_batch_size(),
            channel_size: default_audit_channel_size(),
            flush_interval_ms: default_audit_flush_interval_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_failures: default_max_failures(),
        }
    }
}

impl AuditWorkerConfig {
    fn knobs(&self) -> PipelineKnobs {
        PipelineKnobs {
            batch_size: self.batch_size,
            channel_size: self.channel_size,
            flush_interval_ms: self.flush_interval_ms,
            max_retries: self.max_retries,
            retry_base_delay_ms: self.retry_base_delay_ms,
            max_failures: self.max_failures,
        }
    }

    pub fn settings(&self, worker: &'static str, table: &str) -> PipelineSettings {
        self.knobs().settings(worker, table)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthWorkerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_health_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_health_channel_size")]
    pub channel_size: usize,
    #[serde(default = "default_health_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// How often service counters are snapshotted.
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

impl Default for HealthWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            batch_size: default_health_batch_size(),
            channel_size: default_health_channel_size(),
            flush_interval_ms: default_health_flush_interval_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_failures: default_max_failures(),
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

impl HealthWorkerConfig {
    fn knobs(&self) -> PipelineKnobs {
        PipelineKnobs {
            batch_size: self.batch_size,
            channel_size: self.channel_size,
            flush_interval_ms: self.flush_interval_ms,
            max_retries: self.max_retries,
            retry_base_delay_ms: self.retry_base_delay_ms,
            max_failures: self.max_failures,
        }
    }

    pub fn settings(&self, worker: &'static str, table: &str) -> PipelineSettings {
        self.knobs().settings(worker, table)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

/// Batching fields shared by the audit and health pipelines.
#[derive(Debug, Clone, Copy)]
struct PipelineKnobs {
    batch_size: usize,
    channel_size: usize,
    flush_interval_ms: u64,
    max_retries: u32,
    retry_base_delay_ms: u64,
    max_failures: u32,
}

impl PipelineKnobs {
    fn settings(self, worker: &'static str, table: &str) -> PipelineSettings {
        PipelineSettings {
            worker,
            table: table.to_string(),
            batch_size: self.batch_size,
            channel_size: self.channel_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            retry: RetryPolicy::new(
                self.max_retries,
                Duration::from_millis(self.retry_base_delay_ms),
            ),
            max_failures: self.max_failures,
        }
    }

    fn validate(self, worker: &str) -> Result<()> {
        for (field, value) in [
            ("batch_size", self.batch_size as u64),
            ("channel_size", self.channel_size as u64),
            ("flush_interval_ms", self.flush_interval_ms),
            ("max_failures", u64::from(self.max_failures)),
        ] {
            if value == 0 {
                anyhow::bail!("workers.{}.{} must be greater than zero", worker, field);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CleanupConfig {
    /// Audit rows older than this many days are deleted nightly. Zero or
    /// negative disables cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_audit_batch_size() -> usize {
    100
}

fn default_audit_channel_size() -> usize {
    1000
}

fn default_audit_flush_interval_ms() -> u64 {
    5_000
}

fn default_health_batch_size() -> usize {
    50
}

fn default_health_channel_size() -> usize {
    500
}

fn default_health_flush_interval_ms() -> u64 {
    10_000
}

fn default_report_interval_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_max_failures() -> u32 {
    5
}

fn default_retention_days() -> i64 {
    30
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load(config_path: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::File::with_name(config_path));

        // Add environment variables with prefix COURSEHUB__
        // Example: COURSEHUB__WORKERS__AUDIT__BATCH_SIZE=50
        builder = builder.add_source(
            config::Environment::with_prefix("COURSEHUB")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.database.database_type.as_str() {
            "postgres" => {
                if self.database.host.is_none() {
                    anyhow::bail!("Postgres database requires 'host'");
                }
                if self.database.database.is_none() {
                    anyhow::bail!("Postgres database requires 'database'");
                }
                if self.database.user.is_none() {
                    anyhow::bail!("Postgres database requires 'user'");
                }
                if self.database.password.is_none() {
                    anyhow::bail!("Postgres database requires 'password'");
                }
            }
            "sqlite" => {}
            _ => anyhow::bail!("Invalid database type: {}", self.database.database_type),
        }

        let audit = &self.workers.audit;
        if audit.enabled {
            audit.knobs().validate("audit")?;
        }

        let health = &self.workers.health;
        if health.enabled {
            health.knobs().validate("health")?;
            if health.report_interval_ms == 0 {
                anyhow::bail!("workers.health.report_interval_ms must be greater than zero");
            }
        }

        if self.workers.cleanup.retention_days > MAX_RETENTION_DAYS {
            anyhow::bail!(
                "workers.cleanup.retention_days must be at most {}",
                MAX_RETENTION_DAYS
            );
        }

        if self.shutdown_timeout_ms == 0 {
            anyhow::bail!("shutdown_timeout_ms must be greater than zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sqlite_config() -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            database: DatabaseConfig {
                database_type: "sqlite".to_string(),
                path: None,
                host: None,
                port: None,
                database: None,
                user: None,
                password: None,
            },
            workers: WorkersConfig::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_match_documented_values() {
        let workers = WorkersConfig::default();
        assert_eq!(workers.audit.batch_size, 100);
        assert_eq!(workers.audit.channel_size, 1000);
        assert_eq!(workers.audit.flush_interval_ms, 5_000);
        assert_eq!(workers.health.batch_size, 50);
        assert_eq!(workers.health.channel_size, 500);
        assert_eq!(workers.health.report_interval_ms, 60_000);
        assert_eq!(workers.cleanup.retention_days, 30);
        assert!(sqlite_config().validate().is_ok());
    }

    #[test]
    fn load_fills_missing_sections_with_defaults() {
        let file = write_config(
            r#"
            [database]
            type = "sqlite"
            path = "/tmp/coursehub-test.db"

            [workers.audit]
            batch_size = 25
            "#,
        );
        let config = AppConfig::load(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.sqlite_path(), "/tmp/coursehub-test.db");
        assert_eq!(config.workers.audit.batch_size, 25);
        assert_eq!(config.workers.audit.max_failures, 5);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn environment_overrides_file() {
        let file = write_config(
            r#"
            [database]
            type = "sqlite"
            "#,
        );
        std::env::set_var("COURSEHUB__WORKERS__CLEANUP__RETENTION_DAYS", "7");
        let config = AppConfig::load(file.path().to_str().unwrap());
        std::env::remove_var("COURSEHUB__WORKERS__CLEANUP__RETENTION_DAYS");

        assert_eq!(config.unwrap().workers.cleanup.retention_days, 7);
    }

    #[test]
    fn postgres_requires_connection_fields() {
        let mut config = sqlite_config();
        config.database.database_type = "postgres".to_string();
        config.database.host = Some("db".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'database'"));

        config.database.database = Some("coursehub".to_string());
        config.database.user = Some("app".to_string());
        config.database.password = Some("secret".to_string());
        config.validate().unwrap();
        assert_eq!(
            config.database.postgres_url().unwrap(),
            "postgres://app:secret@db:5432/coursehub"
        );
    }

    #[test]
    fn unknown_database_type_is_rejected() {
        let mut config = sqlite_config();
        config.database.database_type = "mongo".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_sizes_rejected_only_for_enabled_pipelines() {
        let mut config = sqlite_config();
        config.workers.audit.channel_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("workers.audit.channel_size"));

        config.workers.audit.enabled = false;
        config.validate().unwrap();

        config.workers.health.report_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_retention_is_rejected() {
        let mut config = sqlite_config();
        config.workers.cleanup.retention_days = MAX_RETENTION_DAYS;
        config.validate().unwrap();

        config.workers.cleanup.retention_days = 100_000_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("workers.cleanup.retention_days"));

        // Negative values just disable cleanup
        config.workers.cleanup.retention_days = -1;
        config.validate().unwrap();
    }

    #[test]
    fn audit_and_health_share_pipeline_mapping() {
        let mut workers = WorkersConfig::default();
        workers.audit.batch_size = 7;
        workers.audit.max_failures = 9;
        let audit = workers.audit.settings("audit", "audit_logs");
        assert_eq!(audit.batch_size, 7);
        assert_eq!(audit.max_failures, 9);
        assert_eq!(audit.table, "audit_logs");
        assert_eq!(audit.flush_interval, Duration::from_secs(5));
    }

    #[test]
    fn settings_carry_retry_policy() {
        let settings = WorkersConfig::default()
            .health
            .settings("health", "health_metrics");
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.flush_interval, Duration::from_secs(10));
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(100));
        settings.validate().unwrap();
    }
}
