mod dialect;
mod migrations;
mod mock_sink;
mod postgres_sink;
mod sqlite_sink;

mod manager;

pub use dialect::SinkDialect;
pub use manager::{format_timestamp, retention_column, RecordSink, AUDIT_TABLE, HEALTH_TABLE};
pub use mock_sink::MockSink;
pub use postgres_sink::PostgresSink;
pub use sqlite_sink::SqliteSink;

/// Tracing target prefix of everything logged from this module.
pub const SINK_TARGET: &str = module_path!();
