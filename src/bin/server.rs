use anyhow::Result;
use clap::Parser;
use coursehub::config::AppConfig;
use coursehub::http::app_server::AppServer;
use coursehub::sink::{PostgresSink, RecordSink, SqliteSink};
use coursehub::telemetry::{self, AuditLayer};
use coursehub::workers::WorkerManager;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "coursehub-server", about = "CourseHub background worker server")]
struct Cli {
    /// Path to config file
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let now = Instant::now();
    let cli = Cli::parse();

    // Load configuration
    let config = AppConfig::load(&cli.config)?;
    config.validate()?;

    let sink = connect_sink(&config).await?;
    sink.run_migrations().await?;

    let manager = Arc::new(WorkerManager::new(&config.workers, Arc::clone(&sink)));

    // Tracing starts once the manager exists so warnings reach the audit table
    telemetry::init_telemetry(Some(AuditLayer::new(manager.clone())))
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!("Configuration '{}' loaded successfully", &cli.config);

    let app = AppServer::new(manager.clone());
    tracing::info!(routes = ?app.route_paths(), "Router built");
    let router = app.into_router();

    manager.start()?;

    // Create server address
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server started in {}ms", now.elapsed().as_millis());
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown())
        .await?;

    if let Err(e) = manager.stop(config.shutdown_timeout()).await {
        tracing::error!("Error during worker shutdown: {}", e);
    }
    if let Err(e) = sink.close().await {
        tracing::error!("Error closing sink: {}", e);
    }

    tracing::info!("Server shutdown complete");
    telemetry::shutdown_telemetry();

    Ok(())
}

async fn connect_sink(config: &AppConfig) -> Result<Arc<dyn RecordSink>> {
    let sink: Arc<dyn RecordSink> = match config.database.database_type.as_str() {
        "postgres" => Arc::new(PostgresSink::connect(&config.database.postgres_url()?).await?),
        _ => Arc::new(SqliteSink::new(config.database.sqlite_path()).await?),
    };
    Ok(sink)
}

async fn shutdown() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping server...");
}
