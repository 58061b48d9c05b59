use coursehub::config::WorkersConfig;
use coursehub::sink::MockSink;
use coursehub::telemetry::AuditLayer;
use coursehub::workers::{AuditEvent, ManagerState, SubmitOutcome, WorkerError, WorkerManager};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::layer::SubscriberExt;

fn fast_config() -> WorkersConfig {
    let mut config = WorkersConfig::default();
    config.audit.retry_base_delay_ms = 1;
    config.health.flush_interval_ms = 20;
    config.health.report_interval_ms = 20;
    config.health.retry_base_delay_ms = 1;
    config
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_is_well_defined_before_start_and_after_stop() {
    let sink = Arc::new(MockSink::new());
    let manager = WorkerManager::new(&fast_config(), sink);

    let before = manager.health_status();
    assert_eq!(before.state, ManagerState::Stopped);
    assert!(!before.healthy);
    assert_eq!(before.audit.queue_capacity, 1000);
    assert_eq!(before.health.queue_capacity, 500);

    manager.start().unwrap();
    assert!(manager.health_status().healthy);
    manager.stop(Duration::from_secs(5)).await.unwrap();

    let after = manager.health_status();
    assert_eq!(after.state, ManagerState::Stopped);
    assert!(!after.running);
    assert!(!after.audit.running && !after.health.running && !after.cleanup.running);

    let json = serde_json::to_value(&after).unwrap();
    assert_eq!(json["state"], "stopped");
    assert_eq!(json["audit"]["enabled"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_with_tiny_timeout_returns_promptly() {
    let sink = Arc::new(MockSink::new());
    sink.set_write_delay(Duration::from_millis(500));
    let manager = WorkerManager::new(&fast_config(), sink.clone());
    manager.start().unwrap();
    manager.submit_audit_event(AuditEvent::new("WARN", "slow drain"));

    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(1), manager.stop(Duration::from_millis(1)))
        .await
        .expect("stop must not hang on a slow drain");

    assert!(matches!(result, Err(WorkerError::ShutdownTimeout { .. })));
    assert!(result.unwrap_err().is_timeout());
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(manager.state(), ManagerState::Stopped);

    // The abandoned drain still owns the audit pipeline
    assert!(matches!(
        manager.start(),
        Err(WorkerError::StillDraining { worker: "audit" })
    ));
    assert_eq!(manager.state(), ManagerState::Stopped);

    wait_until("slow drain to finish", || manager.start().is_ok()).await;
    assert_eq!(sink.audit_count(), 1);
    manager.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manager_can_restart() {
    let sink = Arc::new(MockSink::new());
    let manager = WorkerManager::new(&fast_config(), sink.clone());

    manager.start().unwrap();
    manager.submit_audit_event(AuditEvent::new("INFO", "first run"));
    manager.stop(Duration::from_secs(5)).await.unwrap();

    manager.start().unwrap();
    manager.submit_audit_event(AuditEvent::new("INFO", "second run"));
    manager.stop(Duration::from_secs(5)).await.unwrap();

    assert_eq!(sink.audit_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_message_never_reaches_sink() {
    let sink = Arc::new(MockSink::new());
    let manager = WorkerManager::new(&fast_config(), sink.clone());
    manager.start().unwrap();

    let outcome = manager.submit_audit_event(AuditEvent::new("ERROR", ""));
    assert_eq!(outcome, SubmitOutcome::Invalid);
    manager.stop(Duration::from_secs(5)).await.unwrap();

    let status = manager.health_status();
    assert_eq!(status.audit.total_dropped, 0);
    assert_eq!(status.audit.total_processed, 0);
    assert_eq!(sink.audit_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_submissions_before_start_are_ignored() {
    let sink = Arc::new(MockSink::new());
    let manager = WorkerManager::new(&fast_config(), sink.clone()).with_routes(["/files"]);

    assert_eq!(
        manager.submit_audit_event(AuditEvent::new("INFO", "too early")),
        SubmitOutcome::NotRunning
    );
    assert!(!manager.record_health_request("files", 200, Duration::from_millis(3)));
    assert_eq!(manager.health_status().audit.total_dropped, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_requests_are_reported_to_sink() {
    let sink = Arc::new(MockSink::new());
    let manager = WorkerManager::new(&fast_config(), sink.clone())
        .with_routes(["/files/{id}", "/subjects", "/health"]);
    manager.start().unwrap();

    for latency in [10, 20, 30] {
        assert!(manager.record_health_request("files", 200, Duration::from_millis(latency)));
    }
    assert!(!manager.record_health_request("health", 200, Duration::from_millis(1)));

    wait_until("files snapshot", || {
        sink.health_metrics()
            .iter()
            .any(|m| m.service == "files" && m.request_count == 3)
    })
    .await;
    manager.stop(Duration::from_secs(5)).await.unwrap();

    let files = sink
        .health_metrics()
        .into_iter()
        .find(|m| m.service == "files")
        .unwrap();
    assert_eq!(files.average_latency, Duration::from_millis(20));
    assert!(sink.health_metrics().iter().all(|m| m.service != "health"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manual_cleanup_through_manager() {
    let sink = Arc::new(MockSink::new());
    let old = chrono::Utc::now() - chrono::Duration::days(90);
    sink.seed_audit_events(vec![AuditEvent::new("INFO", "ancient").with_timestamp(old)]);
    let manager = WorkerManager::new(&fast_config(), sink.clone());

    assert_eq!(manager.run_cleanup_now().await.unwrap(), 1);
    assert_eq!(manager.run_cleanup_now().await.unwrap(), 0);
    assert_eq!(manager.health_status().cleanup.last_deleted, Some(0));

    let mut disabled = fast_config();
    disabled.cleanup.retention_days = 0;
    let manager = WorkerManager::new(&disabled, sink);
    assert!(matches!(
        manager.run_cleanup_now().await,
        Err(WorkerError::CleanupDisabled)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_audit_layer_forwards_application_warnings() {
    let sink = Arc::new(MockSink::new());
    let manager = Arc::new(WorkerManager::new(&fast_config(), sink.clone()));
    manager.start().unwrap();

    let subscriber = tracing_subscriber::registry().with(AuditLayer::new(manager.clone()));
    tracing::subscriber::with_default(subscriber, || {
        tracing::warn!(subject_id = 12, "Deadline moved after submissions opened");
        tracing::info!("Routine message");
        tracing::warn!(target: "coursehub::workers::pipeline", "Queue full, dropping record");
    });

    manager.stop(Duration::from_secs(5)).await.unwrap();

    let events = sink.audit_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message, "Deadline moved after submissions opened");
    assert_eq!(events[0].attributes["subject_id"], 12);
}
