use crate::workers::{service_for_route, WorkerManager};
use axum::body::Body;
use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use std::time::Instant;

/// Axum middleware that feeds per-service request counters.
///
/// Times the handler, maps the matched route template to a service name, and
/// records status and latency on the health worker's registry. Recording is a
/// lock-and-increment, so this middleware adds no I/O to the hot path. Routes
/// without a service (reserved or parameterized first segment) are not
/// recorded.
pub async fn health_middleware(
    State(manager): State<Arc<WorkerManager>>,
    matched_path: Option<MatchedPath>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let service = matched_path.and_then(|path| service_for_route(path.as_str()));

    let response = next.run(request).await;

    if let Some(service) = service {
        manager.record_health_request(&service, response.status().as_u16(), start.elapsed());
    }

    response
}
