use crate::http::handlers::{cleanup_handler, health_handler, workers_status_handler};
use crate::http::health_middleware::health_middleware;
use crate::workers::WorkerManager;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post, MethodRouter};
use axum::Router;
use std::sync::Arc;

pub const PATH_HEALTH: &str = "/health";
pub const PATH_WORKERS_STATUS: &str = "/health/workers";
pub const PATH_LOGS_CLEANUP: &str = "/logs/cleanup";

/// HTTP surface for the worker subsystem.
///
/// Application routes added through [`AppServer::route`] are metered by the
/// health middleware and registered as services when the router is built.
pub struct AppServer {
    pub manager: Arc<WorkerManager>,
    routes: Router<Arc<WorkerManager>>,
    paths: Vec<&'static str>,
}

impl AppServer {
    pub fn new(manager: Arc<WorkerManager>) -> Self {
        AppServer {
            manager,
            routes: Router::new(),
            paths: Vec::new(),
        }
        .route(PATH_HEALTH, get(health_handler))
        .route(PATH_WORKERS_STATUS, get(workers_status_handler))
        .route(PATH_LOGS_CLEANUP, post(cleanup_handler))
    }

    pub fn route(mut self, path: &'static str, method_router: MethodRouter<Arc<WorkerManager>>) -> Self {
        self.routes = self.routes.route(path, method_router);
        self.paths.push(path);
        self
    }

    /// Route templates served, in registration order.
    pub fn route_paths(&self) -> &[&'static str] {
        &self.paths
    }

    pub fn into_router(self) -> Router {
        self.manager.health_worker().register_routes(&self.paths);
        self.routes
            .route_layer(from_fn_with_state(self.manager.clone(), health_middleware))
            .with_state(self.manager)
    }
}
