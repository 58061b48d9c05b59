pub mod app_server;
pub mod error;
pub mod handlers;
pub mod health_middleware;
