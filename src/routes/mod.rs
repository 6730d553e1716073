//! HTTP route handlers.
//!
//! [`health`] is public; [`forward`] and everything under [`admin`] sit
//! behind the [`crate::auth::require_admin_key`] middleware.

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{self, AdminKey};
use crate::state::AppState;

pub mod admin;
pub mod forward;
pub mod health;

/// Assemble the full API router. Shared between `main` and tests so the HTTP
/// contract is exercised exactly as served.
pub fn api_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/health", get(health::health))
        .route("/api/health/{name}", get(health::health_client));

    let admin_routes = Router::new()
        .route("/api/forward", post(forward::forward))
        .route("/api/security-status", get(admin::security_status))
        .route("/api/admin/security", post(admin::security_action))
        .route("/api/cleanup-connections", post(admin::cleanup_connections))
        .route("/api/admin/connection-logs", get(admin::connection_logs))
        .route(
            "/api/admin/connection-logs/clear",
            post(admin::clear_connection_logs),
        )
        .layer(middleware::from_fn(auth::require_admin_key));

    Router::new()
        .merge(public)
        .merge(admin_routes)
        .layer(Extension(AdminKey(state.config.auth.admin_api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
