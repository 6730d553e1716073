//! Unauthenticated health endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::state::AppState;
use crate::util::{format_uptime, now_iso};

/// `GET /api/health` — gateway liveness and connected-agent overview.
///
/// `healthy` means at least one agent is registered; with none the gateway
/// can't forward anything, so the status drops to 503 `unhealthy` for
/// load-balancer consumption.
pub async fn health(State(state): State<AppState>) -> Response {
    let names = state.registry.names().await;
    let details = state.registry.details().await;
    let healthy = !names.is_empty();

    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "connectedClients": names.len(),
        "connectedClientNames": names,
        "clientDetails": details,
        "uptime": format_uptime(state.start_time.elapsed()),
        "timestamp": now_iso(),
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// `GET /api/health/{name}` — per-agent connectivity check.
///
/// Purely local: consults the registry and the session's health flag, never
/// the socket. Unauthenticated so agent operators can self-diagnose.
pub async fn health_client(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.registry.lookup(&name).await {
        Some(session) if session.socket_healthy() => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "connected": true,
                "clientName": name,
                "timestamp": now_iso(),
            })),
        )
            .into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "disconnected",
                "connected": false,
                "clientName": name,
                "timestamp": now_iso(),
            })),
        )
            .into_response(),
    }
}
