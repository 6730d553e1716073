//! Admin endpoints: security ledger control, registry cleanup, and
//! connection-log queries. All sit behind the admin-key middleware.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::connlog::ConnectionEvent;
use crate::state::AppState;
use crate::util::now_iso;

/// Actions accepted by `POST /api/admin/security`.
const VALID_ACTIONS: [&str; 4] = ["ban", "unban", "status", "check"];

/// `GET /api/security-status` — ledger snapshot plus the active thresholds.
pub async fn security_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.ledger.snapshot();
    let ban = &state.config.ban;
    Json(json!({
        "bannedIps": snapshot.banned_ips,
        "tracked": snapshot.tracked,
        "inGrace": snapshot.in_grace,
        "thresholds": {
            "maxAttempts": ban.max_attempts,
            "windowMins": ban.window_mins,
            "permanentAttempts": ban.permanent_attempts,
            "authTolerance": ban.auth_tolerance,
            "graceMins": ban.grace_mins,
            "gcHours": ban.gc_hours,
        },
        "timestamp": now_iso(),
    }))
}

/// Body of `POST /api/admin/security`.
#[derive(Debug, Deserialize)]
pub struct SecurityActionRequest {
    pub action: String,
    #[serde(default)]
    pub ip: Option<String>,
}

/// `POST /api/admin/security` — manual ban/unban plus diagnostics.
pub async fn security_action(
    State(state): State<AppState>,
    Json(request): Json<SecurityActionRequest>,
) -> Response {
    match request.action.as_str() {
        "ban" => {
            let Some(ip) = request.ip else {
                return missing_ip("ban");
            };
            let newly_banned = state.ledger.ban(&ip);
            (
                StatusCode::OK,
                Json(json!({
                    "message": format!("IP {ip} banned"),
                    "ip": ip,
                    "alreadyBanned": !newly_banned,
                    "timestamp": now_iso(),
                })),
            )
                .into_response()
        }
        "unban" => {
            let Some(ip) = request.ip else {
                return missing_ip("unban");
            };
            let was_banned = state.ledger.unban(&ip);
            (
                StatusCode::OK,
                Json(json!({
                    "message": format!("IP {ip} unbanned"),
                    "ip": ip,
                    "wasActuallyBanned": was_banned,
                    "graceMins": state.config.ban.grace_mins,
                    "timestamp": now_iso(),
                })),
            )
                .into_response()
        }
        "status" => security_status(State(state)).await.into_response(),
        "check" => {
            let Some(ip) = request.ip else {
                return missing_ip("check");
            };
            let status = state.ledger.auto_ban_status(&ip);
            (
                StatusCode::OK,
                Json(json!({
                    "autoBanStatus": status,
                    "timestamp": now_iso(),
                })),
            )
                .into_response()
        }
        other => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Invalid action",
                "message": format!("Unknown action '{other}'"),
                "validActions": VALID_ACTIONS,
                "timestamp": now_iso(),
            })),
        )
            .into_response(),
    }
}

fn missing_ip(action: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": "Bad request",
            "message": format!("Action '{action}' requires an 'ip' field"),
            "timestamp": now_iso(),
        })),
    )
        .into_response()
}

/// `POST /api/cleanup-connections` — run the registry sweep synchronously.
pub async fn cleanup_connections(State(state): State<AppState>) -> Json<serde_json::Value> {
    let before = state.registry.count().await;
    let removed = state.registry.sweep().await;
    let after = state.registry.count().await;
    Json(json!({
        "message": "Cleanup completed",
        "connectionsBefore": before,
        "connectionsAfter": after,
        "removedConnections": removed,
        "timestamp": now_iso(),
    }))
}

/// Query parameters for `GET /api/admin/connection-logs`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLogsQuery {
    pub event_type: Option<String>,
    pub client_name: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /api/admin/connection-logs` — filtered entries plus statistics.
pub async fn connection_logs(
    State(state): State<AppState>,
    Query(query): Query<ConnectionLogsQuery>,
) -> Response {
    let event = match query.event_type.as_deref() {
        Some(raw) => match ConnectionEvent::parse(raw) {
            Some(event) => Some(event),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "Invalid eventType",
                        "message": format!("Unknown eventType '{raw}'"),
                        "validEventTypes": ["CONNECT", "DISCONNECT"],
                        "timestamp": now_iso(),
                    })),
                )
                    .into_response();
            }
        },
        None => None,
    };

    let logs = state
        .connection_log
        .query(event, query.client_name.as_deref(), query.limit)
        .await;
    let statistics = state.connection_log.statistics().await;
    let count = logs.len();

    (
        StatusCode::OK,
        Json(json!({
            "logs": logs,
            "count": count,
            "statistics": statistics,
            "timestamp": now_iso(),
        })),
    )
        .into_response()
}

/// `POST /api/admin/connection-logs/clear` — empty the ring.
pub async fn clear_connection_logs(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.connection_log.clear().await;
    Json(json!({
        "message": "Connection logs cleared",
        "timestamp": now_iso(),
    }))
}
