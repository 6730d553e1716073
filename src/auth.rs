//! Admin API key authentication.
//!
//! `/api/forward` and the admin endpoints require an `Authorization` header
//! carrying the configured admin key. Three header forms are accepted, in
//! priority order: `Bearer <key>`, `ApiKey <key>`, and the raw key. The
//! scheme prefix is matched case-insensitively; the key itself is trimmed
//! once and compared byte-exact in constant time.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::util::now_iso;

/// Extension type carrying the expected admin key, injected into the router
/// layer so [`require_admin_key`] can access it without touching `AppState`.
#[derive(Clone)]
pub struct AdminKey(pub String);

/// Extract the API key from an `Authorization` header value.
///
/// - `"Bearer abc"` → `Some("abc")`
/// - `"ApiKey abc"` → `Some("abc")`
/// - `"abc"` → `Some("abc")`
/// - empty / whitespace-only → `None`
pub fn extract_api_key(auth_header: &str) -> Option<&str> {
    let trimmed = auth_header.trim();
    if trimmed.is_empty() {
        return None;
    }

    let lower = trimmed.to_ascii_lowercase();
    let key = if lower.starts_with("bearer ") {
        trimmed[7..].trim()
    } else if lower.starts_with("apikey ") {
        trimmed[7..].trim()
    } else {
        trimmed
    };

    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

/// Axum middleware that rejects requests whose `Authorization` header does
/// not carry the admin key. Missing, malformed, and mismatching headers all
/// map to `401 Unauthorized`.
pub async fn require_admin_key(request: Request, next: Next) -> Response {
    let admin_key = match request.extensions().get::<AdminKey>() {
        Some(key) => key.0.clone(),
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Server configuration error",
                    "message": "Admin key not configured",
                    "timestamp": now_iso(),
                })),
            )
                .into_response();
        }
    };

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_api_key);

    let authorized = match provided {
        Some(key) => constant_time_eq(admin_key.as_bytes(), key.as_bytes()),
        None => false,
    };

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "Unauthorized",
                "message": "Missing or invalid admin API key",
                "timestamp": now_iso(),
            })),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    // Always iterate over the expected key length to avoid timing leak
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}
