//! `POST /api/forward` — push a request to a named agent and relay its reply.

use axum::{
    body::Body,
    extract::State,
    http::{header::HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::envelope;
use crate::registry::ForwardError;
use crate::state::AppState;
use crate::tunnel::{TunnelError, TunnelRequest, TunnelResponse};
use crate::util::now_iso;

/// Response headers never copied from the agent envelope: axum computes
/// framing itself, and a stale length would corrupt the response.
const SKIPPED_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// `POST /api/forward` (admin) — body is a [`TunnelRequest`].
///
/// The dispatch runs on its own task: if the HTTP caller gives up, the
/// exchange still completes so the agent's framed stream stays in sync, and
/// the result is simply discarded.
pub async fn forward(
    State(state): State<AppState>,
    Json(request): Json<TunnelRequest>,
) -> Response {
    if request.client_name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Bad request",
                "message": "clientName is required",
                "timestamp": now_iso(),
            })),
        )
            .into_response();
    }

    let client_name = request.client_name.clone();
    let registry = state.registry.clone();
    let dispatch = tokio::spawn(async move { registry.forward_to_named(&request).await });

    let result = match dispatch.await {
        Ok(result) => result,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Forward failed",
                    "message": "dispatch task aborted",
                    "timestamp": now_iso(),
                })),
            )
                .into_response();
        }
    };

    match result {
        Ok(response) => agent_response_to_http(response),
        Err(ForwardError::NotConnected) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Client not connected",
                "clientName": client_name,
                "timestamp": now_iso(),
            })),
        )
            .into_response(),
        Err(ForwardError::Tunnel(TunnelError::Timeout)) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({
                "error": "Forward failed",
                "message": "Agent did not respond in time",
                "clientName": client_name,
                "timestamp": now_iso(),
            })),
        )
            .into_response(),
        Err(ForwardError::Tunnel(e)) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "error": "Forward failed",
                "message": e.to_string(),
                "clientName": client_name,
                "timestamp": now_iso(),
            })),
        )
            .into_response(),
    }
}

/// Reconstruct an HTTP response from the agent's reply.
///
/// Envelope bodies become binary responses with the agent's headers applied;
/// anything else (agent error text, heartbeat replies) passes through
/// verbatim as the body.
fn agent_response_to_http(response: TunnelResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let Some((headers, bytes)) = envelope::parse(&response.body) else {
        return (status, response.body).into_response();
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        // Header names/values the agent relayed from arbitrary LAN servers
        // may not be valid tokens; skip what doesn't parse.
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) else {
            continue;
        };
        builder = builder.header(name, value);
    }

    match builder.body(Body::from(bytes)) {
        Ok(http_response) => http_response,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Forward failed",
                "message": "could not assemble proxied response",
                "timestamp": now_iso(),
            })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, Config, TimeoutConfig};
    use crate::routes::api_router;
    use crate::tunnel::codec::{self, Frame};
    use crate::tunnel::{listener, AUTH_SUCCESS};
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tower::ServiceExt;

    const MAX: usize = 1024 * 1024;

    fn test_config() -> Config {
        Config {
            auth: AuthConfig {
                tunnel_token: "T".to_string(),
                admin_api_key: "K".to_string(),
            },
            timeouts: TimeoutConfig {
                dispatch_secs: 2,
                ..TimeoutConfig::default()
            },
            ..Config::default()
        }
    }

    async fn start_gateway() -> (AppState, std::net::SocketAddr) {
        let state = AppState::new(test_config());
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        tokio::spawn(listener::run(state.clone(), tcp));
        (state, addr)
    }

    /// Handshake an agent that answers every request with the given envelope.
    async fn connect_envelope_agent(
        addr: std::net::SocketAddr,
        name: &str,
        headers: Vec<(String, String)>,
        body: &'static [u8],
    ) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        codec::write_frame(&mut stream, &Frame::Text("T".to_string()))
            .await
            .unwrap();
        let Frame::Text(reply) = codec::read_frame(&mut stream, MAX).await.unwrap() else {
            panic!("expected text");
        };
        assert_eq!(reply, AUTH_SUCCESS);
        codec::write_frame(&mut stream, &Frame::Text(name.to_string()))
            .await
            .unwrap();

        tokio::spawn(async move {
            loop {
                let Ok(Frame::Request(_)) = codec::read_frame(&mut stream, MAX).await else {
                    return;
                };
                let response = crate::tunnel::TunnelResponse {
                    status: 200,
                    body: envelope::encode(&headers, body),
                };
                if codec::write_frame(&mut stream, &Frame::Response(response))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });
    }

    async fn wait_for_registration(state: &AppState, name: &str) {
        for _ in 0..100 {
            if state.registry.lookup(name).await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent '{name}' never registered");
    }

    fn forward_request(key: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/forward")
            .header("authorization", format!("Bearer {key}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_forward_envelope_end_to_end() {
        let (state, addr) = start_gateway().await;
        connect_envelope_agent(
            addr,
            "cam1",
            vec![("Content-Type".to_string(), "text/plain".to_string())],
            b"hi",
        )
        .await;
        wait_for_registration(&state, "cam1").await;

        let app = api_router(state);
        let response = app
            .oneshot(forward_request(
                "K",
                r#"{"clientName":"cam1","method":"GET","url":"http://lan/ok","body":""}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hi");
    }

    #[tokio::test]
    async fn test_forward_wrong_admin_key_is_401() {
        let (state, _addr) = start_gateway().await;
        let app = api_router(state);
        let response = app
            .oneshot(forward_request(
                "nope",
                r#"{"clientName":"cam1","method":"GET","url":"http://lan/ok","body":""}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Unauthorized");
    }

    #[tokio::test]
    async fn test_forward_unknown_client_is_404() {
        let (state, _addr) = start_gateway().await;
        let app = api_router(state);
        let response = app
            .oneshot(forward_request(
                "K",
                r#"{"clientName":"ghost","method":"GET","url":"http://lan/ok","body":""}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Client not connected");
        assert_eq!(body["clientName"], "ghost");
    }

    #[tokio::test]
    async fn test_non_envelope_body_passes_through_verbatim() {
        let (state, addr) = start_gateway().await;
        // Agent that answers with a plain error string
        let mut stream = TcpStream::connect(addr).await.unwrap();
        codec::write_frame(&mut stream, &Frame::Text("T".to_string()))
            .await
            .unwrap();
        let _ = codec::read_frame(&mut stream, MAX).await.unwrap();
        codec::write_frame(&mut stream, &Frame::Text("err-agent".to_string()))
            .await
            .unwrap();
        tokio::spawn(async move {
            let _ = codec::read_frame(&mut stream, MAX).await;
            let response = crate::tunnel::TunnelResponse {
                status: 500,
                body: "LAN webserver error: connection refused".to_string(),
            };
            let _ = codec::write_frame(&mut stream, &Frame::Response(response)).await;
        });
        wait_for_registration(&state, "err-agent").await;

        let app = api_router(state);
        let response = app
            .oneshot(forward_request(
                "K",
                r#"{"clientName":"err-agent","method":"GET","url":"http://lan/x","body":""}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"LAN webserver error: connection refused");
    }

    #[tokio::test]
    async fn test_forward_timeout_is_504() {
        let (state, addr) = start_gateway().await;
        // Agent that handshakes but never answers requests
        let mut stream = TcpStream::connect(addr).await.unwrap();
        codec::write_frame(&mut stream, &Frame::Text("T".to_string()))
            .await
            .unwrap();
        let _ = codec::read_frame(&mut stream, MAX).await.unwrap();
        codec::write_frame(&mut stream, &Frame::Text("mute".to_string()))
            .await
            .unwrap();
        tokio::spawn(async move {
            // Hold the socket open, read nothing back
            let mut sink = Vec::new();
            use tokio::io::AsyncReadExt;
            let _ = stream.read_to_end(&mut sink).await;
        });
        wait_for_registration(&state, "mute").await;

        let app = api_router(state);
        let response = app
            .oneshot(forward_request(
                "K",
                r#"{"clientName":"mute","method":"GET","url":"http://lan/x","body":""}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Forward failed");
    }

    #[tokio::test]
    async fn test_missing_client_name_is_400() {
        let (state, _addr) = start_gateway().await;
        let app = api_router(state);
        let response = app
            .oneshot(forward_request(
                "K",
                r#"{"clientName":"","method":"GET","url":"http://lan/x","body":""}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
