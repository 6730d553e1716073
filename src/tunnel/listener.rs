//! Tunnel accept loop and agent handshake.
//!
//! For every accepted socket: check the ban set before reading a single
//! byte, then run the handshake on its own task so a slow or hostile peer
//! never stalls accepts. The handshake sequence (all String frames):
//!
//! ```text
//! agent → gateway: auth token
//! gateway → agent: "AUTH_SUCCESS" | "AUTH_FAILED"   [close on failure]
//! agent → gateway: agent name
//! ```
//!
//! A successful handshake registers the session; the task then ends — the
//! socket sits idle until a dispatch or heartbeat takes the session mutex.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::codec::{self, Frame};
use super::session::{FramedConn, TunnelSession};
use super::{TunnelError, AUTH_FAILED, AUTH_SUCCESS};
use crate::auth::constant_time_eq;
use crate::security::SuspiciousKind;
use crate::state::AppState;

/// Run the accept loop forever. The listener is bound by the caller so bind
/// failures surface as startup errors, not mid-loop surprises.
pub async fn run(state: AppState, listener: TcpListener) {
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "Tunnel listener ready");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Transient accept errors (EMFILE, aborted connections)
                warn!(error = %e, "Accept failed");
                continue;
            }
        };

        let ip = peer.ip().to_string();
        if state.ledger.is_banned(&ip) {
            // Reject before any bytes are exchanged; no log entry either —
            // banned peers don't get to fill the ring.
            debug!(ip = %ip, "Rejected connection from banned IP");
            drop(stream);
            continue;
        }

        let state = state.clone();
        tokio::spawn(handshake(state, stream, ip));
    }
}

/// Drive one connection through the handshake and registration.
async fn handshake(state: AppState, stream: TcpStream, ip: String) {
    let local_addr = match stream.local_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let max_frame = state.config.gateway.max_frame_bytes;
    let deadline = state.config.timeouts.handshake();
    let mut conn = FramedConn::new(stream);

    // Step 1: auth token. The first read also sniffs for stray HTTP
    // requests so browsers poking the tunnel port get a real answer.
    let token = match timeout(
        deadline,
        codec::read_frame_handshake(&mut conn.reader, max_frame),
    )
    .await
    {
        Ok(Ok(Frame::Text(token))) => token,
        Ok(Ok(_)) => {
            state
                .ledger
                .record_suspicious(&ip, SuspiciousKind::InvalidProtocol);
            return;
        }
        Ok(Err(e)) => {
            record_handshake_error(&state, &ip, &e);
            if matches!(e, TunnelError::HttpProbe) {
                send_http_rejection(&state, &mut conn).await;
            }
            return;
        }
        Err(_) => {
            debug!(ip = %ip, "Handshake timed out awaiting token");
            return;
        }
    };

    // Step 2: verify the token and answer in-band.
    if !constant_time_eq(
        state.config.auth.tunnel_token.as_bytes(),
        token.as_bytes(),
    ) {
        warn!(ip = %ip, "Agent presented invalid auth token");
        let _ = codec::write_frame(&mut conn.writer, &Frame::Text(AUTH_FAILED.to_string())).await;
        state
            .ledger
            .record_suspicious(&ip, SuspiciousKind::AuthFailed);
        return;
    }
    if codec::write_frame(&mut conn.writer, &Frame::Text(AUTH_SUCCESS.to_string()))
        .await
        .is_err()
    {
        return;
    }

    // Step 3: agent name.
    let name = match timeout(deadline, codec::read_frame(&mut conn.reader, max_frame)).await {
        Ok(Ok(Frame::Text(name))) => name,
        Ok(Ok(_)) => {
            state
                .ledger
                .record_suspicious(&ip, SuspiciousKind::InvalidProtocol);
            return;
        }
        Ok(Err(e)) => {
            record_handshake_error(&state, &ip, &e);
            return;
        }
        Err(_) => {
            debug!(ip = %ip, "Handshake timed out awaiting agent name");
            return;
        }
    };

    if name.is_empty() {
        state
            .ledger
            .record_suspicious(&ip, SuspiciousKind::InvalidProtocol);
        return;
    }

    let session = Arc::new(TunnelSession::new(
        name,
        ip,
        local_addr,
        conn,
        max_frame,
    ));
    state.registry.register(session).await;
}

/// Map a handshake-phase codec error to a ledger entry. Plain disconnects
/// (EOF, reset) are the common case of benign peers and are never recorded.
fn record_handshake_error(state: &AppState, ip: &str, error: &TunnelError) {
    match error {
        TunnelError::PeerGone | TunnelError::Timeout | TunnelError::Closed => {
            debug!(ip, error = %error, "Connection dropped during handshake");
        }
        TunnelError::FrameCorrupt(_) | TunnelError::HttpProbe => {
            warn!(ip, error = %error, "Protocol violation during handshake");
            state
                .ledger
                .record_suspicious(ip, SuspiciousKind::InvalidProtocol);
        }
        TunnelError::StreamCorrupt(_) => {
            warn!(ip, error = %error, "Stream corruption during handshake");
            state
                .ledger
                .record_suspicious(ip, SuspiciousKind::StreamCorruption);
        }
    }
}

/// Courtesy reply for HTTP clients that hit the tunnel port by mistake.
async fn send_http_rejection(state: &AppState, conn: &mut FramedConn) {
    let body = format!(
        "{{\n  \"error\": \"Invalid Protocol\",\n  \"message\": \"This port is for agent tunnel connections, not HTTP.\",\n  \"instructions\": \"Use the REST API at /api/forward on {}.\"\n}}\n",
        state.config.gateway.http_listen
    );
    let response = format!(
        "HTTP/1.1 400 Bad Request\r\nContent-Type: application/json\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let _ = conn.writer.write_all(response.as_bytes()).await;
    let _ = conn.writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, Config, TimeoutConfig};
    use crate::tunnel::TunnelResponse;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    const MAX: usize = 1024 * 1024;

    fn test_config() -> Config {
        Config {
            auth: AuthConfig {
                tunnel_token: "T".to_string(),
                admin_api_key: "K".to_string(),
            },
            timeouts: TimeoutConfig {
                handshake_secs: 2,
                ..TimeoutConfig::default()
            },
            ..Config::default()
        }
    }

    /// Bind a loopback listener, run the accept loop, return state + addr.
    async fn start_gateway(config: Config) -> (AppState, std::net::SocketAddr) {
        let state = AppState::new(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run(state.clone(), listener));
        (state, addr)
    }

    /// Agent-side handshake helper.
    async fn agent_handshake(addr: std::net::SocketAddr, token: &str, name: &str) -> (TcpStream, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        codec::write_frame(&mut stream, &Frame::Text(token.to_string()))
            .await
            .unwrap();
        let Frame::Text(reply) = codec::read_frame(&mut stream, MAX).await.unwrap() else {
            panic!("expected text reply");
        };
        if reply == AUTH_SUCCESS {
            codec::write_frame(&mut stream, &Frame::Text(name.to_string()))
                .await
                .unwrap();
        }
        (stream, reply)
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

    #[tokio::test]
    async fn test_successful_handshake_registers_agent() {
        let (state, addr) = start_gateway(test_config()).await;
        let (_stream, reply) = agent_handshake(addr, "T", "cam1").await;
        assert_eq!(reply, AUTH_SUCCESS);
        wait_for_registration(&state, "cam1").await;

        let session = state.registry.lookup("cam1").await.unwrap();
        assert_eq!(session.name(), "cam1");
        assert!(session.socket_healthy());

        // Registration produced a CONNECT log entry
        let logs = state.connection_log.all().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].client_name, "cam1");
    }

    #[tokio::test]
    async fn test_wrong_token_gets_auth_failed_and_no_registration() {
        let (state, addr) = start_gateway(test_config()).await;
        let (_stream, reply) = agent_handshake(addr, "wrong", "cam1").await;
        assert_eq!(reply, AUTH_FAILED);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.registry.count().await, 0);
        // No disconnect entry: the handshake never completed
        assert!(state.connection_log.all().await.is_empty());
        // But the failure is on the ledger
        assert_eq!(state.ledger.auto_ban_status("127.0.0.1").attempts, 1);
    }

    #[tokio::test]
    async fn test_repeated_auth_failures_ban_at_tolerance() {
        let (state, addr) = start_gateway(test_config()).await;
        for _ in 0..5 {
            let (_s, reply) = agent_handshake(addr, "wrong", "x").await;
            assert_eq!(reply, AUTH_FAILED);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Five failures sit below the tolerance of eight
        assert!(!state.ledger.is_banned("127.0.0.1"));

        for _ in 0..3 {
            let _ = agent_handshake(addr, "wrong", "x").await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.ledger.is_banned("127.0.0.1"));

        // A banned peer is dropped before any frame exchange
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("expected prompt EOF")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_duplicate_name_evicts_prior_session() {
        let (state, addr) = start_gateway(test_config()).await;
        let (_s1, _) = agent_handshake(addr, "T", "cam1").await;
        wait_for_registration(&state, "cam1").await;
        let first = state.registry.lookup("cam1").await.unwrap();

        let (_s2, _) = agent_handshake(addr, "T", "cam1").await;
        for _ in 0..100 {
            let current = state.registry.lookup("cam1").await.unwrap();
            if !Arc::ptr_eq(&current, &first) {
                assert!(!first.socket_healthy());
                assert_eq!(state.registry.count().await, 1);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("second session never replaced the first");
    }

    #[tokio::test]
    async fn test_http_probe_gets_400_and_suspicion() {
        let (state, addr) = start_gateway(test_config()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request"));
        assert!(reply.contains("Invalid Protocol"));
        assert_eq!(state.ledger.auto_ban_status("127.0.0.1").attempts, 1);
    }

    #[tokio::test]
    async fn test_silent_disconnect_is_not_suspicious() {
        let (state, addr) = start_gateway(test_config()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        drop(stream);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.ledger.auto_ban_status("127.0.0.1").attempts, 0);
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let (state, addr) = start_gateway(test_config()).await;
        let (_stream, reply) = agent_handshake(addr, "T", "").await;
        assert_eq!(reply, AUTH_SUCCESS);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.registry.count().await, 0);
        assert_eq!(state.ledger.auto_ban_status("127.0.0.1").attempts, 1);
    }

    #[tokio::test]
    async fn test_registered_agent_answers_forward() {
        let (state, addr) = start_gateway(test_config()).await;
        let (mut stream, _) = agent_handshake(addr, "T", "cam1").await;
        wait_for_registration(&state, "cam1").await;

        // Agent task: answer one request
        let agent = tokio::spawn(async move {
            let Ok(Frame::Request(req)) = codec::read_frame(&mut stream, MAX).await else {
                panic!("expected request");
            };
            assert_eq!(req.client_name, "cam1");
            let response = TunnelResponse {
                status: 200,
                body: format!("{} {} {}", req.method, req.url, req.body),
            };
            codec::write_frame(&mut stream, &Frame::Response(response))
                .await
                .unwrap();
        });

        let request = crate::tunnel::TunnelRequest {
            client_name: "cam1".to_string(),
            method: "GET".to_string(),
            url: "http://lan/ok".to_string(),
            body: String::new(),
        };
        let response = state.registry.forward_to_named(&request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "GET http://lan/ok ");
        agent.await.unwrap();
    }
}
