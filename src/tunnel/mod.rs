//! Reverse tunnel for agents behind NAT.
//!
//! Agents dial the gateway's tunnel port, authenticate with the shared token,
//! register a name, and then hold the TCP connection open. The gateway pushes
//! [`TunnelRequest`]s down the connection and reads the paired
//! [`TunnelResponse`] — one exchange at a time per session.

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod listener;
pub mod session;

/// Reserved method for in-band liveness probes. Agents answer with
/// `{status: 200, body: "heartbeat_ok"}` and never touch their LAN.
pub const HEARTBEAT_METHOD: &str = "HEARTBEAT";

/// The `url` field of a heartbeat request.
pub const HEARTBEAT_URL: &str = "ping";

/// Expected heartbeat response body.
pub const HEARTBEAT_OK: &str = "heartbeat_ok";

/// Handshake reply after a matching auth token. Part of the wire contract.
pub const AUTH_SUCCESS: &str = "AUTH_SUCCESS";

/// Handshake reply after a mismatching auth token. Part of the wire contract.
pub const AUTH_FAILED: &str = "AUTH_FAILED";

/// A request pushed from the gateway to an agent over its tunnel.
///
/// The same shape is accepted as the JSON body of `POST /api/forward`
/// (camelCase keys are the wire contract on both surfaces).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    /// Name of the agent this request is addressed to.
    pub client_name: String,
    /// Uppercase HTTP verb, or [`HEARTBEAT_METHOD`].
    pub method: String,
    /// Target URL the agent should fetch inside its LAN.
    pub url: String,
    /// Request body, empty for GET and heartbeats.
    #[serde(default)]
    pub body: String,
}

impl TunnelRequest {
    /// Build a heartbeat probe for the named agent.
    pub fn heartbeat(client_name: &str) -> Self {
        Self {
            client_name: client_name.to_string(),
            method: HEARTBEAT_METHOD.to_string(),
            url: HEARTBEAT_URL.to_string(),
            body: String::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.method == HEARTBEAT_METHOD
    }
}

/// An agent's reply to a [`TunnelRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelResponse {
    /// HTTP status the agent observed (or synthesized).
    pub status: u16,
    /// Response body: usually the `Headers:`/`Body-Base64:` envelope, or an
    /// agent-side error message, or `"heartbeat_ok"`.
    pub body: String,
}

/// Errors surfaced by tunnel operations.
///
/// Categories matter more than messages: the listener maps them to
/// security-ledger kinds and the HTTP layer maps them to status codes.
#[derive(Debug)]
pub enum TunnelError {
    /// EOF, connection reset, or broken pipe. The common case of a benign
    /// peer going away; never treated as suspicious.
    PeerGone,
    /// Frame header rejected: unknown tag or implausible length.
    FrameCorrupt(String),
    /// Frame payload rejected: well-tagged but undecodable (UTF-8/JSON).
    StreamCorrupt(String),
    /// The first bytes spell an HTTP verb — a browser or scanner hit the
    /// tunnel port.
    HttpProbe,
    /// The paired response did not arrive within the deadline.
    Timeout,
    /// The session is marked closed/unhealthy; no I/O was attempted.
    Closed,
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelError::PeerGone => write!(f, "peer disconnected"),
            TunnelError::FrameCorrupt(detail) => write!(f, "corrupt frame: {detail}"),
            TunnelError::StreamCorrupt(detail) => write!(f, "corrupt stream: {detail}"),
            TunnelError::HttpProbe => write!(f, "HTTP request on tunnel port"),
            TunnelError::Timeout => write!(f, "response deadline exceeded"),
            TunnelError::Closed => write!(f, "connection unhealthy"),
        }
    }
}

impl std::error::Error for TunnelError {}
