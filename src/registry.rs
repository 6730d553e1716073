//! Registry of connected agents: name → live tunnel session.
//!
//! Holds at most one session per name. A second handshake with a name in use
//! evicts and closes the previous session before the new one is inserted.
//! The periodic sweep removes sessions whose local health check fails and
//! heartbeat-probes the rest; probes queue on each session's request mutex,
//! so a sweep never yanks a session out from under an in-flight forward.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::connlog::ConnectionLog;
use crate::tunnel::session::TunnelSession;
use crate::tunnel::{TunnelError, TunnelRequest, TunnelResponse};

/// Why a forward could not produce a response.
#[derive(Debug)]
pub enum ForwardError {
    /// No session registered under the requested name.
    NotConnected,
    /// The session failed during or before the exchange.
    Tunnel(TunnelError),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::NotConnected => write!(f, "Client not connected"),
            ForwardError::Tunnel(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ForwardError {}

/// Per-agent detail row for the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDetail {
    pub name: String,
    pub connected_at: String,
    pub uptime: String,
    pub connected: bool,
}

/// Thread-safe agent registry. Cheap to clone; all clones share the map.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Arc<TunnelSession>>>>,
    connection_log: ConnectionLog,
    dispatch_deadline: Duration,
    heartbeat_deadline: Duration,
}

impl AgentRegistry {
    pub fn new(
        connection_log: ConnectionLog,
        dispatch_deadline: Duration,
        heartbeat_deadline: Duration,
    ) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            connection_log,
            dispatch_deadline,
            heartbeat_deadline,
        }
    }

    /// Insert a freshly handshaken session, evicting and closing any previous
    /// session registered under the same name. Returns the evicted session.
    pub async fn register(&self, session: Arc<TunnelSession>) -> Option<Arc<TunnelSession>> {
        let name = session.name().to_string();
        let ip = session.remote_ip().to_string();

        let prior = {
            let mut agents = self.agents.write().await;
            agents.insert(name.clone(), session)
        };

        if let Some(ref old) = prior {
            warn!(client = %name, "Replacing existing session for re-registering agent");
            old.close().await;
            self.connection_log
                .log_disconnect(
                    Some(&name),
                    old.remote_ip(),
                    Some("replaced by new connection"),
                )
                .await;
        }

        self.connection_log.log_connect(&name, &ip).await;
        info!(client = %name, ip = %ip, "Agent registered");
        prior
    }

    /// Look up a session by agent name.
    pub async fn lookup(&self, name: &str) -> Option<Arc<TunnelSession>> {
        self.agents.read().await.get(name).cloned()
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// All registered names, sorted for stable output.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Detail rows for the health endpoint, sorted by name.
    pub async fn details(&self) -> Vec<AgentDetail> {
        let agents = self.agents.read().await;
        let mut details: Vec<AgentDetail> = agents
            .values()
            .map(|s| AgentDetail {
                name: s.name().to_string(),
                connected_at: s.connected_at(),
                uptime: s.uptime(),
                connected: true,
            })
            .collect();
        drop(agents);
        details.sort_by(|a, b| a.name.cmp(&b.name));
        details
    }

    /// Forward a request to the agent named in it and await the response.
    ///
    /// A session that fails its pre-dispatch health check is removed from the
    /// registry before the error is returned. Errors that occur during the
    /// exchange (timeout, corruption, peer loss) leave the entry in place —
    /// the session has marked itself unhealthy and the next touch or sweep
    /// will collect it.
    pub async fn forward_to_named(
        &self,
        request: &TunnelRequest,
    ) -> Result<TunnelResponse, ForwardError> {
        let session = self
            .lookup(&request.client_name)
            .await
            .ok_or(ForwardError::NotConnected)?;

        match session.dispatch(request, self.dispatch_deadline).await {
            Ok(response) => Ok(response),
            Err(TunnelError::Closed) => {
                self.remove(&session, "connection unhealthy").await;
                Err(ForwardError::Tunnel(TunnelError::Closed))
            }
            Err(e) => Err(ForwardError::Tunnel(e)),
        }
    }

    /// Remove `session` from the registry if it is still the one registered
    /// under its name, close it, and log the disconnect. Removal is atomic
    /// per entry; a replacement session registered meanwhile is left alone.
    pub async fn remove(&self, session: &Arc<TunnelSession>, reason: &str) {
        let name = session.name();
        let removed = {
            let mut agents = self.agents.write().await;
            match agents.get(name) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    agents.remove(name);
                    true
                }
                _ => false,
            }
        };

        if removed {
            session.close().await;
            self.connection_log
                .log_disconnect(Some(name), session.remote_ip(), Some(reason))
                .await;
            info!(client = %name, reason, "Agent removed from registry");
        }
    }

    /// Health-sweep every session: drop the locally unhealthy outright, then
    /// heartbeat-probe the rest and drop the unresponsive. Returns how many
    /// sessions were removed.
    pub async fn sweep(&self) -> usize {
        let snapshot: Vec<Arc<TunnelSession>> =
            self.agents.read().await.values().cloned().collect();

        let mut removed = 0;
        for session in snapshot {
            if !session.socket_healthy() {
                self.remove(&session, "connection unhealthy").await;
                removed += 1;
                continue;
            }
            if let Err(e) = session.heartbeat(self.heartbeat_deadline).await {
                warn!(client = %session.name(), error = %e, "Heartbeat failed, removing agent");
                self.remove(&session, "heartbeat failed").await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Registry sweep removed dead agents");
        }
        removed
    }
}
