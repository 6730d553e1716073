//! In-memory log of agent connect/disconnect events.
//!
//! Fixed-size ring buffer: when full, the oldest entries are silently
//! dropped. Disconnects for connections that never completed the handshake
//! (no agent name) are suppressed entirely — port scanners would otherwise
//! fill the ring with noise. Statistics are computed by scanning the current
//! snapshot; there are no pre-aggregated counters to drift.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::util::now_iso;

/// What happened to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionEvent {
    Connect,
    Disconnect,
}

impl ConnectionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Disconnect => "DISCONNECT",
        }
    }

    /// Parse an `eventType` query value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CONNECT" => Some(Self::Connect),
            "DISCONNECT" => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// One logged connection event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLogEntry {
    pub event: ConnectionEvent,
    /// ISO-8601 local time with millisecond precision.
    pub timestamp: String,
    pub client_name: String,
    pub client_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable one-liner mirroring what goes to the tracing log.
    pub message: String,
}

/// Aggregate statistics over the current ring contents.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatistics {
    pub total_connections: usize,
    pub total_disconnections: usize,
    pub unique_clients: usize,
    pub total_log_entries: usize,
    pub max_log_entries: usize,
}

/// Bounded, thread-safe connection event log. Cheap to clone; all clones
/// share the same ring.
#[derive(Clone)]
pub struct ConnectionLog {
    entries: Arc<RwLock<VecDeque<ConnectionLogEntry>>>,
    max_entries: usize,
}

impl ConnectionLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(max_entries.min(256)))),
            max_entries,
        }
    }

    /// Record a successful agent registration.
    pub async fn log_connect(&self, client_name: &str, client_ip: &str) {
        let message = format!("Client '{client_name}' connected from {client_ip}");
        info!("CONNECTION_LOG: {message}");
        self.push(ConnectionLogEntry {
            event: ConnectionEvent::Connect,
            timestamp: now_iso(),
            client_name: client_name.to_string(),
            client_ip: client_ip.to_string(),
            reason: None,
            message,
        })
        .await;
    }

    /// Record an agent disconnect.
    ///
    /// `client_name` is `None` when the connection never completed the
    /// handshake; those disconnects are dropped without logging.
    pub async fn log_disconnect(
        &self,
        client_name: Option<&str>,
        client_ip: &str,
        reason: Option<&str>,
    ) {
        let Some(name) = client_name.filter(|n| !n.is_empty()) else {
            debug!(client_ip, "Unregistered connection closed (not logged)");
            return;
        };

        let mut message = format!("Client '{name}' disconnected from {client_ip}");
        if let Some(r) = reason.filter(|r| !r.trim().is_empty()) {
            message.push_str(" - Reason: ");
            message.push_str(r);
        }
        info!("CONNECTION_LOG: {message}");

        self.push(ConnectionLogEntry {
            event: ConnectionEvent::Disconnect,
            timestamp: now_iso(),
            client_name: name.to_string(),
            client_ip: client_ip.to_string(),
            reason: reason.map(ToString::to_string),
            message,
        })
        .await;
    }

    async fn push(&self, entry: ConnectionLogEntry) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// All entries, oldest first.
    pub async fn all(&self) -> Vec<ConnectionLogEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    /// Entries matching the given filters, oldest first. A `limit` keeps only
    /// the most recent N of the filtered set.
    pub async fn query(
        &self,
        event: Option<ConnectionEvent>,
        client_name: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<ConnectionLogEntry> {
        let entries = self.entries.read().await;
        let filtered: Vec<ConnectionLogEntry> = entries
            .iter()
            .filter(|e| event.is_none_or(|ev| e.event == ev))
            .filter(|e| client_name.is_none_or(|n| e.client_name == n))
            .cloned()
            .collect();
        match limit {
            Some(n) if filtered.len() > n => filtered[filtered.len() - n..].to_vec(),
            _ => filtered,
        }
    }

    /// Scan the ring and compute aggregate statistics.
    pub async fn statistics(&self) -> ConnectionStatistics {
        let entries = self.entries.read().await;
        let total_connections = entries
            .iter()
            .filter(|e| e.event == ConnectionEvent::Connect)
            .count();
        let total_disconnections = entries.len() - total_connections;
        let unique_clients = entries
            .iter()
            .map(|e| e.client_name.as_str())
            .collect::<HashSet<_>>()
            .len();

        ConnectionStatistics {
            total_connections,
            total_disconnections,
            unique_clients,
            total_log_entries: entries.len(),
            max_log_entries: self.max_entries,
        }
    }

    /// Empty the ring.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        info!("CONNECTION_LOG: All connection logs cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_disconnect_logged() {
        let log = ConnectionLog::new(10);
        log.log_connect("cam1", "10.0.0.5").await;
        log.log_disconnect(Some("cam1"), "10.0.0.5", Some("heartbeat failed"))
            .await;

        let entries = log.all().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, ConnectionEvent::Connect);
        assert_eq!(entries[0].message, "Client 'cam1' connected from 10.0.0.5");
        assert_eq!(entries[1].event, ConnectionEvent::Disconnect);
        assert_eq!(
            entries[1].message,
            "Client 'cam1' disconnected from 10.0.0.5 - Reason: heartbeat failed"
        );
    }

    #[tokio::test]
    async fn test_unnamed_disconnect_suppressed() {
        let log = ConnectionLog::new(10);
        log.log_disconnect(None, "10.0.0.9", Some("auth failed")).await;
        log.log_disconnect(Some(""), "10.0.0.9", None).await;
        assert!(log.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_ring_drops_oldest_on_overflow() {
        let log = ConnectionLog::new(3);
        for i in 0..5 {
            log.log_connect(&format!("c{i}"), "10.0.0.1").await;
        }
        let entries = log.all().await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].client_name, "c2");
        assert_eq!(entries[2].client_name, "c4");
    }

    #[tokio::test]
    async fn test_query_filters_and_limit() {
        let log = ConnectionLog::new(100);
        log.log_connect("a", "ip1").await;
        log.log_connect("b", "ip2").await;
        log.log_disconnect(Some("a"), "ip1", None).await;
        log.log_connect("a", "ip1").await;

        let connects = log.query(Some(ConnectionEvent::Connect), None, None).await;
        assert_eq!(connects.len(), 3);

        let for_a = log.query(None, Some("a"), None).await;
        assert_eq!(for_a.len(), 3);

        let recent = log.query(None, Some("a"), Some(2)).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event, ConnectionEvent::Disconnect);
        assert_eq!(recent[1].event, ConnectionEvent::Connect);
    }

    #[tokio::test]
    async fn test_statistics_by_scan() {
        let log = ConnectionLog::new(100);
        log.log_connect("a", "ip1").await;
        log.log_connect("b", "ip2").await;
        log.log_disconnect(Some("a"), "ip1", None).await;

        let stats = log.statistics().await;
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.total_disconnections, 1);
        assert_eq!(stats.unique_clients, 2);
        assert_eq!(stats.total_log_entries, 3);
        assert_eq!(stats.max_log_entries, 100);
    }

    #[tokio::test]
    async fn test_clear() {
        let log = ConnectionLog::new(10);
        log.log_connect("a", "ip1").await;
        log.clear().await;
        assert!(log.all().await.is_empty());
        assert_eq!(log.statistics().await.total_log_entries, 0);
    }
}
