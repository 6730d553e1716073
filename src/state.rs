//! Shared application state passed to every handler via Axum's `State`
//! extractor and into the tunnel listener.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::connlog::ConnectionLog;
use crate::registry::AgentRegistry;
use crate::security::SecurityLedger;

/// Shared gateway state. One value owns the registry, ledger, and log; the
/// HTTP handlers, tunnel listener, and maintenance sweep all hold clones.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the gateway started (for uptime reporting).
    pub start_time: Instant,
    /// Name → live agent session.
    pub registry: AgentRegistry,
    /// Per-IP suspicious-activity tracking and ban set.
    pub ledger: SecurityLedger,
    /// Bounded ring of connect/disconnect events.
    pub connection_log: ConnectionLog,
}

impl AppState {
    /// Wire up a fresh gateway from configuration. Tests construct one per
    /// case; nothing here is global.
    pub fn new(config: Config) -> Self {
        let connection_log = ConnectionLog::new(config.gateway.max_log_entries);
        let registry = AgentRegistry::new(
            connection_log.clone(),
            config.timeouts.dispatch(),
            config.timeouts.heartbeat(),
        );
        let ledger = SecurityLedger::new(config.ban.clone());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            ledger,
            connection_log,
        }
    }
}
