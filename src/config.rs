//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `LANLINK_TUNNEL_TOKEN`, `LANLINK_ADMIN_KEY`,
//!    `LANLINK_TUNNEL_LISTEN`, `LANLINK_HTTP_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `lanlink.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [gateway]
//! tunnel_listen = "0.0.0.0:5000"
//! http_listen = "0.0.0.0:9990"
//! max_frame_bytes = 67108864  # 64 MiB
//!
//! [auth]
//! tunnel_token = "shared-agent-secret"
//! admin_api_key = "admin-secret"
//!
//! [ban]
//! max_attempts = 5        # suspicious events before windowed auto-ban
//! window_mins = 15        # auto-ban window
//! permanent_attempts = 15 # unconditional ban threshold
//! auth_tolerance = 8      # higher threshold for plain auth failures
//! grace_mins = 30         # no auto-ban after a manual unban
//! gc_hours = 24           # drop stale attempt tracking
//!
//! [timeouts]
//! handshake_secs = 30
//! dispatch_secs = 30
//! heartbeat_secs = 10
//! sweep_interval_secs = 60
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub ban: BanConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener addresses and wire limits.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Socket address for agent tunnel connections (default `0.0.0.0:5000`).
    #[serde(default = "default_tunnel_listen")]
    pub tunnel_listen: String,
    /// Socket address for the HTTP API (default `0.0.0.0:9990`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Maximum accepted frame payload in bytes (default 64 MiB). Kept above
    /// the agent-side 50 MiB response cap; guards against corrupted length
    /// prefixes, not against large legitimate responses.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Maximum connection-log entries kept in memory (default 1000).
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

/// Shared secrets for agents and admins.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Token agents must present as their first frame. Override with
    /// `LANLINK_TUNNEL_TOKEN`. Defaults to `"change-me"` which triggers a
    /// startup warning.
    #[serde(default = "default_secret")]
    pub tunnel_token: String,
    /// API key for `/api/forward` and admin endpoints. Override with
    /// `LANLINK_ADMIN_KEY`.
    #[serde(default = "default_secret")]
    pub admin_api_key: String,
}

/// Auto-ban thresholds for the security ledger.
#[derive(Debug, Clone, Deserialize)]
pub struct BanConfig {
    /// Suspicious events before a windowed auto-ban (default 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Window in minutes for the windowed auto-ban (default 15).
    #[serde(default = "default_window_mins")]
    pub window_mins: u64,
    /// Event count that bans unconditionally, regardless of window (default 15).
    #[serde(default = "default_permanent_attempts")]
    pub permanent_attempts: u32,
    /// Threshold used instead of `max_attempts` for plain auth failures
    /// (default 8). Mistyped tokens are common; don't ban as eagerly.
    #[serde(default = "default_auth_tolerance")]
    pub auth_tolerance: u32,
    /// Minutes after a manual unban during which auto-ban is suppressed
    /// (default 30).
    #[serde(default = "default_grace_mins")]
    pub grace_mins: u64,
    /// Hours after which idle attempt tracking is dropped (default 24).
    /// Bans themselves are never aged out.
    #[serde(default = "default_gc_hours")]
    pub gc_hours: u64,
}

/// Deadlines for tunnel operations.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Per-read deadline during the handshake (default 30).
    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,
    /// Deadline for the paired response read of a forward (default 30).
    #[serde(default = "default_dispatch_secs")]
    pub dispatch_secs: u64,
    /// Deadline for a heartbeat probe response (default 10).
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Seconds between registry health sweeps (default 60).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_tunnel_listen() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_http_listen() -> String {
    "0.0.0.0:9990".to_string()
}
fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_max_log_entries() -> usize {
    1000
}
fn default_secret() -> String {
    "change-me".to_string()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_window_mins() -> u64 {
    15
}
fn default_permanent_attempts() -> u32 {
    15
}
fn default_auth_tolerance() -> u32 {
    8
}
fn default_grace_mins() -> u64 {
    30
}
fn default_gc_hours() -> u64 {
    24
}
fn default_handshake_secs() -> u64 {
    30
}
fn default_dispatch_secs() -> u64 {
    30
}
fn default_heartbeat_secs() -> u64 {
    10
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tunnel_listen: default_tunnel_listen(),
            http_listen: default_http_listen(),
            max_frame_bytes: default_max_frame_bytes(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tunnel_token: default_secret(),
            admin_api_key: default_secret(),
        }
    }
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_mins: default_window_mins(),
            permanent_attempts: default_permanent_attempts(),
            auth_tolerance: default_auth_tolerance(),
            grace_mins: default_grace_mins(),
            gc_hours: default_gc_hours(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_secs: default_handshake_secs(),
            dispatch_secs: default_dispatch_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            auth: AuthConfig::default(),
            ban: BanConfig::default(),
            timeouts: TimeoutConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }
    pub fn dispatch(&self) -> Duration {
        Duration::from_secs(self.dispatch_secs)
    }
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `lanlink.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("lanlink.toml").exists() {
            let content =
                std::fs::read_to_string("lanlink.toml").expect("Failed to read lanlink.toml");
            toml::from_str(&content).expect("Failed to parse lanlink.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(token) = std::env::var("LANLINK_TUNNEL_TOKEN") {
            config.auth.tunnel_token = token;
        }
        if let Ok(key) = std::env::var("LANLINK_ADMIN_KEY") {
            config.auth.admin_api_key = key;
        }
        if let Ok(listen) = std::env::var("LANLINK_TUNNEL_LISTEN") {
            config.gateway.tunnel_listen = listen;
        }
        if let Ok(listen) = std::env::var("LANLINK_HTTP_LISTEN") {
            config.gateway.http_listen = listen;
        }

        config
    }
}
