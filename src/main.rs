//! # lanlink
//!
//! Reverse HTTP tunnel gateway. Agents behind NAT/firewalls dial out to the
//! tunnel port, authenticate with a shared token, and register by name;
//! external callers address them through the HTTP API and the gateway relays
//! requests over the established tunnels.
//!
//! ## API surface
//!
//! | Method | Path                              | Auth  | Description                        |
//! |--------|-----------------------------------|-------|------------------------------------|
//! | POST   | `/api/forward`                    | admin | Forward a request to a named agent |
//! | GET    | `/api/health`                     | No    | Gateway + connected-agent overview |
//! | GET    | `/api/health/{name}`              | No    | Per-agent connectivity check       |
//! | GET    | `/api/security-status`            | admin | Ban/attempt ledger snapshot        |
//! | POST   | `/api/admin/security`             | admin | ban / unban / status / check       |
//! | POST   | `/api/cleanup-connections`        | admin | Synchronous registry sweep         |
//! | GET    | `/api/admin/connection-logs`      | admin | Filtered connection events         |
//! | POST   | `/api/admin/connection-logs/clear`| admin | Empty the event ring               |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, router setup, background tasks, shutdown
//! config.rs        — TOML + env-var configuration
//! auth.rs          — admin key middleware, constant-time comparison
//! state.rs         — AppState (registry, ledger, connection log)
//! registry.rs      — name → session map, forwarding, health sweep
//! security.rs      — per-IP suspicious-activity ledger, auto-ban, grace
//! connlog.rs       — bounded connect/disconnect event ring
//! envelope.rs      — Headers:/Body-Base64: response wrapper
//! tunnel/
//!   codec.rs       — tagged length-prefixed frames
//!   session.rs     — per-agent session, dispatch, heartbeat
//!   listener.rs    — accept loop, ban gate, handshake
//! routes/
//!   health.rs      — open health endpoints
//!   forward.rs     — authenticated forward + envelope unwrap
//!   admin.rs       — security/cleanup/log administration
//! ```

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use lanlink::config::Config;
use lanlink::routes;
use lanlink::state::AppState;
use lanlink::tunnel::listener;

/// Reverse HTTP tunnel gateway.
#[derive(Parser)]
#[command(name = "lanlink", version)]
struct Cli {
    /// Path to TOML config file (default: ./lanlink.toml if present).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("lanlink v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Tunnel listener: {}", config.gateway.tunnel_listen);
    info!("HTTP listener: {}", config.gateway.http_listen);

    if config.auth.tunnel_token == "change-me" {
        warn!("Using default tunnel token — set LANLINK_TUNNEL_TOKEN or update config");
    }
    if config.auth.admin_api_key == "change-me" {
        warn!("Using default admin API key — set LANLINK_ADMIN_KEY or update config");
    }

    let state = AppState::new(config);

    let tunnel_listener = bind_or_die(&state.config.gateway.tunnel_listen, "tunnel").await;
    let http_listener = bind_or_die(&state.config.gateway.http_listen, "HTTP").await;

    let tunnel_task = tokio::spawn(listener::run(state.clone(), tunnel_listener));

    // Periodic sweep: drop unhealthy sessions, heartbeat-probe the rest.
    // The sweep is awaited in this task, so ticks never overlap; a sweep
    // outlasting the interval causes ticks to be skipped, not queued.
    let sweep_state = state.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_state.config.timeouts.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup isn't a sweep
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep_state.registry.sweep().await;
        }
    });

    let app = routes::api_router(state);

    info!("Gateway ready");

    // Graceful shutdown on SIGINT/SIGTERM
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    if let Err(e) = axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "HTTP server error");
        std::process::exit(1);
    }

    info!("Shutting down...");
    sweep_task.abort();
    tunnel_task.abort();
    info!("Goodbye");
}

/// Bind a TCP listener or exit with a classified fatal error.
async fn bind_or_die(addr: &str, label: &str) -> TcpListener {
    match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let diagnosis = match e.kind() {
                std::io::ErrorKind::AddrInUse => "address already in use",
                std::io::ErrorKind::PermissionDenied => {
                    "permission denied (privileged port without privileges?)"
                }
                _ => "bind failed",
            };
            error!(addr, listener = label, error = %e, "Fatal: {diagnosis}");
            std::process::exit(1);
        }
    }
}
