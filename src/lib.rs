#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]

//! lanlink library — the reverse HTTP tunnel gateway's building blocks.
//!
//! - `tunnel` — framed wire codec, agent sessions, tunnel listener
//! - `registry` — name → session map, forwarding, health sweep
//! - `security` — per-IP suspicious-activity ledger with auto-ban
//! - `connlog` — bounded connect/disconnect event log
//! - `envelope` — the `Headers:`/`Body-Base64:` agent response wrapper
//! - `routes` — HTTP API handlers and router assembly
//! - `auth` — admin API key authentication
//! - `config` — TOML + env-var configuration

pub mod auth;
pub mod config;
pub mod connlog;
pub mod envelope;
pub mod registry;
pub mod routes;
pub mod security;
pub mod state;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use connlog::ConnectionLog;
pub use registry::AgentRegistry;
pub use security::SecurityLedger;
pub use state::AppState;
pub use tunnel::{TunnelRequest, TunnelResponse};
