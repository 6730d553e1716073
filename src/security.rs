//! Per-IP suspicious-activity tracking with auto-ban and grace periods.
//!
//! The ledger is pure in-memory state shared between the tunnel listener
//! (records events, checks bans at accept time) and the admin API (manual
//! ban/unban, diagnostics). Three rules govern auto-banning:
//!
//! - `auth_tolerance` events of kind `AUTH_FAILED` within the window, or
//!   `max_attempts` of any other kind, ban the IP.
//! - `permanent_attempts` events ban unconditionally, window or not.
//! - An IP inside its post-unban grace window is never auto-banned.
//!
//! Tracking entries are garbage-collected after `gc_hours` of silence; the
//! ban set itself is never aged out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::BanConfig;

/// Classification of a suspicious event. Serialized names appear in admin
/// API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuspiciousKind {
    /// Wrong tunnel token. Gets the higher `auth_tolerance` threshold.
    AuthFailed,
    /// Frame-header garbage, HTTP on the tunnel port, or a malformed
    /// handshake sequence.
    InvalidProtocol,
    /// Well-tagged frame whose payload would not decode.
    StreamCorruption,
    /// Peer speaks an incompatible codec revision.
    ClassVersionMismatch,
    /// Connection dropped at a point no well-behaved peer drops at.
    UnexpectedTermination,
}

impl SuspiciousKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::InvalidProtocol => "INVALID_PROTOCOL",
            Self::StreamCorruption => "STREAM_CORRUPTION",
            Self::ClassVersionMismatch => "CLASS_VERSION_MISMATCH",
            Self::UnexpectedTermination => "UNEXPECTED_TERMINATION",
        }
    }
}

/// Tracked suspicious activity for one IP.
#[derive(Debug, Clone)]
struct AttemptRecord {
    count: u32,
    first_at: Instant,
    last_at: Instant,
    first_at_wall: DateTime<Local>,
    last_at_wall: DateTime<Local>,
    last_kind: SuspiciousKind,
}

#[derive(Default)]
struct LedgerState {
    banned: HashSet<String>,
    attempts: HashMap<String, AttemptRecord>,
    /// IP → unban instant; auto-ban is suppressed while inside the grace
    /// window measured from here.
    recently_unbanned: HashMap<String, Instant>,
}

/// Diagnostic snapshot for one IP, returned by the admin `check` action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoBanStatus {
    pub ip: String,
    pub banned: bool,
    pub in_grace: bool,
    pub grace_remaining_secs: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_attempt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_kind: Option<SuspiciousKind>,
    pub would_auto_ban: bool,
    pub reason: String,
}

/// One tracked IP in the full ledger snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedIp {
    pub ip: String,
    pub attempts: u32,
    pub first_attempt: String,
    pub last_attempt: String,
    pub last_kind: SuspiciousKind,
}

/// Full ledger snapshot for the admin status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub banned_ips: Vec<String>,
    pub tracked: Vec<TrackedIp>,
    pub in_grace: Vec<GraceEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraceEntry {
    pub ip: String,
    pub remaining_secs: u64,
}

/// Thread-safe suspicious-activity ledger. Cheap to clone; all clones share
/// state.
#[derive(Clone)]
pub struct SecurityLedger {
    inner: Arc<Mutex<LedgerState>>,
    config: BanConfig,
}

impl SecurityLedger {
    pub fn new(config: BanConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerState::default())),
            config,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_mins * 60)
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.grace_mins * 60)
    }

    fn gc_age(&self) -> Duration {
        Duration::from_secs(self.config.gc_hours * 3600)
    }

    /// O(1) ban check, called on every accept before any bytes are read.
    pub fn is_banned(&self, ip: &str) -> bool {
        self.inner.lock().unwrap().banned.contains(ip)
    }

    /// Record a suspicious event and apply the auto-ban rules.
    ///
    /// Returns `true` if this event caused the IP to be banned. IPs inside
    /// their grace window are left untouched apart from a debug trace.
    pub fn record_suspicious(&self, ip: &str, kind: SuspiciousKind) -> bool {
        let now = Instant::now();
        let mut state = self.inner.lock().unwrap();

        Self::sweep_locked(&mut state, now, self.grace(), self.gc_age());

        if let Some(unbanned_at) = state.recently_unbanned.get(ip) {
            if now.duration_since(*unbanned_at) <= self.grace() {
                debug!(ip, kind = kind.as_str(), "Suspicious event ignored (grace period)");
                return false;
            }
        }

        let wall = Local::now();
        let record = state
            .attempts
            .entry(ip.to_string())
            .or_insert_with(|| AttemptRecord {
                count: 0,
                first_at: now,
                last_at: now,
                first_at_wall: wall,
                last_at_wall: wall,
                last_kind: kind,
            });
        record.count += 1;
        record.last_at = now;
        record.last_at_wall = wall;
        record.last_kind = kind;

        let count = record.count;
        let elapsed = now.duration_since(record.first_at);
        let threshold = if kind == SuspiciousKind::AuthFailed {
            self.config.auth_tolerance
        } else {
            self.config.max_attempts
        };

        let should_ban = count >= self.config.permanent_attempts
            || (count >= threshold && elapsed <= self.window());

        if should_ban && state.banned.insert(ip.to_string()) {
            warn!(
                ip,
                kind = kind.as_str(),
                attempts = count,
                "Auto-banned IP after repeated suspicious activity"
            );
            return true;
        }

        debug!(ip, kind = kind.as_str(), attempts = count, "Recorded suspicious event");
        false
    }

    /// Manually ban an IP. Returns `false` if it was already banned.
    pub fn ban(&self, ip: &str) -> bool {
        let newly = self.inner.lock().unwrap().banned.insert(ip.to_string());
        if newly {
            warn!(ip, "IP banned by admin");
        }
        newly
    }

    /// Manually unban an IP: removes it from the ban set, clears its attempt
    /// tracking, and opens its grace window. Returns whether the IP was
    /// actually banned.
    pub fn unban(&self, ip: &str) -> bool {
        let mut state = self.inner.lock().unwrap();
        let was_banned = state.banned.remove(ip);
        state.attempts.remove(ip);
        state.recently_unbanned.insert(ip.to_string(), Instant::now());
        if was_banned {
            warn!(ip, grace_mins = self.config.grace_mins, "IP unbanned by admin");
        }
        was_banned
    }

    /// Diagnostic read for one IP. Never mutates.
    pub fn auto_ban_status(&self, ip: &str) -> AutoBanStatus {
        let now = Instant::now();
        let state = self.inner.lock().unwrap();

        let banned = state.banned.contains(ip);
        let grace_remaining = state
            .recently_unbanned
            .get(ip)
            .map(|at| self.grace().saturating_sub(now.duration_since(*at)))
            .unwrap_or(Duration::ZERO);
        let in_grace = grace_remaining > Duration::ZERO;

        let record = state.attempts.get(ip);
        let attempts = record.map_or(0, |r| r.count);

        let (would_auto_ban, reason) = if banned {
            (false, "already banned".to_string())
        } else if in_grace {
            (
                false,
                format!("grace period active ({}s remaining)", grace_remaining.as_secs()),
            )
        } else if let Some(r) = record {
            let threshold = if r.last_kind == SuspiciousKind::AuthFailed {
                self.config.auth_tolerance
            } else {
                self.config.max_attempts
            };
            let next = r.count + 1;
            if next >= self.config.permanent_attempts {
                (true, format!("next event reaches permanent threshold {}", self.config.permanent_attempts))
            } else if next >= threshold && now.duration_since(r.first_at) <= self.window() {
                (true, format!("next event reaches threshold {threshold} inside window"))
            } else {
                (false, format!("{} of {threshold} events inside window", r.count))
            }
        } else {
            (false, "no recorded activity".to_string())
        };

        AutoBanStatus {
            ip: ip.to_string(),
            banned,
            in_grace,
            grace_remaining_secs: grace_remaining.as_secs(),
            attempts,
            first_attempt: record.map(|r| fmt_wall(r.first_at_wall)),
            last_attempt: record.map(|r| fmt_wall(r.last_at_wall)),
            last_kind: record.map(|r| r.last_kind),
            would_auto_ban,
            reason,
        }
    }

    /// Full snapshot for the admin status endpoints.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let now = Instant::now();
        let state = self.inner.lock().unwrap();

        let mut banned_ips: Vec<String> = state.banned.iter().cloned().collect();
        banned_ips.sort();

        let mut tracked: Vec<TrackedIp> = state
            .attempts
            .iter()
            .map(|(ip, r)| TrackedIp {
                ip: ip.clone(),
                attempts: r.count,
                first_attempt: fmt_wall(r.first_at_wall),
                last_attempt: fmt_wall(r.last_at_wall),
                last_kind: r.last_kind,
            })
            .collect();
        tracked.sort_by(|a, b| a.ip.cmp(&b.ip));

        let mut in_grace: Vec<GraceEntry> = state
            .recently_unbanned
            .iter()
            .filter_map(|(ip, at)| {
                let remaining = self.grace().saturating_sub(now.duration_since(*at));
                (remaining > Duration::ZERO).then(|| GraceEntry {
                    ip: ip.clone(),
                    remaining_secs: remaining.as_secs(),
                })
            })
            .collect();
        in_grace.sort_by(|a, b| a.ip.cmp(&b.ip));

        LedgerSnapshot {
            banned_ips,
            tracked,
            in_grace,
        }
    }

    /// Drop attempt tracking idle past the GC horizon and expired grace
    /// entries. Runs opportunistically from [`Self::record_suspicious`].
    fn sweep_locked(state: &mut LedgerState, now: Instant, grace: Duration, gc_age: Duration) {
        state
            .attempts
            .retain(|_, r| now.duration_since(r.last_at) <= gc_age);
        state
            .recently_unbanned
            .retain(|_, at| now.duration_since(*at) <= grace);
    }
}

fn fmt_wall(dt: DateTime<Local>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}
