//! Small helpers shared across modules.

use std::time::Duration;

use chrono::Local;

/// Current local time as an ISO-8601 string with millisecond precision.
///
/// Every JSON response carries one of these so callers can correlate
/// gateway responses with their own logs.
pub fn now_iso() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// Format a duration in the coarsest unit that is at least 1.
///
/// - `"2 hours, 13 minutes"`
/// - `"5 minutes, 42 seconds"`
/// - `"45 seconds"`
pub fn format_uptime(uptime: Duration) -> String {
    let seconds = uptime.as_secs();
    let minutes = seconds / 60;
    let hours = minutes / 60;

    if hours > 0 {
        format!("{} hours, {} minutes", hours, minutes % 60)
    } else if minutes > 0 {
        format!("{} minutes, {} seconds", minutes, seconds % 60)
    } else {
        format!("{seconds} seconds")
    }
}
