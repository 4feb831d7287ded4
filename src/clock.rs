/// Wall-clock stamps and monotonic elapsed-time helpers.
///
/// Everything persisted to disk is stamped in UTC; durations that drive the
/// watchdog and backoff are always measured on the monotonic clock.
use chrono::{Local, Utc};
use std::time::{Duration, Instant};

/// UTC timestamp for logs and JSON payloads, e.g. `2026-02-15T08:30:00Z`.
pub fn utc_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Compact local timestamp used to name default job roots, e.g. `20260215_083000`.
pub fn compact_local() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Seconds elapsed between two instants as `f64`, saturating at zero.
pub fn secs_between(earlier: Instant, later: Instant) -> f64 {
    later.saturating_duration_since(earlier).as_secs_f64()
}

/// Convert a non-negative seconds value into a `Duration`.
///
/// Negative, NaN and infinite inputs map to `Duration::ZERO`; values too
/// large for a `Duration` saturate.
pub fn duration_from_secs(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}
