use std::time::Duration;
use tracing::warn;

use crate::clock::duration_from_secs;

/// Backoff multiplier ceiling relative to the base delay.
pub const MAX_BACKOFF_FACTOR: f64 = 6.0;

/// Linear backoff capped at `MAX_BACKOFF_FACTOR` times the base.
///
/// Returns `base * min(6, 1 + 0.5 * failures)`.
pub fn backoff_secs(base_secs: f64, failures: u32) -> f64 {
    let factor = (1.0 + 0.5 * f64::from(failures)).min(MAX_BACKOFF_FACTOR);
    base_secs.max(0.0) * factor
}

/// Decision returned by the restart policy after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RestartDecision {
    /// Budget remains: sleep this long, then spawn the next attempt.
    Restart { failures: u32, backoff: Duration },
    /// `failures > max_restarts`: stop supervising.
    Exhausted { failures: u32 },
}

/// Restart policy for crashed, hung or unspawnable children.
///
/// Counts failures for the whole life of the supervisor (never reset by a
/// later healthy attempt) and decides whether another attempt is allowed.
pub struct RestartPolicy {
    max_restarts: u32,
    base_backoff_secs: f64,
    failures: u32,
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, base_backoff_secs: f64) -> Self {
        Self {
            max_restarts,
            base_backoff_secs,
            failures: 0,
        }
    }

    /// Cumulative failure count.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// True once more failures have happened than restarts are allowed.
    pub fn exhausted(&self) -> bool {
        self.failures > self.max_restarts
    }

    /// Count one failed attempt and decide what happens next.
    pub fn record_failure(&mut self) -> RestartDecision {
        self.failures += 1;

        if self.exhausted() {
            warn!(
                failures = self.failures,
                max_restarts = self.max_restarts,
                "restart budget exhausted"
            );
            RestartDecision::Exhausted {
                failures: self.failures,
            }
        } else {
            let secs = backoff_secs(self.base_backoff_secs, self.failures);
            warn!(
                failures = self.failures,
                max_restarts = self.max_restarts,
                backoff_secs = secs,
                "attempt failed, restarting after backoff"
            );
            RestartDecision::Restart {
                failures: self.failures,
                backoff: duration_from_secs(secs),
            }
        }
    }
}
