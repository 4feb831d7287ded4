//! Output-growth watchdog.
//!
//! Classifies "seconds since the child last produced output" into ordered
//! severity stages. The classifier is a pure function; [`WatchdogClock`] holds
//! the per-attempt bookkeeping (last observed byte count, current stage,
//! degrade level, countdown throttle) and is fed one observation per poll tick.

use serde::Serialize;
use std::time::Instant;

use crate::clock::secs_between;

/// Escalating severity of "no observable output".
///
/// Declaration order is severity order. `Washout` is supervisor-level and is
/// never returned by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum WatchdogStage {
    Ok = 0,
    Surge = 1,
    Spill = 2,
    Breach = 3,
    Washout = 4,
}

impl WatchdogStage {
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            WatchdogStage::Ok => "OK",
            WatchdogStage::Surge => "SURGE",
            WatchdogStage::Spill => "SPILL",
            WatchdogStage::Breach => "BREACH",
            WatchdogStage::Washout => "WASHOUT",
        }
    }
}

impl std::fmt::Display for WatchdogStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Classify `no_output_s` against the stage thresholds.
///
/// A non-positive `breach_s` disables the watchdog entirely.
pub fn classify(no_output_s: f64, surge_s: f64, spill_s: f64, breach_s: f64) -> WatchdogStage {
    if breach_s <= 0.0 {
        return WatchdogStage::Ok;
    }
    if no_output_s >= breach_s {
        return WatchdogStage::Breach;
    }
    if spill_s > 0.0 && no_output_s >= spill_s {
        return WatchdogStage::Spill;
    }
    if surge_s > 0.0 && no_output_s >= surge_s {
        return WatchdogStage::Surge;
    }
    WatchdogStage::Ok
}

/// Validated stage thresholds in seconds.
///
/// Either all zero (disabled) or `0 < surge < spill < breach`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub surge_s: f64,
    pub spill_s: f64,
    pub breach_s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdError {
    pub surge_s: f64,
    pub spill_s: f64,
    pub breach_s: f64,
}

impl std::fmt::Display for ThresholdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "watchdog thresholds must satisfy 0 < surge < spill < breach \
             (got surge={:.1}s spill={:.1}s breach={:.1}s; breach must be at least 3s)",
            self.surge_s, self.spill_s, self.breach_s
        )
    }
}

impl std::error::Error for ThresholdError {}

impl Thresholds {
    pub const DISABLED: Thresholds = Thresholds {
        surge_s: 0.0,
        spill_s: 0.0,
        breach_s: 0.0,
    };

    /// Derive missing (zero) or out-of-range surge/spill values from the
    /// breach threshold, then validate the ordering.
    pub fn derive(breach_s: u64, surge_s: u64, spill_s: u64) -> Result<Self, ThresholdError> {
        if breach_s == 0 {
            return Ok(Self::DISABLED);
        }
        let breach = breach_s as f64;
        let mut surge = surge_s as f64;
        let mut spill = spill_s as f64;

        if surge <= 0.0 || surge >= breach {
            surge = (breach / 3.0).max(1.0);
        }
        if spill <= 0.0 || spill >= breach {
            spill = (2.0 * breach / 3.0).max(surge + 1.0);
        }
        if spill <= surge {
            spill = surge + 1.0;
        }

        let t = Thresholds {
            surge_s: surge,
            spill_s: spill,
            breach_s: breach,
        };
        t.validate()?;
        Ok(t)
    }

    pub fn validate(&self) -> Result<(), ThresholdError> {
        if !self.enabled() {
            return Ok(());
        }
        if 0.0 < self.surge_s && self.surge_s < self.spill_s && self.spill_s < self.breach_s {
            Ok(())
        } else {
            Err(ThresholdError {
                surge_s: self.surge_s,
                spill_s: self.spill_s,
                breach_s: self.breach_s,
            })
        }
    }

    pub fn enabled(&self) -> bool {
        self.breach_s > 0.0
    }

    pub fn classify(&self, no_output_s: f64) -> WatchdogStage {
        classify(no_output_s, self.surge_s, self.spill_s, self.breach_s)
    }

    /// The stage after `stage` and the threshold at which it fires.
    pub fn next_after(&self, stage: WatchdogStage) -> Option<(WatchdogStage, f64)> {
        match stage {
            WatchdogStage::Ok => Some((WatchdogStage::Surge, self.surge_s)),
            WatchdogStage::Surge => Some((WatchdogStage::Spill, self.spill_s)),
            WatchdogStage::Spill => Some((WatchdogStage::Breach, self.breach_s)),
            WatchdogStage::Breach | WatchdogStage::Washout => None,
        }
    }
}

/// A stage change observed on one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: WatchdogStage,
    pub to: WatchdogStage,
    pub no_output_s: f64,
    /// `no_output` when escalating, `output_resumed` when recovering.
    pub reason: &'static str,
    /// Set when this transition is the first SPILL entry of the attempt.
    pub enter_degrade: bool,
}

/// Informational "next stage in N seconds" line.
#[derive(Debug, Clone, PartialEq)]
pub struct Countdown {
    pub stage: WatchdogStage,
    pub next: Option<WatchdogStage>,
    pub next_in_s: f64,
    pub no_output_s: f64,
}

/// Per-attempt watchdog bookkeeping.
#[derive(Debug)]
pub struct WatchdogClock {
    thresholds: Thresholds,
    stage: WatchdogStage,
    last_bytes: u64,
    last_activity: Instant,
    last_countdown: Option<Instant>,
    countdown_every_s: f64,
    degrade_level: String,
}

pub const DEGRADE_SPILL: &str = "spill";

impl WatchdogClock {
    /// Start a clock for a fresh attempt whose output files currently hold
    /// `initial_bytes` bytes.
    pub fn start(thresholds: Thresholds, poll_interval_s: f64, initial_bytes: u64, now: Instant) -> Self {
        Self {
            thresholds,
            stage: WatchdogStage::Ok,
            last_bytes: initial_bytes,
            last_activity: now,
            last_countdown: None,
            countdown_every_s: poll_interval_s.max(5.0),
            degrade_level: String::new(),
        }
    }

    pub fn stage(&self) -> WatchdogStage {
        self.stage
    }

    /// Combined output size seen on the last observation.
    pub fn last_bytes(&self) -> u64 {
        self.last_bytes
    }

    pub fn degrade_level(&self) -> &str {
        &self.degrade_level
    }

    pub fn no_output_s(&self, now: Instant) -> f64 {
        secs_between(self.last_activity, now)
    }

    /// Feed one observation of the combined output size.
    ///
    /// Any change in size counts as activity and resets the no-output clock.
    /// Returns the transition if the stage changed. With the watchdog disabled
    /// this only tracks activity.
    pub fn observe(&mut self, total_bytes: u64, now: Instant) -> Option<Transition> {
        if total_bytes != self.last_bytes {
            self.last_bytes = total_bytes;
            self.last_activity = now;
        }
        if !self.thresholds.enabled() {
            return None;
        }

        let no_output_s = self.no_output_s(now);
        let next = self.thresholds.classify(no_output_s);
        if next == self.stage {
            return None;
        }

        let from = self.stage;
        self.stage = next;
        let enter_degrade = next == WatchdogStage::Spill && self.degrade_level != DEGRADE_SPILL;
        if enter_degrade {
            self.degrade_level = DEGRADE_SPILL.to_string();
        }
        Some(Transition {
            from,
            to: next,
            no_output_s,
            reason: if next < from { "output_resumed" } else { "no_output" },
            enter_degrade,
        })
    }

    /// Countdown line while at SURGE or worse, throttled to once per
    /// `max(5s, poll_interval)`.
    pub fn countdown(&mut self, now: Instant) -> Option<Countdown> {
        if !self.thresholds.enabled() || self.stage < WatchdogStage::Surge {
            return None;
        }
        if let Some(last) = self.last_countdown {
            if secs_between(last, now) < self.countdown_every_s {
                return None;
            }
        }
        self.last_countdown = Some(now);

        let no_output_s = self.no_output_s(now);
        let (next, next_in_s) = match self.thresholds.next_after(self.stage) {
            Some((stage, at)) => (Some(stage), (at - no_output_s).max(0.0)),
            None => (None, 0.0),
        };
        Some(Countdown {
            stage: self.stage,
            next,
            next_in_s,
            no_output_s,
        })
    }
}
