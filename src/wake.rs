//! Wake trigger: a small JSON file telling an external agent why it should
//! re-engage with a job.
//!
//! At most one trigger is meant to be outstanding. The external agent consumes
//! (deletes) it; the supervisor only ever checks for existence and writes.
//! Check-then-write is racy against a concurrent consumer, which is accepted
//! for a best-effort channel.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::clock::utc_iso;
use crate::persist::{self, PersistError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    Heartbeat,
    Crash,
    Done,
    MaxRestarts,
    Washout,
}

impl WakeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            WakeReason::Heartbeat => "heartbeat",
            WakeReason::Crash => "crash",
            WakeReason::Done => "done",
            WakeReason::MaxRestarts => "max_restarts",
            WakeReason::Washout => "washout",
        }
    }

    /// Terminal reasons end supervision and replace an outstanding trigger.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WakeReason::Done | WakeReason::MaxRestarts | WakeReason::Washout
        )
    }
}

/// The JSON payload of `wake_trigger.json`.
#[derive(Debug, Clone, Serialize)]
pub struct WakeTrigger {
    pub version: u32,
    pub created_utc: String,
    pub wake_after_s: u64,
    pub memo: String,
    pub reason: WakeReason,
    pub job_root: String,
    pub attempt: u32,
    /// Supervisor pid (not the child's).
    pub pid: u32,
    pub window_title: String,
}

/// What `WakeEmitter::emit` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Written,
    /// A terminal trigger replaced one that was never consumed.
    Replaced,
    /// An outstanding trigger was left untouched.
    Suppressed,
}

/// Writes wake triggers for one job.
#[derive(Debug, Clone)]
pub struct WakeEmitter {
    path: PathBuf,
    job_root: String,
    wake_after_s: u64,
    window_title: String,
    pid: u32,
}

impl WakeEmitter {
    pub fn new(path: PathBuf, job_root: &Path, wake_after_s: u64, window_title: String) -> Self {
        Self {
            path,
            job_root: job_root.display().to_string(),
            wake_after_s,
            window_title,
            pid: std::process::id(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if a trigger is waiting to be consumed.
    pub fn outstanding(&self) -> bool {
        self.path.exists()
    }

    pub fn build(&self, reason: WakeReason, attempt: u32, memo: String) -> WakeTrigger {
        WakeTrigger {
            version: 1,
            created_utc: utc_iso(),
            wake_after_s: self.wake_after_s,
            memo,
            reason,
            job_root: self.job_root.clone(),
            attempt,
            pid: self.pid,
            window_title: self.window_title.clone(),
        }
    }

    /// Write a trigger unless one is outstanding; terminal reasons replace an
    /// outstanding trigger instead of being dropped.
    pub fn emit(
        &self,
        reason: WakeReason,
        attempt: u32,
        memo: String,
    ) -> Result<EmitOutcome, PersistError> {
        let outstanding = self.outstanding();
        if outstanding && !reason.is_terminal() {
            tracing::debug!(
                reason = reason.as_str(),
                path = %self.path.display(),
                "wake trigger already outstanding, not overwriting"
            );
            return Ok(EmitOutcome::Suppressed);
        }

        let trigger = self.build(reason, attempt, memo);
        persist::atomic_write_json(&self.path, &trigger)?;
        tracing::info!(reason = reason.as_str(), path = %self.path.display(), "wrote wake trigger");
        Ok(if outstanding {
            EmitOutcome::Replaced
        } else {
            EmitOutcome::Written
        })
    }
}
