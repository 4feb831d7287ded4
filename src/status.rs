/// Run-state file: writes `state.json` as JSON on every supervisor transition.
///
/// The snapshot is replaced atomically so readers never see a partial write.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::clock::utc_iso;
use crate::persist::{self, PersistError};

/// Supervisor phases written to the run-state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    Starting,
    ChildRunning,
    BackingOff,
    Stopped,
    Succeeded,
    Washout,
    MaxRestarts,
}

impl SupervisorPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SupervisorPhase::Starting => "starting",
            SupervisorPhase::ChildRunning => "child_running",
            SupervisorPhase::BackingOff => "backing_off",
            SupervisorPhase::Stopped => "stopped",
            SupervisorPhase::Succeeded => "succeeded",
            SupervisorPhase::Washout => "washout",
            SupervisorPhase::MaxRestarts => "max_restarts",
        }
    }
}

/// The JSON payload written to `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub version: u32,
    pub updated_utc: String,
    pub pid: u32,
    pub phase: SupervisorPhase,
    pub attempt: u32,
    pub failures: u32,
    pub child_pid: u32,
    pub child_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_duration_s: Option<f64>,
    pub child_cmd: Vec<String>,
}

/// Mutable state tracker that builds a `RunState` for each update.
///
/// Owned by the supervisor loop; nothing else writes `state.json`.
pub struct RunStateTracker {
    path: PathBuf,
    pid: u32,
    child_cmd: Vec<String>,
    attempt: u32,
    failures: u32,
    child_pid: u32,
    child_running: bool,
    child_exit_code: Option<i32>,
    child_duration_s: Option<f64>,
}

impl RunStateTracker {
    pub fn new(path: PathBuf, child_cmd: Vec<String>) -> Self {
        Self {
            path,
            pid: std::process::id(),
            child_cmd,
            attempt: 0,
            failures: 0,
            child_pid: 0,
            child_running: false,
            child_exit_code: None,
            child_duration_s: None,
        }
    }

    pub fn snapshot(&self, phase: SupervisorPhase) -> RunState {
        RunState {
            version: 1,
            updated_utc: utc_iso(),
            pid: self.pid,
            phase,
            attempt: self.attempt,
            failures: self.failures,
            child_pid: self.child_pid,
            child_running: self.child_running,
            child_exit_code: self.child_exit_code,
            child_duration_s: self.child_duration_s,
            child_cmd: self.child_cmd.clone(),
        }
    }

    /// Atomically write the current state with the given phase.
    pub fn update(&self, phase: SupervisorPhase) -> Result<(), PersistError> {
        persist::atomic_write_json(&self.path, &self.snapshot(phase))
    }

    pub fn set_failures(&mut self, failures: u32) {
        self.failures = failures;
    }

    /// A new attempt's child is running.
    pub fn child_started(&mut self, attempt: u32, child_pid: u32) {
        self.attempt = attempt;
        self.child_pid = child_pid;
        self.child_running = true;
        self.child_exit_code = None;
        self.child_duration_s = None;
    }

    /// The current attempt's child has exited (or was killed).
    pub fn child_exited(&mut self, exit_code: i32, duration_s: f64) {
        self.child_running = false;
        self.child_exit_code = Some(exit_code);
        self.child_duration_s = Some(duration_s);
    }
}

/// Read a previously written run state, if present and well-formed.
pub fn read_run_state(path: &std::path::Path) -> Option<RunState> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}
