//! The supervisor loop.
//!
//! The outer loop runs one attempt per iteration: check stop conditions,
//! spawn the child, watch it, classify how it ended, then either stop or back
//! off and go again. The inner loop polls the child once per tick, feeding
//! output growth into the watchdog clock and acting on stage transitions.

use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::artifacts::{Artifacts, WatchdogReport};
use crate::clock::{duration_from_secs, secs_between, utc_iso};
use crate::config::JobConfig;
use crate::data_dir::JobDir;
use crate::persist::{self, PersistError};
use crate::process::{spawn_child, RunningChild, SpawnSpec, TreeKiller};
use crate::retry::{RestartDecision, RestartPolicy};
use crate::signals::StopSignal;
use crate::status::{RunStateTracker, SupervisorPhase};
use crate::wake::{EmitOutcome, WakeEmitter, WakeReason};
use crate::watchdog::{Transition, WatchdogClock, WatchdogStage};

/// Grace period for a killed child to report its exit status.
const EXIT_GRACE: Duration = Duration::from_secs(5);
/// Pause after a watchdog kill before collecting the exit status.
const KILL_SETTLE: Duration = Duration::from_millis(500);

pub const ENV_JOB_ROOT: &str = "NIGHTWATCH_JOB_ROOT";
pub const ENV_JOB_NAME: &str = "NIGHTWATCH_JOB_NAME";
pub const ENV_ATTEMPT: &str = "NIGHTWATCH_ATTEMPT";
pub const ENV_DEGRADE_LEVEL: &str = "NIGHTWATCH_DEGRADE_LEVEL";

/// Why the supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The child exited 0 with stop-on-success enabled.
    Succeeded,
    /// The stop file appeared.
    Stopped,
    /// More failures than `max_restarts`.
    MaxRestarts,
    /// Watchdog kill ceiling reached.
    Washout,
}

impl SupervisorExit {
    pub fn code(self) -> i32 {
        match self {
            SupervisorExit::Succeeded | SupervisorExit::Stopped => 0,
            SupervisorExit::MaxRestarts => 1,
            SupervisorExit::Washout => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptEnd {
    Exited,
    StopRequested,
    WatchdogKilled { washout: bool },
}

#[derive(Debug)]
struct AttemptOutcome {
    end: AttemptEnd,
    pid: u32,
    exit_code: i32,
    duration_s: f64,
}

#[derive(Serialize)]
struct JobRecord<'a> {
    version: u32,
    created_utc: String,
    pid: u32,
    #[serde(flatten)]
    config: &'a JobConfig,
}

/// Append-only `supervisor.log`, mirrored to tracing.
struct Narrative {
    path: PathBuf,
}

impl Narrative {
    fn line(&self, msg: &str) {
        tracing::info!("{msg}");
        self.append(msg);
    }

    fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
        self.append(msg);
    }

    fn append(&self, msg: &str) {
        if let Err(e) = persist::append_line(&self.path, &format!("[{}] {msg}", utc_iso())) {
            tracing::warn!(error = %e, "failed to append to supervisor log");
        }
    }
}

/// Supervises one child command for the lifetime of the process.
pub struct Supervisor {
    config: JobConfig,
    dir: JobDir,
    artifacts: Artifacts,
    narrative: Narrative,
    wake: WakeEmitter,
    stop: StopSignal,
    killer: Box<dyn TreeKiller>,
    run_state: RunStateTracker,
    restarts: RestartPolicy,
    attempt: u32,
    kill_count: u32,
}

impl Supervisor {
    pub fn new(config: JobConfig, killer: Box<dyn TreeKiller>) -> Self {
        let artifacts = Artifacts::new(
            JobDir::new(&config.job_root),
            config.status_path.clone(),
            config.thresholds,
        );
        let dir = artifacts.dir().clone();
        let narrative = Narrative {
            path: dir.supervisor_log(),
        };
        let wake = WakeEmitter::new(
            config.wake_trigger.clone(),
            dir.root(),
            config.wake_after_s,
            config.wake_window_title.clone(),
        );
        let stop = StopSignal::new(config.stop_on_file.clone());
        let run_state = RunStateTracker::new(dir.run_state(), config.child_cmd.clone());
        let restarts = RestartPolicy::new(config.max_restarts, config.restart_backoff_s);

        Self {
            config,
            dir,
            artifacts,
            narrative,
            wake,
            stop,
            killer,
            run_state,
            restarts,
            attempt: 0,
            kill_count: 0,
        }
    }

    /// Run attempts until a terminal condition.
    ///
    /// Only a failure to persist `job.json` at startup is returned as an
    /// error; every later write failure is logged and the loop carries on.
    pub async fn run(mut self) -> Result<SupervisorExit, PersistError> {
        self.startup()?;

        loop {
            if self.stop.requested() {
                return Ok(self.stop_requested());
            }
            if self.restarts.exhausted() {
                return Ok(self.give_up_max_restarts());
            }

            self.attempt += 1;
            self.narrative
                .line(&format!("attempt={} launching child", self.attempt));

            let env = self.child_env();
            let stdout = self.dir.child_stdout();
            let stderr = self.dir.child_stderr();
            let spec = SpawnSpec {
                command: &self.config.child_cmd,
                stdout: &stdout,
                stderr: &stderr,
                env,
            };
            let child = match spawn_child(&spec) {
                Ok(child) => child,
                Err(e) => {
                    self.narrative
                        .warn(&format!("failed to launch child: {e}"));
                    self.after_failure(None).await;
                    continue;
                }
            };

            self.run_state.child_started(self.attempt, child.pid());
            self.write_run_state(SupervisorPhase::ChildRunning);

            let outcome = self.watch(child).await;
            self.record_exit(&outcome);

            match outcome.end {
                AttemptEnd::StopRequested => {
                    self.write_run_state(SupervisorPhase::Stopped);
                    return Ok(self.finish(SupervisorExit::Stopped));
                }
                AttemptEnd::WatchdogKilled { washout: true } => {
                    return Ok(self.washout());
                }
                AttemptEnd::Exited if outcome.exit_code == 0 && self.config.stop_on_success => {
                    return Ok(self.succeeded());
                }
                AttemptEnd::Exited | AttemptEnd::WatchdogKilled { washout: false } => {
                    self.after_failure(Some(outcome.exit_code)).await;
                }
            }
        }
    }

    fn startup(&mut self) -> Result<(), PersistError> {
        self.dir.create().map_err(|e| PersistError::CreateDir {
            path: self.dir.root().to_path_buf(),
            source: e,
        })?;
        let record = JobRecord {
            version: 1,
            created_utc: utc_iso(),
            pid: std::process::id(),
            config: &self.config,
        };
        persist::atomic_write_json(&self.dir.job_config(), &record)?;

        self.narrative.line(&format!(
            "supervisor start pid={} job={:?}",
            std::process::id(),
            self.config.job_name
        ));
        self.narrative
            .line(&format!("child cmd: {:?}", self.config.child_cmd));
        self.narrative
            .line(&format!("job_root={}", self.dir.root().display()));
        self.narrative
            .line(&format!("tree killer: {}", self.killer.name()));
        self.write_run_state(SupervisorPhase::Starting);

        if self.config.watchdog_enabled() {
            let t = self.config.thresholds;
            self.narrative.line(&format!(
                "watchdog clock: surge_s={:.1} spill_s={:.1} breach_s={:.1} abort_after_kills={} poll_s={:.2} status_path={}",
                t.surge_s,
                t.spill_s,
                t.breach_s,
                self.config.watchdog_abort_after_kills,
                self.config.poll_interval_s,
                self.config.status_path.display()
            ));
            self.status_line(&format!(
                "watchdog clock armed: job={:?} job_root={} surge_s={:.1} spill_s={:.1} breach_s={:.1} abort_after_kills={}",
                self.config.job_name,
                self.dir.root().display(),
                t.surge_s,
                t.spill_s,
                t.breach_s,
                self.config.watchdog_abort_after_kills
            ));
            let report = self.report(WatchdogStage::Ok, None, "armed", 0, 0.0, "");
            if let Err(e) = self.artifacts.record_transition(&report) {
                self.narrative
                    .warn(&format!("watchdog arm emit failed: {e}"));
            }
        }
        Ok(())
    }

    /// Inner poll loop for one attempt.
    async fn watch(&mut self, mut child: RunningChild) -> AttemptOutcome {
        let pid = child.pid();
        let started = child.started();
        let poll = duration_from_secs(self.config.poll_interval_s);
        let heartbeat_s = self.config.heartbeat_interval_s as f64;
        let mut clock = WatchdogClock::start(
            self.config.thresholds,
            self.config.poll_interval_s,
            self.output_bytes().unwrap_or(0),
            started,
        );
        let mut last_heartbeat = started;

        let end = loop {
            if self.stop.requested() {
                self.narrative.line(&format!(
                    "stop file exists: {} (killing child pid={pid})",
                    self.stop_path_display()
                ));
                self.killer.kill_tree(pid);
                break AttemptEnd::StopRequested;
            }
            if child.poll_exit().is_some() {
                break AttemptEnd::Exited;
            }

            let now = Instant::now();
            let bytes = self
                .output_bytes()
                .unwrap_or_else(|| clock.last_bytes());
            if let Some(transition) = clock.observe(bytes, now) {
                self.on_transition(&transition, pid, clock.degrade_level());
            }
            if let Some(countdown) = clock.countdown(now) {
                let next = countdown.next.map(WatchdogStage::name).unwrap_or("");
                self.status_line(&format!(
                    "clock: stage={} no_output_s={:.1} next={next} in {:.1}s attempt={} pid={pid}",
                    countdown.stage, countdown.no_output_s, countdown.next_in_s, self.attempt
                ));
            }

            if clock.stage() == WatchdogStage::Breach {
                self.narrative.line(&format!(
                    "watchdog: no output for {:.1}s; killing child pid={pid}",
                    self.config.thresholds.breach_s
                ));
                // Kill first; the artifact writes below read the child's logs.
                self.killer.kill_tree(pid);
                let washout = self.on_breach(pid, clock.no_output_s(now), clock.degrade_level());
                tokio::time::sleep(KILL_SETTLE).await;
                break AttemptEnd::WatchdogKilled { washout };
            }

            if heartbeat_s > 0.0 && secs_between(last_heartbeat, now) >= heartbeat_s {
                last_heartbeat = now;
                self.heartbeat(pid, secs_between(started, now));
            }

            tokio::time::sleep(poll).await;
        };

        let exit_code = child.finish(EXIT_GRACE).await;
        AttemptOutcome {
            end,
            pid,
            exit_code,
            duration_s: secs_between(started, Instant::now()),
        }
    }

    /// Persist the finished attempt before deciding what happens next.
    fn record_exit(&mut self, outcome: &AttemptOutcome) {
        self.run_state
            .child_exited(outcome.exit_code, outcome.duration_s);
        self.write_run_state(SupervisorPhase::ChildRunning);
        self.narrative.line(&format!(
            "child exit rc={} dur_s={:.1} pid={}",
            outcome.exit_code, outcome.duration_s, outcome.pid
        ));
    }

    fn on_transition(&self, transition: &Transition, pid: u32, degrade_level: &str) {
        tracing::debug!(
            from = %transition.from,
            to = %transition.to,
            no_output_s = transition.no_output_s,
            "watchdog stage change"
        );
        let report = self.report(
            transition.to,
            Some(transition.from),
            transition.reason,
            pid,
            transition.no_output_s,
            degrade_level,
        );
        if let Err(e) = self.artifacts.record_transition(&report) {
            self.narrative.warn(&format!("watchdog emit failed: {e}"));
        }
        self.status_line(&format!(
            "{}: no_output_s={:.1} attempt={} pid={pid} job_root={}",
            transition.to,
            transition.no_output_s,
            self.attempt,
            self.dir.root().display()
        ));

        if transition.enter_degrade {
            match self.artifacts.write_degrade(degrade_level) {
                Ok(()) => self.narrative.line(&format!(
                    "degrade mode signalled for next attempt: level={degrade_level}"
                )),
                Err(e) => self
                    .narrative
                    .warn(&format!("degrade_mode write failed: {e}")),
            }
        }
    }

    /// Record a BREACH kill. Returns true when the kill ceiling is reached.
    fn on_breach(&mut self, pid: u32, no_output_s: f64, degrade_level: &str) -> bool {
        self.write_failure_artifacts(WatchdogStage::Breach, "no_output", pid, no_output_s);

        self.kill_count += 1;
        let limit = self.config.watchdog_abort_after_kills;
        if limit == 0 || self.kill_count < limit {
            return false;
        }

        if let Err(e) = self.artifacts.append_failure_summary(
            WatchdogStage::Washout,
            "abort_after_kills",
            self.attempt,
            pid,
            no_output_s,
        ) {
            self.narrative
                .warn(&format!("failure summary write failed: {e}"));
        }
        let report = self.report(
            WatchdogStage::Washout,
            Some(WatchdogStage::Breach),
            "abort_after_kills",
            pid,
            no_output_s,
            degrade_level,
        );
        if let Err(e) = self.artifacts.record_transition(&report) {
            self.narrative
                .warn(&format!("washout state write failed: {e}"));
        }
        self.status_line(&format!("WASHOUT: abort_after_kills={limit} (aborting)"));
        true
    }

    fn heartbeat(&self, pid: u32, elapsed_s: f64) {
        let memo = format!(
            "[nightwatch] heartbeat: still running (attempt={} pid={pid} elapsed_s={}). job_root={}",
            self.attempt,
            elapsed_s as u64,
            self.dir.root().display()
        );
        if self.emit_wake(WakeReason::Heartbeat, memo) == Some(EmitOutcome::Written) {
            self.narrative.line(&format!(
                "wrote heartbeat wake trigger: {}",
                self.wake.path().display()
            ));
        }
    }

    /// Failure accounting shared by crashes, watchdog kills and spawn errors.
    /// `exit_code` is `None` when the child never started.
    async fn after_failure(&mut self, exit_code: Option<i32>) {
        let decision = self.restarts.record_failure();
        let failures = self.restarts.failures();
        self.run_state.set_failures(failures);

        if let Some(rc) = exit_code {
            let memo = format!(
                "[nightwatch] CRASH rc={rc} attempt={} failures={failures} (auto-restarting). job_root={}",
                self.attempt,
                self.dir.root().display()
            );
            if self.emit_wake(WakeReason::Crash, memo) == Some(EmitOutcome::Written) {
                self.narrative.line(&format!(
                    "wrote crash wake trigger: {}",
                    self.wake.path().display()
                ));
            }
        }

        match decision {
            RestartDecision::Restart { failures, backoff } => {
                self.write_run_state(SupervisorPhase::BackingOff);
                self.narrative.line(&format!(
                    "backoff {:.1}s before restart (failures={failures})",
                    backoff.as_secs_f64()
                ));
                self.backoff_sleep(backoff).await;
            }
            RestartDecision::Exhausted { failures } => {
                // The next loop iteration stops with max_restarts.
                self.narrative.line(&format!(
                    "restart budget exhausted: failures={failures} max_restarts={}",
                    self.config.max_restarts
                ));
            }
        }
    }

    /// Sleep for `backoff` in poll-sized slices, returning early once the
    /// stop file appears. The outer loop then handles the stop.
    async fn backoff_sleep(&self, backoff: Duration) {
        let slice = duration_from_secs(self.config.poll_interval_s);
        let started = Instant::now();
        loop {
            if self.stop.requested() {
                return;
            }
            let elapsed = started.elapsed();
            if elapsed >= backoff {
                return;
            }
            tokio::time::sleep(slice.min(backoff - elapsed)).await;
        }
    }

    fn stop_requested(&mut self) -> SupervisorExit {
        self.narrative.line(&format!(
            "stop file exists: {} (stopping)",
            self.stop_path_display()
        ));
        self.write_run_state(SupervisorPhase::Stopped);
        self.finish(SupervisorExit::Stopped)
    }

    fn succeeded(&mut self) -> SupervisorExit {
        self.write_run_state(SupervisorPhase::Succeeded);
        let memo = format!(
            "[nightwatch] DONE rc=0 attempt={} job_root={}",
            self.attempt,
            self.dir.root().display()
        );
        if self.emit_wake(WakeReason::Done, memo).is_some() {
            self.narrative.line(&format!(
                "wrote done wake trigger: {}",
                self.wake.path().display()
            ));
        }
        self.finish(SupervisorExit::Succeeded)
    }

    fn washout(&mut self) -> SupervisorExit {
        self.write_run_state(SupervisorPhase::Washout);
        self.narrative.warn(&format!(
            "WASHOUT: aborting supervisor after watchdog kill (kill_count={})",
            self.kill_count
        ));
        let memo = format!(
            "[nightwatch] WASHOUT: watchdog abort (kill_count={}). job_root={}",
            self.kill_count,
            self.dir.root().display()
        );
        if self.emit_wake(WakeReason::Washout, memo).is_some() {
            self.narrative.line(&format!(
                "wrote washout wake trigger: {}",
                self.wake.path().display()
            ));
        }
        self.finish(SupervisorExit::Washout)
    }

    fn give_up_max_restarts(&mut self) -> SupervisorExit {
        let failures = self.restarts.failures();
        self.narrative.warn(&format!(
            "max restarts exceeded: failures={failures} (stopping)"
        ));

        self.write_failure_artifacts(WatchdogStage::Washout, "max_restarts", 0, 0.0);
        let report = self.report(WatchdogStage::Washout, None, "max_restarts", 0, 0.0, "");
        if let Err(e) = self.artifacts.record_transition(&report) {
            self.narrative
                .warn(&format!("washout artifact write failed: {e}"));
        }
        self.status_line(&format!(
            "WASHOUT: max_restarts exceeded failures={failures} kill_count={}",
            self.kill_count
        ));

        self.write_run_state(SupervisorPhase::MaxRestarts);
        let memo = format!(
            "[nightwatch] STOPPED: max restarts exceeded. job_root={}",
            self.dir.root().display()
        );
        self.emit_wake(WakeReason::MaxRestarts, memo);
        self.finish(SupervisorExit::MaxRestarts)
    }

    fn finish(&self, exit: SupervisorExit) -> SupervisorExit {
        self.narrative.line(&format!(
            "supervisor exit code={} job_root={}",
            exit.code(),
            self.dir.root().display()
        ));
        exit
    }

    // --- helpers ---

    fn child_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (ENV_JOB_ROOT.to_string(), self.dir.root().display().to_string()),
            (ENV_JOB_NAME.to_string(), self.config.job_name.clone()),
            (ENV_ATTEMPT.to_string(), self.attempt.to_string()),
        ];
        if let Some(level) = self.artifacts.read_degrade_level() {
            self.narrative
                .line(&format!("passing degrade level to child: {level}"));
            env.push((ENV_DEGRADE_LEVEL.to_string(), level));
        }
        env
    }

    /// Combined size of both output files, `None` if either can't be read.
    fn output_bytes(&self) -> Option<u64> {
        let out = std::fs::metadata(self.dir.child_stdout()).ok()?.len();
        let err = std::fs::metadata(self.dir.child_stderr()).ok()?.len();
        Some(out + err)
    }

    fn report<'a>(
        &self,
        stage: WatchdogStage,
        previous: Option<WatchdogStage>,
        reason: &'a str,
        child_pid: u32,
        no_output_s: f64,
        degrade_level: &'a str,
    ) -> WatchdogReport<'a> {
        WatchdogReport {
            stage,
            previous,
            reason,
            attempt: self.attempt,
            failures: self.restarts.failures(),
            child_pid,
            no_output_s,
            kill_count: self.kill_count,
            degrade_level,
        }
    }

    fn write_failure_artifacts(
        &self,
        stage: WatchdogStage,
        reason: &str,
        child_pid: u32,
        no_output_s: f64,
    ) {
        let result = self
            .artifacts
            .append_failure_summary(stage, reason, self.attempt, child_pid, no_output_s)
            .and_then(|_| self.artifacts.write_log_tail(self.config.log_tail_lines));
        if let Err(e) = result {
            self.narrative
                .warn(&format!("failure artifact write failed: {e}"));
        }
    }

    fn write_run_state(&self, phase: SupervisorPhase) {
        if let Err(e) = self.run_state.update(phase) {
            self.narrative.warn(&format!("run state write failed: {e}"));
        }
    }

    fn status_line(&self, line: &str) {
        if let Err(e) = self.artifacts.status(line) {
            tracing::warn!(error = %e, "failed to append status line");
        }
    }

    fn emit_wake(&self, reason: WakeReason, memo: String) -> Option<EmitOutcome> {
        match self.wake.emit(reason, self.attempt, memo) {
            Ok(EmitOutcome::Replaced) => {
                self.narrative.line(&format!(
                    "{} wake trigger replaced an unconsumed trigger",
                    reason.as_str()
                ));
                Some(EmitOutcome::Replaced)
            }
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.narrative
                    .warn(&format!("wake trigger write failed: {e}"));
                None
            }
        }
    }

    fn stop_path_display(&self) -> String {
        self.stop
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }
}
