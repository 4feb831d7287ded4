//! Diagnostic artifacts written under the job root.
//!
//! `watchdog_state.json` and `degrade_mode.json` are snapshots (atomic
//! replace); `watchdog_events.jsonl`, `failure_summary.md` and the status log
//! are append-only; `child_log_tail.txt` is rewritten on every failure.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::clock::utc_iso;
use crate::data_dir::JobDir;
use crate::persist::{self, PersistError};
use crate::watchdog::{Thresholds, WatchdogStage};

const SCHEMA_VERSION: u32 = 1;
const TAIL_CHUNK: u64 = 8 * 1024;
/// Upper bound on bytes read from one stream for the log tail.
pub const TAIL_MAX_BYTES: u64 = 4 * 1024 * 1024;
/// Longest line kept in the log tail.
pub const TAIL_MAX_LINE_BYTES: usize = 4 * 1024;

/// One watchdog observation, shared by the state snapshot and the event log.
#[derive(Debug, Clone)]
pub struct WatchdogReport<'a> {
    pub stage: WatchdogStage,
    pub previous: Option<WatchdogStage>,
    pub reason: &'a str,
    pub attempt: u32,
    pub failures: u32,
    pub child_pid: u32,
    pub no_output_s: f64,
    pub kill_count: u32,
    pub degrade_level: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WatchdogStateFile {
    pub version: u32,
    pub updated_utc: String,
    pub job_root: String,
    pub stage: String,
    pub reason: String,
    pub attempt: u32,
    pub failures: u32,
    pub child_pid: u32,
    pub no_output_s: f64,
    pub watchdog_surge_s: f64,
    pub watchdog_spill_s: f64,
    pub watchdog_no_output_s: f64,
    pub kill_count: u32,
    pub degrade_level: String,
}

#[derive(Debug, Serialize)]
struct WatchdogEvent<'a> {
    version: u32,
    created_utc: String,
    stage: WatchdogStage,
    stage_rank: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_stage: Option<WatchdogStage>,
    reason: &'a str,
    attempt: u32,
    failures: u32,
    child_pid: u32,
    no_output_s: f64,
    watchdog_no_output_s: f64,
    kill_count: u32,
    job_root: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
struct DegradeSignal {
    version: u32,
    updated_utc: String,
    level: String,
    job_root: String,
}

/// Writer for every per-job diagnostic artifact plus the shared status log.
#[derive(Debug, Clone)]
pub struct Artifacts {
    dir: JobDir,
    job_root: String,
    status_log: PathBuf,
    thresholds: Thresholds,
}

impl Artifacts {
    pub fn new(dir: JobDir, status_log: PathBuf, thresholds: Thresholds) -> Self {
        let job_root = dir.root().display().to_string();
        Self {
            dir,
            job_root,
            status_log,
            thresholds,
        }
    }

    pub fn dir(&self) -> &JobDir {
        &self.dir
    }

    /// Rewrite `watchdog_state.json`.
    pub fn write_watchdog_state(&self, report: &WatchdogReport<'_>) -> Result<(), PersistError> {
        let state = WatchdogStateFile {
            version: SCHEMA_VERSION,
            updated_utc: utc_iso(),
            job_root: self.job_root.clone(),
            stage: report.stage.name().to_string(),
            reason: report.reason.to_string(),
            attempt: report.attempt,
            failures: report.failures,
            child_pid: report.child_pid,
            no_output_s: report.no_output_s,
            watchdog_surge_s: self.thresholds.surge_s,
            watchdog_spill_s: self.thresholds.spill_s,
            watchdog_no_output_s: self.thresholds.breach_s,
            kill_count: report.kill_count,
            degrade_level: report.degrade_level.to_string(),
        };
        persist::atomic_write_json(&self.dir.watchdog_state(), &state)
    }

    /// Append one line to `watchdog_events.jsonl`.
    pub fn append_event(&self, report: &WatchdogReport<'_>) -> Result<(), PersistError> {
        let event = WatchdogEvent {
            version: SCHEMA_VERSION,
            created_utc: utc_iso(),
            stage: report.stage,
            stage_rank: report.stage.rank(),
            previous_stage: report.previous,
            reason: report.reason,
            attempt: report.attempt,
            failures: report.failures,
            child_pid: report.child_pid,
            no_output_s: report.no_output_s,
            watchdog_no_output_s: self.thresholds.breach_s,
            kill_count: report.kill_count,
            job_root: &self.job_root,
        };
        persist::append_jsonl(&self.dir.watchdog_events(), &event)
    }

    /// Event + snapshot for one transition; the event goes first so the
    /// snapshot never runs ahead of the history.
    pub fn record_transition(&self, report: &WatchdogReport<'_>) -> Result<(), PersistError> {
        self.append_event(report)?;
        self.write_watchdog_state(report)
    }

    /// Append a markdown incident entry to `failure_summary.md`.
    pub fn append_failure_summary(
        &self,
        stage: WatchdogStage,
        reason: &str,
        attempt: u32,
        child_pid: u32,
        no_output_s: f64,
    ) -> Result<(), PersistError> {
        let entry = format!(
            "## {stage} - {reason}\n\
             \n\
             - utc: `{}`\n\
             - attempt: `{attempt}`\n\
             - child_pid: `{child_pid}`\n\
             - no_output_s: `{no_output_s:.1}`\n\
             - watchdog_no_output_s: `{:.1}`\n\
             \n",
            utc_iso(),
            self.thresholds.breach_s,
        );
        persist::append(&self.dir.failure_summary(), entry.as_bytes())
    }

    /// Rewrite `child_log_tail.txt` with the last `max_lines` of each stream.
    pub fn write_log_tail(&self, max_lines: usize) -> Result<(), PersistError> {
        let mut out = String::new();
        for (label, path) in [
            ("child_stdout.log", self.dir.child_stdout()),
            ("child_stderr.log", self.dir.child_stderr()),
        ] {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("=== {label} (tail) ===\n"));
            let lines = match tail_lines(&path, max_lines) {
                Ok(lines) => lines,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "failed to read log tail");
                    Vec::new()
                }
            };
            if lines.is_empty() {
                out.push_str("<empty>\n");
            }
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
        }
        persist::atomic_write(&self.dir.log_tail(), out.as_bytes())
    }

    /// Rewrite `degrade_mode.json` with `level`.
    pub fn write_degrade(&self, level: &str) -> Result<(), PersistError> {
        let signal = DegradeSignal {
            version: SCHEMA_VERSION,
            updated_utc: utc_iso(),
            level: level.to_string(),
            job_root: self.job_root.clone(),
        };
        persist::atomic_write_json(&self.dir.degrade_mode(), &signal)
    }

    /// Degrade level left behind by an earlier attempt, if any.
    pub fn read_degrade_level(&self) -> Option<String> {
        let contents = std::fs::read_to_string(self.dir.degrade_mode()).ok()?;
        let signal: DegradeSignal = serde_json::from_str(&contents).ok()?;
        let level = signal.level.trim();
        (!level.is_empty()).then(|| level.to_string())
    }

    /// Append a stamped line to the human-readable status log.
    pub fn status(&self, line: &str) -> Result<(), PersistError> {
        persist::append_line(&self.status_log, &format!("[{}] {line}", utc_iso()))
    }
}

/// Last `max_lines` lines of `path`, read backwards from the end in fixed
/// chunks.
///
/// At most [`TAIL_MAX_BYTES`] are scanned, so a log with few or no newlines
/// (`\r` progress bars) costs a bounded read. Lines longer than
/// [`TAIL_MAX_LINE_BYTES`] keep only their end. A missing file yields no
/// lines. Invalid UTF-8 is replaced.
pub fn tail_lines(path: &Path, max_lines: usize) -> std::io::Result<Vec<String>> {
    if max_lines == 0 {
        return Ok(Vec::new());
    }
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    let floor = len.saturating_sub(TAIL_MAX_BYTES);

    // Chunks are collected newest first and reversed once at the end.
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut newlines = 0usize;
    let mut trailing_newline = false;
    let mut pos = len;
    while pos > floor {
        let take = TAIL_CHUNK.min(pos - floor);
        pos -= take;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; take as usize];
        file.read_exact(&mut chunk)?;

        if chunks.is_empty() {
            trailing_newline = chunk.last() == Some(&b'\n');
        }
        newlines += chunk.iter().filter(|b| **b == b'\n').count();
        chunks.push(chunk);

        // A trailing newline terminates the last line rather than starting a new one.
        let separators = newlines - usize::from(trailing_newline);
        if separators >= max_lines {
            break;
        }
    }
    chunks.reverse();
    let buf = chunks.concat();

    let text = String::from_utf8_lossy(&buf);
    let lines: Vec<&str> = text.lines().collect();
    // The first line may be partial if we stopped mid-file; it is only kept
    // when enough complete lines are not available anyway.
    let skip = lines.len().saturating_sub(max_lines);
    Ok(lines[skip..].iter().map(|l| clip_line(l)).collect())
}

/// Keep the last [`TAIL_MAX_LINE_BYTES`] of `line`, on a char boundary.
fn clip_line(line: &str) -> String {
    if line.len() <= TAIL_MAX_LINE_BYTES {
        return line.to_string();
    }
    let mut start = line.len() - TAIL_MAX_LINE_BYTES;
    while !line.is_char_boundary(start) {
        start += 1;
    }
    format!("[clipped] {}", &line[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn artifacts(dir: &Path) -> Artifacts {
        Artifacts::new(
            JobDir::new(dir.join("job")),
            dir.join("status.md"),
            Thresholds {
                surge_s: 3.0,
                spill_s: 7.0,
                breach_s: 10.0,
            },
        )
    }

    fn report(stage: WatchdogStage, reason: &str) -> WatchdogReport<'_> {
        WatchdogReport {
            stage,
            previous: Some(WatchdogStage::Spill),
            reason,
            attempt: 2,
            failures: 1,
            child_pid: 4242,
            no_output_s: 10.5,
            kill_count: 1,
            degrade_level: "spill",
        }
    }

    #[test]
    fn test_tail_lines_matches_naive_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        let body: String = (0..5000).map(|i| format!("line {i} {}\n", "x".repeat(i % 13))).collect();
        std::fs::write(&path, &body).unwrap();

        for n in [1, 2, 10, 200, 4999, 5000, 6000] {
            let naive: Vec<String> = body
                .lines()
                .rev()
                .take(n)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .map(String::from)
                .collect();
            assert_eq!(tail_lines(&path, n).unwrap(), naive, "n={n}");
        }
    }

    #[test]
    fn test_tail_lines_without_trailing_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        std::fs::write(&path, "a\nb\nc").unwrap();
        assert_eq!(tail_lines(&path, 2).unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn test_tail_lines_bounded_on_newline_free_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.log");
        // A `\r` progress bar: 16 MiB with no newline at all.
        let mut body = Vec::with_capacity(16 * 1024 * 1024 + 16);
        while body.len() < 16 * 1024 * 1024 {
            body.extend_from_slice(b"\rstep 000123/999999 loss=0.4242 ");
        }
        body.extend_from_slice(b"\rDONE-MARKER");
        std::fs::write(&path, &body).unwrap();

        let started = std::time::Instant::now();
        let lines = tail_lines(&path, 200).unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("[clipped] "));
        assert!(lines[0].len() <= TAIL_MAX_LINE_BYTES + "[clipped] ".len());
        assert!(lines[0].ends_with("DONE-MARKER"));
    }

    #[test]
    fn test_tail_lines_clips_long_last_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        let long = format!("{}END", "é".repeat(TAIL_MAX_LINE_BYTES));
        std::fs::write(&path, format!("first\n{long}\n")).unwrap();

        let lines = tail_lines(&path, 2).unwrap();
        assert_eq!(lines[0], "first");
        assert!(lines[1].starts_with("[clipped] "));
        assert!(lines[1].ends_with("END"));
        assert!(lines[1].len() <= TAIL_MAX_LINE_BYTES + "[clipped] ".len());
    }

    #[test]
    fn test_tail_lines_missing_and_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.log");
        assert!(tail_lines(&path, 10).unwrap().is_empty());
        std::fs::write(&path, "a\n").unwrap();
        assert!(tail_lines(&path, 0).unwrap().is_empty());
    }

    #[test]
    fn test_write_log_tail_format() {
        let dir = tempdir().unwrap();
        let a = artifacts(dir.path());
        a.dir().create().unwrap();
        std::fs::write(a.dir().child_stdout(), "one\ntwo\nthree\n").unwrap();

        a.write_log_tail(2).unwrap();
        let text = std::fs::read_to_string(a.dir().log_tail()).unwrap();
        assert_eq!(
            text,
            "=== child_stdout.log (tail) ===\ntwo\nthree\n\n=== child_stderr.log (tail) ===\n<empty>\n"
        );
    }

    #[test]
    fn test_watchdog_state_and_event() {
        let dir = tempdir().unwrap();
        let a = artifacts(dir.path());
        a.record_transition(&report(WatchdogStage::Breach, "no_output")).unwrap();
        a.record_transition(&report(WatchdogStage::Washout, "abort_after_kills")).unwrap();

        let state: WatchdogStateFile =
            serde_json::from_str(&std::fs::read_to_string(a.dir().watchdog_state()).unwrap()).unwrap();
        assert_eq!(state.stage, "WASHOUT");
        assert_eq!(state.reason, "abort_after_kills");
        assert_eq!(state.kill_count, 1);
        assert_eq!(state.watchdog_spill_s, 7.0);
        assert_eq!(state.degrade_level, "spill");

        let events = std::fs::read_to_string(a.dir().watchdog_events()).unwrap();
        let stages: Vec<serde_json::Value> = events
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
            .collect();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0]["stage"], "BREACH");
        assert_eq!(stages[1]["stage"], "WASHOUT");
        assert_eq!(stages[1]["stage_rank"], 4);
        assert_eq!(stages[1]["previous_stage"], "SPILL");
        assert_eq!(stages[1]["child_pid"], 4242);
    }

    #[test]
    fn test_failure_summary_appends() {
        let dir = tempdir().unwrap();
        let a = artifacts(dir.path());
        a.append_failure_summary(WatchdogStage::Breach, "no_output", 1, 77, 10.04)
            .unwrap();
        a.append_failure_summary(WatchdogStage::Washout, "max_restarts", 3, 0, 0.0)
            .unwrap();

        let text = std::fs::read_to_string(a.dir().failure_summary()).unwrap();
        assert!(text.starts_with("## BREACH - no_output\n\n- utc: `"));
        assert!(text.contains("- child_pid: `77`"));
        assert!(text.contains("- no_output_s: `10.0`"));
        assert!(text.contains("- watchdog_no_output_s: `10.0`"));
        assert!(text.contains("## WASHOUT - max_restarts"));
    }

    #[test]
    fn test_degrade_round_trip_and_blank_level() {
        let dir = tempdir().unwrap();
        let a = artifacts(dir.path());
        assert_eq!(a.read_degrade_level(), None);

        a.write_degrade("spill").unwrap();
        assert_eq!(a.read_degrade_level().as_deref(), Some("spill"));

        a.write_degrade("  ").unwrap();
        assert_eq!(a.read_degrade_level(), None);
    }

    #[test]
    fn test_status_lines_are_stamped() {
        let dir = tempdir().unwrap();
        let a = artifacts(dir.path());
        a.status("SURGE: no_output_s=3.0").unwrap();
        a.status("SPILL: no_output_s=7.0").unwrap();

        let text = std::fs::read_to_string(dir.path().join("status.md")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('[') && lines[0].ends_with("SURGE: no_output_s=3.0"));
    }
}
