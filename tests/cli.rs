#![cfg(unix)]

use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn nightwatch(data_dir: &Path, args: &[&str], child: &str) -> Output {
    Command::new(env!("CARGO_BIN_EXE_nightwatch"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .args(["--", "sh", "-c", child])
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_silent_child_washes_out() {
    let dir = tempdir().unwrap();
    let job = dir.path().join("job");
    let out = nightwatch(
        dir.path(),
        &[
            "--job-name",
            "hang",
            "--job-root",
            job.to_str().unwrap(),
            "--watchdog-no-output-s",
            "3",
            "--watchdog-abort-after-kills",
            "1",
            "--max-restarts",
            "0",
            "--poll-interval-s",
            "0.2",
        ],
        "echo hello; sleep 30",
    );
    assert_eq!(out.status.code(), Some(3), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let wd = read_json(&job.join("watchdog_state.json"));
    assert_eq!(wd["stage"], "WASHOUT");

    let events = std::fs::read_to_string(job.join("watchdog_events.jsonl")).unwrap();
    assert!(events
        .lines()
        .any(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["stage"] == "WASHOUT"));

    for name in ["failure_summary.md", "child_log_tail.txt", "supervisor.log"] {
        let text = std::fs::read_to_string(job.join(name)).unwrap();
        assert!(!text.is_empty(), "{name} is empty");
    }
    assert!(std::fs::read_to_string(job.join("child_log_tail.txt"))
        .unwrap()
        .contains("hello"));

    let wake = read_json(&dir.path().join("wake_trigger.json"));
    assert_eq!(wake["reason"], "washout");
    assert_eq!(wake["job_root"], job.to_str().unwrap());
}

#[test]
fn test_output_appends_across_attempts() {
    let dir = tempdir().unwrap();
    let job = dir.path().join("job");
    let out = nightwatch(
        dir.path(),
        &[
            "--job-name",
            "crashy",
            "--job-root",
            job.to_str().unwrap(),
            "--max-restarts",
            "1",
            "--restart-backoff-s",
            "0",
        ],
        "echo attempt-$NIGHTWATCH_ATTEMPT; exit 1",
    );
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(
        std::fs::read_to_string(job.join("child_stdout.log")).unwrap(),
        "attempt-1\nattempt-2\n"
    );
    assert_eq!(read_json(&job.join("state.json"))["phase"], "max_restarts");
}

#[test]
fn test_success_writes_done_trigger() {
    let dir = tempdir().unwrap();
    let out = nightwatch(dir.path(), &["--job-name", "ok job"], "echo fine");
    assert_eq!(out.status.code(), Some(0));

    let wake = read_json(&dir.path().join("wake_trigger.json"));
    assert_eq!(wake["reason"], "done");

    // Default job root lands under <data-dir>/jobs with a sanitized name.
    let jobs: Vec<_> = std::fs::read_dir(dir.path().join("jobs"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].ends_with("_ok_job"), "{jobs:?}");
}

#[test]
fn test_stop_file_exits_cleanly() {
    let dir = tempdir().unwrap();
    let stop = dir.path().join("STOP");
    let script = format!("sleep 1; touch '{}'; sleep 30", stop.display());
    let out = nightwatch(
        dir.path(),
        &[
            "--job-name",
            "stoppable",
            "--stop-on-file",
            stop.to_str().unwrap(),
            "--poll-interval-s",
            "0.2",
        ],
        &script,
    );
    assert_eq!(out.status.code(), Some(0));
    assert!(!dir.path().join("wake_trigger.json").exists());
}

#[test]
fn test_dry_run_prints_resolved_config() {
    let dir = tempdir().unwrap();
    let out = nightwatch(
        dir.path(),
        &["--job-name", "dry", "--dry-run", "--watchdog-no-output-s", "30"],
        "true",
    );
    assert_eq!(out.status.code(), Some(0));
    let config: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(config["job_name"], "dry");
    assert_eq!(config["thresholds"]["surge_s"], 10.0);
    assert_eq!(config["thresholds"]["spill_s"], 20.0);
    assert_eq!(config["max_restarts"], 10);
    assert!(!dir.path().join("jobs").exists());
}

#[test]
fn test_invalid_thresholds_rejected() {
    let dir = tempdir().unwrap();
    let out = nightwatch(
        dir.path(),
        &["--job-name", "bad", "--watchdog-no-output-s", "2"],
        "true",
    );
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("surge < spill < breach"));
}

#[test]
fn test_missing_job_name_is_usage_error() {
    let dir = tempdir().unwrap();
    let out = nightwatch(dir.path(), &[], "true");
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_status_reports_finished_job() {
    let dir = tempdir().unwrap();
    let job = dir.path().join("job");
    let run = nightwatch(
        dir.path(),
        &["--job-name", "s", "--job-root", job.to_str().unwrap()],
        "exit 0",
    );
    assert_eq!(run.status.code(), Some(0));

    let out = Command::new(env!("CARGO_BIN_EXE_nightwatch"))
        .args(["--status", "--job-root"])
        .arg(&job)
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(0));
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("phase:      succeeded"), "{text}");
    assert!(text.contains("rc=0"));
}

#[test]
fn test_second_supervisor_on_same_job_root_refused() {
    let dir = tempdir().unwrap();
    let job = dir.path().join("job");
    let mut first = Command::new(env!("CARGO_BIN_EXE_nightwatch"))
        .arg("--data-dir")
        .arg(dir.path())
        .args(["--job-name", "one", "--job-root"])
        .arg(&job)
        .args(["--", "sh", "-c", "sleep 5"])
        .spawn()
        .unwrap();

    // Wait for the first supervisor to record its child.
    let state = job.join("state.json");
    for _ in 0..50 {
        if std::fs::read_to_string(&state)
            .map(|s| s.contains("\"phase\": \"child_running\""))
            .unwrap_or(false)
        {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    let second = nightwatch(
        dir.path(),
        &["--job-name", "two", "--job-root", job.to_str().unwrap()],
        "true",
    );
    assert_eq!(second.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&second.stderr).contains("another supervisor holds"));

    first.kill().unwrap();
    let _ = first.wait();
}
