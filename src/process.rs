/// Child process lifecycle: spawn the supervised command in its own process
/// group with stdout/stderr appended to files, poll for exit, kill the whole
/// tree on demand, and resolve an exit code without ever blocking unbounded.
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

/// Exit code recorded when a child's real status cannot be obtained.
pub const EXIT_SENTINEL: i32 = -1;

/// Errors that can occur while starting an attempt.
#[derive(Debug)]
pub enum SpawnError {
    /// The command vector was empty.
    EmptyCommand,
    /// Failed to open one of the append-only output files.
    OutputFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the child process.
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::EmptyCommand => write!(f, "child command is empty"),
            SpawnError::OutputFile { path, source } => {
                write!(f, "failed to open output file {}: {}", path.display(), source)
            }
            SpawnError::Spawn { program, source } => {
                write!(f, "failed to spawn child {program}: {source}")
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::EmptyCommand => None,
            SpawnError::OutputFile { source, .. } => Some(source),
            SpawnError::Spawn { source, .. } => Some(source),
        }
    }
}

/// Where the child's streams go and what extra environment it sees.
#[derive(Debug, Clone)]
pub struct SpawnSpec<'a> {
    pub command: &'a [String],
    pub stdout: &'a Path,
    pub stderr: &'a Path,
    pub env: Vec<(String, String)>,
}

fn open_append(path: &Path) -> Result<File, SpawnError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SpawnError::OutputFile {
            path: path.to_path_buf(),
            source: e,
        })
}

/// A spawned attempt that has not been finalized yet.
#[derive(Debug)]
pub struct RunningChild {
    child: Child,
    pid: u32,
    started: Instant,
    exit_code: Option<i32>,
}

/// Spawn the child in a new process group so the watchdog can later kill the
/// entire subtree. Output files are opened in append mode and never
/// truncated, so every attempt's output follows the previous one.
pub fn spawn_child(spec: &SpawnSpec<'_>) -> Result<RunningChild, SpawnError> {
    let (program, args) = spec.command.split_first().ok_or(SpawnError::EmptyCommand)?;
    let stdout = open_append(spec.stdout)?;
    let stderr = open_append(spec.stderr)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    let child = cmd.spawn().map_err(|e| SpawnError::Spawn {
        program: program.clone(),
        source: e,
    })?;
    let pid = child.id().unwrap_or(0);
    tracing::info!(pid, program = %program, "child process started");

    Ok(RunningChild {
        child,
        pid,
        started: Instant::now(),
        exit_code: None,
    })
}

impl RunningChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Non-blocking exit check. Returns the exit code once the child is gone.
    pub fn poll_exit(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(exit_code_of(status));
                self.exit_code
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "failed to poll child status");
                None
            }
        }
    }

    /// Resolve the final exit code, waiting at most `grace` for a child that
    /// was just killed. Falls back to [`EXIT_SENTINEL`].
    pub async fn finish(mut self, grace: Duration) -> i32 {
        if let Some(code) = self.poll_exit() {
            return code;
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => exit_code_of(status),
            Ok(Err(e)) => {
                tracing::warn!(pid = self.pid, error = %e, "failed to wait for child");
                EXIT_SENTINEL
            }
            Err(_) => {
                tracing::warn!(
                    pid = self.pid,
                    grace_secs = grace.as_secs_f64(),
                    "child did not exit within grace period"
                );
                EXIT_SENTINEL
            }
        }
    }
}

/// Map an exit status to an integer: the exit code, or `-signal` for a child
/// killed by a signal on unix.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return -sig;
        }
    }
    EXIT_SENTINEL
}

/// Forceful termination of a whole process tree rooted at a pid.
///
/// Best-effort: implementations log and swallow failures, including the
/// target already being gone.
pub trait TreeKiller: Send + Sync {
    fn name(&self) -> &'static str;

    fn kill_tree(&self, pid: u32);
}

/// SIGKILL to the child's process group (the child leads its own group).
#[cfg(unix)]
pub struct ProcessGroupKiller;

#[cfg(unix)]
impl TreeKiller for ProcessGroupKiller {
    fn name(&self) -> &'static str {
        "killpg"
    }

    fn kill_tree(&self, pid: u32) {
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        if raw <= 0 {
            return;
        }
        let target = Pid::from_raw(raw);
        if let Err(group_err) = killpg(target, Signal::SIGKILL) {
            tracing::debug!(pid, error = %group_err, "killpg failed, signalling pid directly");
            if let Err(e) = kill(target, Signal::SIGKILL) {
                tracing::debug!(pid, error = %e, "kill failed, process already gone");
            }
        }
    }
}

/// `taskkill /T /F` for platforms without POSIX process groups.
#[cfg_attr(unix, allow(dead_code))]
pub struct TaskkillKiller;

impl TreeKiller for TaskkillKiller {
    fn name(&self) -> &'static str {
        "taskkill"
    }

    fn kill_tree(&self, pid: u32) {
        if pid == 0 {
            return;
        }
        let pid_arg = pid.to_string();
        let result = std::process::Command::new("taskkill")
            .args(["/PID", pid_arg.as_str(), "/T", "/F"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if !status.success() => {
                tracing::debug!(pid, ?status, "taskkill reported failure, process likely gone");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(pid, error = %e, "failed to run taskkill"),
        }
    }
}

/// The tree killer for the current platform, chosen once at startup.
#[cfg(unix)]
pub fn platform_killer() -> Box<dyn TreeKiller> {
    Box::new(ProcessGroupKiller)
}

#[cfg(not(unix))]
pub fn platform_killer() -> Box<dyn TreeKiller> {
    Box::new(TaskkillKiller)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    async fn run_to_exit(child: &mut RunningChild) -> i32 {
        loop {
            if let Some(code) = child.poll_exit() {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_spawn_redirects_streams_separately() {
        let dir = tempdir().unwrap();
        let (out, err) = (dir.path().join("out.log"), dir.path().join("err.log"));
        let cmd = sh("echo to-stdout; echo to-stderr >&2");
        let spec = SpawnSpec {
            command: &cmd,
            stdout: &out,
            stderr: &err,
            env: Vec::new(),
        };

        let mut child = spawn_child(&spec).unwrap();
        assert!(child.pid() > 0);
        assert_eq!(run_to_exit(&mut child).await, 0);
        assert_eq!(child.finish(Duration::from_secs(1)).await, 0);

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "to-stdout\n");
        assert_eq!(std::fs::read_to_string(&err).unwrap(), "to-stderr\n");
    }

    #[tokio::test]
    async fn test_output_appended_across_attempts() {
        let dir = tempdir().unwrap();
        let (out, err) = (dir.path().join("out.log"), dir.path().join("err.log"));

        for attempt in 1..=2 {
            let cmd = sh("echo out-$NIGHTWATCH_ATTEMPT; echo err-$NIGHTWATCH_ATTEMPT >&2");
            let spec = SpawnSpec {
                command: &cmd,
                stdout: &out,
                stderr: &err,
                env: vec![("NIGHTWATCH_ATTEMPT".to_string(), attempt.to_string())],
            };
            let mut child = spawn_child(&spec).unwrap();
            run_to_exit(&mut child).await;
        }

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "out-1\nout-2\n");
        assert_eq!(std::fs::read_to_string(&err).unwrap(), "err-1\nerr-2\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let dir = tempdir().unwrap();
        let (out, err) = (dir.path().join("out.log"), dir.path().join("err.log"));
        let cmd = sh("exit 42");
        let spec = SpawnSpec {
            command: &cmd,
            stdout: &out,
            stderr: &err,
            env: Vec::new(),
        };
        let mut child = spawn_child(&spec).unwrap();
        assert_eq!(run_to_exit(&mut child).await, 42);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempdir().unwrap();
        let (out, err) = (dir.path().join("out.log"), dir.path().join("err.log"));
        let cmd = vec!["nonexistent-binary-xyz".to_string()];
        let spec = SpawnSpec {
            command: &cmd,
            stdout: &out,
            stderr: &err,
            env: Vec::new(),
        };
        let e = spawn_child(&spec).unwrap_err();
        assert!(matches!(e, SpawnError::Spawn { .. }));
        assert!(e.to_string().contains("failed to spawn child nonexistent-binary-xyz"));
    }

    #[tokio::test]
    async fn test_empty_command_and_bad_output_path() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.log");
        let empty: Vec<String> = Vec::new();
        let spec = SpawnSpec {
            command: &empty,
            stdout: &out,
            stderr: &out,
            env: Vec::new(),
        };
        assert!(matches!(spawn_child(&spec).unwrap_err(), SpawnError::EmptyCommand));

        let cmd = sh("true");
        let bad = Path::new("/nonexistent-dir/impossible/out.log");
        let spec = SpawnSpec {
            command: &cmd,
            stdout: bad,
            stderr: &out,
            env: Vec::new(),
        };
        assert!(matches!(spawn_child(&spec).unwrap_err(), SpawnError::OutputFile { .. }));
    }

    #[tokio::test]
    async fn test_kill_tree_stops_grandchildren() {
        let dir = tempdir().unwrap();
        let (out, err) = (dir.path().join("out.log"), dir.path().join("err.log"));
        // The ticking loop runs in a backgrounded subshell, i.e. a grandchild.
        let cmd = sh("(while true; do echo tick; sleep 0.05; done) & wait");
        let spec = SpawnSpec {
            command: &cmd,
            stdout: &out,
            stderr: &err,
            env: Vec::new(),
        };
        let child = spawn_child(&spec).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let killer = platform_killer();
        assert_eq!(killer.name(), "killpg");
        killer.kill_tree(child.pid());

        let code = child.finish(Duration::from_secs(5)).await;
        assert_eq!(code, -9);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let size_a = std::fs::metadata(&out).unwrap().len();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let size_b = std::fs::metadata(&out).unwrap().len();
        assert!(size_a > 0);
        assert_eq!(size_a, size_b, "grandchild kept writing after kill_tree");
    }

    #[tokio::test]
    async fn test_kill_tree_on_gone_process_is_silent() {
        let dir = tempdir().unwrap();
        let (out, err) = (dir.path().join("out.log"), dir.path().join("err.log"));
        let cmd = sh("true");
        let spec = SpawnSpec {
            command: &cmd,
            stdout: &out,
            stderr: &err,
            env: Vec::new(),
        };
        let mut child = spawn_child(&spec).unwrap();
        run_to_exit(&mut child).await;
        let pid = child.pid();
        child.finish(Duration::from_secs(1)).await;

        ProcessGroupKiller.kill_tree(pid);
        ProcessGroupKiller.kill_tree(0);
        TaskkillKiller.kill_tree(0);
    }

    #[tokio::test]
    async fn test_finish_times_out_to_sentinel() {
        let dir = tempdir().unwrap();
        let (out, err) = (dir.path().join("out.log"), dir.path().join("err.log"));
        let cmd = sh("sleep 5");
        let spec = SpawnSpec {
            command: &cmd,
            stdout: &out,
            stderr: &err,
            env: Vec::new(),
        };
        let child = spawn_child(&spec).unwrap();
        let pid = child.pid();

        let started = Instant::now();
        assert_eq!(child.finish(Duration::from_millis(100)).await, EXIT_SENTINEL);
        assert!(started.elapsed() < Duration::from_secs(3));
        ProcessGroupKiller.kill_tree(pid);
    }
}
