use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Manages the `.nightwatch/` directory layout.
///
/// Shared artifacts (the wake trigger and the status log) live directly under
/// the data directory; each supervised job gets its own directory under `jobs/`.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `.nightwatch/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one subdirectory per job.
    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    /// Default wake trigger path, shared by every job.
    pub fn wake_trigger(&self) -> PathBuf {
        self.root.join("wake_trigger.json")
    }

    /// Default human-readable status log, shared by every job.
    pub fn status_log(&self) -> PathBuf {
        self.root.join("status.md")
    }

    /// Default job root: `jobs/<stamp>_<sanitized job name>`.
    pub fn job_root_for(&self, job_name: &str, stamp: &str) -> PathBuf {
        self.jobs_dir()
            .join(format!("{stamp}_{}", sanitize_job_name(job_name)))
    }

    /// Create the data directory and append it to `.gitignore` when one exists
    /// next to it. Returns Ok(true) if the root was created.
    pub fn ensure_initialized(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(self.jobs_dir())?;
        self.update_gitignore()?;
        Ok(created)
    }

    /// Append the data directory to `.gitignore` if the file exists in the
    /// parent of the data directory and doesn't already list it.
    pub fn update_gitignore(&self) -> std::io::Result<()> {
        let gitignore_dir = match self.root.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let gitignore_path = gitignore_dir.join(".gitignore");
        if !gitignore_path.exists() {
            return Ok(());
        }

        let dir_name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.root.to_string_lossy().to_string());
        let entry = format!("{dir_name}/");

        let contents = std::fs::read_to_string(&gitignore_path)?;
        let already_present = contents.lines().any(|line| {
            let trimmed = line.trim();
            trimmed == entry || trimmed == dir_name
        });
        if already_present {
            return Ok(());
        }

        let prefix = if contents.ends_with('\n') || contents.is_empty() {
            ""
        } else {
            "\n"
        };
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&gitignore_path)?;
        use std::io::Write;
        writeln!(file, "{prefix}{entry}")
    }
}

/// Replace anything outside `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize_job_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Well-known artifact paths inside one job root.
#[derive(Debug, Clone)]
pub struct JobDir {
    root: PathBuf,
}

impl JobDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Immutable config snapshot.
    pub fn job_config(&self) -> PathBuf {
        self.root.join("job.json")
    }

    /// Latest run-state snapshot.
    pub fn run_state(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// Append-only supervisor narrative.
    pub fn supervisor_log(&self) -> PathBuf {
        self.root.join("supervisor.log")
    }

    pub fn child_stdout(&self) -> PathBuf {
        self.root.join("child_stdout.log")
    }

    pub fn child_stderr(&self) -> PathBuf {
        self.root.join("child_stderr.log")
    }

    pub fn watchdog_state(&self) -> PathBuf {
        self.root.join("watchdog_state.json")
    }

    pub fn watchdog_events(&self) -> PathBuf {
        self.root.join("watchdog_events.jsonl")
    }

    pub fn failure_summary(&self) -> PathBuf {
        self.root.join("failure_summary.md")
    }

    /// Rewritten on each failure with the tail of both output streams.
    pub fn log_tail(&self) -> PathBuf {
        self.root.join("child_log_tail.txt")
    }

    pub fn degrade_mode(&self) -> PathBuf {
        self.root.join("degrade_mode.json")
    }

    /// Path to the singleton lock file.
    pub fn lock(&self) -> PathBuf {
        self.root.join("supervisor.lock")
    }

    /// Take the exclusive supervisor lock for this job root.
    ///
    /// The lock is released when the returned guard is dropped (or the
    /// process exits).
    pub fn acquire_lock(&self) -> Result<JobLock, LockError> {
        let path = self.lock();
        let file = File::create(&path).map_err(|e| LockError::Open {
            path: path.clone(),
            source: e,
        })?;
        file.try_lock_exclusive()
            .map_err(|e| LockError::Held { path, source: e })?;
        Ok(JobLock { _file: file })
    }
}

/// Guard for the job-root lock.
#[derive(Debug)]
pub struct JobLock {
    _file: File,
}

/// Errors from taking the job-root lock.
#[derive(Debug)]
pub enum LockError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Held {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {source}", path.display())
            }
            LockError::Held { path, source } => write!(
                f,
                "another supervisor holds {} ({source})",
                path.display()
            ),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } => Some(source),
            LockError::Held { source, .. } => Some(source),
        }
    }
}
