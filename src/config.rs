use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::data_dir::DataDir;
use crate::watchdog::{ThresholdError, Thresholds};

/// Optional configuration file (`--config nightwatch.toml`).
///
/// Every field has a default; CLI flags override whatever is set here.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub watchdog: WatchdogSection,
    pub restart: RestartSection,
    pub wake: WakeSection,
    pub paths: PathsSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    /// Breach threshold; 0 disables the watchdog.
    pub no_output_secs: u64,
    pub surge_secs: u64,
    pub spill_secs: u64,
    /// 0 = never abort.
    pub abort_after_kills: u32,
    pub poll_interval_secs: f64,
    pub log_tail_lines: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RestartSection {
    pub max_restarts: u32,
    pub backoff_secs: f64,
    pub stop_on_success: bool,
    pub stop_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WakeSection {
    pub trigger_path: Option<PathBuf>,
    pub after_secs: u64,
    /// 0 disables heartbeat triggers.
    pub heartbeat_interval_secs: u64,
    pub window_title: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub data_dir: PathBuf,
    pub status_path: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            no_output_secs: 0,
            surge_secs: 0,
            spill_secs: 0,
            abort_after_kills: 0,
            poll_interval_secs: 1.0,
            log_tail_lines: 200,
        }
    }
}

impl Default for RestartSection {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            backoff_secs: 5.0,
            stop_on_success: true,
            stop_file: None,
        }
    }
}

impl Default for WakeSection {
    fn default() -> Self {
        Self {
            trigger_path: None,
            after_secs: 720,
            heartbeat_interval_secs: 0,
            window_title: String::new(),
        }
    }
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".nightwatch"),
            status_path: None,
        }
    }
}

/// Load a TOML config file.
pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Values given on the command line. `None` falls back to the config file,
/// then to the built-in defaults.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub job_name: String,
    pub job_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub wake_trigger: Option<PathBuf>,
    pub wake_after_s: Option<u64>,
    pub wake_window_title: Option<String>,
    pub heartbeat_interval_s: Option<u64>,
    pub watchdog_no_output_s: Option<u64>,
    pub watchdog_surge_s: Option<u64>,
    pub watchdog_spill_s: Option<u64>,
    pub watchdog_abort_after_kills: Option<u32>,
    pub poll_interval_s: Option<f64>,
    pub max_restarts: Option<u32>,
    pub restart_backoff_s: Option<f64>,
    pub stop_on_file: Option<PathBuf>,
    pub stop_on_success: Option<bool>,
    pub status_path: Option<PathBuf>,
    pub log_tail_lines: Option<usize>,
    pub child_cmd: Vec<String>,
}

/// Immutable, fully resolved configuration of one supervisor invocation.
///
/// Persisted verbatim to `job.json`.
#[derive(Debug, Clone, Serialize)]
pub struct JobConfig {
    pub job_name: String,
    pub job_root: PathBuf,
    pub data_dir: PathBuf,
    pub wake_trigger: PathBuf,
    pub wake_after_s: u64,
    pub wake_window_title: String,
    pub heartbeat_interval_s: u64,
    pub watchdog_no_output_s: u64,
    pub watchdog_surge_s: u64,
    pub watchdog_spill_s: u64,
    pub watchdog_abort_after_kills: u32,
    /// Derived and validated stage thresholds.
    pub thresholds: Thresholds,
    pub poll_interval_s: f64,
    pub max_restarts: u32,
    pub restart_backoff_s: f64,
    pub stop_on_file: Option<PathBuf>,
    pub stop_on_success: bool,
    pub status_path: PathBuf,
    pub log_tail_lines: usize,
    pub child_cmd: Vec<String>,
}

impl JobConfig {
    /// Merge CLI overrides over the file config and validate the result.
    ///
    /// `stamp` names the default job root (see `DataDir::job_root_for`).
    pub fn resolve(cli: Overrides, file: FileConfig, stamp: &str) -> Result<Self, ConfigError> {
        let job_name = cli.job_name.trim().to_string();
        if job_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "job-name",
                reason: "must not be empty".to_string(),
            });
        }
        if cli.child_cmd.is_empty() {
            return Err(ConfigError::Invalid {
                field: "child command",
                reason: "missing; pass it after `--`".to_string(),
            });
        }

        let data_dir = cli.data_dir.unwrap_or(file.paths.data_dir);
        let layout = DataDir::new(&data_dir);
        let job_root = cli
            .job_root
            .unwrap_or_else(|| layout.job_root_for(&job_name, stamp));
        let wake_trigger = cli
            .wake_trigger
            .or(file.wake.trigger_path)
            .unwrap_or_else(|| layout.wake_trigger());
        let status_path = cli
            .status_path
            .or(file.paths.status_path)
            .unwrap_or_else(|| layout.status_log());

        let breach = cli
            .watchdog_no_output_s
            .unwrap_or(file.watchdog.no_output_secs);
        let surge = cli.watchdog_surge_s.unwrap_or(file.watchdog.surge_secs);
        let spill = cli.watchdog_spill_s.unwrap_or(file.watchdog.spill_secs);
        let thresholds = Thresholds::derive(breach, surge, spill)?;

        let mut poll_interval_s = cli
            .poll_interval_s
            .unwrap_or(file.watchdog.poll_interval_secs);
        if !poll_interval_s.is_finite() || poll_interval_s <= 0.0 {
            poll_interval_s = 1.0;
        }

        let restart_backoff_s = cli.restart_backoff_s.unwrap_or(file.restart.backoff_secs);
        if !restart_backoff_s.is_finite() || restart_backoff_s < 0.0 {
            return Err(ConfigError::Invalid {
                field: "restart-backoff-s",
                reason: format!("must be a non-negative number of seconds, got {restart_backoff_s}"),
            });
        }

        Ok(Self {
            job_name,
            job_root,
            data_dir,
            wake_trigger,
            wake_after_s: cli.wake_after_s.unwrap_or(file.wake.after_secs),
            wake_window_title: cli
                .wake_window_title
                .unwrap_or(file.wake.window_title),
            heartbeat_interval_s: cli
                .heartbeat_interval_s
                .unwrap_or(file.wake.heartbeat_interval_secs),
            watchdog_no_output_s: breach,
            watchdog_surge_s: surge,
            watchdog_spill_s: spill,
            watchdog_abort_after_kills: cli
                .watchdog_abort_after_kills
                .unwrap_or(file.watchdog.abort_after_kills),
            thresholds,
            poll_interval_s,
            max_restarts: cli.max_restarts.unwrap_or(file.restart.max_restarts),
            restart_backoff_s,
            stop_on_file: cli.stop_on_file.or(file.restart.stop_file),
            stop_on_success: cli
                .stop_on_success
                .unwrap_or(file.restart.stop_on_success),
            status_path,
            log_tail_lines: cli.log_tail_lines.unwrap_or(file.watchdog.log_tail_lines),
            child_cmd: cli.child_cmd,
        })
    }

    pub fn watchdog_enabled(&self) -> bool {
        self.thresholds.enabled()
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Thresholds(ThresholdError),
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl From<ThresholdError> for ConfigError {
    fn from(e: ThresholdError) -> Self {
        ConfigError::Thresholds(e)
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Thresholds(e) => write!(f, "{e}"),
            ConfigError::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Thresholds(e) => Some(e),
            ConfigError::Invalid { .. } => None,
        }
    }
}
