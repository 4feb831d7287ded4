mod artifacts;
mod clock;
mod config;
mod data_dir;
mod persist;
mod process;
mod retry;
mod signals;
mod status;
mod supervisor;
mod wake;
mod watchdog;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use crate::config::{FileConfig, JobConfig, Overrides};
use crate::data_dir::{DataDir, JobDir};
use crate::supervisor::Supervisor;

const DEFAULT_CONFIG: &str = "nightwatch.toml";

/// Supervise one long-running command: restart it on crash, kill it when it
/// goes silent, and leave a wake trigger for whoever is watching.
#[derive(Parser, Debug)]
#[command(name = "nightwatch", version, about)]
pub struct Cli {
    /// Human label for the job
    #[arg(long, required_unless_present = "status")]
    job_name: Option<String>,

    /// Artifact directory (default: <data-dir>/jobs/<stamp>_<job-name>)
    #[arg(long)]
    job_root: Option<PathBuf>,

    /// Wake trigger path (default: <data-dir>/wake_trigger.json)
    #[arg(long)]
    wake_trigger: Option<PathBuf>,

    /// Suggested wait before the watcher acts on a trigger
    #[arg(long)]
    wake_after_s: Option<u64>,

    /// Window title hint recorded in the wake trigger
    #[arg(long)]
    wake_window_title: Option<String>,

    /// Heartbeat trigger interval in seconds, 0 disables
    #[arg(long)]
    heartbeat_interval_s: Option<u64>,

    /// Seconds without output before the child is killed, 0 disables
    #[arg(long)]
    watchdog_no_output_s: Option<u64>,

    /// SURGE threshold (derived from the breach threshold when unset)
    #[arg(long)]
    watchdog_surge_s: Option<u64>,

    /// SPILL threshold (derived from the breach threshold when unset)
    #[arg(long)]
    watchdog_spill_s: Option<u64>,

    /// Stop with WASHOUT after this many watchdog kills, 0 never
    #[arg(long)]
    watchdog_abort_after_kills: Option<u32>,

    /// Seconds between polls of the child
    #[arg(long)]
    poll_interval_s: Option<f64>,

    /// Failures tolerated before giving up
    #[arg(long)]
    max_restarts: Option<u32>,

    /// Base backoff between restarts in seconds
    #[arg(long)]
    restart_backoff_s: Option<f64>,

    /// Stop cleanly once this file exists
    #[arg(long)]
    stop_on_file: Option<PathBuf>,

    /// Stop after the child exits 0 (the default)
    #[arg(long, overrides_with = "no_stop_on_success")]
    stop_on_success: bool,

    /// Restart the child even after it exits 0
    #[arg(long, overrides_with = "stop_on_success")]
    no_stop_on_success: bool,

    /// Shared status log (default: <data-dir>/status.md)
    #[arg(long)]
    status_path: Option<PathBuf>,

    /// Lines per stream kept in child_log_tail.txt
    #[arg(long)]
    log_tail_lines: Option<usize>,

    /// Config file path (default: nightwatch.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for shared artifacts and default job roots
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the run state of --job-root and exit
    #[arg(long, requires = "job_root")]
    status: bool,

    /// Extra logging (watchdog ticks, restart decisions)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Command to supervise
    #[arg(last = true, value_name = "CHILD_CMD")]
    child_cmd: Vec<String>,
}

impl Cli {
    fn stop_on_success(&self) -> Option<bool> {
        if self.no_stop_on_success {
            Some(false)
        } else if self.stop_on_success {
            Some(true)
        } else {
            None
        }
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            job_name: self.job_name.clone().unwrap_or_default(),
            job_root: self.job_root.clone(),
            data_dir: self.data_dir.clone(),
            wake_trigger: self.wake_trigger.clone(),
            wake_after_s: self.wake_after_s,
            wake_window_title: self.wake_window_title.clone(),
            heartbeat_interval_s: self.heartbeat_interval_s,
            watchdog_no_output_s: self.watchdog_no_output_s,
            watchdog_surge_s: self.watchdog_surge_s,
            watchdog_spill_s: self.watchdog_spill_s,
            watchdog_abort_after_kills: self.watchdog_abort_after_kills,
            poll_interval_s: self.poll_interval_s,
            max_restarts: self.max_restarts,
            restart_backoff_s: self.restart_backoff_s,
            stop_on_file: self.stop_on_file.clone(),
            stop_on_success: self.stop_on_success(),
            status_path: self.status_path.clone(),
            log_tail_lines: self.log_tail_lines,
            child_cmd: self.child_cmd.clone(),
        }
    }
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "nightwatch=debug"
    } else if cli.quiet {
        "nightwatch=warn"
    } else {
        "nightwatch=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<FileConfig, config::ConfigError> {
    match &cli.config {
        Some(path) => config::load_file_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            config::load_file_config(Path::new(DEFAULT_CONFIG))
        }
        None => Ok(FileConfig::default()),
    }
}

fn print_status(job_root: &Path) -> i32 {
    let dir = JobDir::new(job_root);
    let Some(state) = status::read_run_state(&dir.run_state()) else {
        eprintln!("No run state found at {}", dir.run_state().display());
        return 1;
    };
    println!("job_root:   {}", job_root.display());
    println!("phase:      {}", state.phase.as_str());
    println!("updated:    {}", state.updated_utc);
    println!("supervisor: pid {}", state.pid);
    println!("attempt:    {} (failures {})", state.attempt, state.failures);
    if state.child_running {
        println!("child:      running, pid {}", state.child_pid);
    } else if let Some(code) = state.child_exit_code {
        println!(
            "child:      exited rc={code} after {:.1}s",
            state.child_duration_s.unwrap_or(0.0)
        );
    }
    println!("command:    {:?}", state.child_cmd);

    if let Ok(contents) = std::fs::read_to_string(dir.watchdog_state()) {
        match serde_json::from_str::<artifacts::WatchdogStateFile>(&contents) {
            Ok(wd) => {
                println!(
                    "watchdog:   {} ({}) no_output_s={:.1} kills={}",
                    wd.stage, wd.reason, wd.no_output_s, wd.kill_count
                );
                if !wd.degrade_level.is_empty() {
                    println!("degrade:    {}", wd.degrade_level);
                }
            }
            Err(e) => eprintln!("Unreadable watchdog state: {e}"),
        }
    }
    0
}

fn print_dry_run(config: &JobConfig) -> i32 {
    match serde_json::to_string_pretty(config) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            eprintln!("Error: failed to render config: {e}");
            1
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    if cli.status {
        // `requires = "job_root"` guarantees the path.
        let code = cli.job_root.as_deref().map(print_status).unwrap_or(2);
        std::process::exit(code);
    }

    let file = match load_config(&cli) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let config = match JobConfig::resolve(cli.overrides(), file, &clock::compact_local()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if cli.dry_run {
        std::process::exit(print_dry_run(&config));
    }

    let data_dir = DataDir::new(&config.data_dir);
    match data_dir.ensure_initialized() {
        Ok(true) => tracing::info!(path = %data_dir.root().display(), "created data directory"),
        Ok(false) => {}
        Err(e) => {
            eprintln!(
                "Error: failed to initialize data directory {}: {e}",
                data_dir.root().display()
            );
            std::process::exit(1);
        }
    }

    let job = JobDir::new(&config.job_root);
    if let Err(e) = job.create() {
        eprintln!(
            "Error: failed to create job root {}: {e}",
            config.job_root.display()
        );
        std::process::exit(1);
    }
    let lock = match job.acquire_lock() {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        job = %config.job_name,
        job_root = %config.job_root.display(),
        watchdog = config.watchdog_enabled(),
        "nightwatch starting"
    );

    let code = match Supervisor::new(config, process::platform_killer()).run().await {
        Ok(exit) => {
            tracing::info!(?exit, code = exit.code(), "supervisor finished");
            exit.code()
        }
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };
    drop(lock);
    std::process::exit(code);
}
