use std::path::{Path, PathBuf};

/// STOP file detection for graceful shutdown.
///
/// The presence of the configured file is the only external cancellation
/// mechanism. It is checked on every tick of both supervisor loops; once it
/// exists the current child is killed and the supervisor exits cleanly.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    path: Option<PathBuf>,
}

impl StopSignal {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// True when a stop file is configured and present.
    pub fn requested(&self) -> bool {
        self.path.as_deref().is_some_and(Path::exists)
    }
}
