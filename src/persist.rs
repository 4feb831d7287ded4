/// Crash-safe file writers.
///
/// Snapshot files are replaced atomically: the payload is written to a sibling
/// temp file in the destination directory, which is then renamed over the
/// destination, so readers see either the old document or the new one.
/// History files are only ever opened in append mode.
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors from persistence operations.
#[derive(Debug)]
pub enum PersistError {
    Serialize {
        source: serde_json::Error,
    },
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Serialize { source } => write!(f, "failed to serialize: {source}"),
            PersistError::CreateDir { path, source } => {
                write!(f, "failed to create directory {}: {source}", path.display())
            }
            PersistError::Write { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
            PersistError::Rename { to, source } => {
                write!(f, "failed to rename temp file over {}: {source}", to.display())
            }
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistError::Serialize { source } => Some(source),
            PersistError::CreateDir { source, .. } => Some(source),
            PersistError::Write { source, .. } => Some(source),
            PersistError::Rename { source, .. } => Some(source),
        }
    }
}

/// Create the parent directory of `path` if it is missing.
pub fn ensure_parent(path: &Path) -> Result<(), PersistError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            std::fs::create_dir_all(dir).map_err(|e| PersistError::CreateDir {
                path: dir.to_path_buf(),
                source: e,
            })
        }
        _ => Ok(()),
    }
}

/// Atomically replace `path` with `bytes`.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    ensure_parent(path)?;
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".nightwatch.tmp.")
        .tempfile_in(dir)
        .map_err(|e| PersistError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PersistError::Write {
            path: tmp.path().to_path_buf(),
            source: e,
        })?;

    tmp.persist(path).map_err(|e| PersistError::Rename {
        to: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Atomically replace `path` with the pretty-printed JSON form of `value`.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let mut json =
        serde_json::to_string_pretty(value).map_err(|e| PersistError::Serialize { source: e })?;
    json.push('\n');
    atomic_write(path, json.as_bytes())
}

/// Append raw bytes to `path`, creating it (and its directory) if needed.
pub fn append(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    ensure_parent(path)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(bytes))
        .map_err(|e| PersistError::Write {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Append one line of text. A trailing newline in `line` is not doubled.
pub fn append_line(path: &Path, line: &str) -> Result<(), PersistError> {
    let mut buf = line.trim_end_matches('\n').to_string();
    buf.push('\n');
    append(path, buf.as_bytes())
}

/// Append one compact JSON object as a JSON-lines record.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let mut json = serde_json::to_string(value).map_err(|e| PersistError::Serialize { source: e })?;
    json.push('\n');
    append(path, json.as_bytes())
}
