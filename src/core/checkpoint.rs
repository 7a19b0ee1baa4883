//! Durable checkpoint host for monitor state.
//!
//! Each monitor owns one directory holding:
//! - `checkpoint.jsonl`: newline-delimited JSON checkpoint events, always
//!   starting with an `epoch_started` snapshot
//! - `dead_letter.jsonl`: items dropped after repeated failures
//! - `monitor.lock`: advisory lock held while the monitor runs
//!
//! Rotation replaces the whole log with a single fresh snapshot.

use std::fs::{File as StdFile, OpenOptions as StdOpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::{CheckpointEvent, DeadLetter, PollState};

const LOG_FILE: &str = "checkpoint.jsonl";
const DEAD_LETTER_FILE: &str = "dead_letter.jsonl";
const LOCK_FILE: &str = "monitor.lock";

/// Errors from the checkpoint host
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt checkpoint at {path}:{line}: {message}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Monitor '{0}' is already running (checkpoint locked)")]
    Locked(String),
}

/// Durable home for a monitor's `PollState`
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last persisted state, or `None` on first start
    async fn resume(&self) -> Result<Option<PollState>, CheckpointError>;

    /// Record one incremental change
    async fn append(&self, event: &CheckpointEvent) -> Result<(), CheckpointError>;

    /// Discard all history and start over from `state`
    async fn rotate(&self, state: &PollState) -> Result<(), CheckpointError>;

    /// Keep an abandoned item for manual inspection
    async fn dead_letter(&self, entry: &DeadLetter) -> Result<(), CheckpointError>;
}

/// File-based checkpoint store using JSONL format
pub struct JsonlCheckpointStore {
    /// Monitor name
    monitor: String,

    /// Directory containing the monitor's files
    dir: PathBuf,

    /// Path to checkpoint.jsonl
    log_path: PathBuf,

    /// Path to dead_letter.jsonl
    dead_letter_path: PathBuf,

    /// Held for the store's lifetime; released on drop
    _lock: StdFile,
}

impl JsonlCheckpointStore {
    /// Open the store for a monitor under the configured home directory
    pub async fn open(monitor: &str) -> anyhow::Result<Self> {
        let root = crate::config::monitors_dir()?;
        Ok(Self::open_at(&root, monitor).await?)
    }

    /// Open the store for a monitor under `root`, taking the exclusive lock
    pub async fn open_at(root: &Path, monitor: &str) -> Result<Self, CheckpointError> {
        let dir = root.join(monitor);
        fs::create_dir_all(&dir).await?;

        let lock = StdOpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| CheckpointError::Locked(monitor.to_string()))?;

        Ok(Self {
            monitor: monitor.to_string(),
            log_path: dir.join(LOG_FILE),
            dead_letter_path: dir.join(DEAD_LETTER_FILE),
            dir,
            _lock: lock,
        })
    }

    /// Read a monitor's state without taking the lock or repairing the log
    pub async fn peek(root: &Path, monitor: &str) -> Result<Option<PollState>, CheckpointError> {
        let log_path = root.join(monitor).join(LOG_FILE);
        let (events, _) = read_log(&log_path).await?;
        Ok(PollState::from_events(&events))
    }

    pub fn monitor(&self) -> &str {
        &self.monitor
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn dead_letter_path(&self) -> &Path {
        &self.dead_letter_path
    }

    /// All events in the current epoch, in order
    pub async fn events(&self) -> Result<Vec<CheckpointEvent>, CheckpointError> {
        Ok(read_log(&self.log_path).await?.0)
    }

    /// All dead-lettered items, oldest first
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, CheckpointError> {
        if !self.dead_letter_path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.dead_letter_path).await?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(CheckpointError::from))
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for JsonlCheckpointStore {
    async fn resume(&self) -> Result<Option<PollState>, CheckpointError> {
        let (events, tail) = read_log(&self.log_path).await?;

        // Later appends must start on a fresh line
        match tail {
            LogTail::Clean => {}
            LogTail::Torn { valid_len } => {
                warn!(
                    monitor = %self.monitor,
                    path = %self.log_path.display(),
                    "Dropping incomplete trailing checkpoint line"
                );
                let file = OpenOptions::new().write(true).open(&self.log_path).await?;
                file.set_len(valid_len).await?;
                file.sync_all().await?;
            }
            LogTail::Unterminated => {
                warn!(
                    monitor = %self.monitor,
                    path = %self.log_path.display(),
                    "Terminating checkpoint line written without newline"
                );
                let mut file = OpenOptions::new().append(true).open(&self.log_path).await?;
                file.write_all(b"\n").await?;
                file.flush().await?;
                file.sync_all().await?;
            }
        }

        debug!(monitor = %self.monitor, events = events.len(), "Replayed checkpoint log");
        Ok(PollState::from_events(&events))
    }

    async fn append(&self, event: &CheckpointEvent) -> Result<(), CheckpointError> {
        append_line(&self.log_path, &serde_json::to_string(event)?).await
    }

    async fn rotate(&self, state: &PollState) -> Result<(), CheckpointError> {
        let snapshot = CheckpointEvent::epoch_started(state, state.epoch_start);
        let tmp_path = self.log_path.with_extension("jsonl.tmp");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        let json = serde_json::to_string(&snapshot)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &self.log_path).await?;
        sync_dir(&self.dir).await?;
        Ok(())
    }

    async fn dead_letter(&self, entry: &DeadLetter) -> Result<(), CheckpointError> {
        append_line(&self.dead_letter_path, &serde_json::to_string(entry)?).await
    }
}

async fn append_line(path: &Path, json: &str) -> Result<(), CheckpointError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    file.write_all(format!("{}\n", json).as_bytes()).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

/// Make a rename inside `dir` durable
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), CheckpointError> {
    fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), CheckpointError> {
    Ok(())
}

/// State of the last line of a checkpoint log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogTail {
    /// Empty log or final line ends with a newline
    Clean,
    /// Final line is an unparsable partial write; keep `valid_len` bytes
    Torn { valid_len: u64 },
    /// Final line parsed but its newline never made it to disk
    Unterminated,
}

/// Parse a checkpoint log.
///
/// A final line without a terminating newline is a write interrupted by a
/// crash. If it fails to parse it is skipped; if it parses it is kept.
/// Either way the returned `LogTail` tells the caller how to repair the
/// file before appending. Any other bad line is an error.
async fn read_log(path: &Path) -> Result<(Vec<CheckpointEvent>, LogTail), CheckpointError> {
    if !path.exists() {
        return Ok((Vec::new(), LogTail::Clean));
    }

    let content = fs::read_to_string(path).await?;
    let mut events = Vec::new();
    let mut offset = 0usize;

    for (idx, line) in content.split_inclusive('\n').enumerate() {
        let start = offset;
        offset += line.len();

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<CheckpointEvent>(line.trim_end()) {
            Ok(event) => {
                events.push(event);
                if !line.ends_with('\n') {
                    return Ok((events, LogTail::Unterminated));
                }
            }
            Err(_) if !line.ends_with('\n') => {
                return Ok((
                    events,
                    LogTail::Torn {
                        valid_len: start as u64,
                    },
                ));
            }
            Err(e) => {
                return Err(CheckpointError::Corrupt {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    message: e.to_string(),
                });
            }
        }
    }

    Ok((events, LogTail::Clean))
}
