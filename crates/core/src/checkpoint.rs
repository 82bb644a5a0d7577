//! Checkpoint files: a zstd-compressed MessagePack snapshot of settled tasks.
//!
//! Layout: `<checkpoint_dir>/<execution_id>/checkpoint-<timestamp>.zstd`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::CheckpointError;
use crate::state::{ExecutionState, SettledTask};
use crate::task::{TaskId, TaskOutcome, TaskStatus};

pub const CHECKPOINT_VERSION: u16 = 1;

const FILE_PREFIX: &str = "checkpoint-";
const FILE_SUFFIX: &str = ".zstd";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub task_id: TaskId,
    pub operation_name: String,
    pub status: TaskStatus,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u16,
    pub execution_id: String,
    pub created_at: DateTime<Utc>,
    pub tasks: Vec<CheckpointEntry>,
}

impl Checkpoint {
    /// Snapshot the succeeded tasks of `state`, sorted by task id.
    ///
    /// Failed tasks are left out so a resumed run executes them again.
    pub fn from_state(execution_id: &str, state: &ExecutionState) -> Self {
        let mut tasks: Vec<CheckpointEntry> = state
            .settled()
            .filter(|(_, s)| s.status == TaskStatus::Succeeded)
            .map(|(id, s)| CheckpointEntry {
                task_id: id.clone(),
                operation_name: s.operation_name.clone(),
                status: s.status,
                outcome: s.outcome.clone(),
            })
            .collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Self {
            version: CHECKPOINT_VERSION,
            execution_id: execution_id.to_string(),
            created_at: Utc::now(),
            tasks,
        }
    }

    /// Write into `<checkpoint_dir>/<execution_id>/` via a temp file and rename.
    pub fn write(&self, checkpoint_dir: &Path) -> Result<PathBuf, CheckpointError> {
        let dir = checkpoint_dir.join(&self.execution_id);
        fs::create_dir_all(&dir)?;

        let encoded = rmp_serde::to_vec_named(self)?;
        let compressed = zstd::encode_all(encoded.as_slice(), 3)?;

        let name = format!(
            "{FILE_PREFIX}{}{FILE_SUFFIX}",
            self.created_at.format("%Y%m%dT%H%M%S%.6fZ")
        );
        let path = dir.join(&name);
        let tmp = dir.join(format!(".{name}.tmp"));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&compressed)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        info!(
            "Checkpoint {} written: {} tasks, {} bytes ({} raw)",
            path.display(),
            self.tasks.len(),
            compressed.len(),
            encoded.len()
        );
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self, CheckpointError> {
        let compressed = fs::read(path)?;
        let encoded = zstd::decode_all(compressed.as_slice())?;
        let checkpoint: Checkpoint = rmp_serde::from_slice(&encoded)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Version(checkpoint.version));
        }
        debug!(path = %path.display(), tasks = checkpoint.tasks.len(), "Read checkpoint");
        Ok(checkpoint)
    }

    /// Entries in the shape the execution state restores from.
    pub fn into_ledger(self) -> impl Iterator<Item = (TaskId, SettledTask)> {
        self.tasks.into_iter().map(|e| {
            (
                e.task_id,
                SettledTask {
                    operation_name: e.operation_name,
                    status: e.status,
                    outcome: e.outcome,
                },
            )
        })
    }
}

/// Snapshot `state` and write it under `checkpoint_dir`.
pub fn record_execution_checkpoint(
    checkpoint_dir: &Path,
    execution_id: &str,
    state: &ExecutionState,
) -> Result<PathBuf, CheckpointError> {
    Checkpoint::from_state(execution_id, state).write(checkpoint_dir)
}

/// Newest checkpoint file in `dir`, by timestamped name.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut newest: Option<PathBuf> = None;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_checkpoint = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX));
        if is_checkpoint && newest.as_ref().map_or(true, |n| path > *n) {
            newest = Some(path);
        }
    }
    Ok(newest)
}

/// Resolve a resume target: a checkpoint file, or a directory holding them.
pub fn resolve_checkpoint(path: &Path) -> Result<PathBuf, CheckpointError> {
    if path.is_dir() {
        latest_checkpoint(path)?.ok_or_else(|| {
            CheckpointError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no checkpoint files in {}", path.display()),
            ))
        })
    } else {
        Ok(path.to_path_buf())
    }
}

/// Decides when the executor loop should write the next checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointSchedule {
    interval: Option<Duration>,
    last: Instant,
}

impl CheckpointSchedule {
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    pub fn is_due(&self) -> bool {
        self.interval.is_some_and(|i| self.last.elapsed() >= i)
    }

    pub fn mark(&mut self) {
        self.last = Instant::now();
    }
}
