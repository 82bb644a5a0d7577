use thiserror::Error;

use crate::flow::FlowError;
use crate::task::{TaskError, TaskId};

/// Top-level error returned by [`crate::execute`] and the task/flow APIs.
#[derive(Error, Debug)]
pub enum MazepaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Task {task_id} ({operation_name}) failed: {error}")]
    TaskFailed {
        task_id: TaskId,
        operation_name: String,
        error: TaskError,
    },

    #[error("Task {task_id} ({operation_name}) exhausted {attempts} attempts: {error}")]
    RetriesExhausted {
        task_id: TaskId,
        operation_name: String,
        attempts: u32,
        error: TaskError,
    },

    #[error("Flow {flow} failed: {source}")]
    Flow {
        flow: String,
        #[source]
        source: FlowError,
    },

    #[error("Execution stalled: {0}")]
    Stalled(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl From<serde_json::Error> for MazepaError {
    fn from(e: serde_json::Error) -> Self {
        MazepaError::Serialization(e.to_string())
    }
}

impl MazepaError {
    /// The captured task error behind a task-level abort, if any.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            MazepaError::TaskFailed { error, .. } | MazepaError::RetriesExhausted { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }
}

/// Infrastructure errors raised by an [`crate::ExecutionQueue`] implementation.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("message parse error: {0}")]
    Parse(String),

    #[error("message encode error: {0}")]
    Encode(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("checkpoint decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("unsupported checkpoint version {0}")]
    Version(u16),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("overrides must be a table, got {0}")]
    NotATable(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}
