use std::time::Duration;

use thiserror::Error;

use crate::core::edge::EdgeId;
use crate::core::task::{DeviceId, TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Task {0} not found in graph")]
    UnknownNode(TaskId),

    #[error("Edge {0} not found in graph")]
    UnknownEdge(EdgeId),

    #[error("Task {0} cannot depend on itself")]
    SelfLoop(TaskId),

    #[error("Adding dependency from {from} to {to} would create a cycle")]
    CyclicDependency { from: TaskId, to: TaskId },

    #[error("Task {id} is {status} and can no longer be modified")]
    ImmutableState { id: TaskId, status: TaskStatus },

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Ignoring signal for task {id}: expected {expected}, found {status}")]
    DuplicateSignal {
        id: TaskId,
        expected: TaskStatus,
        status: TaskStatus,
    },

    #[error("Graph invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No home directory")]
    NoHomeDir,
}

/// Failures reported by the device layer while assigning or reaching a device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no device can run task {0}")]
    NoDevice(TaskId),

    #[error("device {device} unreachable: {reason}")]
    Unreachable { device: DeviceId, reason: String },

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("dispatch abandoned")]
    Abandoned,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
