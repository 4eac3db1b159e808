//! Task node data model for the execution graph.
//!
//! A `TaskNode` is the atomic unit of work handed to a device. Each node
//! tracks its status, optional device assignment, advisory tips, and the
//! result or error recorded on its terminal transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task within a graph.
///
/// Planners may supply their own identifiers (`"task-1"`); locally created
/// tasks get a UUID v4.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a remote worker device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task status in its lifecycle.
///
/// `Completed`, `Failed` and `Cancelled` are terminal: no further
/// transitions occur once a node reaches one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// All incoming edges are currently satisfied (or there are none).
    #[default]
    Pending,
    /// At least one incoming edge is not yet satisfied.
    WaitingDependency,
    /// Dispatched to a device and awaiting its completion signal.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Abandoned without (or before) completing.
    Cancelled,
}

impl TaskStatus {
    /// True for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// True for states that still accept structural edits.
    pub fn is_modifiable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::WaitingDependency)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::WaitingDependency => "waiting_dependency",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Terminal report delivered by a device for a dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TaskOutcome {
    Completed {
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    Failed {
        error: String,
    },
}

impl TaskOutcome {
    pub fn completed(result: serde_json::Value) -> Self {
        TaskOutcome::Completed {
            result: Some(result),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }
}

/// A single schedulable unit in the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable name for the task.
    pub name: String,
    /// Instruction handed to the target device.
    pub description: String,
    /// Device that should (or did) execute this task.
    #[serde(default)]
    pub target_device_id: Option<DeviceId>,
    /// Advisory guidance passed along with the description.
    #[serde(default)]
    pub tips: Vec<String>,
    /// Current execution status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Predecessor ids, cached from the owning graph's edges.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Payload reported by the device on success.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error detail recorded on failure or cancellation.
    #[serde(default)]
    pub error: Option<String>,
    /// When the task was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When the task was dispatched.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    /// Create a new task with a generated id and Pending status.
    pub fn new(name: &str, description: &str) -> Self {
        Self::with_id(TaskId::new(), name, description)
    }

    /// Create a new task with a caller-supplied id.
    pub fn with_id(id: impl Into<TaskId>, name: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            description: description.to_string(),
            target_device_id: None,
            tips: Vec::new(),
            status: TaskStatus::Pending,
            dependencies: BTreeSet::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn tips<I, S>(mut self, tips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tips = tips.into_iter().map(Into::into).collect();
        self
    }

    pub fn target_device(mut self, device: impl Into<DeviceId>) -> Self {
        self.target_device_id = Some(device.into());
        self
    }

    /// Transition to Running and record the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transition to Completed with the device's result.
    pub fn complete(&mut self, result: Option<serde_json::Value>) {
        self.status = TaskStatus::Completed;
        self.result = result;
        self.completed_at = Some(Utc::now());
    }

    /// Transition to Failed with an error message.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }

    /// Transition to Cancelled, recording why.
    pub fn cancel(&mut self, reason: &str) {
        self.status = TaskStatus::Cancelled;
        self.error = Some(reason.to_string());
        self.completed_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_modifiable(&self) -> bool {
        self.status.is_modifiable()
    }

    /// Wall time between dispatch and the terminal transition.
    ///
    /// Nodes cancelled before dispatch report a zero duration.
    pub fn duration(&self) -> Option<Duration> {
        let completed = self.completed_at?;
        let started = self.started_at.unwrap_or(completed);
        Some((completed - started).to_std().unwrap_or(Duration::ZERO))
    }
}
