//! Orchestration layer: drives a task graph through execution.
//!
//! This module provides the device backend seam, the event stream consumed
//! by visualisation layers, and the orchestrator that walks the graph.

mod backend;
mod events;
mod orchestrator;

pub use backend::{DeadlineBackend, DeviceBackend, DispatchRequest, LocalBackend};
pub use events::{EventBus, GraphEvent};
pub use orchestrator::{
    ExecutionReport, Orchestrator, OrchestratorHandle, TaskFailure, TaskSummary,
};

pub use crate::core::task::TaskOutcome;
