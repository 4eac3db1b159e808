//! Core domain models for task-graph orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the crate: tasks, dependency edges and the execution DAG.

pub mod dag;
pub mod edge;
pub mod metrics;
pub mod snapshot;
pub mod task;

pub use dag::{GraphState, RemovedTask, StatusTransition, TaskGraph, TaskUpdate};
pub use edge::{Condition, DependencyEdge, DependencyKind, EdgeId, EdgeState};
pub use metrics::{MetricsMode, ParallelismMetrics};
pub use snapshot::{EdgeRecord, GraphSnapshot, NodeRecord};
pub use task::{DeviceId, TaskId, TaskNode, TaskOutcome, TaskStatus};
