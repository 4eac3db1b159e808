//! Task dependency graphs and their execution.
//!
//! - [`core`]: tasks, dependency edges, the DAG, metrics and snapshots
//! - [`editor`]: undoable structural edits
//! - [`orchestration`]: drives a graph through a device backend

pub mod config;
pub mod core;
pub mod editor;
pub mod error;
pub mod log;
pub mod orchestration;

pub use error::{DispatchError, Error, Result};
