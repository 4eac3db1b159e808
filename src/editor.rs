//! Undoable structural edits over a [`TaskGraph`].
//!
//! Every mutation goes through an [`EditCommand`]. Executing a command
//! records the data needed to reverse it (the removed node with its edges,
//! the previous field values, the inserted edge) so `undo` is a pure
//! structural reversal. Commands only ever touch nodes that have not
//! started, which keeps reversal independent of in-flight execution.

use crate::core::dag::{RemovedTask, TaskGraph, TaskUpdate};
use crate::core::edge::{DependencyEdge, EdgeId};
use crate::core::task::{TaskId, TaskNode};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A structural mutation of a task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditCommand {
    AddTask { task: TaskNode },
    RemoveTask { id: TaskId },
    UpdateTask { id: TaskId, update: TaskUpdate },
    AddDependency { edge: DependencyEdge },
    RemoveDependency { id: EdgeId },
    /// Applied atomically and undone as one step.
    Batch { commands: Vec<EditCommand> },
}

impl EditCommand {
    pub fn add_task(task: TaskNode) -> Self {
        EditCommand::AddTask { task }
    }

    pub fn remove_task(id: impl Into<TaskId>) -> Self {
        EditCommand::RemoveTask { id: id.into() }
    }

    pub fn update_task(id: impl Into<TaskId>, update: TaskUpdate) -> Self {
        EditCommand::UpdateTask {
            id: id.into(),
            update,
        }
    }

    pub fn add_dependency(edge: DependencyEdge) -> Self {
        EditCommand::AddDependency { edge }
    }

    pub fn remove_dependency(id: impl Into<EdgeId>) -> Self {
        EditCommand::RemoveDependency { id: id.into() }
    }

    pub fn batch(commands: Vec<EditCommand>) -> Self {
        EditCommand::Batch { commands }
    }

    fn label(&self) -> &'static str {
        match self {
            EditCommand::AddTask { .. } => "add_task",
            EditCommand::RemoveTask { .. } => "remove_task",
            EditCommand::UpdateTask { .. } => "update_task",
            EditCommand::AddDependency { .. } => "add_dependency",
            EditCommand::RemoveDependency { .. } => "remove_dependency",
            EditCommand::Batch { .. } => "batch",
        }
    }
}

/// What an applied command changed, enough to reverse it.
#[derive(Debug, Clone)]
enum Applied {
    AddedTask(TaskId),
    RemovedTask(RemovedTask),
    UpdatedTask { id: TaskId, previous: TaskUpdate },
    AddedDependency(EdgeId),
    RemovedDependency(DependencyEdge),
    Batch(Vec<Applied>),
}

#[derive(Debug, Clone)]
struct Entry {
    command: EditCommand,
    applied: Applied,
}

/// Command-pattern editor with undo/redo history.
///
/// The editor does not own the graph; callers pass the graph they hold
/// (for a running plan, the one behind the orchestrator's lock).
#[derive(Debug, Default)]
pub struct GraphEditor {
    undo_stack: Vec<Entry>,
    redo_stack: Vec<EditCommand>,
}

impl GraphEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a command and push it onto the undo history.
    ///
    /// Clears the redo history. On error the graph is unchanged and the
    /// history is untouched.
    pub fn execute(&mut self, graph: &mut TaskGraph, command: EditCommand) -> Result<()> {
        let applied = apply(graph, &command)?;
        debug!(command = command.label(), "edit applied");
        self.undo_stack.push(Entry { command, applied });
        self.redo_stack.clear();
        Ok(())
    }

    /// Reverse the most recent command.
    ///
    /// Returns `Ok(false)` when there is nothing to undo. If the reversal
    /// is no longer possible (a node it touches has since started), the
    /// graph is left as it was, both histories are cleared and the error is
    /// returned.
    pub fn undo(&mut self, graph: &mut TaskGraph) -> Result<bool> {
        let Some(entry) = self.undo_stack.pop() else {
            return Ok(false);
        };
        if let Err(err) = revert(graph, entry.applied) {
            warn!(command = entry.command.label(), error = %err, "undo failed, history cleared");
            self.clear();
            return Err(err);
        }
        debug!(command = entry.command.label(), "edit undone");
        self.redo_stack.push(entry.command);
        Ok(true)
    }

    /// Re-apply the most recently undone command.
    ///
    /// Returns `Ok(false)` when there is nothing to redo. On error both
    /// histories are cleared.
    pub fn redo(&mut self, graph: &mut TaskGraph) -> Result<bool> {
        let Some(command) = self.redo_stack.pop() else {
            return Ok(false);
        };
        match apply(graph, &command) {
            Ok(applied) => {
                debug!(command = command.label(), "edit redone");
                self.undo_stack.push(Entry { command, applied });
                Ok(true)
            }
            Err(err) => {
                warn!(command = command.label(), error = %err, "redo failed, history cleared");
                self.clear();
                Err(err)
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Drop both histories.
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

fn apply(graph: &mut TaskGraph, command: &EditCommand) -> Result<Applied> {
    match command {
        EditCommand::AddTask { task } => {
            graph.add_task(task.clone())?;
            Ok(Applied::AddedTask(task.id.clone()))
        }
        EditCommand::RemoveTask { id } => Ok(Applied::RemovedTask(graph.remove_task(id)?)),
        EditCommand::UpdateTask { id, update } => {
            let previous = graph.update_task(id, update.clone())?;
            Ok(Applied::UpdatedTask {
                id: id.clone(),
                previous,
            })
        }
        EditCommand::AddDependency { edge } => {
            graph.add_dependency(edge.clone())?;
            Ok(Applied::AddedDependency(edge.id.clone()))
        }
        EditCommand::RemoveDependency { id } => {
            Ok(Applied::RemovedDependency(graph.remove_dependency(id)?))
        }
        EditCommand::Batch { commands } => {
            let mut applied = Vec::with_capacity(commands.len());
            for command in commands {
                match apply(graph, command) {
                    Ok(done) => applied.push(done),
                    Err(err) => {
                        rollback(graph, applied);
                        return Err(err);
                    }
                }
            }
            Ok(Applied::Batch(applied))
        }
    }
}

/// Reverse an applied command. Returns the record that reverses the
/// reversal, so a partly reverted batch can be put back.
///
/// A batch is reverted whole or not at all: if a member fails, the members
/// already reverted are re-applied before the error is returned.
fn revert(graph: &mut TaskGraph, applied: Applied) -> Result<Applied> {
    let inverse = match applied {
        Applied::AddedTask(id) => Applied::RemovedTask(graph.remove_task(&id)?),
        Applied::RemovedTask(removed) => {
            let id = removed.task.id.clone();
            graph.restore_task(removed)?;
            Applied::AddedTask(id)
        }
        Applied::UpdatedTask { id, previous } => {
            let previous = graph.update_task(&id, previous)?;
            Applied::UpdatedTask { id, previous }
        }
        Applied::AddedDependency(id) => Applied::RemovedDependency(graph.remove_dependency(&id)?),
        Applied::RemovedDependency(edge) => {
            let id = edge.id.clone();
            graph.add_dependency(edge)?;
            Applied::AddedDependency(id)
        }
        Applied::Batch(members) => {
            let mut reverted = Vec::with_capacity(members.len());
            for member in members.into_iter().rev() {
                match revert(graph, member) {
                    Ok(inverse) => reverted.push(inverse),
                    Err(err) => {
                        rollback(graph, reverted);
                        return Err(err);
                    }
                }
            }
            Applied::Batch(reverted)
        }
    };
    Ok(inverse)
}

/// Undo already-applied batch members, most recent first.
fn rollback(graph: &mut TaskGraph, applied: Vec<Applied>) {
    for done in applied.into_iter().rev() {
        if let Err(err) = revert(graph, done) {
            warn!(error = %err, "batch rollback incomplete");
        }
    }
}
