//! Task graph (directed acyclic graph) for dependency management.
//!
//! `TaskGraph` owns every node and edge of a plan. It guarantees
//! acyclicity at mutation time, keeps each node's cached status consistent
//! with its incoming edges, and exposes the compare-and-set transitions the
//! orchestrator uses while the graph executes.

use crate::core::edge::{ConditionContext, DependencyEdge, DependencyKind, EdgeId, EdgeState};
use crate::core::metrics::{self, ParallelismMetrics};
use crate::core::task::{DeviceId, TaskId, TaskNode, TaskOutcome, TaskStatus};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use petgraph::algo::{has_path_connecting, is_cyclic_directed};
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Whole-graph lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GraphState {
    /// Built or edited, not (re)validated yet.
    #[default]
    Created,
    /// Validated and not yet started.
    Ready,
    /// At least one node has been dispatched.
    Executing,
    /// Every node completed.
    Completed,
    /// Every node failed or was cancelled.
    Failed,
    /// Every node is terminal with mixed outcomes.
    PartiallyFailed,
}

impl GraphState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GraphState::Completed | GraphState::Failed | GraphState::PartiallyFailed
        )
    }
}

impl std::fmt::Display for GraphState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GraphState::Created => "created",
            GraphState::Ready => "ready",
            GraphState::Executing => "executing",
            GraphState::Completed => "completed",
            GraphState::Failed => "failed",
            GraphState::PartiallyFailed => "partially_failed",
        };
        write!(f, "{}", s)
    }
}

/// A recorded node status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub task_id: TaskId,
    pub old: TaskStatus,
    pub new: TaskStatus,
    pub at: DateTime<Utc>,
}

/// Field changes for `update_task`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tips: Option<Vec<String>>,
    #[serde(default)]
    pub target_device_id: Option<Option<DeviceId>>,
}

impl TaskUpdate {
    pub fn description(description: &str) -> Self {
        Self {
            description: Some(description.to_string()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.tips.is_none()
            && self.target_device_id.is_none()
    }
}

/// A node removed from the graph together with its incident edges.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedTask {
    pub task: TaskNode,
    pub edges: Vec<DependencyEdge>,
    /// Insertion position the task held before removal.
    pub position: usize,
}

/// The task dependency graph.
///
/// Nodes live in a petgraph `StableDiGraph` so that indices survive
/// removals; `task_index` and `edge_index` map the public ids onto them.
#[derive(Clone)]
pub struct TaskGraph {
    graph: StableDiGraph<TaskNode, DependencyEdge>,
    task_index: HashMap<TaskId, NodeIndex>,
    edge_index: HashMap<EdgeId, EdgeIndex>,
    /// Task ids in insertion order; drives every tie-break.
    order: Vec<TaskId>,
    state: GraphState,
    journal: Vec<StatusTransition>,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            task_index: HashMap::new(),
            edge_index: HashMap::new(),
            order: Vec::new(),
            state: GraphState::Created,
            journal: Vec::new(),
        }
    }

    // ========== Structural mutation ==========

    /// Insert a task.
    ///
    /// The stored status, cached dependencies and execution fields of the
    /// incoming node are not trusted: the node enters as Pending with a
    /// clean execution record.
    ///
    /// # Errors
    /// `DuplicateId` if a task with the same id already exists.
    pub fn add_task(&mut self, mut task: TaskNode) -> Result<()> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::DuplicateId(task.id.to_string()));
        }

        task.status = TaskStatus::Pending;
        task.dependencies.clear();
        task.result = None;
        task.error = None;
        task.started_at = None;
        task.completed_at = None;

        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id.clone(), index);
        self.order.push(id);
        self.invalidate_validation();
        Ok(())
    }

    /// Insert a dependency edge.
    ///
    /// The cycle check runs before the edge is committed: a path from `to`
    /// back to `from` means the new edge would close a cycle.
    ///
    /// # Errors
    /// - `DuplicateId` if the edge id, or an edge between the same pair, exists
    /// - `UnknownNode` if either endpoint is missing
    /// - `SelfLoop` if `from == to`
    /// - `ImmutableState` if `to` has already started
    /// - `Validation` for a conditional edge without a predicate, or one
    ///   whose predicate names a task that is not an ancestor of `to`
    /// - `CyclicDependency` if the edge would close a cycle
    pub fn add_dependency(&mut self, edge: DependencyEdge) -> Result<()> {
        if self.edge_index.contains_key(&edge.id) {
            return Err(Error::DuplicateId(edge.id.to_string()));
        }
        let from_index = self.index_of(&edge.from)?;
        let to_index = self.index_of(&edge.to)?;

        if from_index == to_index {
            return Err(Error::SelfLoop(edge.from.clone()));
        }
        if self.graph.find_edge(from_index, to_index).is_some() {
            return Err(Error::DuplicateId(format!("{}->{}", edge.from, edge.to)));
        }
        self.ensure_modifiable(to_index)?;
        if edge.kind == DependencyKind::Conditional && edge.condition.is_none() {
            return Err(Error::Validation(format!(
                "conditional edge {} has no condition",
                edge.id
            )));
        }
        if has_path_connecting(&self.graph, to_index, from_index, None) {
            return Err(Error::CyclicDependency {
                from: edge.from.clone(),
                to: edge.to.clone(),
            });
        }
        if let Some(condition) = &edge.condition {
            let mut visible: HashSet<NodeIndex> = self.ancestor_indices(to_index).into_iter().collect();
            visible.insert(from_index);
            visible.extend(self.ancestor_indices(from_index));
            let outside = condition.named_tasks().into_iter().find(|named| {
                !self
                    .task_index
                    .get(*named)
                    .is_some_and(|index| visible.contains(index))
            });
            if let Some(named) = outside {
                return Err(Error::Validation(format!(
                    "condition on edge {} names {}, which is not an ancestor of {}",
                    edge.id, named, edge.to
                )));
            }
        }

        let edge_id = edge.id.clone();
        let from_id = edge.from.clone();
        let index = self.graph.add_edge(from_index, to_index, edge);
        self.edge_index.insert(edge_id, index);
        self.graph[to_index].dependencies.insert(from_id);
        self.refresh_node(to_index);
        self.invalidate_validation();
        Ok(())
    }

    /// Remove a task and every incident edge.
    ///
    /// # Errors
    /// `UnknownNode`, or `ImmutableState` if the task has started.
    pub fn remove_task(&mut self, id: &TaskId) -> Result<RemovedTask> {
        let index = self.index_of(id)?;
        self.ensure_modifiable(index)?;

        let incident: Vec<EdgeIndex> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .chain(self.graph.edges_directed(index, Direction::Outgoing))
            .map(|e| e.id())
            .collect();
        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();

        let mut edges = Vec::with_capacity(incident.len());
        for edge_index in incident {
            if let Some(edge) = self.graph.remove_edge(edge_index) {
                self.edge_index.remove(&edge.id);
                edges.push(edge);
            }
        }
        let task = self
            .graph
            .remove_node(index)
            .ok_or_else(|| Error::UnknownNode(id.clone()))?;
        self.task_index.remove(id);
        let position = self.order.iter().position(|t| t == id).unwrap_or(0);
        self.order.retain(|t| t != id);

        for dependent in dependents {
            self.graph[dependent].dependencies.remove(id);
            self.refresh_node(dependent);
        }
        self.invalidate_validation();
        Ok(RemovedTask {
            task,
            edges,
            position,
        })
    }

    /// Put a removed task back at its old insertion position together with
    /// its incident edges.
    ///
    /// # Errors
    /// Whatever `add_task` / `add_dependency` raise; on error the graph is
    /// left as it was.
    pub fn restore_task(&mut self, removed: RemovedTask) -> Result<()> {
        let id = removed.task.id.clone();
        for edge in &removed.edges {
            let other = if edge.from == id { &edge.to } else { &edge.from };
            let other_index = self.index_of(other)?;
            if edge.to != id {
                self.ensure_modifiable(other_index)?;
            }
            if self.edge_index.contains_key(&edge.id) {
                return Err(Error::DuplicateId(edge.id.to_string()));
            }
        }

        self.add_task(removed.task)?;
        if let Some(last) = self.order.pop() {
            let at = removed.position.min(self.order.len());
            self.order.insert(at, last);
        }
        // Edges whose predicates name ancestors go last, once the paths
        // they rely on are back.
        let (plain, scoped): (Vec<_>, Vec<_>) = removed
            .edges
            .into_iter()
            .partition(|e| !e.condition.as_ref().is_some_and(|c| c.references_ancestors()));
        for edge in plain.into_iter().chain(scoped) {
            if let Err(err) = self.add_dependency(edge) {
                self.remove_task(&id)?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Remove a dependency edge.
    ///
    /// # Errors
    /// `UnknownEdge`, or `ImmutableState` if the edge's target has started.
    pub fn remove_dependency(&mut self, id: &EdgeId) -> Result<DependencyEdge> {
        let index = *self
            .edge_index
            .get(id)
            .ok_or_else(|| Error::UnknownEdge(id.clone()))?;
        let (_, to_index) = self
            .graph
            .edge_endpoints(index)
            .ok_or_else(|| Error::UnknownEdge(id.clone()))?;
        self.ensure_modifiable(to_index)?;

        let edge = self
            .graph
            .remove_edge(index)
            .ok_or_else(|| Error::UnknownEdge(id.clone()))?;
        self.edge_index.remove(id);
        self.graph[to_index].dependencies.remove(&edge.from);
        self.refresh_node(to_index);
        self.invalidate_validation();
        Ok(edge)
    }

    /// Change descriptive fields of a task that has not started.
    ///
    /// Returns the update that restores the previous values.
    ///
    /// # Errors
    /// `UnknownNode`, or `ImmutableState` if the task has started.
    pub fn update_task(&mut self, id: &TaskId, update: TaskUpdate) -> Result<TaskUpdate> {
        let index = self.index_of(id)?;
        self.ensure_modifiable(index)?;

        let task = &mut self.graph[index];
        let mut previous = TaskUpdate::default();
        if let Some(name) = update.name {
            previous.name = Some(std::mem::replace(&mut task.name, name));
        }
        if let Some(description) = update.description {
            previous.description = Some(std::mem::replace(&mut task.description, description));
        }
        if let Some(tips) = update.tips {
            previous.tips = Some(std::mem::replace(&mut task.tips, tips));
        }
        if let Some(device) = update.target_device_id {
            previous.target_device_id =
                Some(std::mem::replace(&mut task.target_device_id, device));
        }
        Ok(previous)
    }

    // ========== Lookup ==========

    pub fn get_task(&self, id: &TaskId) -> Option<&TaskNode> {
        self.task_index.get(id).map(|&index| &self.graph[index])
    }

    pub fn get_edge(&self, id: &EdgeId) -> Option<&DependencyEdge> {
        self.edge_index.get(id).map(|&index| &self.graph[index])
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> Vec<&TaskNode> {
        self.order
            .iter()
            .filter_map(|id| self.get_task(id))
            .collect()
    }

    /// All edges, grouped by target in task insertion order.
    pub fn edges(&self) -> Vec<&DependencyEdge> {
        self.order
            .iter()
            .filter_map(|id| self.task_index.get(id))
            .flat_map(|&index| self.incoming_edge_indices(index))
            .map(|edge_index| &self.graph[edge_index])
            .collect()
    }

    /// Edges pointing into the given task.
    pub fn incoming_edges(&self, id: &TaskId) -> Vec<&DependencyEdge> {
        match self.task_index.get(id) {
            Some(&index) => self
                .incoming_edge_indices(index)
                .into_iter()
                .map(|e| &self.graph[e])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Edges leaving the given task.
    pub fn outgoing_edges(&self, id: &TaskId) -> Vec<&DependencyEdge> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .edges_directed(index, Direction::Outgoing)
                .map(|e| e.weight())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Tasks the given task depends on.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on the given task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Every task reachable backwards from the given task.
    pub fn ancestors_of(&self, id: &TaskId) -> HashSet<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .ancestor_indices(index)
                .into_iter()
                .map(|i| self.graph[i].id.clone())
                .collect(),
            None => HashSet::new(),
        }
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    /// Tasks whose status still permits structural edits.
    pub fn get_modifiable_tasks(&self) -> Vec<&TaskNode> {
        self.tasks()
            .into_iter()
            .filter(|t| t.is_modifiable())
            .collect()
    }

    /// Edges whose target still permits structural edits.
    pub fn get_modifiable_dependencies(&self) -> Vec<&DependencyEdge> {
        self.edges()
            .into_iter()
            .filter(|e| self.get_task(&e.to).is_some_and(TaskNode::is_modifiable))
            .collect()
    }

    // ========== Validation and ordering ==========

    /// Re-check the whole graph.
    ///
    /// Independent of the incremental checks made at mutation time; returns
    /// the list of problems instead of failing.
    pub fn validate_dag(&self) -> (bool, Vec<String>) {
        let mut errors = Vec::new();

        if is_cyclic_directed(&self.graph) {
            errors.push("graph contains a dependency cycle".to_string());
        }

        for (id, &index) in &self.edge_index {
            let Some((from_index, to_index)) = self.graph.edge_endpoints(index) else {
                errors.push(format!("edge {} is not attached to the graph", id));
                continue;
            };
            let edge = &self.graph[index];
            for (endpoint, node_index) in [(&edge.from, from_index), (&edge.to, to_index)] {
                let live = self.task_index.get(endpoint) == Some(&node_index);
                if !live {
                    errors.push(format!(
                        "edge {} references task {} which is not in the graph",
                        id, endpoint
                    ));
                }
            }
            if from_index == to_index {
                errors.push(format!("edge {} is a self-loop on {}", id, edge.from));
            }
            if edge.kind == DependencyKind::Conditional && edge.condition.is_none() {
                errors.push(format!("conditional edge {} has no condition", id));
            }
            if let Some(condition) = &edge.condition {
                let ancestors = self.ancestor_indices(to_index);
                for named in condition.named_tasks() {
                    let visible = self
                        .task_index
                        .get(named)
                        .is_some_and(|index| ancestors.contains(index));
                    if !visible {
                        errors.push(format!(
                            "condition on edge {} names {}, which is not an ancestor of {}",
                            id, named, edge.to
                        ));
                    }
                }
            }
        }

        for task in self.tasks() {
            let expected: HashSet<&TaskId> = self
                .dependencies_of(&task.id)
                .into_iter()
                .map(|t| &t.id)
                .collect();
            let cached: HashSet<&TaskId> = task.dependencies.iter().collect();
            if expected != cached {
                errors.push(format!(
                    "task {} has stale cached dependencies",
                    task.id
                ));
            }
        }

        (errors.is_empty(), errors)
    }

    /// Depth-first cycle probe, independent of petgraph's algorithms.
    pub fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks: HashMap<NodeIndex, Mark> = self
            .graph
            .node_indices()
            .map(|i| (i, Mark::Unvisited))
            .collect();

        for root in self.graph.node_indices() {
            if marks[&root] != Mark::Unvisited {
                continue;
            }
            // Explicit stack of (node, remaining successors).
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = vec![(
                root,
                self.graph
                    .neighbors_directed(root, Direction::Outgoing)
                    .collect(),
            )];
            marks.insert(root, Mark::OnStack);

            while let Some((node, successors)) = stack.last_mut() {
                match successors.pop() {
                    Some(next) => match marks[&next] {
                        Mark::OnStack => return true,
                        Mark::Done => {}
                        Mark::Unvisited => {
                            marks.insert(next, Mark::OnStack);
                            let children = self
                                .graph
                                .neighbors_directed(next, Direction::Outgoing)
                                .collect();
                            stack.push((next, children));
                        }
                    },
                    None => {
                        marks.insert(*node, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }
        false
    }

    /// Kahn's algorithm with ties broken by insertion order.
    ///
    /// # Errors
    /// `InvariantViolation` if nodes remain unprocessed, which only a cycle
    /// can cause.
    pub fn get_topological_order(&self) -> Result<Vec<TaskId>> {
        let position: HashMap<NodeIndex, usize> = self
            .order
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| self.task_index.get(id).map(|&i| (i, pos)))
            .collect();

        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|i| {
                let degree = self.graph.edges_directed(i, Direction::Incoming).count();
                (i, degree)
            })
            .collect();

        let mut queue: BinaryHeap<Reverse<(usize, NodeIndex)>> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&i, _)| Reverse((position[&i], i)))
            .collect();

        let mut sorted = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((_, index))) = queue.pop() {
            sorted.push(self.graph[index].id.clone());
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(Reverse((position[&next], next)));
                    }
                }
            }
        }

        if sorted.len() != self.graph.node_count() {
            return Err(Error::InvariantViolation(format!(
                "topological sort processed {} of {} tasks; the graph is cyclic",
                sorted.len(),
                self.graph.node_count()
            )));
        }
        Ok(sorted)
    }

    /// Critical path, total work, parallelism ratio and maximum width.
    pub fn get_parallelism_metrics(&self) -> Result<ParallelismMetrics> {
        metrics::compute(self)
    }

    /// Largest number of tasks sharing one topological level.
    pub fn get_max_width(&self) -> Result<usize> {
        Ok(metrics::levels(self)?
            .into_values()
            .fold(HashMap::<usize, usize>::new(), |mut counts, level| {
                *counts.entry(level).or_default() += 1;
                counts
            })
            .into_values()
            .max()
            .unwrap_or(0))
    }

    // ========== Execution state ==========

    /// Current eligibility of an edge.
    pub fn edge_state(&self, id: &EdgeId) -> Option<EdgeState> {
        self.edge_index.get(id).map(|&e| self.evaluate_edge(e))
    }

    /// Eligibility of every edge, in `edges()` order.
    pub fn edge_states(&self) -> Vec<(EdgeId, EdgeState)> {
        self.edges()
            .into_iter()
            .map(|e| (e.id.clone(), self.edge_state(&e.id).unwrap_or(EdgeState::Pending)))
            .collect()
    }

    /// Tasks that have not started and whose incoming edges are all
    /// satisfied, in insertion order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter_map(|id| self.task_index.get(id).map(|&i| (id, i)))
            .filter(|&(_, index)| self.graph[index].is_modifiable())
            .filter(|&(_, index)| {
                self.incoming_edge_indices(index)
                    .into_iter()
                    .all(|e| self.evaluate_edge(e) == EdgeState::Satisfied)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Tasks currently dispatched.
    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone())
            .collect()
    }

    /// True once every task is terminal.
    pub fn is_finished(&self) -> bool {
        self.graph
            .node_indices()
            .all(|i| self.graph[i].is_terminal())
    }

    /// Aggregate terminal classification, if every task is terminal.
    pub fn outcome(&self) -> Option<GraphState> {
        if self.is_empty() || !self.is_finished() {
            return None;
        }
        let completed = self
            .graph
            .node_indices()
            .filter(|&i| self.graph[i].status == TaskStatus::Completed)
            .count();
        Some(if completed == self.task_count() {
            GraphState::Completed
        } else if completed == 0 {
            GraphState::Failed
        } else {
            GraphState::PartiallyFailed
        })
    }

    /// Recompute Pending / WaitingDependency for every task not yet started.
    pub fn refresh_statuses(&mut self) {
        let indices: Vec<NodeIndex> = self.graph.node_indices().collect();
        for index in indices {
            self.refresh_node(index);
        }
    }

    /// Cancel every not-yet-started task that has a blocked incoming edge,
    /// repeating until no more cancellations cascade.
    ///
    /// Returns the cancelled ids in the order they were cancelled.
    pub fn propagate_cancellations(&mut self) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        loop {
            let blocked: Vec<(NodeIndex, TaskId)> = self
                .order
                .iter()
                .filter_map(|id| self.task_index.get(id).copied())
                .filter(|&index| self.graph[index].is_modifiable())
                .filter_map(|index| {
                    self.incoming_edge_indices(index)
                        .into_iter()
                        .find(|&e| self.evaluate_edge(e) == EdgeState::Blocked)
                        .map(|e| (index, self.graph[e].from.clone()))
                })
                .collect();
            if blocked.is_empty() {
                break;
            }
            for (index, upstream) in blocked {
                let reason = format!("upstream task {} did not complete", upstream);
                self.transition(index, TaskStatus::Cancelled, |task| task.cancel(&reason));
                cancelled.push(self.graph[index].id.clone());
            }
        }
        self.refresh_statuses();
        cancelled
    }

    /// Compare-and-set a not-yet-started task to Running.
    ///
    /// # Errors
    /// `UnknownNode`, or `ImmutableState` if the task already left
    /// Pending/WaitingDependency.
    pub fn start_task(&mut self, id: &TaskId) -> Result<()> {
        let index = self.index_of(id)?;
        self.ensure_modifiable(index)?;
        self.transition(index, TaskStatus::Running, TaskNode::start);
        Ok(())
    }

    /// Record the device chosen for a running task.
    pub fn assign_device(&mut self, id: &TaskId, device: DeviceId) -> Result<()> {
        let index = self.index_of(id)?;
        let task = &mut self.graph[index];
        if task.status != TaskStatus::Running {
            return Err(Error::DuplicateSignal {
                id: id.clone(),
                expected: TaskStatus::Running,
                status: task.status,
            });
        }
        task.target_device_id = Some(device);
        Ok(())
    }

    /// Compare-and-set a Running task to its terminal outcome.
    ///
    /// # Errors
    /// `UnknownNode`, or `DuplicateSignal` if the task is not Running; the
    /// task is left untouched in that case.
    pub fn finish_task(&mut self, id: &TaskId, outcome: TaskOutcome) -> Result<TaskStatus> {
        let index = self.index_of(id)?;
        let status = self.graph[index].status;
        if status != TaskStatus::Running {
            return Err(Error::DuplicateSignal {
                id: id.clone(),
                expected: TaskStatus::Running,
                status,
            });
        }
        let new = match outcome {
            TaskOutcome::Completed { result } => {
                self.transition(index, TaskStatus::Completed, |t| t.complete(result));
                TaskStatus::Completed
            }
            TaskOutcome::Failed { error } => {
                self.transition(index, TaskStatus::Failed, |t| t.fail(&error));
                TaskStatus::Failed
            }
        };
        self.refresh_dependents(index);
        Ok(new)
    }

    /// Cancel a single non-terminal task. Returns false if it was terminal.
    pub fn cancel_task(&mut self, id: &TaskId, reason: &str) -> Result<bool> {
        let index = self.index_of(id)?;
        if self.graph[index].is_terminal() {
            return Ok(false);
        }
        self.transition(index, TaskStatus::Cancelled, |t| t.cancel(reason));
        self.refresh_dependents(index);
        Ok(true)
    }

    /// Cancel every non-terminal task.
    ///
    /// Leaves no Pending or WaitingDependency task behind, so there is no
    /// cached status to refresh. Returns the ids that were Running when
    /// cancelled.
    pub fn cancel_all(&mut self, reason: &str) -> Vec<TaskId> {
        let mut interrupted = Vec::new();
        let indices: Vec<NodeIndex> = self
            .order
            .iter()
            .filter_map(|id| self.task_index.get(id).copied())
            .collect();
        for index in indices {
            let status = self.graph[index].status;
            if status.is_terminal() {
                continue;
            }
            if status == TaskStatus::Running {
                interrupted.push(self.graph[index].id.clone());
            }
            self.transition(index, TaskStatus::Cancelled, |t| t.cancel(reason));
        }
        interrupted
    }

    /// Move the lifecycle state, returning the previous one if it changed.
    pub fn set_state(&mut self, state: GraphState) -> Option<GraphState> {
        if self.state == state {
            return None;
        }
        Some(std::mem::replace(&mut self.state, state))
    }

    /// Take every status transition recorded since the last drain.
    pub fn drain_transitions(&mut self) -> Vec<StatusTransition> {
        std::mem::take(&mut self.journal)
    }

    // ========== Internals ==========

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownNode(id.clone()))
    }

    fn ensure_modifiable(&self, index: NodeIndex) -> Result<()> {
        let task = &self.graph[index];
        if task.is_modifiable() {
            Ok(())
        } else {
            Err(Error::ImmutableState {
                id: task.id.clone(),
                status: task.status,
            })
        }
    }

    fn invalidate_validation(&mut self) {
        if self.state == GraphState::Ready {
            self.state = GraphState::Created;
        }
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&TaskNode> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|n| &self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Incoming edges sorted by source insertion position.
    fn incoming_edge_indices(&self, index: NodeIndex) -> Vec<EdgeIndex> {
        let mut edges: Vec<(usize, EdgeIndex)> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|e| {
                let pos = self
                    .order
                    .iter()
                    .position(|id| *id == self.graph[e.source()].id)
                    .unwrap_or(usize::MAX);
                (pos, e.id())
            })
            .collect();
        edges.sort();
        edges.into_iter().map(|(_, e)| e).collect()
    }

    pub(crate) fn ancestor_indices(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.graph.neighbors_directed(next, Direction::Incoming));
            }
        }
        seen.into_iter().collect()
    }

    fn evaluate_edge(&self, index: EdgeIndex) -> EdgeState {
        let Some((from_index, to_index)) = self.graph.edge_endpoints(index) else {
            return EdgeState::Pending;
        };
        let edge = &self.graph[index];
        let mut ctx = ConditionContext::new(&self.graph[from_index]);
        if edge
            .condition
            .as_ref()
            .is_some_and(|c| c.references_ancestors())
        {
            for ancestor in self.ancestor_indices(to_index) {
                let task = &self.graph[ancestor];
                ctx.ancestors.insert(&task.id, task);
            }
        }
        edge.evaluate(&ctx)
    }

    fn refresh_node(&mut self, index: NodeIndex) {
        if !self.graph[index].is_modifiable() {
            return;
        }
        let satisfied = self
            .incoming_edge_indices(index)
            .into_iter()
            .all(|e| self.evaluate_edge(e) == EdgeState::Satisfied);
        let desired = if satisfied {
            TaskStatus::Pending
        } else {
            TaskStatus::WaitingDependency
        };
        self.transition(index, desired, |t| t.status = desired);
    }

    fn refresh_dependents(&mut self, index: NodeIndex) {
        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        for dependent in dependents {
            self.refresh_node(dependent);
        }
    }

    fn transition(&mut self, index: NodeIndex, new: TaskStatus, apply: impl FnOnce(&mut TaskNode)) {
        let task = &mut self.graph[index];
        let old = task.status;
        apply(task);
        if old != new {
            self.journal.push(StatusTransition {
                task_id: task.id.clone(),
                old,
                new,
                at: Utc::now(),
            });
        }
    }

    pub(crate) fn graph(&self) -> &StableDiGraph<TaskNode, DependencyEdge> {
        &self.graph
    }

    pub(crate) fn insertion_order(&self) -> &[TaskId] {
        &self.order
    }

    pub(crate) fn node_index(&self, id: &TaskId) -> Option<NodeIndex> {
        self.task_index.get(id).copied()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.edge_count())
            .field("state", &self.state)
            .finish()
    }
}
