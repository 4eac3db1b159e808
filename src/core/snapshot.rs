//! Persisted representation of a task graph.
//!
//! Snapshots double as the input format for planners, so every field
//! except the ids and edge endpoints is optional and nothing in a snapshot
//! is trusted: loading routes each node and edge through the graph's
//! checked mutation API.

use crate::core::dag::{GraphState, TaskGraph};
use crate::core::edge::{Condition, DependencyEdge, DependencyKind, EdgeId};
use crate::core::task::{DeviceId, TaskId, TaskNode, TaskStatus};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: TaskId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device_id: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tips: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    /// Predecessors. Any id listed here without a matching edge record
    /// becomes an unconditional edge on load.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    #[serde(default)]
    pub id: Option<EdgeId>,
    pub from: TaskId,
    pub to: TaskId,
    #[serde(default)]
    pub condition_kind: DependencyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_expr: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub state: GraphState,
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub edges: Vec<EdgeRecord>,
}

impl GraphSnapshot {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading graph snapshot");
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json_pretty()?)?;
        debug!(path = %path.display(), nodes = self.nodes.len(), "graph snapshot saved");
        Ok(())
    }
}

impl From<&TaskNode> for NodeRecord {
    fn from(task: &TaskNode) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            description: task.description.clone(),
            target_device_id: task.target_device_id.clone(),
            tips: task.tips.clone(),
            status: task.status,
            dependencies: task.dependencies.clone(),
            result: task.result.clone(),
            error: task.error.clone(),
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

impl From<&DependencyEdge> for EdgeRecord {
    fn from(edge: &DependencyEdge) -> Self {
        Self {
            id: Some(edge.id.clone()),
            from: edge.from.clone(),
            to: edge.to.clone(),
            condition_kind: edge.kind,
            condition_expr: edge.condition.clone(),
            description: edge.description.clone(),
        }
    }
}

impl TaskGraph {
    /// Capture every node and edge in the persisted form.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            state: self.state(),
            nodes: self.tasks().into_iter().map(NodeRecord::from).collect(),
            edges: self.edges().into_iter().map(EdgeRecord::from).collect(),
        }
    }

    /// Rebuild a graph from a snapshot.
    ///
    /// Stored statuses are ignored; every node loads as Pending or
    /// WaitingDependency and the graph loads in `Created` state.
    ///
    /// # Errors
    /// Any structural error the same nodes and edges would raise through
    /// `add_task` / `add_dependency`.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        let mut graph = TaskGraph::new();
        let mut implied = Vec::new();

        for record in snapshot.nodes {
            let name = if record.name.is_empty() {
                record.id.to_string()
            } else {
                record.name
            };
            let mut task = TaskNode::with_id(record.id.clone(), &name, &record.description);
            task.target_device_id = record.target_device_id;
            task.tips = record.tips;
            implied.extend(
                record
                    .dependencies
                    .into_iter()
                    .map(|dep| (dep, record.id.clone())),
            );
            graph.add_task(task)?;
        }

        let mut explicit = HashSet::new();
        let mut scoped = Vec::new();
        for record in snapshot.edges {
            explicit.insert((record.from.clone(), record.to.clone()));
            let mut edge = DependencyEdge::new(record.from, record.to, record.condition_kind);
            if let Some(id) = record.id {
                edge.id = id;
            }
            edge.condition = record.condition_expr;
            edge.description = record.description;
            if edge.condition.as_ref().is_some_and(|c| c.references_ancestors()) {
                scoped.push(edge);
            } else {
                graph.add_dependency(edge)?;
            }
        }

        for (from, to) in implied {
            if !explicit.contains(&(from.clone(), to.clone())) {
                graph.add_dependency(DependencyEdge::unconditional(from, to))?;
            }
        }

        // Predicates naming ancestors need the paths to those ancestors in
        // place; they may also depend on each other, so retry until stable.
        while !scoped.is_empty() {
            let mut deferred = Vec::new();
            let mut last_error = None;
            let pending = scoped.len();
            for edge in scoped {
                let retry = edge.clone();
                if let Err(err) = graph.add_dependency(edge) {
                    last_error = Some(err);
                    deferred.push(retry);
                }
            }
            if deferred.len() == pending {
                if let Some(err) = last_error {
                    return Err(err);
                }
            }
            scoped = deferred;
        }

        debug!(
            tasks = graph.task_count(),
            dependencies = graph.edge_count(),
            "graph rebuilt from snapshot"
        );
        Ok(graph)
    }
}
