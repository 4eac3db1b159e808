//! Parallelism metrics over a task graph.
//!
//! While any task is unfinished every node weighs 1 ("node count" mode).
//! Once every task is terminal the weights switch to measured durations in
//! milliseconds ("actual time" mode), each at least 1 so that a non-empty
//! graph always has a critical path of length 1 or more.

use crate::core::dag::TaskGraph;
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::stable_graph::NodeIndex;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Floor for a measured node weight, in milliseconds.
const MIN_WEIGHT_MS: f64 = 1.0;

/// How node weights were chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsMode {
    NodeCount,
    ActualTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelismMetrics {
    pub mode: MetricsMode,
    /// Longest weighted source-to-sink path (L): node count, or
    /// milliseconds in `ActualTime` mode.
    pub critical_path_length: f64,
    /// Sum of all node weights (W).
    pub total_work: f64,
    /// W / L, never below 1.
    pub parallelism_ratio: f64,
    /// Largest number of tasks sharing an earliest-start level.
    pub max_width: usize,
    /// Tasks along one critical path, source first.
    pub critical_path: Vec<TaskId>,
}

pub(crate) fn compute(graph: &TaskGraph) -> Result<ParallelismMetrics> {
    let g = graph.graph();
    let order = indices_in_order(graph)?;

    let mode = if !graph.is_empty() && graph.is_finished() {
        MetricsMode::ActualTime
    } else {
        MetricsMode::NodeCount
    };
    let weight = |index: NodeIndex| match mode {
        MetricsMode::NodeCount => 1.0,
        MetricsMode::ActualTime => g[index]
            .duration()
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
            .max(MIN_WEIGHT_MS),
    };

    let mut finish: HashMap<NodeIndex, f64> = HashMap::with_capacity(order.len());
    let mut via: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut total_work = 0.0;
    let mut tail: Option<(NodeIndex, f64)> = None;

    for &index in &order {
        let best = g
            .neighbors_directed(index, Direction::Incoming)
            .filter_map(|pred| finish.get(&pred).map(|&f| (pred, f)))
            .fold(None, |acc: Option<(NodeIndex, f64)>, (pred, f)| match acc {
                Some((_, best)) if best >= f => acc,
                _ => Some((pred, f)),
            });

        let w = weight(index);
        total_work += w;
        let length = w + best.map(|(_, f)| f).unwrap_or(0.0);
        if let Some((pred, _)) = best {
            via.insert(index, pred);
        }
        finish.insert(index, length);

        if tail.map_or(true, |(_, longest)| length > longest) {
            tail = Some((index, length));
        }
    }

    let mut critical_path = Vec::new();
    let mut cursor = tail.map(|(index, _)| index);
    while let Some(index) = cursor {
        critical_path.push(g[index].id.clone());
        cursor = via.get(&index).copied();
    }
    critical_path.reverse();

    let critical_path_length = tail.map(|(_, l)| l).unwrap_or(0.0);
    let parallelism_ratio = if critical_path_length > f64::EPSILON {
        (total_work / critical_path_length).max(1.0)
    } else {
        1.0
    };

    Ok(ParallelismMetrics {
        mode,
        critical_path_length,
        total_work,
        parallelism_ratio,
        max_width: graph.get_max_width()?,
        critical_path,
    })
}

/// Earliest-start level of every task: sources are level 0, every other
/// task sits one level below its deepest predecessor.
pub(crate) fn levels(graph: &TaskGraph) -> Result<HashMap<NodeIndex, usize>> {
    let g = graph.graph();
    let mut levels: HashMap<NodeIndex, usize> = HashMap::new();
    for index in indices_in_order(graph)? {
        let level = g
            .neighbors_directed(index, Direction::Incoming)
            .filter_map(|pred| levels.get(&pred).map(|l| l + 1))
            .max()
            .unwrap_or(0);
        levels.insert(index, level);
    }
    Ok(levels)
}

fn indices_in_order(graph: &TaskGraph) -> Result<Vec<NodeIndex>> {
    graph
        .get_topological_order()?
        .iter()
        .map(|id| {
            graph
                .node_index(id)
                .ok_or_else(|| Error::InvariantViolation(format!("task {} has no node", id)))
        })
        .collect()
}
