//! Dependency edges and their condition policies.
//!
//! An edge `from -> to` states that `to` may not start until `from` has
//! reached a terminal state, refined by the edge's `DependencyKind`.

use crate::core::task::{TaskId, TaskNode, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for an edge within a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub String);

impl EdgeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EdgeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Condition policy of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Satisfied once `from` reaches any terminal state.
    #[default]
    Unconditional,
    /// Satisfied only if `from` completed; blocks (and cancels `to`) otherwise.
    SuccessOnly,
    /// Satisfied once `from` reaches any terminal state, regardless of outcome.
    ///
    /// Evaluates exactly like `Unconditional`; kept as a distinct tag so
    /// planners can state intent.
    CompletionOnly,
    /// Satisfied once `from` is terminal and the edge's predicate holds.
    Conditional,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DependencyKind::Unconditional => "unconditional",
            DependencyKind::SuccessOnly => "success_only",
            DependencyKind::CompletionOnly => "completion_only",
            DependencyKind::Conditional => "conditional",
        };
        write!(f, "{}", s)
    }
}

/// Current eligibility of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    /// Not yet decidable; re-evaluated on every state change.
    Pending,
    /// The dependent may proceed as far as this edge is concerned.
    Satisfied,
    /// Can never be satisfied; the dependent must be cancelled.
    Blocked,
}

impl std::fmt::Display for EdgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EdgeState::Pending => "pending",
            EdgeState::Satisfied => "satisfied",
            EdgeState::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// Runtime predicate attached to a `Conditional` edge.
///
/// Each leaf inspects one node: the edge's source by default, or the named
/// `task`, which must be an ancestor of the edge's target. A leaf whose node
/// is not terminal (or not visible) is undecided, and so is every `All`,
/// `Any` or `Not` whose result hinges on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Condition {
    /// The node completed successfully.
    Succeeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<TaskId>,
    },
    /// The node failed or was cancelled.
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<TaskId>,
    },
    /// The node completed and its result (or the JSON pointer into it) equals `value`.
    ResultEquals {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<TaskId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pointer: Option<String>,
        value: Value,
    },
    /// The node completed and its rendered result contains `text`.
    ResultContains {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<TaskId>,
        text: String,
    },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

/// Nodes visible to a predicate while evaluating one edge.
pub struct ConditionContext<'a> {
    /// The edge's source node.
    pub from: &'a TaskNode,
    /// Ancestors of the edge's target, keyed by id.
    pub ancestors: HashMap<&'a TaskId, &'a TaskNode>,
}

impl<'a> ConditionContext<'a> {
    pub fn new(from: &'a TaskNode) -> Self {
        Self {
            from,
            ancestors: HashMap::new(),
        }
    }

    fn resolve(&self, task: Option<&TaskId>) -> Option<&'a TaskNode> {
        let node = match task {
            None => Some(self.from),
            Some(id) if *id == self.from.id => Some(self.from),
            Some(id) => self.ancestors.get(id).copied(),
        }?;
        node.is_terminal().then_some(node)
    }
}

impl Condition {
    pub fn succeeded() -> Self {
        Condition::Succeeded { task: None }
    }

    pub fn failed() -> Self {
        Condition::Failed { task: None }
    }

    pub fn result_equals(value: Value) -> Self {
        Condition::ResultEquals {
            task: None,
            pointer: None,
            value,
        }
    }

    pub fn result_contains(text: &str) -> Self {
        Condition::ResultContains {
            task: None,
            text: text.to_string(),
        }
    }

    /// Whether any leaf names a node other than the edge's source.
    pub fn references_ancestors(&self) -> bool {
        !self.named_tasks().is_empty()
    }

    /// Task ids named explicitly by leaves, in tree order.
    pub fn named_tasks(&self) -> Vec<&TaskId> {
        match self {
            Condition::Succeeded { task }
            | Condition::Failed { task }
            | Condition::ResultEquals { task, .. }
            | Condition::ResultContains { task, .. } => task.iter().collect(),
            Condition::All { conditions } | Condition::Any { conditions } => {
                conditions.iter().flat_map(Condition::named_tasks).collect()
            }
            Condition::Not { condition } => condition.named_tasks(),
        }
    }

    /// Evaluate against the current state of the graph.
    ///
    /// `None` means undecided: some leaf the outcome depends on names a node
    /// that is not terminal or not visible.
    pub fn evaluate(&self, ctx: &ConditionContext<'_>) -> Option<bool> {
        match self {
            Condition::Succeeded { task } => ctx
                .resolve(task.as_ref())
                .map(|n| n.status == TaskStatus::Completed),
            Condition::Failed { task } => ctx
                .resolve(task.as_ref())
                .map(|n| matches!(n.status, TaskStatus::Failed | TaskStatus::Cancelled)),
            Condition::ResultEquals {
                task,
                pointer,
                value,
            } => ctx.resolve(task.as_ref()).map(|node| {
                completed_result(node)
                    .and_then(|result| match pointer.as_deref() {
                        None | Some("") => Some(result),
                        Some(p) => result.pointer(p),
                    })
                    .is_some_and(|found| found == value)
            }),
            Condition::ResultContains { task, text } => ctx.resolve(task.as_ref()).map(|node| {
                completed_result(node).is_some_and(|result| match result {
                    Value::String(s) => s.contains(text.as_str()),
                    other => other.to_string().contains(text.as_str()),
                })
            }),
            Condition::All { conditions } => {
                let mut decided = Some(true);
                for condition in conditions {
                    match condition.evaluate(ctx) {
                        Some(false) => return Some(false),
                        None => decided = None,
                        Some(true) => {}
                    }
                }
                decided
            }
            Condition::Any { conditions } => {
                let mut decided = Some(false);
                for condition in conditions {
                    match condition.evaluate(ctx) {
                        Some(true) => return Some(true),
                        None => decided = None,
                        Some(false) => {}
                    }
                }
                decided
            }
            Condition::Not { condition } => condition.evaluate(ctx).map(|b| !b),
        }
    }
}

fn completed_result(node: &TaskNode) -> Option<&Value> {
    if node.status != TaskStatus::Completed {
        return None;
    }
    node.result.as_ref()
}

/// A directed dependency `from -> to` with a condition policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub id: EdgeId,
    pub from: TaskId,
    pub to: TaskId,
    #[serde(default)]
    pub kind: DependencyKind,
    /// Predicate for `Conditional` edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Human-readable statement of the condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DependencyEdge {
    pub fn new(from: impl Into<TaskId>, to: impl Into<TaskId>, kind: DependencyKind) -> Self {
        Self {
            id: EdgeId::new(),
            from: from.into(),
            to: to.into(),
            kind,
            condition: None,
            description: None,
        }
    }

    pub fn unconditional(from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        Self::new(from, to, DependencyKind::Unconditional)
    }

    pub fn success_only(from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        Self::new(from, to, DependencyKind::SuccessOnly)
    }

    pub fn completion_only(from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        Self::new(from, to, DependencyKind::CompletionOnly)
    }

    pub fn conditional(
        from: impl Into<TaskId>,
        to: impl Into<TaskId>,
        condition: Condition,
    ) -> Self {
        let mut edge = Self::new(from, to, DependencyKind::Conditional);
        edge.condition = Some(condition);
        edge
    }

    pub fn with_id(mut self, id: impl Into<EdgeId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn described(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Evaluate the edge against its source node (and, for predicates that
    /// name them, the target's ancestors).
    pub fn evaluate(&self, ctx: &ConditionContext<'_>) -> EdgeState {
        let from = ctx.from;
        if !from.is_terminal() {
            return EdgeState::Pending;
        }
        match self.kind {
            DependencyKind::Unconditional | DependencyKind::CompletionOnly => EdgeState::Satisfied,
            DependencyKind::SuccessOnly => {
                if from.status == TaskStatus::Completed {
                    EdgeState::Satisfied
                } else {
                    EdgeState::Blocked
                }
            }
            DependencyKind::Conditional => match &self.condition {
                Some(condition) if condition.evaluate(ctx) == Some(true) => EdgeState::Satisfied,
                Some(_) => EdgeState::Pending,
                None => EdgeState::Satisfied,
            },
        }
    }
}
