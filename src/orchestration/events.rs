//! Observable stream of graph changes.
//!
//! Subscribers are optional: publishing never blocks and never fails the
//! run. A subscriber that falls behind sees `RecvError::Lagged` and skips
//! ahead.

use crate::core::dag::{GraphState, StatusTransition};
use crate::core::edge::{EdgeId, EdgeState};
use crate::core::task::{TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GraphEvent {
    StatusChanged {
        task_id: TaskId,
        old: TaskStatus,
        new: TaskStatus,
        at: DateTime<Utc>,
    },
    EdgeChanged {
        edge_id: EdgeId,
        from: TaskId,
        to: TaskId,
        old: EdgeState,
        new: EdgeState,
        at: DateTime<Utc>,
    },
    GraphStateChanged {
        old: GraphState,
        new: GraphState,
        at: DateTime<Utc>,
    },
}

impl From<StatusTransition> for GraphEvent {
    fn from(t: StatusTransition) -> Self {
        GraphEvent::StatusChanged {
            task_id: t.task_id,
            old: t.old,
            new: t.new,
            at: t.at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GraphEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: GraphEvent) {
        trace!(?event, "publish");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
