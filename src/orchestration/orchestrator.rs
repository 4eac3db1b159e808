//! Orchestrator for graph execution.
//!
//! The Orchestrator walks a validated [`TaskGraph`], dispatching ready tasks
//! to a [`DeviceBackend`] and applying their completion signals until every
//! task is terminal. Each dispatch runs as its own tokio task and reports
//! back over a single mpsc channel, so the main loop suspends only while
//! waiting for the next signal from any in-flight task.
//!
//! The graph sits behind one `RwLock` shared with [`OrchestratorHandle`];
//! every status transition and every live edit happens under that lock.

use crate::config::Config;
use crate::core::dag::{GraphState, TaskGraph};
use crate::core::edge::{EdgeId, EdgeState};
use crate::core::metrics::ParallelismMetrics;
use crate::core::task::{DeviceId, TaskId, TaskOutcome, TaskStatus};
use crate::error::{DispatchError, Error, Result};
use crate::orchestration::backend::{DeviceBackend, DispatchRequest};
use crate::orchestration::events::{EventBus, GraphEvent};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CANCELLED_REASON: &str = "graph execution cancelled";
const STUCK_REASON: &str = "dependency conditions can never be satisfied";

/// Messages delivered to the main loop.
#[derive(Debug, Clone, PartialEq)]
enum Signal {
    /// The backend picked a device for a running task.
    Assigned { task_id: TaskId, device: DeviceId },
    /// A running task reached its terminal outcome.
    Finished {
        task_id: TaskId,
        outcome: TaskOutcome,
    },
    /// The graph was edited; re-evaluate readiness.
    Edited,
}

/// Final state of one task in a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub device: Option<DeviceId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A task that did not complete, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub error: String,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub state: GraphState,
    pub tasks: Vec<TaskSummary>,
    pub failures: Vec<TaskFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub cancelled: bool,
    pub metrics: ParallelismMetrics,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.state == GraphState::Completed
    }

    pub fn failure(&self, id: &TaskId) -> Option<&TaskFailure> {
        self.failures.iter().find(|f| &f.task_id == id)
    }
}

/// Cloneable control surface for a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    graph: Arc<RwLock<TaskGraph>>,
    signals: mpsc::Sender<Signal>,
    cancel: CancellationToken,
}

impl OrchestratorHandle {
    /// Cancel the run: every non-terminal task becomes Cancelled and the
    /// backend is asked to abandon in-flight dispatches.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deliver a completion signal from an external transport.
    ///
    /// Signals for tasks that are not running are dropped by the
    /// orchestrator.
    pub async fn signal(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<()> {
        self.signals
            .send(Signal::Finished { task_id, outcome })
            .await
            .map_err(|_| Error::Dispatch(DispatchError::Abandoned))
    }

    /// Apply a structural edit under the graph lock and wake the
    /// orchestrator so newly ready tasks are dispatched.
    pub async fn edit<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut TaskGraph) -> T,
    {
        let out = {
            let mut graph = self.graph.write().await;
            f(&mut graph)
        };
        // The run may already be over.
        let _ = self.signals.send(Signal::Edited).await;
        out
    }

    pub fn graph(&self) -> Arc<RwLock<TaskGraph>> {
        Arc::clone(&self.graph)
    }
}

/// Drives one task graph to a terminal state.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use constellation::config::Config;
/// use constellation::orchestration::{LocalBackend, Orchestrator};
///
/// let orchestrator = Orchestrator::new(graph, Arc::new(LocalBackend::default()), &Config::default());
/// let mut events = orchestrator.subscribe();
/// let report = orchestrator.run().await?;
/// ```
pub struct Orchestrator {
    graph: Arc<RwLock<TaskGraph>>,
    backend: Arc<dyn DeviceBackend>,
    events: EventBus,
    cancel: CancellationToken,
    signal_tx: mpsc::Sender<Signal>,
    signal_rx: mpsc::Receiver<Signal>,
    max_concurrent: Option<usize>,
}

impl Orchestrator {
    pub fn new(graph: TaskGraph, backend: Arc<dyn DeviceBackend>, config: &Config) -> Self {
        Self::shared(Arc::new(RwLock::new(graph)), backend, config)
    }

    /// Build over a graph the caller already shares.
    pub fn shared(
        graph: Arc<RwLock<TaskGraph>>,
        backend: Arc<dyn DeviceBackend>,
        config: &Config,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(config.signal_capacity.max(1));
        Self {
            graph,
            backend,
            events: EventBus::new(config.event_capacity),
            cancel: CancellationToken::new(),
            signal_tx,
            signal_rx,
            max_concurrent: config.concurrency_limit(),
        }
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            graph: Arc::clone(&self.graph),
            signals: self.signal_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.events.subscribe()
    }

    pub fn graph(&self) -> Arc<RwLock<TaskGraph>> {
        Arc::clone(&self.graph)
    }

    /// Execute the graph to completion.
    ///
    /// # Errors
    /// Only structural problems raise: an invalid graph or a graph that has
    /// already been executed. Task failures are part of the report.
    pub async fn run(mut self) -> Result<ExecutionReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut edge_states = self.prepare().await?;
        let mut in_flight = JoinSet::new();
        let mut cancelled = false;

        loop {
            while in_flight.try_join_next().is_some() {}

            let requests = {
                let mut graph = self.graph.write().await;
                let requests = self.schedule(&mut graph);
                let idle = requests.is_empty() && graph.running_tasks().is_empty();
                if idle && !graph.is_finished() {
                    let stuck: Vec<TaskId> = graph
                        .tasks()
                        .into_iter()
                        .filter(|t| !t.is_terminal())
                        .map(|t| t.id.clone())
                        .collect();
                    warn!(tasks = ?stuck, "no task can become ready, cancelling the rest");
                    graph.cancel_all(STUCK_REASON);
                }
                self.publish_changes(&mut graph, &mut edge_states);
                if idle {
                    break;
                }
                requests
            };

            for request in requests {
                self.spawn_dispatch(&mut in_flight, request);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                signal = self.signal_rx.recv() => {
                    // The orchestrator holds a sender, so the channel never closes.
                    if let Some(signal) = signal {
                        self.apply_signal(signal).await;
                    }
                }
            }
        }

        if cancelled {
            self.cancel_run(&mut edge_states).await;
        }
        in_flight.abort_all();

        let mut graph = self.graph.write().await;
        let state = graph.outcome().unwrap_or(GraphState::Completed);
        if let Some(old) = graph.set_state(state) {
            self.events.publish(GraphEvent::GraphStateChanged {
                old,
                new: state,
                at: Utc::now(),
            });
        }
        let report = build_report(&graph, state, started_at, clock.elapsed(), cancelled)?;
        info!(
            state = %report.state,
            tasks = report.tasks.len(),
            failures = report.failures.len(),
            duration_ms = report.duration.as_millis() as u64,
            "graph execution finished"
        );
        Ok(report)
    }

    /// Validate, move the graph to Executing and capture initial edge
    /// states.
    async fn prepare(&self) -> Result<HashMap<EdgeId, EdgeState>> {
        let mut graph = self.graph.write().await;
        let state = graph.state();
        if state == GraphState::Executing || state.is_terminal() {
            return Err(Error::Validation(format!(
                "graph is {} and cannot be executed again",
                state
            )));
        }

        let (valid, errors) = graph.validate_dag();
        if !valid {
            return Err(Error::Validation(errors.join("; ")));
        }
        graph.refresh_statuses();

        for next in [GraphState::Ready, GraphState::Executing] {
            if let Some(old) = graph.set_state(next) {
                self.events.publish(GraphEvent::GraphStateChanged {
                    old,
                    new: next,
                    at: Utc::now(),
                });
            }
        }
        info!(
            tasks = graph.task_count(),
            dependencies = graph.edge_count(),
            "graph execution started"
        );

        let mut edge_states = HashMap::new();
        self.publish_changes(&mut graph, &mut edge_states);
        Ok(edge_states)
    }

    /// Cancel blocked tasks, then start as many ready tasks as capacity
    /// allows, in insertion order.
    fn schedule(&self, graph: &mut TaskGraph) -> Vec<DispatchRequest> {
        let cancelled = graph.propagate_cancellations();
        if !cancelled.is_empty() {
            debug!(tasks = ?cancelled, "cancelled tasks behind failed dependencies");
        }

        let running = graph.running_tasks().len();
        let slots = self
            .max_concurrent
            .map_or(usize::MAX, |max| max.saturating_sub(running));

        let mut requests = Vec::new();
        for id in graph.ready_tasks().into_iter().take(slots) {
            if let Err(err) = graph.start_task(&id) {
                warn!(task = %id, error = %err, "ready task could not start");
                continue;
            }
            if let Some(task) = graph.get_task(&id) {
                debug!(task = %id, name = %task.name, "dispatching");
                requests.push(DispatchRequest::from(task));
            }
        }
        requests
    }

    fn spawn_dispatch(&self, in_flight: &mut JoinSet<()>, request: DispatchRequest) {
        let backend = Arc::clone(&self.backend);
        let signals = self.signal_tx.clone();
        in_flight.spawn(async move {
            let task_id = request.task_id.clone();
            let outcome = match dispatch(backend.as_ref(), request, &signals).await {
                Ok(outcome) => outcome,
                Err(err) => TaskOutcome::failed(err.to_string()),
            };
            let _ = signals.send(Signal::Finished { task_id, outcome }).await;
        });
    }

    async fn apply_signal(&self, signal: Signal) {
        let mut graph = self.graph.write().await;
        match signal {
            Signal::Assigned { task_id, device } => {
                if let Err(err) = graph.assign_device(&task_id, device) {
                    debug!(task = %task_id, error = %err, "late device assignment ignored");
                }
            }
            Signal::Finished { task_id, outcome } => match graph.finish_task(&task_id, outcome) {
                Ok(status) => debug!(task = %task_id, status = %status, "task finished"),
                Err(err @ Error::DuplicateSignal { .. }) => {
                    warn!(task = %task_id, error = %err, "dropping duplicate or late signal");
                }
                Err(err) => warn!(task = %task_id, error = %err, "signal for unknown task"),
            },
            Signal::Edited => debug!("graph edited, re-evaluating readiness"),
        }
    }

    async fn cancel_run(&self, edge_states: &mut HashMap<EdgeId, EdgeState>) {
        let interrupted = {
            let mut graph = self.graph.write().await;
            let interrupted = graph.cancel_all(CANCELLED_REASON);
            self.publish_changes(&mut graph, edge_states);
            interrupted
        };
        info!(in_flight = interrupted.len(), "graph execution cancelled");
        join_all(interrupted.iter().map(|id| self.backend.abandon(id))).await;
    }

    /// Publish node transitions recorded since the last call and every
    /// edge whose eligibility changed.
    fn publish_changes(&self, graph: &mut TaskGraph, edge_states: &mut HashMap<EdgeId, EdgeState>) {
        for transition in graph.drain_transitions() {
            self.events.publish(transition.into());
        }

        let now = Utc::now();
        let mut current = HashMap::with_capacity(edge_states.len());
        for edge in graph.edges() {
            let Some(new) = graph.edge_state(&edge.id) else {
                continue;
            };
            if let Some(&old) = edge_states.get(&edge.id) {
                if old != new {
                    self.events.publish(GraphEvent::EdgeChanged {
                        edge_id: edge.id.clone(),
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        old,
                        new,
                        at: now,
                    });
                }
            }
            current.insert(edge.id.clone(), new);
        }
        *edge_states = current;
    }
}

/// Assign (unless pinned) and dispatch one request.
async fn dispatch(
    backend: &dyn DeviceBackend,
    request: DispatchRequest,
    signals: &mpsc::Sender<Signal>,
) -> std::result::Result<TaskOutcome, DispatchError> {
    let device = match request.target_device_id.clone() {
        Some(device) => device,
        None => {
            let device = backend.assign(&request).await?;
            let _ = signals
                .send(Signal::Assigned {
                    task_id: request.task_id.clone(),
                    device: device.clone(),
                })
                .await;
            device
        }
    };
    backend.dispatch(request, device).await
}

fn build_report(
    graph: &TaskGraph,
    state: GraphState,
    started_at: DateTime<Utc>,
    duration: Duration,
    cancelled: bool,
) -> Result<ExecutionReport> {
    let tasks = graph
        .tasks()
        .into_iter()
        .map(|t| TaskSummary {
            task_id: t.id.clone(),
            name: t.name.clone(),
            status: t.status,
            device: t.target_device_id.clone(),
            started_at: t.started_at,
            completed_at: t.completed_at,
        })
        .collect();
    let failures = graph
        .tasks()
        .into_iter()
        .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
        .map(|t| TaskFailure {
            task_id: t.id.clone(),
            status: t.status,
            error: t.error.clone().unwrap_or_default(),
        })
        .collect();

    Ok(ExecutionReport {
        state,
        tasks,
        failures,
        started_at,
        finished_at: Utc::now(),
        duration,
        cancelled,
        metrics: graph.get_parallelism_metrics()?,
    })
}
