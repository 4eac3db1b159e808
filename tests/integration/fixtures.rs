//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A gated fake device backend whose dispatches resolve only when a test
//!   releases them
//! - A harness that runs an orchestrator in the background
//! - Predefined graph shapes

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use constellation::config::Config;
use constellation::core::{DependencyEdge, DeviceId, TaskGraph, TaskId, TaskNode, TaskStatus};
use constellation::orchestration::{
    DeviceBackend, DispatchRequest, ExecutionReport, GraphEvent, Orchestrator,
    OrchestratorHandle, TaskOutcome,
};
use constellation::{DispatchError, Result};

const WAIT: Duration = Duration::from_secs(5);

/// Create a task whose id and name are both `name`.
pub fn test_task(name: &str) -> TaskNode {
    TaskNode::with_id(name, name, &format!("{} description", name))
}

/// `t0 -> t1 -> ... -> t{n-1}`
pub fn chain_graph(n: usize) -> TaskGraph {
    let mut graph = TaskGraph::new();
    for i in 0..n {
        graph.add_task(test_task(&format!("t{}", i))).unwrap();
        if i > 0 {
            graph
                .add_dependency(DependencyEdge::unconditional(
                    format!("t{}", i - 1),
                    format!("t{}", i),
                ))
                .unwrap();
        }
    }
    graph
}

/// `a -> {b, c} -> d`
pub fn diamond_graph() -> TaskGraph {
    let mut graph = TaskGraph::new();
    for name in ["a", "b", "c", "d"] {
        graph.add_task(test_task(name)).unwrap();
    }
    for (from, to) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")] {
        graph
            .add_dependency(DependencyEdge::unconditional(from, to))
            .unwrap();
    }
    graph
}

/// `n` tasks with no edges.
pub fn independent_graph(n: usize) -> TaskGraph {
    let mut graph = TaskGraph::new();
    for i in 0..n {
        graph.add_task(test_task(&format!("t{}", i))).unwrap();
    }
    graph
}

/// Fake device layer: every dispatch parks until the test releases it.
pub struct GatedBackend {
    gates: Mutex<HashMap<TaskId, oneshot::Sender<TaskOutcome>>>,
    dispatched: mpsc::UnboundedSender<TaskId>,
    abandoned: Mutex<Vec<TaskId>>,
    assigned: Mutex<Vec<TaskId>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl GatedBackend {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TaskId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(Self {
            gates: Mutex::new(HashMap::new()),
            dispatched: tx,
            abandoned: Mutex::new(Vec::new()),
            assigned: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        (backend, rx)
    }

    /// Resolve a parked dispatch. Returns false if it is not parked.
    pub fn release(&self, id: &str, outcome: TaskOutcome) -> bool {
        let gate = self.gates.lock().unwrap().remove(&TaskId::from(id));
        match gate {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn complete(&self, id: &str) -> bool {
        self.release(id, TaskOutcome::completed(serde_json::json!({ "task": id })))
    }

    pub fn fail(&self, id: &str, error: &str) -> bool {
        self.release(id, TaskOutcome::failed(error))
    }

    pub fn abandoned(&self) -> Vec<TaskId> {
        self.abandoned.lock().unwrap().clone()
    }

    pub fn assigned(&self) -> Vec<TaskId> {
        self.assigned.lock().unwrap().clone()
    }

    /// Most dispatches parked at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceBackend for GatedBackend {
    async fn assign(&self, request: &DispatchRequest) -> std::result::Result<DeviceId, DispatchError> {
        self.assigned.lock().unwrap().push(request.task_id.clone());
        Ok(DeviceId::from("gated-device"))
    }

    async fn dispatch(
        &self,
        request: DispatchRequest,
        _device: DeviceId,
    ) -> std::result::Result<TaskOutcome, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.gates
            .lock()
            .unwrap()
            .insert(request.task_id.clone(), tx);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _ = self.dispatched.send(request.task_id.clone());

        let outcome = rx.await.map_err(|_| DispatchError::Abandoned);
        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn abandon(&self, task_id: &TaskId) {
        self.abandoned.lock().unwrap().push(task_id.clone());
    }
}

/// An orchestrator running in the background over a gated backend.
pub struct RunHarness {
    pub backend: Arc<GatedBackend>,
    pub dispatched: mpsc::UnboundedReceiver<TaskId>,
    pub events: broadcast::Receiver<GraphEvent>,
    pub handle: OrchestratorHandle,
    pub graph: Arc<RwLock<TaskGraph>>,
    run: JoinHandle<Result<ExecutionReport>>,
}

impl RunHarness {
    pub fn start(graph: TaskGraph) -> Self {
        Self::start_with(graph, &Config::default())
    }

    pub fn start_with(graph: TaskGraph, config: &Config) -> Self {
        let (backend, dispatched) = GatedBackend::new();
        let orchestrator = Orchestrator::new(graph, backend.clone(), config);
        let events = orchestrator.subscribe();
        let handle = orchestrator.handle();
        let graph = orchestrator.graph();
        let run = tokio::spawn(orchestrator.run());
        Self {
            backend,
            dispatched,
            events,
            handle,
            graph,
            run,
        }
    }

    /// Next task handed to the backend.
    pub async fn next_dispatched(&mut self) -> TaskId {
        tokio::time::timeout(WAIT, self.dispatched.recv())
            .await
            .expect("timed out waiting for a dispatch")
            .expect("backend dropped")
    }

    /// Collect the next `n` dispatched task ids.
    pub async fn dispatched_batch(&mut self, n: usize) -> Vec<TaskId> {
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            ids.push(self.next_dispatched().await);
        }
        ids
    }

    /// Wait until the orchestrator has applied `status` to `id`.
    pub async fn wait_for_status(&mut self, id: &str, status: TaskStatus) {
        let target = TaskId::from(id);
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(GraphEvent::StatusChanged { task_id, new, .. })
                        if task_id == target && new == status =>
                    {
                        return;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("event stream closed before {} became {}", id, status)
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for status change");
    }

    pub async fn status_of(&self, id: &str) -> TaskStatus {
        self.graph
            .read()
            .await
            .get_task(&TaskId::from(id))
            .map(|t| t.status)
            .expect("unknown task")
    }

    pub async fn finish(self) -> ExecutionReport {
        tokio::time::timeout(WAIT, self.run)
            .await
            .expect("timed out waiting for the run")
            .expect("orchestrator panicked")
            .expect("orchestrator returned an error")
    }
}

/// Status of `id` in a report.
pub fn report_status(report: &ExecutionReport, id: &str) -> TaskStatus {
    report
        .tasks
        .iter()
        .find(|t| t.task_id.as_str() == id)
        .map(|t| t.status)
        .expect("task missing from report")
}
