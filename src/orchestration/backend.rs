//! Seam to the device layer.
//!
//! The orchestrator never talks to devices directly. It hands each ready
//! task to a [`DeviceBackend`], which picks a device and eventually
//! resolves to a [`TaskOutcome`].

use crate::core::task::{DeviceId, TaskId, TaskNode, TaskOutcome};
use crate::error::DispatchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// What a device needs to know to run a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tips: Vec<String>,
    #[serde(default)]
    pub target_device_id: Option<DeviceId>,
}

impl From<&TaskNode> for DispatchRequest {
    fn from(task: &TaskNode) -> Self {
        Self {
            task_id: task.id.clone(),
            name: task.name.clone(),
            description: task.description.clone(),
            tips: task.tips.clone(),
            target_device_id: task.target_device_id.clone(),
        }
    }
}

/// Device assignment and dispatch, as consumed by the orchestrator.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Choose a device able to run the request.
    async fn assign(&self, request: &DispatchRequest) -> Result<DeviceId, DispatchError>;

    /// Run the request on a device and resolve once it reports back.
    async fn dispatch(
        &self,
        request: DispatchRequest,
        device: DeviceId,
    ) -> Result<TaskOutcome, DispatchError>;

    /// Ask the device layer to stop working on a task. Cooperative: a
    /// completion may still arrive afterwards and is then ignored.
    async fn abandon(&self, _task_id: &TaskId) {}
}

#[async_trait]
impl<B: DeviceBackend + ?Sized> DeviceBackend for Arc<B> {
    async fn assign(&self, request: &DispatchRequest) -> Result<DeviceId, DispatchError> {
        (**self).assign(request).await
    }

    async fn dispatch(
        &self,
        request: DispatchRequest,
        device: DeviceId,
    ) -> Result<TaskOutcome, DispatchError> {
        (**self).dispatch(request, device).await
    }

    async fn abandon(&self, task_id: &TaskId) {
        (**self).abandon(task_id).await
    }
}

/// Wraps a backend so every dispatch has its own deadline.
///
/// An expired dispatch resolves to `DispatchError::DeadlineExceeded`, which
/// the orchestrator records as the task's failure.
pub struct DeadlineBackend<B> {
    inner: B,
    deadline: Duration,
}

impl<B: DeviceBackend> DeadlineBackend<B> {
    pub fn new(inner: B, deadline: Duration) -> Self {
        Self { inner, deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

#[async_trait]
impl<B: DeviceBackend> DeviceBackend for DeadlineBackend<B> {
    async fn assign(&self, request: &DispatchRequest) -> Result<DeviceId, DispatchError> {
        self.inner.assign(request).await
    }

    async fn dispatch(
        &self,
        request: DispatchRequest,
        device: DeviceId,
    ) -> Result<TaskOutcome, DispatchError> {
        let task_id = request.task_id.clone();
        match timeout(self.deadline, self.inner.dispatch(request, device)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(task = %task_id, deadline = ?self.deadline, "dispatch deadline exceeded");
                self.inner.abandon(&task_id).await;
                Err(DispatchError::DeadlineExceeded(self.deadline))
            }
        }
    }

    async fn abandon(&self, task_id: &TaskId) {
        self.inner.abandon(task_id).await
    }
}

/// In-process backend that completes every task successfully.
///
/// Devices are named `local-0 .. local-{n-1}` and handed out round-robin.
/// The result echoes the device and task so simulations show where each
/// task ran.
pub struct LocalBackend {
    devices: usize,
    latency: Duration,
    next: AtomicUsize,
}

impl LocalBackend {
    pub fn new(devices: usize) -> Self {
        Self {
            devices: devices.max(1),
            latency: Duration::ZERO,
            next: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl DeviceBackend for LocalBackend {
    async fn assign(&self, _request: &DispatchRequest) -> Result<DeviceId, DispatchError> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.devices;
        Ok(DeviceId(format!("local-{}", slot)))
    }

    async fn dispatch(
        &self,
        request: DispatchRequest,
        device: DeviceId,
    ) -> Result<TaskOutcome, DispatchError> {
        debug!(task = %request.task_id, device = %device, "local dispatch");
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(TaskOutcome::completed(serde_json::json!({
            "device": device.0,
            "task": request.name,
        })))
    }
}
