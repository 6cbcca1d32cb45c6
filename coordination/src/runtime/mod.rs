//! Agent Runtime
//!
//! Executes one agent's task against the backend the router picks.
//!
//! ```text
//!   route(task) ──▶ pool.get(backend) ──▶ invoke(payload, ctx)
//!        │                │                     │
//!   NoRouteAvailable  BackendError      timeout_at(deadline)
//!                                         ├─ expired → cancel token, Timeout
//!                                         ├─ Err(e)  → BackendError(e)
//!                                         └─ Ok(r)   → record_success, AgentOutput
//! ```
//!
//! The runtime never retries. Re-dispatch and rebirth belong to the
//! orchestrator.

pub mod backend;
pub mod testing;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, SwarmError};
use crate::router::ModelRouter;
use crate::state::{AgentId, BackendId, Task, TaskId};

pub use backend::{
    BackendFailure, BackendPool, BackendReply, InvocationContext, ModelBackend, SharedBackendPool,
};
pub use worker::{AgentWorker, HeartbeatBoard, RunOutcome, SubmitError, WorkOrder, WorkerHandle};

/// A successful agent run
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub backend_id: BackendId,
    pub value: String,
    pub confidence: f32,
    pub tokens_used: u32,
    pub latency: Duration,
}

/// A failed agent run
#[derive(Debug, Clone, PartialEq)]
pub struct AgentFailure {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    /// Backend that was called, if routing got that far
    pub backend_id: Option<BackendId>,
    pub kind: ErrorKind,
    pub detail: String,
    pub elapsed: Duration,
}

impl AgentFailure {
    fn new(agent_id: &str, task: &Task, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            task_id: task.id.clone(),
            backend_id: None,
            kind,
            detail: detail.into(),
            elapsed: Duration::ZERO,
        }
    }

    fn on_backend(mut self, backend_id: &str, elapsed: Duration) -> Self {
        self.backend_id = Some(backend_id.to_string());
        self.elapsed = elapsed;
        self
    }
}

/// Runs tasks for agents against routed backends
pub struct AgentRuntime {
    router: Arc<ModelRouter>,
    pool: SharedBackendPool,
    /// Parent of every per-call token; cancelling it aborts all in-flight calls
    shutdown: CancellationToken,
}

impl AgentRuntime {
    pub fn new(router: Arc<ModelRouter>, pool: SharedBackendPool) -> Self {
        Self {
            router,
            pool,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    pub fn pool(&self) -> &SharedBackendPool {
        &self.pool
    }

    /// Cancel every in-flight backend call
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn record_call(&self, backend_id: &str, latency: Duration, confidence: Option<f32>) {
        if let Err(e) = self.router.registry().record_call(backend_id, latency, confidence) {
            debug!(backend_id, error = %e, "Backend vanished before its call was counted");
        }
    }

    /// Run `task` on behalf of `agent_id`, bounded by the task's deadline
    pub async fn run(&self, agent_id: &str, task: &Task) -> Result<AgentOutput, AgentFailure> {
        self.run_until(agent_id, task, None).await
    }

    /// Run `task`, bounded by the earlier of the task deadline and `limit`
    pub async fn run_until(
        &self,
        agent_id: &str,
        task: &Task,
        limit: Option<Instant>,
    ) -> Result<AgentOutput, AgentFailure> {
        let started = Instant::now();
        let deadline = match (task.deadline.map(|d| started + d), limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let backend = self.router.route(task).map_err(|e| {
            AgentFailure::new(agent_id, task, e.kind(), e.to_string())
        })?;

        let client = self.pool.get(&backend.id).ok_or_else(|| {
            let err = SwarmError::BackendError {
                backend_id: backend.id.clone(),
                detail: "no client attached".to_string(),
            };
            AgentFailure::new(agent_id, task, err.kind(), err.to_string()).on_backend(&backend.id, Duration::ZERO)
        })?;

        let cancel = self.shutdown.child_token();
        let ctx = InvocationContext {
            task_id: task.id.clone(),
            deadline,
            cancel: cancel.clone(),
        };

        debug!(agent_id, task_id = %task.id, backend_id = %backend.id, "Invoking backend");
        let call = client.invoke(&task.payload, ctx);
        let result = match deadline {
            Some(at) => match tokio::time::timeout_at(at, call).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    let elapsed = started.elapsed();
                    let err = SwarmError::Timeout {
                        task_id: task.id.clone(),
                        elapsed_ms: elapsed.as_millis() as u64,
                    };
                    warn!(agent_id, task_id = %task.id, backend_id = %backend.id, "Backend call timed out");
                    self.record_call(&backend.id, elapsed, None);
                    return Err(AgentFailure::new(agent_id, task, err.kind(), err.to_string())
                        .on_backend(&backend.id, elapsed));
                }
            },
            None => call.await,
        };
        let elapsed = started.elapsed();

        match result {
            Ok(reply) => {
                if let Err(e) = self.router.registry().record_success(&backend.id) {
                    debug!(backend_id = %backend.id, error = %e, "Backend vanished before success was recorded");
                }
                let confidence = reply.confidence.clamp(0.0, 1.0);
                self.record_call(&backend.id, elapsed, Some(confidence));
                Ok(AgentOutput {
                    agent_id: agent_id.to_string(),
                    task_id: task.id.clone(),
                    backend_id: backend.id,
                    value: reply.value,
                    confidence,
                    tokens_used: reply.tokens_used,
                    latency: elapsed,
                })
            }
            Err(failure) => {
                let err = SwarmError::BackendError {
                    backend_id: backend.id.clone(),
                    detail: failure.to_string(),
                };
                warn!(agent_id, task_id = %task.id, error = %err, "Backend call failed");
                self.record_call(&backend.id, elapsed, None);
                Err(AgentFailure::new(agent_id, task, err.kind(), err.to_string())
                    .on_backend(&backend.id, elapsed))
            }
        }
    }
}
