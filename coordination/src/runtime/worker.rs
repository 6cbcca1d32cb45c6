//! Per-agent worker loop
//!
//! Every agent owns one worker task that consumes work orders from a
//! channel and answers on a oneshot, so an agent never runs two tasks at
//! once. Workers beat on a shared heartbeat board while idle and while a
//! call is in flight; a worker that stops beating is stalled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{AgentFailure, AgentOutput, AgentRuntime};
use crate::state::{AgentId, Task};

/// Outcome of one work order
pub type RunOutcome = Result<AgentOutput, AgentFailure>;

/// A task handed to an agent's worker
#[derive(Debug)]
pub struct WorkOrder {
    pub task: Arc<Task>,
    /// Round deadline imposed by the orchestrator, on top of the task's own
    pub limit: Option<Instant>,
    pub reply: oneshot::Sender<RunOutcome>,
}

/// Error handing an order to a worker
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("worker for agent {0} is gone")]
    Gone(AgentId),

    #[error("worker for agent {0} already has an order queued")]
    Busy(AgentId),
}

/// Last heartbeat per agent
#[derive(Debug, Default)]
pub struct HeartbeatBoard {
    beats: Mutex<HashMap<AgentId, Instant>>,
}

impl HeartbeatBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AgentId, Instant>> {
        self.beats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn beat(&self, agent_id: &str) {
        self.lock().insert(agent_id.to_string(), Instant::now());
    }

    pub fn last(&self, agent_id: &str) -> Option<Instant> {
        self.lock().get(agent_id).copied()
    }

    /// Time since the agent last beat; `None` if it never has
    pub fn silent_for(&self, agent_id: &str) -> Option<Duration> {
        self.last(agent_id).map(|at| at.elapsed())
    }

    pub fn forget(&self, agent_id: &str) {
        self.lock().remove(agent_id);
    }
}

/// Worker loop for one agent
pub struct AgentWorker {
    agent_id: AgentId,
    runtime: Arc<AgentRuntime>,
    orders: mpsc::Receiver<WorkOrder>,
    heartbeats: Arc<HeartbeatBoard>,
    heartbeat_interval: Duration,
}

impl AgentWorker {
    /// Spawn a worker for `agent_id` and return the handle that feeds it
    pub fn spawn(
        agent_id: impl Into<AgentId>,
        runtime: Arc<AgentRuntime>,
        heartbeats: Arc<HeartbeatBoard>,
        heartbeat_interval: Duration,
    ) -> WorkerHandle {
        let agent_id = agent_id.into();
        let (sender, orders) = mpsc::channel(1);
        heartbeats.beat(&agent_id);

        let worker = AgentWorker {
            agent_id: agent_id.clone(),
            runtime,
            orders,
            heartbeats,
            heartbeat_interval: heartbeat_interval.max(Duration::from_millis(1)),
        };
        let join = tokio::spawn(worker.run());

        WorkerHandle {
            agent_id,
            sender,
            join,
        }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        debug!(agent_id = %self.agent_id, "Worker started");

        loop {
            tokio::select! {
                order = self.orders.recv() => match order {
                    Some(order) => self.handle(order, &mut ticker).await,
                    None => break,
                },
                _ = ticker.tick() => self.heartbeats.beat(&self.agent_id),
            }
        }

        debug!(agent_id = %self.agent_id, "Worker stopped");
    }

    async fn handle(&self, order: WorkOrder, ticker: &mut tokio::time::Interval) {
        self.heartbeats.beat(&self.agent_id);
        let run = self
            .runtime
            .run_until(&self.agent_id, &order.task, order.limit);
        tokio::pin!(run);

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = ticker.tick() => self.heartbeats.beat(&self.agent_id),
            }
        };

        self.heartbeats.beat(&self.agent_id);
        if order.reply.send(outcome).is_err() {
            debug!(agent_id = %self.agent_id, task_id = %order.task.id, "Result dropped, requester gone");
        }
    }
}

/// Sending side of an agent's worker
#[derive(Debug)]
pub struct WorkerHandle {
    agent_id: AgentId,
    sender: mpsc::Sender<WorkOrder>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Queue a task without waiting; the receiver yields the outcome
    pub fn submit(
        &self,
        task: Arc<Task>,
        limit: Option<Instant>,
    ) -> Result<oneshot::Receiver<RunOutcome>, SubmitError> {
        let (reply, outcome) = oneshot::channel();
        self.sender
            .try_send(WorkOrder { task, limit, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SubmitError::Busy(self.agent_id.clone()),
                mpsc::error::TrySendError::Closed(_) => SubmitError::Gone(self.agent_id.clone()),
            })?;
        Ok(outcome)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the worker immediately, dropping any in-flight order
    pub fn abort(&self) {
        info!(agent_id = %self.agent_id, "Worker aborted");
        self.join.abort();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}
