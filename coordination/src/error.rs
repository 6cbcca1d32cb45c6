//! Error taxonomy for the swarm core.
//!
//! Every terminal failure a caller sees is a [`TaskFailure`]: the failure
//! kind, the task it belongs to, and the causal chain of attempts that led
//! there. Callers branch on [`ErrorKind`] rather than on message text.
//!
//! | Kind               | Raised by       | Recovery                              |
//! |--------------------|-----------------|---------------------------------------|
//! | UnknownBackend     | registry        | none, caller bug                      |
//! | NoRouteAvailable   | router          | propagated to caller                  |
//! | Timeout            | agent runtime   | re-dispatch, then escalate            |
//! | BackendError       | agent runtime   | re-dispatch, then escalate            |
//! | NoQuorum           | consensus       | escalate with relaxed quorum          |
//! | RebirthExhausted   | rebirth manager | agent retired, parent tier notified   |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{AgentId, BackendId, Capability, TaskId, Tier};

/// Classification of every failure the core can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownBackend,
    NoRouteAvailable,
    Timeout,
    BackendError,
    NoQuorum,
    RebirthExhausted,
    /// A task id was submitted twice
    DuplicateTask,
}

impl ErrorKind {
    /// Whether the orchestrator recovers from this kind by re-dispatching
    /// or escalating instead of returning it straight to the caller.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::BackendError | ErrorKind::NoQuorum
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::UnknownBackend => write!(f, "unknown_backend"),
            ErrorKind::NoRouteAvailable => write!(f, "no_route_available"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::BackendError => write!(f, "backend_error"),
            ErrorKind::NoQuorum => write!(f, "no_quorum"),
            ErrorKind::RebirthExhausted => write!(f, "rebirth_exhausted"),
            ErrorKind::DuplicateTask => write!(f, "duplicate_task"),
        }
    }
}

/// Unified error type for core operations
#[derive(Debug, Clone, Error)]
pub enum SwarmError {
    #[error("Unknown backend: {0}")]
    UnknownBackend(BackendId),

    #[error("No route available for task {task_id} (requires {required:?})")]
    NoRouteAvailable {
        task_id: TaskId,
        required: Vec<Capability>,
    },

    #[error("Task {task_id} timed out after {elapsed_ms}ms")]
    Timeout { task_id: TaskId, elapsed_ms: u64 },

    #[error("Backend {backend_id} failed: {detail}")]
    BackendError { backend_id: BackendId, detail: String },

    #[error("No quorum for task {task_id}: got {got}, need {need}")]
    NoQuorum {
        task_id: TaskId,
        got: usize,
        need: usize,
    },

    #[error("Agent {agent_id} exhausted rebirth after {attempts} attempts")]
    RebirthExhausted { agent_id: AgentId, attempts: u32 },

    #[error("Task {0} was already submitted")]
    DuplicateTask(TaskId),
}

impl SwarmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SwarmError::UnknownBackend(_) => ErrorKind::UnknownBackend,
            SwarmError::NoRouteAvailable { .. } => ErrorKind::NoRouteAvailable,
            SwarmError::Timeout { .. } => ErrorKind::Timeout,
            SwarmError::BackendError { .. } => ErrorKind::BackendError,
            SwarmError::NoQuorum { .. } => ErrorKind::NoQuorum,
            SwarmError::RebirthExhausted { .. } => ErrorKind::RebirthExhausted,
            SwarmError::DuplicateTask(_) => ErrorKind::DuplicateTask,
        }
    }
}

/// One step in the history that led to a terminal failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalLink {
    /// Tier the attempt ran in
    pub tier: Tier,
    /// Dispatch round, 1-indexed across the whole task
    pub attempt: u32,
    pub kind: ErrorKind,
    /// Agent the failure is attributed to, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub detail: String,
}

impl fmt::Display for CausalLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} {}", self.attempt, self.tier, self.kind)?;
        if let Some(agent) = &self.agent_id {
            write!(f, " ({})", agent)?;
        }
        write!(f, ": {}", self.detail)
    }
}

/// Terminal failure returned to the submitter of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub task_id: TaskId,
    pub chain: Vec<CausalLink>,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, task_id: impl Into<TaskId>) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            chain: Vec::new(),
        }
    }

    pub fn with_chain(mut self, chain: Vec<CausalLink>) -> Self {
        self.chain = chain;
        self
    }

    /// The failure that started the chain, if any was recorded
    pub fn root_cause(&self) -> Option<&CausalLink> {
        self.chain.first()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} failed: {}", self.task_id, self.kind)?;
        if !self.chain.is_empty() {
            let steps: Vec<String> = self.chain.iter().map(|l| l.to_string()).collect();
            write!(f, " [{}]", steps.join(" → "))?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskFailure {}

impl From<(SwarmError, TaskId)> for TaskFailure {
    fn from((err, task_id): (SwarmError, TaskId)) -> Self {
        TaskFailure::new(err.kind(), task_id)
    }
}
