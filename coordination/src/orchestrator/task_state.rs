//! Per-task state machine with legal transition guards.
//!
//! Every submitted task starts at `Dispatched` and terminates at either
//! `Resolved` or `Failed`. The orchestrator calls `advance()` to move between
//! states; each call validates the edge and appends to the transition log so
//! a task's history can be replayed afterwards.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::state::{TaskId, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Sent to one or more agents of a tier
    Dispatched,
    /// Waiting for replies, a quorum, or the round timeout
    AwaitingResults,
    /// Decision reached; terminal
    Resolved,
    /// Handed to the parent tier
    Escalated,
    /// Typed failure returned to the caller; terminal
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatched => write!(f, "Dispatched"),
            Self::AwaitingResults => write!(f, "AwaitingResults"),
            Self::Resolved => write!(f, "Resolved"),
            Self::Escalated => write!(f, "Escalated"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Legal edges:
/// ```text
/// Dispatched      → AwaitingResults | Escalated | Failed
/// AwaitingResults → Resolved | Escalated | Dispatched (re-dispatch in tier) | Failed
/// Escalated       → Dispatched (parent tier) | Failed
/// ```
fn is_legal_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;

    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Dispatched, AwaitingResults)
            | (Dispatched, Escalated)
            | (AwaitingResults, Resolved)
            | (AwaitingResults, Escalated)
            | (AwaitingResults, Dispatched)
            | (Escalated, Dispatched)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskState,
    pub to: TaskState,
    /// Tier the task was in when the transition happened
    pub tier: Tier,
    /// Dispatch round at the time of transition
    pub attempt: u32,
    /// Milliseconds since the task was submitted
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub task_id: TaskId,
    pub from: TaskState,
    pub to: TaskState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Illegal task transition for {}: {} → {}",
            self.task_id, self.from, self.to
        )
    }
}

impl std::error::Error for IllegalTransition {}

pub struct TaskStateMachine {
    task_id: TaskId,
    current: TaskState,
    tier: Tier,
    attempt: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl TaskStateMachine {
    /// Start a task at `Dispatched` in `tier`, round 1
    pub fn new(task_id: impl Into<TaskId>, tier: Tier) -> Self {
        Self {
            task_id: task_id.into(),
            current: TaskState::Dispatched,
            tier,
            attempt: 1,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> TaskState {
        self.current
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn advance(&mut self, to: TaskState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                task_id: self.task_id.clone(),
                from: self.current,
                to,
            });
        }

        tracing::debug!(
            task_id = %self.task_id,
            from = %self.current,
            to = %to,
            tier = %self.tier,
            attempt = self.attempt,
            "Task transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            tier: self.tier,
            attempt: self.attempt,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    /// Start the next round in `tier` (same tier for a re-dispatch, the
    /// parent after an escalation)
    pub fn redispatch(&mut self, tier: Tier, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(TaskState::Dispatched, Some(reason))?;
        self.tier = tier;
        self.attempt += 1;
        Ok(())
    }

    /// Transition to `Failed` from any non-terminal state.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(TaskState::Failed, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<TransitionRecord> {
        self.transitions
    }
}
