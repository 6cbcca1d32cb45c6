//! Agent table: every agent instance of the swarm and its lifecycle state
//!
//! The map is behind an `RwLock` and every instance behind its own `Mutex`,
//! so writes to one agent are serialized while different agents change
//! state concurrently. All state changes go through the guarded transition
//! table below and land in the transition log.
//!
//! ```text
//! Idle ──▶ Running ──▶ Idle
//!             │
//!             └──▶ Failed ──▶ Reborn ──▶ Idle
//!                    │
//!                    └── retired: no further transitions
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::state::{AgentId, TaskId, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Running,
    Failed,
    Reborn,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Idle => write!(f, "idle"),
            AgentState::Running => write!(f, "running"),
            AgentState::Failed => write!(f, "failed"),
            AgentState::Reborn => write!(f, "reborn"),
        }
    }
}

fn is_legal_transition(from: AgentState, to: AgentState) -> bool {
    use AgentState::*;
    matches!(
        (from, to),
        (Idle, Running) | (Running, Idle) | (Running, Failed) | (Failed, Reborn) | (Reborn, Idle)
    )
}

/// One agent of the swarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: AgentId,
    pub tier: Tier,
    pub state: AgentState,
    pub current_task: Option<TaskId>,
    /// Failures over the agent's whole life
    pub failure_count: u32,
    /// Failures since the last rebirth; compared against the trigger threshold
    pub failures_since_rebirth: u32,
    pub rebirths: u32,
    /// Permanently failed; never leaves `Failed`
    pub retired: bool,
    /// Parent tier has been told about the retirement
    pub escalated: bool,
    pub created_at: DateTime<Utc>,
}

impl AgentInstance {
    pub fn new(id: impl Into<AgentId>, tier: Tier) -> Self {
        Self {
            id: id.into(),
            tier,
            state: AgentState::Idle,
            current_task: None,
            failure_count: 0,
            failures_since_rebirth: 0,
            rebirths: 0,
            retired: false,
            escalated: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == AgentState::Idle && !self.retired
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Illegal agent transition for {agent_id}: {from} → {to}")]
    IllegalTransition {
        agent_id: AgentId,
        from: AgentState,
        to: AgentState,
    },

    #[error("Agent {0} is retired")]
    Retired(AgentId),
}

/// Logged agent state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTransition {
    pub agent_id: AgentId,
    pub from: AgentState,
    pub to: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub at: DateTime<Utc>,
}

/// What became of an agent whose run failed
#[derive(Debug, Clone, PartialEq)]
pub enum FailureSettlement {
    /// Below the trigger threshold; back to Idle
    Released,
    /// Moved to Failed; rebirth policy applies
    Failed { tier: Tier, rebirths: u32 },
    /// The agent is no longer running that task
    Stale,
}

type Slot = Arc<Mutex<AgentInstance>>;

/// Transition log entries kept when no capacity is given
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

pub struct AgentTable {
    agents: RwLock<BTreeMap<AgentId, Slot>>,
    log: Mutex<VecDeque<AgentTransition>>,
    log_capacity: usize,
}

fn lock_slot(slot: &Slot) -> MutexGuard<'_, AgentInstance> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sort key for `{tier}-{n}` ids: tier name, then the number
fn id_order(id: &str) -> (&str, u64, &str) {
    match id.rsplit_once('-') {
        Some((prefix, n)) => match n.parse() {
            Ok(n) => (prefix, n, ""),
            Err(_) => (prefix, u64::MAX, n),
        },
        None => (id, u64::MAX, ""),
    }
}

impl Default for AgentTable {
    fn default() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl AgentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` transitions, dropping the oldest
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            log: Mutex::new(VecDeque::new()),
            log_capacity: capacity.max(1),
        }
    }

    fn slot(&self, id: &str) -> Result<Slot, AgentError> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownAgent(id.to_string()))
    }

    /// Every slot in numeric id order, so `neuronal-100` follows `neuronal-99`
    fn slots(&self) -> Vec<Slot> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(&AgentId, &Slot)> = agents.iter().collect();
        entries.sort_by(|(a, _), (b, _)| id_order(a).cmp(&id_order(b)));
        let slots = entries.into_iter().map(|(_, slot)| slot.clone()).collect();
        slots
    }

    fn apply(&self, agent: &mut AgentInstance, to: AgentState) -> Result<(), AgentError> {
        if agent.retired {
            return Err(AgentError::Retired(agent.id.clone()));
        }
        if !is_legal_transition(agent.state, to) {
            return Err(AgentError::IllegalTransition {
                agent_id: agent.id.clone(),
                from: agent.state,
                to,
            });
        }
        debug!(agent_id = %agent.id, from = %agent.state, to = %to, "Agent transition");
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        if log.len() == self.log_capacity {
            log.pop_front();
        }
        log.push_back(AgentTransition {
            agent_id: agent.id.clone(),
            from: agent.state,
            to,
            task_id: agent.current_task.clone(),
            at: Utc::now(),
        });
        drop(log);
        agent.state = to;
        Ok(())
    }

    /// Add an instance; returns false if the id is taken
    pub fn insert(&self, instance: AgentInstance) -> bool {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        if agents.contains_key(&instance.id) {
            return false;
        }
        agents.insert(instance.id.clone(), Arc::new(Mutex::new(instance)));
        true
    }

    pub fn remove(&self, id: &str) -> Option<AgentInstance> {
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .map(|slot| lock_slot(&slot).clone())
    }

    pub fn clear(&self) -> usize {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        let count = agents.len();
        agents.clear();
        count
    }

    pub fn get(&self, id: &str) -> Option<AgentInstance> {
        self.slot(id).ok().map(|slot| lock_slot(&slot).clone())
    }

    /// Snapshot of every agent, in id order
    pub fn all(&self) -> Vec<AgentInstance> {
        self.slots().iter().map(|s| lock_slot(s).clone()).collect()
    }

    /// Snapshot of one tier, in id order
    pub fn in_tier(&self, tier: Tier) -> Vec<AgentInstance> {
        self.all().into_iter().filter(|a| a.tier == tier).collect()
    }

    /// Next free id of the form `{tier}-{nn}`
    pub fn next_id(&self, tier: Tier) -> AgentId {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        (1..)
            .map(|n| format!("{}-{:02}", tier, n))
            .find(|id| !agents.contains_key(id))
            .unwrap_or_else(|| format!("{}-{}", tier, uuid::Uuid::new_v4()))
    }

    /// Move up to `limit` idle agents of `tier` to Running on `task_id`,
    /// lowest id first
    pub fn claim_idle(&self, tier: Tier, task_id: &str, limit: Option<usize>) -> Vec<AgentId> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut claimed = Vec::new();
        for slot in self.slots() {
            if claimed.len() >= limit {
                break;
            }
            let mut agent = lock_slot(&slot);
            if agent.tier != tier || !agent.is_available() {
                continue;
            }
            agent.current_task = Some(task_id.to_string());
            if self.apply(&mut agent, AgentState::Running).is_ok() {
                claimed.push(agent.id.clone());
            } else {
                agent.current_task = None;
            }
        }
        claimed
    }

    /// Return a running agent to Idle after a success (or an unused claim)
    pub fn release(&self, id: &str, task_id: &str) -> bool {
        let Ok(slot) = self.slot(id) else {
            return false;
        };
        let mut agent = lock_slot(&slot);
        if agent.state != AgentState::Running || agent.current_task.as_deref() != Some(task_id) {
            return false;
        }
        let released = self.apply(&mut agent, AgentState::Idle).is_ok();
        agent.current_task = None;
        released
    }

    /// Count a failed run and decide between Idle and Failed.
    ///
    /// `trigger` gets the failures since the last rebirth and says whether
    /// they warrant a rebirth. `task_id` of `None` fails whatever the agent
    /// is running (used for stalls).
    pub fn settle_failure(
        &self,
        id: &str,
        task_id: Option<&str>,
        trigger: impl Fn(u32) -> bool,
    ) -> FailureSettlement {
        let Ok(slot) = self.slot(id) else {
            return FailureSettlement::Stale;
        };
        let mut agent = lock_slot(&slot);
        let same_task = match task_id {
            Some(task) => agent.current_task.as_deref() == Some(task),
            None => true,
        };
        if agent.state != AgentState::Running || !same_task {
            return FailureSettlement::Stale;
        }

        agent.failure_count += 1;
        agent.failures_since_rebirth += 1;
        let to = if trigger(agent.failures_since_rebirth) {
            AgentState::Failed
        } else {
            AgentState::Idle
        };
        if self.apply(&mut agent, to).is_err() {
            return FailureSettlement::Stale;
        }
        agent.current_task = None;

        match to {
            AgentState::Failed => FailureSettlement::Failed {
                tier: agent.tier,
                rebirths: agent.rebirths,
            },
            _ => FailureSettlement::Released,
        }
    }

    /// Failed → Reborn; counts the rebirth and clears the failure window
    pub fn mark_reborn(&self, id: &str) -> Result<AgentInstance, AgentError> {
        let slot = self.slot(id)?;
        let mut agent = lock_slot(&slot);
        self.apply(&mut agent, AgentState::Reborn)?;
        agent.rebirths += 1;
        agent.failures_since_rebirth = 0;
        Ok(agent.clone())
    }

    /// Reborn → Idle
    pub fn mark_ready(&self, id: &str) -> Result<(), AgentError> {
        let slot = self.slot(id)?;
        let mut agent = lock_slot(&slot);
        self.apply(&mut agent, AgentState::Idle)
    }

    /// Mark a failed agent permanently failed.
    ///
    /// Returns true only the first time, when the parent tier still has to
    /// be told.
    pub fn retire(&self, id: &str) -> Result<bool, AgentError> {
        let slot = self.slot(id)?;
        let mut agent = lock_slot(&slot);
        if agent.state != AgentState::Failed {
            return Err(AgentError::IllegalTransition {
                agent_id: agent.id.clone(),
                from: agent.state,
                to: AgentState::Failed,
            });
        }
        agent.retired = true;
        let first = !agent.escalated;
        agent.escalated = true;
        Ok(first)
    }

    /// Agents currently running, with their task
    pub fn running(&self) -> Vec<(AgentId, Tier, Option<TaskId>)> {
        self.slots()
            .iter()
            .map(|s| lock_slot(s).clone())
            .filter(|a| a.state == AgentState::Running)
            .map(|a| (a.id, a.tier, a.current_task))
            .collect()
    }

    /// Full transition log, oldest first
    pub fn transitions(&self) -> Vec<AgentTransition> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn transitions_of(&self, id: &str) -> Vec<AgentTransition> {
        self.transitions()
            .into_iter()
            .filter(|t| t.agent_id == id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(count: usize) -> AgentTable {
        let table = AgentTable::new();
        for _ in 0..count {
            let id = table.next_id(Tier::Neuronal);
            table.insert(AgentInstance::new(id, Tier::Neuronal));
        }
        table
    }

    #[test]
    fn test_ids_are_sequential() {
        let table = table(2);
        assert_eq!(table.next_id(Tier::Neuronal), "neuronal-03");
        assert_eq!(table.next_id(Tier::Cognitive), "cognitive-01");
        assert!(!table.insert(AgentInstance::new("neuronal-01", Tier::Neuronal)));
    }

    #[test]
    fn test_claim_lowest_idle_first() {
        let table = table(3);
        assert_eq!(table.claim_idle(Tier::Neuronal, "t1", Some(1)), vec!["neuronal-01"]);
        assert_eq!(
            table.claim_idle(Tier::Neuronal, "t2", None),
            vec!["neuronal-02", "neuronal-03"]
        );
        assert!(table.claim_idle(Tier::Neuronal, "t3", None).is_empty());
        assert!(table.claim_idle(Tier::Swarm, "t3", None).is_empty());
    }

    #[test]
    fn test_claim_order_is_numeric_past_99() {
        let table = table(120);
        assert_eq!(table.next_id(Tier::Neuronal), "neuronal-121");

        let claimed = table.claim_idle(Tier::Neuronal, "t1", Some(101));
        assert_eq!(claimed[9], "neuronal-10");
        assert_eq!(claimed[98], "neuronal-99");
        assert_eq!(claimed[99], "neuronal-100");
        assert_eq!(claimed[100], "neuronal-101");

        let rest = table.claim_idle(Tier::Neuronal, "t2", None);
        assert_eq!(rest.first().map(String::as_str), Some("neuronal-102"));
        assert_eq!(rest.last().map(String::as_str), Some("neuronal-120"));
    }

    #[test]
    fn test_transition_log_is_capped() {
        let table = AgentTable::with_log_capacity(3);
        table.insert(AgentInstance::new("neuronal-01", Tier::Neuronal));
        for task in ["t1", "t2"] {
            table.claim_idle(Tier::Neuronal, task, None);
            assert!(table.release("neuronal-01", task));
        }

        let log = table.transitions();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].to, AgentState::Idle);
        assert_eq!(log[0].task_id.as_deref(), Some("t1"));
        assert_eq!(log[2].task_id.as_deref(), Some("t2"));
    }

    #[test]
    fn test_release_requires_matching_task() {
        let table = table(1);
        table.claim_idle(Tier::Neuronal, "t1", None);
        assert!(!table.release("neuronal-01", "other"));
        assert!(table.release("neuronal-01", "t1"));
        assert_eq!(table.get("neuronal-01").unwrap().state, AgentState::Idle);
        assert!(!table.release("neuronal-01", "t1"));
    }

    #[test]
    fn test_failure_threshold() {
        let table = table(1);
        table.claim_idle(Tier::Neuronal, "t1", None);
        assert_eq!(
            table.settle_failure("neuronal-01", Some("t1"), |n| n >= 2),
            FailureSettlement::Released
        );
        table.claim_idle(Tier::Neuronal, "t2", None);
        assert_eq!(
            table.settle_failure("neuronal-01", Some("t2"), |n| n >= 2),
            FailureSettlement::Failed {
                tier: Tier::Neuronal,
                rebirths: 0
            }
        );
        let agent = table.get("neuronal-01").unwrap();
        assert_eq!(agent.state, AgentState::Failed);
        assert_eq!(agent.failure_count, 2);
        assert_eq!(agent.current_task, None);
    }

    #[test]
    fn test_rebirth_cycle() {
        let table = table(1);
        table.claim_idle(Tier::Neuronal, "t1", None);
        table.settle_failure("neuronal-01", Some("t1"), |_| true);
        let reborn = table.mark_reborn("neuronal-01").unwrap();
        assert_eq!(reborn.state, AgentState::Reborn);
        assert_eq!(reborn.rebirths, 1);
        assert_eq!(reborn.failures_since_rebirth, 0);
        table.mark_ready("neuronal-01").unwrap();
        assert!(table.get("neuronal-01").unwrap().is_available());

        let states: Vec<AgentState> = table
            .transitions_of("neuronal-01")
            .iter()
            .map(|t| t.to)
            .collect();
        assert_eq!(
            states,
            vec![
                AgentState::Running,
                AgentState::Failed,
                AgentState::Reborn,
                AgentState::Idle
            ]
        );
    }

    #[test]
    fn test_retired_agent_is_locked() {
        let table = table(1);
        table.claim_idle(Tier::Neuronal, "t1", None);
        table.settle_failure("neuronal-01", Some("t1"), |_| true);
        assert_eq!(table.retire("neuronal-01"), Ok(true));
        assert_eq!(table.retire("neuronal-01"), Ok(false));
        assert_eq!(
            table.mark_reborn("neuronal-01"),
            Err(AgentError::Retired("neuronal-01".into()))
        );
        assert!(table.claim_idle(Tier::Neuronal, "t2", None).is_empty());
        assert_eq!(table.get("neuronal-01").unwrap().state, AgentState::Failed);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let table = table(1);
        assert!(matches!(
            table.mark_reborn("neuronal-01"),
            Err(AgentError::IllegalTransition { from: AgentState::Idle, .. })
        ));
        assert!(matches!(
            table.mark_reborn("ghost"),
            Err(AgentError::UnknownAgent(_))
        ));
        assert!(table.retire("neuronal-01").is_err());
    }
}
