//! Event types for swarm coordination
//!
//! Structured events the core emits to its injected sink: backend
//! lifecycle, task dispatch and resolution, agent failure and rebirth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consensus::ConsensusStrategy;
use crate::error::ErrorKind;
use crate::registry::BackendHealth;
use crate::state::{AgentId, BackendId, TaskId, Tier};

/// Unique identifier for events
pub type EventId = String;

/// All swarm coordination events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwarmEvent {
    BackendRegistered {
        backend_id: BackendId,
        timestamp: DateTime<Utc>,
    },

    BackendDeregistered {
        backend_id: BackendId,
        timestamp: DateTime<Utc>,
    },

    /// A probe changed a backend's health
    BackendHealthChanged {
        backend_id: BackendId,
        from: BackendHealth,
        to: BackendHealth,
        timestamp: DateTime<Utc>,
    },

    /// A task round was sent to one or more agents of a tier
    TaskDispatched {
        task_id: TaskId,
        tier: Tier,
        attempt: u32,
        agents: Vec<AgentId>,
        timestamp: DateTime<Utc>,
    },

    /// An agent returned a result
    ResultReceived {
        task_id: TaskId,
        agent_id: AgentId,
        backend_id: BackendId,
        confidence: f32,
        latency_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// An agent's run failed
    AgentFailed {
        agent_id: AgentId,
        task_id: Option<TaskId>,
        kind: ErrorKind,
        detail: String,
        timestamp: DateTime<Utc>,
    },

    /// A task moved up to the parent tier
    TaskEscalated {
        task_id: TaskId,
        from: Tier,
        to: Tier,
        reason: ErrorKind,
        min_quorum: usize,
        timestamp: DateTime<Utc>,
    },

    /// A task was resolved
    ConsensusResolved {
        task_id: TaskId,
        tier: Tier,
        strategy: ConsensusStrategy,
        value_preview: String,
        support: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },

    /// A task failed terminally
    TaskFailed {
        task_id: TaskId,
        kind: ErrorKind,
        chain_len: usize,
        timestamp: DateTime<Utc>,
    },

    /// A failed agent was re-provisioned
    AgentReborn {
        agent_id: AgentId,
        tier: Tier,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// An agent ran out of rebirth attempts and was retired
    RebirthExhausted {
        agent_id: AgentId,
        tier: Tier,
        /// Tier notified of the loss; `None` at the top of the hierarchy
        parent: Option<Tier>,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// An agent missed its heartbeat window
    AgentStalled {
        agent_id: AgentId,
        silent_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl SwarmEvent {
    /// Generate a new unique event ID
    pub fn new_id() -> EventId {
        uuid::Uuid::new_v4().to_string()
    }

    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SwarmEvent::BackendRegistered { timestamp, .. }
            | SwarmEvent::BackendDeregistered { timestamp, .. }
            | SwarmEvent::BackendHealthChanged { timestamp, .. }
            | SwarmEvent::TaskDispatched { timestamp, .. }
            | SwarmEvent::ResultReceived { timestamp, .. }
            | SwarmEvent::AgentFailed { timestamp, .. }
            | SwarmEvent::TaskEscalated { timestamp, .. }
            | SwarmEvent::ConsensusResolved { timestamp, .. }
            | SwarmEvent::TaskFailed { timestamp, .. }
            | SwarmEvent::AgentReborn { timestamp, .. }
            | SwarmEvent::RebirthExhausted { timestamp, .. }
            | SwarmEvent::AgentStalled { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            SwarmEvent::BackendRegistered { .. } => "backend_registered",
            SwarmEvent::BackendDeregistered { .. } => "backend_deregistered",
            SwarmEvent::BackendHealthChanged { .. } => "backend_health_changed",
            SwarmEvent::TaskDispatched { .. } => "task_dispatched",
            SwarmEvent::ResultReceived { .. } => "result_received",
            SwarmEvent::AgentFailed { .. } => "agent_failed",
            SwarmEvent::TaskEscalated { .. } => "task_escalated",
            SwarmEvent::ConsensusResolved { .. } => "consensus_resolved",
            SwarmEvent::TaskFailed { .. } => "task_failed",
            SwarmEvent::AgentReborn { .. } => "agent_reborn",
            SwarmEvent::RebirthExhausted { .. } => "rebirth_exhausted",
            SwarmEvent::AgentStalled { .. } => "agent_stalled",
        }
    }

    /// Get the task ID if this event is task-related
    pub fn task_id(&self) -> Option<&str> {
        match self {
            SwarmEvent::TaskDispatched { task_id, .. }
            | SwarmEvent::ResultReceived { task_id, .. }
            | SwarmEvent::TaskEscalated { task_id, .. }
            | SwarmEvent::ConsensusResolved { task_id, .. }
            | SwarmEvent::TaskFailed { task_id, .. } => Some(task_id),
            SwarmEvent::AgentFailed { task_id, .. } => task_id.as_deref(),
            _ => None,
        }
    }

    /// Get the agent ID if this event concerns one agent
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            SwarmEvent::ResultReceived { agent_id, .. }
            | SwarmEvent::AgentFailed { agent_id, .. }
            | SwarmEvent::AgentReborn { agent_id, .. }
            | SwarmEvent::RebirthExhausted { agent_id, .. }
            | SwarmEvent::AgentStalled { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    /// Get the backend ID if this event concerns one backend
    pub fn backend_id(&self) -> Option<&str> {
        match self {
            SwarmEvent::BackendRegistered { backend_id, .. }
            | SwarmEvent::BackendDeregistered { backend_id, .. }
            | SwarmEvent::BackendHealthChanged { backend_id, .. }
            | SwarmEvent::ResultReceived { backend_id, .. } => Some(backend_id),
            _ => None,
        }
    }
}

/// Truncate a value for event payloads
pub fn preview(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        let cut: String = value.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = SwarmEvent::TaskEscalated {
            task_id: "task-123".to_string(),
            from: Tier::Neuronal,
            to: Tier::Swarm,
            reason: ErrorKind::NoQuorum,
            min_quorum: 1,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("task_escalated"));
        assert!(json.contains("no_quorum"));

        let parsed: SwarmEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "task_escalated");
        assert_eq!(parsed.task_id(), Some("task-123"));
    }

    #[test]
    fn test_accessors() {
        let failed = SwarmEvent::AgentFailed {
            agent_id: "neuronal-01".into(),
            task_id: None,
            kind: ErrorKind::Timeout,
            detail: "deadline".into(),
            timestamp: Utc::now(),
        };
        assert_eq!(failed.task_id(), None);
        assert_eq!(failed.agent_id(), Some("neuronal-01"));
        assert_eq!(failed.backend_id(), None);
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdef", 3), "abc…");
    }
}
