//! Core domain types shared by every swarm component
//!
//! Tasks, tiers, capabilities and priorities. These are plain data; the
//! components that own their lifecycles live in `registry`, `orchestrator`
//! and `consensus`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consensus::ConsensusStrategy;

/// Unique identifier for submitted tasks
pub type TaskId = String;

/// Unique identifier for agent instances
pub type AgentId = String;

/// Unique identifier for registered model backends
pub type BackendId = String;

/// Default generation budget when a task does not specify one
pub const DEFAULT_MAX_TOKENS: u32 = 256;

/// Capability a backend offers and a task may require.
///
/// The set is closed: configuration naming anything else fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Vision,
    Audio,
    Code,
    Reasoning,
    Embedding,
}

impl Capability {
    pub fn all() -> &'static [Capability] {
        &[
            Capability::Text,
            Capability::Vision,
            Capability::Audio,
            Capability::Code,
            Capability::Reasoning,
            Capability::Embedding,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Text => "text",
            Capability::Vision => "vision",
            Capability::Audio => "audio",
            Capability::Code => "code",
            Capability::Reasoning => "reasoning",
            Capability::Embedding => "embedding",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a capability tag is not part of the known set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability tag: {0}")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_lowercase();
        Capability::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == tag)
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

/// Agent tiers in the swarm hierarchy, leaf first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Fast, numerous leaf agents
    Neuronal,
    /// Mycelial middle layer that cross-checks the leaves
    Swarm,
    /// Top reasoning layer; nothing above it
    Cognitive,
}

impl Tier {
    pub fn all() -> &'static [Tier] {
        &[Tier::Neuronal, Tier::Swarm, Tier::Cognitive]
    }

    /// The tier that receives escalations from this one
    pub fn parent(&self) -> Option<Tier> {
        match self {
            Tier::Neuronal => Some(Tier::Swarm),
            Tier::Swarm => Some(Tier::Cognitive),
            Tier::Cognitive => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Neuronal => write!(f, "neuronal"),
            Tier::Swarm => write!(f, "swarm"),
            Tier::Cognitive => write!(f, "cognitive"),
        }
    }
}

/// Task priority; scales how strictly the router weighs latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn weight(&self) -> f64 {
        match self {
            Priority::Low => 0.5,
            Priority::Normal => 1.0,
            Priority::High => 2.0,
            Priority::Critical => 4.0,
        }
    }
}

/// What the task asks a backend to do.
///
/// `body` is opaque to the core; only backends interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub body: String,
    #[serde(default)]
    pub required: BTreeSet<Capability>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

impl TaskPayload {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            required: BTreeSet::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn requires(mut self, capability: Capability) -> Self {
        self.required.insert(capability);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }
}

/// How the orchestrator should dispatch a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchMode {
    /// One agent of the tier handles the task
    Single { tier: Tier },
    /// Every idle agent of the tier handles it and the results are merged
    Consensus {
        tier: Tier,
        /// Overrides the configured strategy
        #[serde(default)]
        strategy: Option<ConsensusStrategy>,
        /// Overrides the configured minimum quorum
        #[serde(default)]
        min_quorum: Option<usize>,
    },
}

impl DispatchMode {
    pub fn tier(&self) -> Tier {
        match self {
            DispatchMode::Single { tier } | DispatchMode::Consensus { tier, .. } => *tier,
        }
    }

    pub fn is_consensus(&self) -> bool {
        matches!(self, DispatchMode::Consensus { .. })
    }
}

/// A unit of work submitted to the orchestrator.
///
/// Immutable once submitted; the orchestrator shares it as `Arc<Task>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "new_task_id")]
    pub id: TaskId,
    pub payload: TaskPayload,
    #[serde(default)]
    pub priority: Priority,
    /// Budget for each backend call, measured from dispatch
    #[serde(default)]
    pub deadline: Option<Duration>,
    /// Agent that spawned this task, if any
    #[serde(default)]
    pub origin: Option<AgentId>,
    pub dispatch: DispatchMode,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}

impl Task {
    /// Create a single-agent task for the given tier
    pub fn new(payload: TaskPayload, tier: Tier) -> Self {
        Self {
            id: new_task_id(),
            payload,
            priority: Priority::Normal,
            deadline: None,
            origin: None,
            dispatch: DispatchMode::Single { tier },
            created_at: Utc::now(),
        }
    }

    /// Create a task that fans out to the whole tier for consensus
    pub fn consensus(payload: TaskPayload, tier: Tier) -> Self {
        Self {
            dispatch: DispatchMode::Consensus {
                tier,
                strategy: None,
                min_quorum: None,
            },
            ..Self::new(payload, tier)
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<AgentId>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Override the consensus strategy (no effect on single dispatch)
    pub fn with_strategy(mut self, strategy: ConsensusStrategy) -> Self {
        if let DispatchMode::Consensus {
            strategy: ref mut s,
            ..
        } = self.dispatch
        {
            *s = Some(strategy);
        }
        self
    }

    /// Override the minimum quorum (no effect on single dispatch)
    pub fn with_min_quorum(mut self, quorum: usize) -> Self {
        if let DispatchMode::Consensus {
            min_quorum: ref mut q,
            ..
        } = self.dispatch
        {
            *q = Some(quorum.max(1));
        }
        self
    }

    pub fn required(&self) -> &BTreeSet<Capability> {
        &self.payload.required
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_parse() {
        assert_eq!("text".parse::<Capability>().unwrap(), Capability::Text);
        assert_eq!(" Vision ".parse::<Capability>().unwrap(), Capability::Vision);
        let err = "telepathy".parse::<Capability>().unwrap_err();
        assert_eq!(err, UnknownCapability("telepathy".to_string()));
    }

    #[test]
    fn test_capability_serde_rejects_unknown() {
        let ok: Capability = serde_json::from_str("\"audio\"").unwrap();
        assert_eq!(ok, Capability::Audio);
        assert!(serde_json::from_str::<Capability>("\"smell\"").is_err());
    }

    #[test]
    fn test_tier_parents() {
        assert_eq!(Tier::Neuronal.parent(), Some(Tier::Swarm));
        assert_eq!(Tier::Swarm.parent(), Some(Tier::Cognitive));
        assert_eq!(Tier::Cognitive.parent(), None);
    }

    #[test]
    fn test_priority_weights_increase() {
        assert!(Priority::Low.weight() < Priority::Normal.weight());
        assert!(Priority::High.weight() < Priority::Critical.weight());
    }

    #[test]
    fn test_task_builders() {
        let task = Task::consensus(TaskPayload::new("summarize").requires(Capability::Text), Tier::Swarm)
            .with_id("t-1")
            .with_min_quorum(0)
            .with_strategy(ConsensusStrategy::WeightedConfidence);

        assert_eq!(task.id, "t-1");
        assert_eq!(task.dispatch.tier(), Tier::Swarm);
        match task.dispatch {
            DispatchMode::Consensus {
                strategy,
                min_quorum,
                ..
            } => {
                assert_eq!(strategy, Some(ConsensusStrategy::WeightedConfidence));
                assert_eq!(min_quorum, Some(1));
            }
            DispatchMode::Single { .. } => panic!("expected consensus dispatch"),
        }
    }

    #[test]
    fn test_single_task_ignores_consensus_overrides() {
        let task = Task::new(TaskPayload::new("hi"), Tier::Neuronal).with_min_quorum(3);
        assert_eq!(task.dispatch, DispatchMode::Single { tier: Tier::Neuronal });
    }

    #[test]
    fn test_task_serde_roundtrip() {
        let task = Task::new(TaskPayload::new("hi").with_max_tokens(64), Tier::Neuronal)
            .with_deadline(Duration::from_millis(1500));
        let json = serde_json::to_string(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.deadline, Some(Duration::from_millis(1500)));
        assert_eq!(parsed.payload.max_tokens, 64);
    }
}
