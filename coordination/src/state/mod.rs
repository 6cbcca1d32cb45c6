//! Domain types for the swarm: tasks, tiers, capabilities and priorities.

pub mod types;

pub use types::{
    AgentId, BackendId, Capability, DispatchMode, Priority, Task, TaskId, TaskPayload, Tier,
    UnknownCapability, DEFAULT_MAX_TOKENS,
};
