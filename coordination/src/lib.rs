//! Swarm coordination core
//!
//! Routes work from tiers of cooperating agents to locally hosted model
//! backends, reconciles redundant results, and recovers failed agents.
//!
//! # Components
//!
//! - [`registry`]: model backends, their capabilities, cost and health
//! - [`router`]: picks a backend for a task under latency and VRAM limits
//! - [`runtime`]: runs one agent's task against its routed backend
//! - [`orchestrator`]: agent tiers, dispatch, escalation, task lifecycle
//! - [`consensus`]: merges redundant results into one decision
//! - [`rebirth`]: backoff and retirement policy for failed agents
//! - [`events`]: structured events, sinks, broadcast bus and history
//! - [`config`]: YAML configuration
//!
//! # Flow
//!
//! ```text
//! submit(task) ─▶ orchestrator ─▶ agents of a tier ─▶ router ─▶ backend
//!                      ▲                │
//!                      │                ▼
//!                  escalate ◀── consensus::resolve ──▶ Decision
//!                                       │
//!                              failed agent ─▶ rebirth
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod consensus;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod rebirth;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod state;

pub use config::{ConfigError, SwarmConfig};
pub use consensus::{ConsensusRecord, ConsensusStrategy, Decision};
pub use error::{CausalLink, ErrorKind, SwarmError, TaskFailure};
pub use events::{EventBus, EventSink, SharedEventSink, SwarmEvent};
pub use orchestrator::{HierarchyOrchestrator, SwarmContext};
pub use rebirth::{RebirthManager, RebirthPolicy};
pub use registry::{BackendDescriptor, BackendHealth, BackendRegistry, SharedRegistry};
pub use router::ModelRouter;
pub use runtime::{AgentRuntime, BackendPool, ModelBackend};
pub use state::{Capability, DispatchMode, Priority, Task, TaskPayload, Tier};
