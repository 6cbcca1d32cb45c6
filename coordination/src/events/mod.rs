//! Structured event plumbing for the swarm core
//!
//! # Architecture
//!
//! 1. **Event Types** (`types.rs`): the events the core emits, from
//!    backend registration through task resolution to agent rebirth.
//!
//! 2. **Event Sink** (`sink.rs`): the interface the core emits into, plus
//!    tracing, fan-out and recording sinks.
//!
//! 3. **Event Bus** (`bus.rs`): Tokio broadcast-based pub/sub that is also
//!    a sink.
//!
//! 4. **Event History** (`history.rs`): bounded in-memory history with
//!    query and replay.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Orchestrator │────▶│  EventSink   │────▶│  Subscribers │
//! │ Prober       │     │  (bus, log)  │     │   (recv)     │
//! └──────────────┘     └──────┬───────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐
//!                      │ EventHistory │
//!                      └──────────────┘
//! ```

pub mod bus;
pub mod history;
pub mod sink;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus};
pub use history::{EventHistory, EventStats, ReplayStats, DEFAULT_HISTORY_CAPACITY};
pub use sink::{EventSink, FanoutSink, NullSink, RecordingSink, SharedEventSink, TracingSink};
pub use types::{preview, EventId, SwarmEvent};
