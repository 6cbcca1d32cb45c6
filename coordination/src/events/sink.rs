//! Sink interface the core emits structured events into
//!
//! The orchestrator and health prober only see `dyn EventSink`; what
//! happens to an event (broadcast, log line, dropped) is up to whoever
//! built the context.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use super::types::SwarmEvent;

/// Receiver of structured swarm events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SwarmEvent);
}

/// Shared reference to an event sink
pub type SharedEventSink = Arc<dyn EventSink>;

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SwarmEvent) {}
}

/// Writes every event as a structured `tracing` record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SwarmEvent) {
        let event_type = event.event_type();
        let task_id = event.task_id().unwrap_or("-");
        let agent_id = event.agent_id().unwrap_or("-");
        let payload = serde_json::to_string(&event).unwrap_or_default();

        match event {
            SwarmEvent::AgentFailed { .. }
            | SwarmEvent::TaskFailed { .. }
            | SwarmEvent::RebirthExhausted { .. }
            | SwarmEvent::AgentStalled { .. } => {
                warn!(event_type, task_id, agent_id, %payload, "swarm event")
            }
            _ => info!(event_type, task_id, agent_id, %payload, "swarm event"),
        }
    }
}

/// Forwards each event to several sinks in order
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<SharedEventSink>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedEventSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: SwarmEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// Keeps every event in memory; handy for tests and audits
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SwarmEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SwarmEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events of one type, in emission order
    pub fn of_type(&self, event_type: &str) -> Vec<SwarmEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: SwarmEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn stalled(agent: &str) -> SwarmEvent {
        SwarmEvent::AgentStalled {
            agent_id: agent.to_string(),
            silent_ms: 5_000,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(RecordingSink::new());
        let b = Arc::new(RecordingSink::new());
        let fanout = FanoutSink::new()
            .with(a.clone())
            .with(Arc::new(NullSink))
            .with(b.clone());

        fanout.emit(stalled("swarm-01"));
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.of_type("agent_stalled").len(), 1);
    }

    #[test]
    fn test_tracing_sink_accepts_events() {
        TracingSink.emit(stalled("swarm-01"));
    }
}
