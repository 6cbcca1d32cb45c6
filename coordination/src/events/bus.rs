//! Event bus for swarm coordination
//!
//! Provides pub/sub messaging using Tokio broadcast channels with an
//! optional in-memory history for replay.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::history::EventHistory;
use super::sink::EventSink;
use super::types::SwarmEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus with broadcast channels and optional history
pub struct EventBus {
    /// Broadcast sender for publishing events
    sender: broadcast::Sender<SwarmEvent>,

    /// Optional history that keeps every published event
    history: Option<Arc<EventHistory>>,
}

impl EventBus {
    /// Create a new event bus without history
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: None,
        }
    }

    /// Create an event bus that records into `history`
    pub fn with_history(history: Arc<EventHistory>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Some(history),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    pub fn history(&self) -> Option<&Arc<EventHistory>> {
        self.history.as_ref()
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: SwarmEvent) {
        let event_type = event.event_type();

        if let Some(history) = &self.history {
            history.record(event.clone());
        }

        // No receivers is fine; history (if any) already has it
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if the bus has any subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: SwarmEvent) {
        self.publish(event);
    }
}

/// Which events a filtered subscriber wants.
///
/// Id filters only reject events that carry a different id; an event with
/// no task id passes a task filter.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub backend_id: Option<String>,
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Matches every event
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn backend(mut self, backend_id: impl Into<String>) -> Self {
        self.backend_id = Some(backend_id.into());
        self
    }

    /// Only events whose `event_type()` is listed
    pub fn types<S: Into<String>>(mut self, event_types: impl IntoIterator<Item = S>) -> Self {
        self.event_types = Some(event_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, event: &SwarmEvent) -> bool {
        let rejects = |want: &Option<String>, got: Option<&str>| match (want, got) {
            (Some(want), Some(got)) => want != got,
            _ => false,
        };
        if rejects(&self.task_id, event.task_id())
            || rejects(&self.agent_id, event.agent_id())
            || rejects(&self.backend_id, event.backend_id())
        {
            return false;
        }
        self.event_types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == event.event_type()))
    }
}

/// Receiver that skips events its filter rejects
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<SwarmEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<SwarmEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Next matching event; lagged gaps are logged and skipped
    pub async fn recv(&mut self) -> Result<SwarmEvent, broadcast::error::RecvError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Filtered subscriber lagged");
                }
                Err(closed) => return Err(closed),
            }
        }
    }
}

impl EventBus {
    /// Subscribe to events matching `filter`
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::state::Tier;
    use chrono::Utc;

    fn dispatched(task_id: &str) -> SwarmEvent {
        SwarmEvent::TaskDispatched {
            task_id: task_id.to_string(),
            tier: Tier::Neuronal,
            attempt: 1,
            agents: vec!["neuronal-01".to_string()],
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(dispatched("task-1"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "task_dispatched");
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new().shared();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(dispatched("task-1"));

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();

        assert_eq!(e1.event_type(), e2.event_type());
    }

    #[test]
    fn test_publish_records_history() {
        let history = Arc::new(EventHistory::new());
        let bus = EventBus::with_history(history.clone());
        bus.publish(dispatched("task-1"));
        bus.publish(dispatched("task-2"));
        assert_eq!(history.len(), 2);
        assert_eq!(history.get_task_events("task-2").len(), 1);
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::new()
            .task("task-1")
            .types(["task_dispatched", "agent_failed"]);

        let non_matching_type = SwarmEvent::TaskFailed {
            task_id: "task-1".to_string(),
            kind: ErrorKind::NoQuorum,
            chain_len: 1,
            timestamp: Utc::now(),
        };

        assert!(filter.matches(&dispatched("task-1")));
        assert!(!filter.matches(&dispatched("task-2")));
        assert!(!filter.matches(&non_matching_type));

        let registered = SwarmEvent::BackendRegistered {
            backend_id: "zamba".to_string(),
            timestamp: Utc::now(),
        };
        assert!(EventFilter::new().task("task-1").matches(&registered));
        assert!(!EventFilter::new().backend("other").matches(&registered));
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let bus = EventBus::new();
        let filter = EventFilter::new().task("target-task");
        let mut filtered = bus.subscribe_filtered(filter);

        bus.publish(dispatched("other-task"));
        bus.publish(dispatched("target-task"));

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.task_id(), Some("target-task"));
    }
}
