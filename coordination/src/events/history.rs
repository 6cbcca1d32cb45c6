//! Event history and replay functionality
//!
//! Keeps published events in memory so a task's decision history can be
//! reconstructed after the fact alongside its consensus records and the
//! rebirth log.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use super::types::SwarmEvent;

/// Default number of events retained before the oldest are dropped
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

/// In-memory event history for replay and querying
pub struct EventHistory {
    events: Mutex<VecDeque<SwarmEvent>>,
    capacity: usize,
}

impl EventHistory {
    /// Create a history with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a history that keeps at most `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SwarmEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event, evicting the oldest once full
    pub fn record(&self, event: SwarmEvent) {
        let mut events = self.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Get all events in a time range
    pub fn get_events(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<SwarmEvent> {
        let events: Vec<SwarmEvent> = self
            .lock()
            .iter()
            .filter(|e| {
                let at = e.timestamp();
                at >= start && at <= end
            })
            .cloned()
            .collect();

        debug!(count = events.len(), "Retrieved events from history");
        events
    }

    /// Get events for the last N minutes
    pub fn get_recent_events(&self, minutes: i64) -> Vec<SwarmEvent> {
        let end = Utc::now();
        let start = end - Duration::minutes(minutes);
        self.get_events(start, end)
    }

    /// Get events for a specific task
    pub fn get_task_events(&self, task_id: &str) -> Vec<SwarmEvent> {
        self.lock()
            .iter()
            .filter(|e| e.task_id() == Some(task_id))
            .cloned()
            .collect()
    }

    /// Get events for a specific agent
    pub fn get_agent_events(&self, agent_id: &str) -> Vec<SwarmEvent> {
        self.lock()
            .iter()
            .filter(|e| e.agent_id() == Some(agent_id))
            .cloned()
            .collect()
    }

    /// Get events of one type, oldest first
    pub fn get_events_of_type(&self, event_type: &str) -> Vec<SwarmEvent> {
        self.lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Replay events through a callback
    pub async fn replay<F, Fut>(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        mut callback: F,
    ) -> ReplayStats
    where
        F: FnMut(SwarmEvent) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let events = self.get_events(start, end);
        info!(total = events.len(), "Starting event replay");

        let mut stats = ReplayStats::new();
        for event in events {
            stats.record_event(&event);
            callback(event).await;
        }

        info!(
            total = stats.total_events,
            tasks = stats.tasks_seen,
            agents = stats.agents_seen,
            "Event replay complete"
        );
        stats
    }

    /// Drop events older than `cutoff`
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut events = self.lock();
        let before = events.len();
        events.retain(|e| e.timestamp() >= cutoff);
        let count = before - events.len();

        info!(count, cutoff = %cutoff, "Pruned old events");
        count
    }

    /// Get event statistics for a time range
    pub fn get_stats(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> EventStats {
        EventStats::from_events(&self.get_events(start, end))
    }

    /// Statistics over every retained event
    pub fn stats(&self) -> EventStats {
        let events: Vec<SwarmEvent> = self.lock().iter().cloned().collect();
        EventStats::from_events(&events)
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics from replay
#[derive(Debug, Default)]
pub struct ReplayStats {
    pub total_events: usize,
    pub tasks_seen: usize,
    pub agents_seen: usize,
    pub failures_seen: usize,
    tasks: HashSet<String>,
    agents: HashSet<String>,
}

impl ReplayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&mut self, event: &SwarmEvent) {
        self.total_events += 1;

        if let Some(task_id) = event.task_id() {
            if self.tasks.insert(task_id.to_string()) {
                self.tasks_seen += 1;
            }
        }

        if let Some(agent_id) = event.agent_id() {
            if self.agents.insert(agent_id.to_string()) {
                self.agents_seen += 1;
            }
        }

        if matches!(event, SwarmEvent::TaskFailed { .. }) {
            self.failures_seen += 1;
        }
    }
}

/// Aggregate statistics for events
#[derive(Debug, Default, serde::Serialize)]
pub struct EventStats {
    pub total_events: usize,
    pub events_by_type: HashMap<String, usize>,
    pub unique_tasks: usize,
    pub resolved: usize,
    pub escalations: usize,
    pub task_failures: usize,
    pub agent_failures: usize,
    pub rebirths: usize,
    pub exhausted: usize,
}

impl EventStats {
    pub fn from_events(events: &[SwarmEvent]) -> Self {
        let mut stats = Self::default();
        let mut tasks = HashSet::new();

        for event in events {
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;

            if let Some(tid) = event.task_id() {
                tasks.insert(tid.to_string());
            }

            match event {
                SwarmEvent::ConsensusResolved { .. } => stats.resolved += 1,
                SwarmEvent::TaskEscalated { .. } => stats.escalations += 1,
                SwarmEvent::TaskFailed { .. } => stats.task_failures += 1,
                SwarmEvent::AgentFailed { .. } => stats.agent_failures += 1,
                SwarmEvent::AgentReborn { .. } => stats.rebirths += 1,
                SwarmEvent::RebirthExhausted { .. } => stats.exhausted += 1,
                _ => {}
            }
        }

        stats.unique_tasks = tasks.len();
        stats
    }
}
