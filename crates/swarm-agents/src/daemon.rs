//! JSON-lines session plumbing for the daemon
//!
//! A [`Session`] turns input lines into submitted tasks and sends one
//! [`Reply`] per line. Task handlers live in a `JoinSet` that the caller
//! reaps as they finish, so a long session only holds the ones still
//! running.

use coordination::events::EventFilter;
use coordination::{Decision, HierarchyOrchestrator, SwarmEvent, Task, TaskFailure};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::warn;

/// One line of output
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Resolved {
        task_id: String,
        decision: Decision,
    },
    Failed {
        #[serde(flatten)]
        failure: TaskFailure,
    },
    Rejected {
        error: String,
    },
    Event {
        event: SwarmEvent,
    },
}

/// Filter for `--events`; `all` matches every event type
pub fn event_filter(types: &[String]) -> EventFilter {
    if types.iter().any(|t| t == "all") {
        EventFilter::new()
    } else {
        EventFilter::new().types(types.iter().cloned())
    }
}

/// Tasks submitted from one input stream
pub struct Session {
    orchestrator: HierarchyOrchestrator,
    replies: mpsc::UnboundedSender<Reply>,
    inflight: JoinSet<()>,
}

impl Session {
    pub fn new(orchestrator: HierarchyOrchestrator, replies: mpsc::UnboundedSender<Reply>) -> Self {
        Self {
            orchestrator,
            replies,
            inflight: JoinSet::new(),
        }
    }

    /// Parse one input line and submit it; malformed lines are rejected
    /// with a reply, blank lines ignored
    pub fn accept(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let task: Task = match serde_json::from_str(line) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "Rejected malformed task line");
                let _ = self.replies.send(Reply::Rejected { error: e.to_string() });
                return;
            }
        };

        let orchestrator = self.orchestrator.clone();
        let replies = self.replies.clone();
        self.inflight.spawn(async move {
            let task_id = task.id.clone();
            let reply = match orchestrator.submit(task).await {
                Ok(decision) => Reply::Resolved { task_id, decision },
                Err(failure) => Reply::Failed { failure },
            };
            let _ = replies.send(reply);
        });
    }

    /// Handlers not yet reaped
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Wait for the next handler to finish and drop it; `false` when none
    /// are left
    pub async fn reap(&mut self) -> bool {
        match self.inflight.join_next().await {
            Some(Err(e)) if !e.is_cancelled() => {
                warn!(error = %e, "Task handler stopped");
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Stop waiting on every handler. Submitted tasks still run to their
    /// terminal record.
    pub fn abort(&mut self) {
        self.inflight.abort_all();
    }

    /// Reap every remaining handler
    pub async fn finish(&mut self) {
        while self.reap().await {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::registry::{BackendCost, BackendDescriptor, BackendRegistry};
    use coordination::runtime::testing::ScriptedBackend;
    use coordination::runtime::BackendPool;
    use coordination::{Capability, SwarmConfig, SwarmContext, Tier};
    use std::sync::Arc;

    fn orchestrator() -> HierarchyOrchestrator {
        let ctx = SwarmContext::new(
            BackendRegistry::new().shared(),
            BackendPool::new().shared(),
            Arc::new(coordination::events::NullSink),
        );
        let orchestrator = HierarchyOrchestrator::new(ctx, &SwarmConfig::default());
        orchestrator.register_backend(
            BackendDescriptor::new("zamba", [Capability::Text], BackendCost::new(50.0, 6.0)),
            Arc::new(ScriptedBackend::new("42", 0.8)),
        );
        orchestrator.init_tier(Tier::Neuronal, 2);
        orchestrator
    }

    fn line(id: &str) -> String {
        serde_json::to_string(
            &Task::new(
                coordination::TaskPayload::new("answer").requires(Capability::Text),
                Tier::Neuronal,
            )
            .with_id(id),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_finished_handlers_are_reaped_mid_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(orchestrator(), tx);

        session.accept(&line("a"));
        session.accept(&line("b"));
        session.accept("not json");
        session.accept("   ");
        assert_eq!(session.in_flight(), 2);

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let reply = serde_json::to_value(rx.recv().await.unwrap()).unwrap();
            statuses.push(reply["status"].as_str().unwrap().to_string());
        }
        statuses.sort();
        assert_eq!(statuses, vec!["rejected", "resolved", "resolved"]);

        // Both handlers are done; reaping frees them while input stays open
        assert!(session.reap().await);
        assert!(session.reap().await);
        assert_eq!(session.in_flight(), 0);
        assert!(!session.reap().await);

        session.accept(&line("c"));
        session.finish().await;
        assert_eq!(session.in_flight(), 0);
        assert!(matches!(rx.recv().await, Some(Reply::Resolved { .. })));
    }

    #[test]
    fn test_event_filter() {
        let event = SwarmEvent::BackendRegistered {
            backend_id: "zamba".into(),
            timestamp: chrono::Utc::now(),
        };
        assert!(event_filter(&["all".into()]).matches(&event));
        assert!(event_filter(&["backend_registered".into()]).matches(&event));
        assert!(!event_filter(&["task_failed".into()]).matches(&event));

        let json = serde_json::to_value(Reply::Event { event }).unwrap();
        assert_eq!(json["status"], "event");
        assert_eq!(json["event"]["type"], "backend_registered");
    }
}
