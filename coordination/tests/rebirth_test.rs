//! Integration tests for agent failure recovery
//!
//! Drives an agent through repeated failures via real submissions and checks
//! the rebirth and retirement path end to end.

use std::sync::Arc;
use std::time::Duration;

use coordination::events::RecordingSink;
use coordination::orchestrator::AgentState;
use coordination::rebirth::LifecycleEvent;
use coordination::registry::{BackendCost, BackendDescriptor, BackendRegistry};
use coordination::runtime::testing::ScriptedBackend;
use coordination::runtime::BackendPool;
use coordination::{
    Capability, ErrorKind, HierarchyOrchestrator, SwarmConfig, SwarmContext, SwarmEvent, Task,
    TaskPayload, Tier,
};

fn failing_swarm(max_attempts: u32) -> (HierarchyOrchestrator, Arc<RecordingSink>) {
    let mut config = SwarmConfig::default();
    config.rebirth.max_attempts = max_attempts;
    config.rebirth.backoff_base_ms = 10;
    config.rebirth.backoff_cap_ms = 40;
    config.orchestrator.max_redispatch = 0;
    config.orchestrator.heartbeat_interval_ms = 10;

    let sink = Arc::new(RecordingSink::new());
    let ctx = SwarmContext::new(
        BackendRegistry::new().shared(),
        BackendPool::new().shared(),
        sink.clone(),
    );
    let swarm = HierarchyOrchestrator::new(ctx, &config);
    swarm.register_backend(
        BackendDescriptor::new("flaky", [Capability::Text], BackendCost::new(40.0, 6.0)),
        Arc::new(ScriptedBackend::failing("connection reset")),
    );
    swarm.init_tier(Tier::Neuronal, 1);
    (swarm, sink)
}

async fn fail_once(swarm: &HierarchyOrchestrator, id: &str) {
    let task = Task::new(TaskPayload::new("boom").requires(Capability::Text), Tier::Neuronal)
        .with_id(id);
    let failure = swarm.submit(task).await.unwrap_err();
    // Nobody above the neuronal tier, so the task dies at the top
    assert_eq!(failure.kind, ErrorKind::NoQuorum);
    assert_eq!(failure.root_cause().unwrap().kind, ErrorKind::BackendError);
    // Let any scheduled rebirth finish
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Test: three failures with max_attempts = 3 retire the agent for good and
/// escalate exactly once
#[tokio::test(start_paused = true)]
async fn test_rebirth_exhaustion() {
    let (swarm, sink) = failing_swarm(3);

    fail_once(&swarm, "f-1").await;
    let agent = swarm.agent("neuronal-01").unwrap();
    assert_eq!(agent.state, AgentState::Idle);
    assert_eq!(agent.rebirths, 1);

    fail_once(&swarm, "f-2").await;
    assert_eq!(swarm.agent("neuronal-01").unwrap().rebirths, 2);

    fail_once(&swarm, "f-3").await;
    let agent = swarm.agent("neuronal-01").unwrap();
    assert_eq!(agent.state, AgentState::Failed);
    assert!(agent.retired);
    assert_eq!(agent.failure_count, 3);

    // A retired agent is never claimed again
    let task = Task::new(TaskPayload::new("more").requires(Capability::Text), Tier::Neuronal)
        .with_id("f-4");
    assert_eq!(swarm.submit(task).await.unwrap_err().kind, ErrorKind::NoQuorum);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(swarm.agent("neuronal-01").unwrap().failure_count, 3);

    let escalations = swarm.escalations();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].parent, Some(Tier::Swarm));
    assert_eq!(escalations[0].attempts, 3);

    let exhausted = sink.of_type("rebirth_exhausted");
    assert_eq!(exhausted.len(), 1);
    assert!(matches!(
        &exhausted[0],
        SwarmEvent::RebirthExhausted {
            parent: Some(Tier::Swarm),
            attempts: 3,
            ..
        }
    ));
    assert_eq!(sink.of_type("agent_reborn").len(), 2);
}

/// Test: once Failed for the last time the agent never returns to Idle
#[tokio::test(start_paused = true)]
async fn test_exhausted_agent_never_idles() {
    let (swarm, _) = failing_swarm(2);
    fail_once(&swarm, "g-1").await;
    fail_once(&swarm, "g-2").await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let transitions = swarm.agent_transitions("neuronal-01");
    let last_failed = transitions
        .iter()
        .rposition(|t| t.to == AgentState::Failed)
        .unwrap();
    assert!(transitions[last_failed..]
        .iter()
        .all(|t| t.to != AgentState::Idle));
    assert_eq!(transitions.last().unwrap().to, AgentState::Failed);

    let summary = swarm.tier_summary();
    assert_eq!(summary[0].retired, 1);
    assert_eq!(summary[0].idle, 0);
}

/// Test: the lifecycle log records each step of the agent's recovery
#[tokio::test(start_paused = true)]
async fn test_lifecycle_log() {
    let (swarm, _) = failing_swarm(2);
    fail_once(&swarm, "h-1").await;
    fail_once(&swarm, "h-2").await;

    let events: Vec<LifecycleEvent> = swarm
        .lifecycle()
        .into_iter()
        .filter(|e| e.agent_id == "neuronal-01")
        .map(|e| e.event)
        .collect();
    assert_eq!(events.len(), 5);
    assert_eq!(
        events[0],
        LifecycleEvent::Failed {
            kind: ErrorKind::BackendError
        }
    );
    assert!(matches!(events[1], LifecycleEvent::RebirthScheduled { attempt: 1, .. }));
    assert_eq!(events[2], LifecycleEvent::Reborn { attempt: 1 });
    assert_eq!(
        events[3],
        LifecycleEvent::Failed {
            kind: ErrorKind::BackendError
        }
    );
    assert_eq!(events[4], LifecycleEvent::Exhausted { attempts: 2 });
}

/// Test: the watchdog stops once the swarm shuts down
#[tokio::test(start_paused = true)]
async fn test_watchdog_stops_on_shutdown() {
    let (swarm, _) = failing_swarm(3);
    let watchdog = swarm.spawn_watchdog();
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(!watchdog.is_finished());

    swarm.shutdown();
    tokio::time::timeout(Duration::from_secs(1), watchdog)
        .await
        .unwrap()
        .unwrap();
    assert!(swarm.agent("neuronal-01").is_none());
}
