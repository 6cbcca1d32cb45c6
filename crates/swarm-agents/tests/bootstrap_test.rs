//! Integration tests for building a swarm from configuration
//!
//! Backends point at a closed local port so nothing here needs a running
//! model server.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use coordination::events::EventFilter;
use coordination::registry::BackendHealth;
use coordination::{Capability, ErrorKind, SwarmConfig, SwarmEvent, Task, TaskPayload, Tier};
use swarm_agents::Swarm;

const UNREACHABLE: &str = r#"
health:
  interval_ms: 50
  timeout_ms: 200
  retries: 0
  retry_backoff_ms: 1
tiers:
  - { tier: neuronal, agents: 2 }
backends:
  - id: ghost
    endpoint: http://127.0.0.1:9
    capabilities: [text]
    tokens_per_sec: 40
    vram_gb: 6
"#;

fn sample_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config/swarm.yaml")
}

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

/// Test: the shipped sample config builds a full three-tier swarm
#[tokio::test]
async fn test_sample_config_builds() {
    let config = SwarmConfig::load(sample_config()).unwrap();
    let swarm = Swarm::build(&config).unwrap();

    assert_eq!(swarm.orchestrator.registry().len(), 3);
    let totals: Vec<(Option<Tier>, usize)> = swarm
        .orchestrator
        .tier_summary()
        .iter()
        .map(|s| (s.tier, s.idle))
        .collect();
    assert_eq!(
        totals,
        vec![
            (Some(Tier::Neuronal), 3),
            (Some(Tier::Swarm), 2),
            (Some(Tier::Cognitive), 1),
        ]
    );

    let reasoner = swarm.orchestrator.registry().get("qwen-reasoner").unwrap();
    assert_eq!(reasoner.model, "qwen2.5:14b");
    assert!(reasoner.capabilities.contains(&Capability::Reasoning));
    swarm.shutdown().await;
}

/// Test: a malformed config file is reported with its path
#[tokio::test]
async fn test_bad_config_is_rejected() {
    let file = write_config("consensus:\n  min_quorum: 0\n");
    let err = Swarm::from_file(file.path()).err().unwrap();
    let message = format!("{:#}", err);
    assert!(message.contains("failed to load swarm config"));
    assert!(message.contains("min_quorum"));
}

/// Test: orchestrator events reach bus subscribers
#[tokio::test]
async fn test_events_reach_bus() {
    let file = write_config(UNREACHABLE);
    let swarm = Swarm::from_file(file.path()).unwrap();
    let mut rx = swarm
        .bus
        .subscribe_filtered(EventFilter::new().types(["backend_deregistered"]));

    swarm.orchestrator.add_agent(Tier::Swarm);
    swarm.orchestrator.deregister_backend("ghost").unwrap();
    let event = rx.recv().await.unwrap();
    assert!(matches!(event, SwarmEvent::BackendDeregistered { .. }));
    assert_eq!(event.backend_id(), Some("ghost"));
    swarm.shutdown().await;
}

/// Test: events land in the swarm's history and its session report
#[tokio::test]
async fn test_history_and_report() {
    let file = write_config(UNREACHABLE);
    let swarm = Swarm::from_file(file.path()).unwrap();
    let types = vec!["backend_health_changed".to_string()];
    let mut health = swarm.watch(EventFilter::new().types(types));

    swarm.prober.probe_all().await;
    let event = health.recv().await.unwrap();
    assert_eq!(event.backend_id(), Some("ghost"));

    let task = Task::new(TaskPayload::new("hello").requires(Capability::Text), Tier::Neuronal)
        .with_id("stranded");
    swarm.orchestrator.submit(task).await.unwrap_err();

    assert_eq!(swarm.history.get_task_events("stranded").len(), 1);
    let report = swarm.report();
    assert_eq!(report.events.task_failures, 1);
    assert_eq!(report.events.events_by_type["backend_health_changed"], 1);
    assert_eq!(report.events.events_by_type["backend_registered"], 1);
    // Nothing was routed, so no backend call was made
    assert_eq!(report.backends.total_calls, 0);
    assert_eq!(report.backends.backends[0].backend_id, "ghost");
    swarm.shutdown().await;
}

/// Test: a backend that fails its probe stops receiving work
#[tokio::test]
async fn test_unreachable_backend_is_not_routed() {
    let file = write_config(UNREACHABLE);
    let swarm = Swarm::from_file(file.path()).unwrap();

    assert_eq!(swarm.prober.probe_all().await, 1);
    assert_eq!(
        swarm.orchestrator.registry().get("ghost").unwrap().health,
        BackendHealth::Unavailable
    );

    let task = Task::new(TaskPayload::new("hello").requires(Capability::Text), Tier::Neuronal)
        .with_id("stranded");
    let failure = swarm.orchestrator.submit(task).await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::NoRouteAvailable);
    swarm.shutdown().await;
}

/// Test: background services start once and stop on shutdown
#[tokio::test]
async fn test_background_lifecycle() {
    let file = write_config(UNREACHABLE);
    let mut swarm = Swarm::from_file(file.path()).unwrap();

    swarm.start_background().unwrap();
    assert_eq!(swarm.background_tasks(), 2);
    assert!(swarm.start_background().is_err());

    tokio::time::timeout(Duration::from_secs(5), swarm.shutdown())
        .await
        .unwrap();
}
