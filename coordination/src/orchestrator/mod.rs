//! Hierarchy Orchestrator
//!
//! Owns the agent tiers and drives every submitted task to exactly one
//! terminal outcome.
//!
//! ```text
//! submit(task)
//!   │ duplicate id ─────────────────────────────▶ Err(DuplicateTask)
//!   │ no backend can serve it ──────────────────▶ Err(NoRouteAvailable)
//!   ▼
//! Dispatched ──claim idle agents──▶ AwaitingResults
//!   │ fewer than quorum                │ replies, first quorum, or round timeout
//!   ▼                                  ▼
//! Escalated ◀──── no quorum / ──── consensus::resolve ──▶ Resolved ─▶ Ok(Decision)
//!   │             failed run           │
//!   │                                  └─ single dispatch timeout/backend
//!   │                                     error: re-dispatch in tier
//!   ├─ parent tier ─▶ Dispatched (quorum relaxed)
//!   └─ no parent ───▶ Failed ─▶ Err(TaskFailure)
//! ```
//!
//! Failed agent runs feed the rebirth manager; the orchestrator carries out
//! its decisions (re-provision after backoff, or retire and notify the
//! parent tier).

pub mod agents;
pub mod task_state;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConsensusConfig, OrchestratorConfig, SwarmConfig};
use crate::consensus::{
    ConsensusArchive, ConsensusError, ConsensusOutcome, ConsensusRecord, ConsensusStrategy,
    Decision,
};
use crate::error::{CausalLink, ErrorKind, SwarmError, TaskFailure};
use crate::events::{preview, SharedEventSink, SwarmEvent};
use crate::rebirth::{LifecycleEntry, RebirthDecision, RebirthManager};
use crate::registry::{BackendDescriptor, SharedRegistry};
use crate::router::ModelRouter;
use crate::runtime::{
    AgentFailure, AgentOutput, AgentRuntime, AgentWorker, HeartbeatBoard, ModelBackend,
    RunOutcome, SharedBackendPool, WorkerHandle,
};
use crate::state::{AgentId, DispatchMode, Task, TaskId, Tier};

pub use agents::{
    AgentError, AgentInstance, AgentState, AgentTable, AgentTransition, FailureSettlement,
};
pub use task_state::{IllegalTransition, TaskState, TaskStateMachine, TransitionRecord};

const PREVIEW_CHARS: usize = 80;

/// Collaborators the swarm core runs against.
///
/// Passed in explicitly; nothing in the core reaches for globals.
#[derive(Clone)]
pub struct SwarmContext {
    pub registry: SharedRegistry,
    pub pool: SharedBackendPool,
    pub events: SharedEventSink,
}

impl SwarmContext {
    pub fn new(registry: SharedRegistry, pool: SharedBackendPool, events: SharedEventSink) -> Self {
        Self {
            registry,
            pool,
            events,
        }
    }
}

/// A retired agent reported to its parent tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationNotice {
    pub agent_id: AgentId,
    pub tier: Tier,
    /// `None` when the agent sat in the top tier
    pub parent: Option<Tier>,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

/// Population of one tier by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSummary {
    pub tier: Option<Tier>,
    pub total: usize,
    pub idle: usize,
    pub running: usize,
    pub failed: usize,
    pub reborn: usize,
    pub retired: usize,
}

/// How a dispatch round ended without a decision
struct RoundFailure {
    kind: ErrorKind,
    links: Vec<CausalLink>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn guard(result: Result<(), IllegalTransition>) {
    if let Err(err) = result {
        warn!(error = %err, "Task transition rejected");
    }
}

struct Inner {
    ctx: SwarmContext,
    consensus: ConsensusConfig,
    settings: OrchestratorConfig,
    runtime: Arc<AgentRuntime>,
    rebirth: RebirthManager,
    agents: AgentTable,
    workers: Mutex<HashMap<AgentId, WorkerHandle>>,
    heartbeats: Arc<HeartbeatBoard>,
    archive: ConsensusArchive,
    transitions: Mutex<HashMap<TaskId, Vec<TransitionRecord>>>,
    inflight: Mutex<HashSet<TaskId>>,
    escalations: Mutex<VecDeque<EscalationNotice>>,
    closing: CancellationToken,
}

/// Removes a task id from the in-flight set once its drive finishes
struct InflightGuard {
    inner: Arc<Inner>,
    task_id: TaskId,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        lock(&self.inner.inflight).remove(&self.task_id);
    }
}

/// Coordinates the tiers of agents.
///
/// Cheap to clone; clones share the same swarm.
#[derive(Clone)]
pub struct HierarchyOrchestrator {
    inner: Arc<Inner>,
}

impl HierarchyOrchestrator {
    pub fn new(ctx: SwarmContext, config: &SwarmConfig) -> Self {
        let router = ModelRouter::with_config(ctx.registry.clone(), config.router.clone());
        let runtime = Arc::new(AgentRuntime::new(Arc::new(router), ctx.pool.clone()));
        let audit_capacity = config.orchestrator.audit_capacity;

        Self {
            inner: Arc::new(Inner {
                ctx,
                consensus: config.consensus.clone(),
                settings: config.orchestrator.clone(),
                runtime,
                rebirth: RebirthManager::with_capacity(config.rebirth.clone(), audit_capacity),
                agents: AgentTable::with_log_capacity(audit_capacity),
                workers: Mutex::new(HashMap::new()),
                heartbeats: Arc::new(HeartbeatBoard::new()),
                archive: ConsensusArchive::new(),
                transitions: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashSet::new()),
                escalations: Mutex::new(VecDeque::new()),
                closing: CancellationToken::new(),
            }),
        }
    }

    pub fn context(&self) -> &SwarmContext {
        &self.inner.ctx
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.inner.ctx.registry
    }

    pub fn router(&self) -> &ModelRouter {
        self.inner.runtime.router()
    }

    pub fn archive(&self) -> &ConsensusArchive {
        &self.inner.archive
    }

    // -- backends ----------------------------------------------------------

    /// Register a backend and attach the client that serves it
    pub fn register_backend(&self, descriptor: BackendDescriptor, client: Arc<dyn ModelBackend>) {
        let backend_id = descriptor.id.clone();
        self.inner.ctx.pool.insert(backend_id.clone(), client);
        if self.inner.ctx.registry.register(descriptor).is_some() {
            debug!(%backend_id, "Backend descriptor replaced");
        }
        self.inner.emit(SwarmEvent::BackendRegistered {
            backend_id,
            timestamp: Utc::now(),
        });
    }

    pub fn deregister_backend(&self, backend_id: &str) -> Result<BackendDescriptor, SwarmError> {
        let descriptor = self.inner.ctx.registry.deregister(backend_id)?;
        self.inner.ctx.pool.remove(backend_id);
        self.inner.emit(SwarmEvent::BackendDeregistered {
            backend_id: backend_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(descriptor)
    }

    // -- agents ------------------------------------------------------------

    /// Create `count` agents in `tier`, each with its own worker
    pub fn init_tier(&self, tier: Tier, count: usize) -> Vec<AgentId> {
        let ids: Vec<AgentId> = (0..count).map(|_| self.add_agent(tier)).collect();
        info!(%tier, count, "Tier initialised");
        ids
    }

    /// Create one idle agent in `tier`
    pub fn add_agent(&self, tier: Tier) -> AgentId {
        let agent_id = loop {
            let candidate = self.inner.agents.next_id(tier);
            if self.inner.agents.insert(AgentInstance::new(candidate.clone(), tier)) {
                break candidate;
            }
        };
        self.inner.spawn_worker(&agent_id);
        debug!(%agent_id, %tier, "Agent created");
        agent_id
    }

    /// Stop every worker and destroy every agent instance
    pub fn shutdown(&self) {
        self.inner.closing.cancel();
        self.inner.runtime.shutdown();
        let workers: Vec<(AgentId, WorkerHandle)> = lock(&self.inner.workers).drain().collect();
        for (agent_id, worker) in workers {
            worker.abort();
            self.inner.heartbeats.forget(&agent_id);
        }
        let destroyed = self.inner.agents.clear();
        info!(destroyed, "Swarm shut down");
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentInstance> {
        self.inner.agents.get(agent_id)
    }

    pub fn agents(&self, tier: Tier) -> Vec<AgentInstance> {
        self.inner.agents.in_tier(tier)
    }

    pub fn agent_transitions(&self, agent_id: &str) -> Vec<AgentTransition> {
        self.inner.agents.transitions_of(agent_id)
    }

    pub fn tier_summary(&self) -> Vec<TierSummary> {
        Tier::all()
            .iter()
            .map(|&tier| {
                let mut summary = TierSummary {
                    tier: Some(tier),
                    ..TierSummary::default()
                };
                for agent in self.inner.agents.in_tier(tier) {
                    summary.total += 1;
                    if agent.retired {
                        summary.retired += 1;
                        continue;
                    }
                    match agent.state {
                        AgentState::Idle => summary.idle += 1,
                        AgentState::Running => summary.running += 1,
                        AgentState::Failed => summary.failed += 1,
                        AgentState::Reborn => summary.reborn += 1,
                    }
                }
                summary
            })
            .collect()
    }

    /// Fail every running agent whose worker has been silent past the
    /// heartbeat timeout; returns the agents sent to rebirth
    pub fn reap_stalled(&self) -> Vec<AgentId> {
        let mut reaped = Vec::new();
        for (agent_id, tier, task_id) in self.inner.agents.running() {
            let Some(silent) = self.inner.heartbeats.silent_for(&agent_id) else {
                continue;
            };
            if !self.inner.rebirth.stalled(silent) {
                continue;
            }

            warn!(%agent_id, %tier, silent_ms = silent.as_millis() as u64, "Agent stalled");
            self.inner.rebirth.record_stall(&agent_id, tier, silent);
            self.inner.emit(SwarmEvent::AgentStalled {
                agent_id: agent_id.clone(),
                silent_ms: silent.as_millis() as u64,
                timestamp: Utc::now(),
            });

            if let FailureSettlement::Failed { tier, rebirths } =
                self.inner.agents.settle_failure(&agent_id, None, |_| true)
            {
                self.inner.emit(SwarmEvent::AgentFailed {
                    agent_id: agent_id.clone(),
                    task_id,
                    kind: ErrorKind::Timeout,
                    detail: format!("no heartbeat for {}ms", silent.as_millis()),
                    timestamp: Utc::now(),
                });
                self.inner.begin_rebirth(&agent_id, tier, rebirths);
                reaped.push(agent_id);
            }
        }
        reaped
    }

    /// Forget finished tasks whose terminal record is older than the
    /// retention window; returns how many were dropped.
    ///
    /// A forgotten task id may be submitted again.
    pub fn prune_expired(&self) -> usize {
        let now = Utc::now();
        self.inner.archive.archive_before(now);
        let cutoff = chrono::Duration::from_std(self.inner.settings.retention())
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let pruned = self.inner.archive.prune_before(cutoff);
        if !pruned.is_empty() {
            let mut transitions = lock(&self.inner.transitions);
            for task_id in &pruned {
                transitions.remove(task_id);
            }
        }
        pruned.len()
    }

    /// Run [`reap_stalled`](Self::reap_stalled) and
    /// [`prune_expired`](Self::prune_expired) every watchdog interval until
    /// shutdown
    pub fn spawn_watchdog(&self) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let closing = self.inner.closing.clone();
        let period = self
            .inner
            .settings
            .watchdog_interval()
            .max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = closing.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = orchestrator.reap_stalled();
                        if !reaped.is_empty() {
                            info!(count = reaped.len(), "Watchdog reaped stalled agents");
                        }
                        let pruned = orchestrator.prune_expired();
                        if pruned > 0 {
                            debug!(count = pruned, "Expired tasks pruned");
                        }
                    }
                }
            }
        })
    }

    // -- tasks -------------------------------------------------------------

    /// Drive `task` to a decision or a typed failure.
    ///
    /// The task runs on its own tokio task. Dropping the returned future
    /// only stops waiting for it: the claimed agents are still settled and
    /// the task still gets its terminal record.
    pub async fn submit(&self, task: Task) -> Result<Decision, TaskFailure> {
        let task = Arc::new(task);
        {
            let mut inflight = lock(&self.inner.inflight);
            if self.inner.archive.contains(&task.id) || !inflight.insert(task.id.clone()) {
                warn!(task_id = %task.id, "Duplicate task rejected");
                return Err(TaskFailure::new(ErrorKind::DuplicateTask, task.id.clone()));
            }
        }
        let inflight = InflightGuard {
            inner: Arc::clone(&self.inner),
            task_id: task.id.clone(),
        };
        let task_id = task.id.clone();
        let inner = Arc::clone(&self.inner);

        let driven = tokio::spawn(async move {
            let _inflight = inflight;
            let mut machine = TaskStateMachine::new(task.id.clone(), task.dispatch.tier());
            let result = inner.drive(&task, &mut machine).await;
            inner.keep_transitions(&task.id, machine.into_transitions());
            result
        });

        match driven.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => {
                warn!(%task_id, error = %err, "Task driver stopped");
                Err(TaskFailure::new(ErrorKind::BackendError, task_id))
            }
        }
    }

    pub fn task_transitions(&self, task_id: &str) -> Vec<TransitionRecord> {
        lock(&self.inner.transitions)
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn consensus_records(&self, task_id: &str) -> Vec<ConsensusRecord> {
        self.inner.archive.records(task_id)
    }

    pub fn escalations(&self) -> Vec<EscalationNotice> {
        lock(&self.inner.escalations).iter().cloned().collect()
    }

    pub fn lifecycle(&self) -> Vec<LifecycleEntry> {
        self.inner.rebirth.lifecycle()
    }
}

impl Inner {
    fn emit(&self, event: SwarmEvent) {
        self.ctx.events.emit(event);
    }

    fn spawn_worker(&self, agent_id: &str) {
        let handle = AgentWorker::spawn(
            agent_id,
            Arc::clone(&self.runtime),
            Arc::clone(&self.heartbeats),
            self.settings.heartbeat_interval(),
        );
        if let Some(old) = lock(&self.workers).insert(agent_id.to_string(), handle) {
            old.abort();
        }
    }

    /// Keep a finished task's transitions while its records are retained
    fn keep_transitions(&self, task_id: &str, records: Vec<TransitionRecord>) {
        let mut transitions = lock(&self.transitions);
        if self.archive.contains(task_id) {
            transitions.insert(task_id.to_string(), records);
        }
    }

    fn stop_worker(&self, agent_id: &str) {
        let worker = lock(&self.workers).remove(agent_id);
        if let Some(worker) = worker {
            worker.abort();
        }
        self.heartbeats.forget(agent_id);
    }

    async fn drive(
        self: &Arc<Self>,
        task: &Arc<Task>,
        machine: &mut TaskStateMachine,
    ) -> Result<Decision, TaskFailure> {
        let consensus = task.dispatch.is_consensus();
        let (mut strategy, mut quorum) = match &task.dispatch {
            DispatchMode::Single { .. } => (ConsensusStrategy::Majority, 1),
            DispatchMode::Consensus {
                strategy,
                min_quorum,
                ..
            } => (
                strategy.clone().unwrap_or_else(|| self.consensus.strategy.clone()),
                min_quorum.unwrap_or(self.consensus.min_quorum).max(1),
            ),
        };
        let mut chain: Vec<CausalLink> = Vec::new();
        let mut redispatches = 0u32;

        info!(task_id = %task.id, tier = %machine.tier(), consensus, "Task submitted");

        if let Err(err) = self.runtime.router().route(task) {
            chain.push(CausalLink {
                tier: machine.tier(),
                attempt: machine.attempt(),
                kind: err.kind(),
                agent_id: None,
                detail: err.to_string(),
            });
            let record = ConsensusRecord::new(
                task.id.clone(),
                machine.tier(),
                machine.attempt(),
                strategy,
                quorum,
                0,
            );
            return Err(self.fail_task(machine, record, err.kind(), chain));
        }

        loop {
            let tier = machine.tier();
            let attempt = machine.attempt();
            let need = if consensus { quorum } else { 1 };
            let claimed = self
                .agents
                .claim_idle(tier, &task.id, (!consensus).then_some(1));
            let mut record = ConsensusRecord::new(
                task.id.clone(),
                tier,
                attempt,
                strategy.clone(),
                quorum,
                claimed.len(),
            );

            let round = if claimed.len() < need {
                for agent_id in &claimed {
                    self.agents.release(agent_id, &task.id);
                }
                debug!(task_id = %task.id, %tier, idle = claimed.len(), need, "Not enough idle agents");
                Err(RoundFailure {
                    kind: ErrorKind::NoQuorum,
                    links: vec![CausalLink {
                        tier,
                        attempt,
                        kind: ErrorKind::NoQuorum,
                        agent_id: None,
                        detail: format!("{} idle agents, need {}", claimed.len(), need),
                    }],
                })
            } else {
                guard(machine.advance(TaskState::AwaitingResults, None));
                self.emit(SwarmEvent::TaskDispatched {
                    task_id: task.id.clone(),
                    tier,
                    attempt,
                    agents: claimed.clone(),
                    timestamp: Utc::now(),
                });
                self.run_round(task, &claimed, &mut record).await
            };

            let failure = match round {
                Ok(decision) => {
                    let reason = decision.strategy.to_string();
                    guard(machine.advance(TaskState::Resolved, Some(reason.as_str())));
                    info!(
                        task_id = %task.id,
                        %tier,
                        support = decision.support,
                        total = decision.total,
                        "Task resolved"
                    );
                    self.emit(SwarmEvent::ConsensusResolved {
                        task_id: task.id.clone(),
                        tier,
                        strategy: decision.strategy.clone(),
                        value_preview: preview(&decision.value, PREVIEW_CHARS),
                        support: decision.support,
                        total: decision.total,
                        timestamp: Utc::now(),
                    });
                    record.close(ConsensusOutcome::Resolved(decision.clone()));
                    self.archive.store(record);
                    return Ok(decision);
                }
                Err(failure) => failure,
            };

            let kind = failure.kind;
            chain.extend(failure.links);

            if kind == ErrorKind::NoRouteAvailable {
                return Err(self.fail_task(machine, record, kind, chain));
            }

            let retryable = matches!(kind, ErrorKind::Timeout | ErrorKind::BackendError);
            if !consensus && retryable && redispatches < self.settings.max_redispatch {
                redispatches += 1;
                debug!(task_id = %task.id, %tier, redispatches, %kind, "Re-dispatching within tier");
                record.close(ConsensusOutcome::Redispatched { kind });
                self.archive.store(record);
                guard(machine.redispatch(tier, &format!("redispatch after {}", kind)));
                continue;
            }

            let Some(parent) = tier.parent() else {
                return Err(self.fail_task(machine, record, kind, chain));
            };

            let reason = kind.to_string();
            guard(machine.advance(TaskState::Escalated, Some(reason.as_str())));
            record.close(ConsensusOutcome::Escalated { kind });
            self.archive.store(record);
            if consensus {
                quorum = self.consensus.relax(quorum);
                strategy = self.consensus.relax_strategy(&strategy);
            }
            warn!(task_id = %task.id, from = %tier, to = %parent, %kind, min_quorum = quorum, "Task escalated");
            self.emit(SwarmEvent::TaskEscalated {
                task_id: task.id.clone(),
                from: tier,
                to: parent,
                reason: kind,
                min_quorum: quorum,
                timestamp: Utc::now(),
            });
            guard(machine.redispatch(parent, "escalated"));
            redispatches = 0;
        }
    }

    /// Fan `task` out to `claimed` and collect replies in arrival order
    /// until all are in, a first quorum resolves, or the round times out
    async fn run_round(
        self: &Arc<Self>,
        task: &Arc<Task>,
        claimed: &[AgentId],
        record: &mut ConsensusRecord,
    ) -> Result<Decision, RoundFailure> {
        let limit = Instant::now() + self.settings.round_timeout();
        let early = matches!(record.strategy, ConsensusStrategy::FirstQuorum { .. });
        let mut links: Vec<CausalLink> = Vec::new();
        let mut no_route = false;
        let mut outstanding: BTreeSet<AgentId> = BTreeSet::new();
        let mut pending = FuturesUnordered::new();

        for agent_id in claimed {
            let submitted = lock(&self.workers)
                .get(agent_id)
                .map(|worker| worker.submit(Arc::clone(task), Some(limit)));
            let receiver: Option<oneshot::Receiver<RunOutcome>> = match submitted {
                Some(Ok(receiver)) => Some(receiver),
                Some(Err(err)) => {
                    warn!(%agent_id, error = %err, "Work order rejected");
                    None
                }
                None => None,
            };
            match receiver {
                Some(receiver) => {
                    outstanding.insert(agent_id.clone());
                    let agent_id = agent_id.clone();
                    pending.push(async move { (agent_id, receiver.await) });
                }
                None => {
                    let failure = worker_lost(agent_id, task);
                    let outcome = self.settle(task, agent_id, Err(failure));
                    self.apply(record, &mut links, &mut no_route, outcome);
                }
            }
        }

        let mut timed_out = false;
        while !outstanding.is_empty() {
            match tokio::time::timeout_at(limit, pending.next()).await {
                Ok(Some((agent_id, reply))) => {
                    outstanding.remove(&agent_id);
                    let outcome = reply.unwrap_or_else(|_| Err(worker_lost(&agent_id, task)));
                    let outcome = self.settle(task, &agent_id, outcome);
                    self.apply(record, &mut links, &mut no_route, outcome);
                    if early && record.resolve().is_ok() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            for agent_id in &outstanding {
                let detail = "no reply within round timeout".to_string();
                record.record_failure(agent_id.clone(), ErrorKind::Timeout, detail.clone());
                links.push(CausalLink {
                    tier: record.tier,
                    attempt: record.attempt,
                    kind: ErrorKind::Timeout,
                    agent_id: Some(agent_id.clone()),
                    detail,
                });
            }
        }

        if !pending.is_empty() {
            let inner = Arc::clone(self);
            let task = Arc::clone(task);
            tokio::spawn(async move {
                while let Some((agent_id, reply)) = pending.next().await {
                    let outcome = reply.unwrap_or_else(|_| Err(worker_lost(&agent_id, &task)));
                    inner.settle(&task, &agent_id, outcome);
                }
            });
        }

        if no_route {
            return Err(RoundFailure {
                kind: ErrorKind::NoRouteAvailable,
                links,
            });
        }

        match record.resolve() {
            Ok(decision) => Ok(decision),
            Err(ConsensusError::NoQuorum { got, need, .. }) => {
                let kind = if task.dispatch.is_consensus() {
                    links.push(CausalLink {
                        tier: record.tier,
                        attempt: record.attempt,
                        kind: ErrorKind::NoQuorum,
                        agent_id: None,
                        detail: format!("got {}, need {}", got, need),
                    });
                    ErrorKind::NoQuorum
                } else {
                    links.last().map(|l| l.kind).unwrap_or(ErrorKind::NoQuorum)
                };
                Err(RoundFailure { kind, links })
            }
        }
    }

    /// Fold a settled outcome into the round's record and causal chain
    fn apply(
        &self,
        record: &mut ConsensusRecord,
        links: &mut Vec<CausalLink>,
        no_route: &mut bool,
        outcome: RunOutcome,
    ) {
        match outcome {
            Ok(output) => {
                record.record_response(
                    output.agent_id,
                    output.backend_id,
                    output.value,
                    output.confidence,
                );
            }
            Err(failure) => {
                *no_route |= failure.kind == ErrorKind::NoRouteAvailable;
                record.record_failure(failure.agent_id.clone(), failure.kind, failure.detail.clone());
                links.push(CausalLink {
                    tier: record.tier,
                    attempt: record.attempt,
                    kind: failure.kind,
                    agent_id: Some(failure.agent_id),
                    detail: failure.detail,
                });
            }
        }
    }

    /// Return the agent to the pool or hand it to the rebirth path
    fn settle(self: &Arc<Self>, task: &Task, agent_id: &str, outcome: RunOutcome) -> RunOutcome {
        match &outcome {
            Ok(output) => {
                self.agents.release(agent_id, &task.id);
                self.emit(result_event(output));
            }
            Err(failure) if failure.kind == ErrorKind::NoRouteAvailable => {
                // Nothing wrong with the agent; the registry changed under it
                self.agents.release(agent_id, &task.id);
            }
            Err(failure) => self.on_agent_failure(agent_id, &task.id, failure),
        }
        outcome
    }

    fn on_agent_failure(self: &Arc<Self>, agent_id: &str, task_id: &str, failure: &AgentFailure) {
        let settlement = self
            .agents
            .settle_failure(agent_id, Some(task_id), |n| self.rebirth.should_trigger(n));
        let tier = match &settlement {
            FailureSettlement::Stale => return,
            FailureSettlement::Released => match self.agents.get(agent_id) {
                Some(agent) => agent.tier,
                None => return,
            },
            FailureSettlement::Failed { tier, .. } => *tier,
        };

        self.rebirth.record_failure(agent_id, tier, failure.kind);
        self.emit(SwarmEvent::AgentFailed {
            agent_id: agent_id.to_string(),
            task_id: Some(task_id.to_string()),
            kind: failure.kind,
            detail: failure.detail.clone(),
            timestamp: Utc::now(),
        });

        if let FailureSettlement::Failed { tier, rebirths } = settlement {
            self.begin_rebirth(agent_id, tier, rebirths);
        }
    }

    /// Carry out the rebirth decision for an agent that just entered Failed
    fn begin_rebirth(self: &Arc<Self>, agent_id: &str, tier: Tier, rebirths: u32) {
        match self.rebirth.on_failed(agent_id, tier, rebirths) {
            RebirthDecision::Reprovision { attempt, delay } => {
                self.stop_worker(agent_id);
                let inner = Arc::clone(self);
                let agent_id = agent_id.to_string();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = inner.closing.cancelled() => {}
                        _ = tokio::time::sleep(delay) => inner.complete_rebirth(&agent_id, tier, attempt, delay),
                    }
                });
            }
            RebirthDecision::Exhausted { attempts } => self.retire(agent_id, tier, attempts),
        }
    }

    fn complete_rebirth(&self, agent_id: &str, tier: Tier, attempt: u32, delay: Duration) {
        if let Err(err) = self.agents.mark_reborn(agent_id) {
            debug!(%agent_id, error = %err, "Rebirth abandoned");
            return;
        }
        self.spawn_worker(agent_id);
        self.rebirth.record_reborn(agent_id, tier, attempt);
        self.emit(SwarmEvent::AgentReborn {
            agent_id: agent_id.to_string(),
            tier,
            attempt,
            delay_ms: delay.as_millis() as u64,
            timestamp: Utc::now(),
        });
        if let Err(err) = self.agents.mark_ready(agent_id) {
            warn!(%agent_id, error = %err, "Reborn agent could not return to idle");
        }
    }

    fn retire(&self, agent_id: &str, tier: Tier, attempts: u32) {
        match self.agents.retire(agent_id) {
            Ok(true) => {
                let parent = tier.parent();
                warn!(%agent_id, %tier, ?parent, attempts, "Agent retired, escalating");
                let mut escalations = lock(&self.escalations);
                if escalations.len() >= self.settings.audit_capacity.max(1) {
                    escalations.pop_front();
                }
                escalations.push_back(EscalationNotice {
                    agent_id: agent_id.to_string(),
                    tier,
                    parent,
                    attempts,
                    at: Utc::now(),
                });
                drop(escalations);
                self.emit(SwarmEvent::RebirthExhausted {
                    agent_id: agent_id.to_string(),
                    tier,
                    parent,
                    attempts,
                    timestamp: Utc::now(),
                });
            }
            Ok(false) => {}
            Err(err) => warn!(%agent_id, error = %err, "Retirement rejected"),
        }
        self.stop_worker(agent_id);
    }

    fn fail_task(
        &self,
        machine: &mut TaskStateMachine,
        mut record: ConsensusRecord,
        kind: ErrorKind,
        chain: Vec<CausalLink>,
    ) -> TaskFailure {
        guard(machine.fail(&kind.to_string()));
        record.close(ConsensusOutcome::Failed { kind });
        let task_id = record.task_id.clone();
        self.archive.store(record);
        warn!(%task_id, %kind, chain_len = chain.len(), "Task failed");
        self.emit(SwarmEvent::TaskFailed {
            task_id: task_id.clone(),
            kind,
            chain_len: chain.len(),
            timestamp: Utc::now(),
        });
        TaskFailure::new(kind, task_id).with_chain(chain)
    }
}

fn worker_lost(agent_id: &str, task: &Task) -> AgentFailure {
    AgentFailure {
        agent_id: agent_id.to_string(),
        task_id: task.id.clone(),
        backend_id: None,
        kind: ErrorKind::BackendError,
        detail: "worker stopped before replying".to_string(),
        elapsed: Duration::ZERO,
    }
}

fn result_event(output: &AgentOutput) -> SwarmEvent {
    SwarmEvent::ResultReceived {
        task_id: output.task_id.clone(),
        agent_id: output.agent_id.clone(),
        backend_id: output.backend_id.clone(),
        confidence: output.confidence,
        latency_ms: output.latency.as_millis() as u64,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::registry::{BackendCost, BackendRegistry};
    use crate::runtime::testing::{ScriptStep, ScriptedBackend};
    use crate::runtime::BackendPool;
    use crate::state::{Capability, TaskPayload};

    fn swarm(client: ScriptedBackend, config: SwarmConfig) -> (HierarchyOrchestrator, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let ctx = SwarmContext::new(
            BackendRegistry::new().shared(),
            BackendPool::new().shared(),
            sink.clone(),
        );
        let orchestrator = HierarchyOrchestrator::new(ctx, &config);
        orchestrator.register_backend(
            BackendDescriptor::new("zamba", [Capability::Text], BackendCost::new(50.0, 6.0)),
            Arc::new(client),
        );
        (orchestrator, sink)
    }

    fn fast_config() -> SwarmConfig {
        let mut config = SwarmConfig::default();
        config.rebirth.backoff_base_ms = 10;
        config.rebirth.backoff_cap_ms = 100;
        config.orchestrator.round_timeout_ms = 1_000;
        config.orchestrator.heartbeat_interval_ms = 10;
        config
    }

    fn text(body: &str) -> TaskPayload {
        TaskPayload::new(body).requires(Capability::Text)
    }

    #[tokio::test]
    async fn test_single_dispatch_resolves() {
        let (orchestrator, sink) = swarm(ScriptedBackend::new("42", 0.8), fast_config());
        orchestrator.init_tier(Tier::Neuronal, 2);

        let decision = orchestrator
            .submit(Task::new(text("answer"), Tier::Neuronal).with_id("t-1"))
            .await
            .unwrap();
        assert_eq!(decision.value, "42");
        assert_eq!(decision.supporters, vec!["neuronal-01"]);
        assert_eq!(decision.backends, vec!["zamba"]);

        let states: Vec<TaskState> = orchestrator
            .task_transitions("t-1")
            .iter()
            .map(|t| t.to)
            .collect();
        assert_eq!(states, vec![TaskState::AwaitingResults, TaskState::Resolved]);
        assert_eq!(orchestrator.agent("neuronal-01").unwrap().state, AgentState::Idle);
        assert_eq!(sink.of_type("consensus_resolved").len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_task_rejected() {
        let (orchestrator, _) = swarm(ScriptedBackend::new("ok", 0.8), fast_config());
        orchestrator.init_tier(Tier::Neuronal, 1);

        let task = Task::new(text("once"), Tier::Neuronal).with_id("dup");
        orchestrator.submit(task.clone()).await.unwrap();
        let err = orchestrator.submit(task).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateTask);
        assert_eq!(orchestrator.consensus_records("dup").len(), 1);
    }

    #[tokio::test]
    async fn test_no_route_fails_without_dispatch() {
        let (orchestrator, sink) = swarm(ScriptedBackend::new("ok", 0.8), fast_config());
        orchestrator.init_tier(Tier::Neuronal, 1);

        let task = Task::new(TaskPayload::new("look").requires(Capability::Vision), Tier::Neuronal)
            .with_id("img");
        let err = orchestrator.submit(task).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoRouteAvailable);
        assert_eq!(err.chain.len(), 1);
        assert!(sink.of_type("task_dispatched").is_empty());

        let terminal = orchestrator.archive().terminal("img").unwrap();
        assert_eq!(terminal.fan_out, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redispatch_then_success() {
        let client = ScriptedBackend::new("fine", 0.7).with_script([ScriptStep::Fail("boom".into())]);
        let (orchestrator, _) = swarm(client, fast_config());
        orchestrator.init_tier(Tier::Neuronal, 2);

        let decision = orchestrator
            .submit(Task::new(text("retry"), Tier::Neuronal).with_id("t-r"))
            .await
            .unwrap();
        assert_eq!(decision.supporters, vec!["neuronal-02"]);

        let outcomes: Vec<ConsensusOutcome> = orchestrator
            .consensus_records("t-r")
            .iter()
            .map(|r| r.outcome().clone())
            .collect();
        assert_eq!(
            outcomes[0],
            ConsensusOutcome::Redispatched {
                kind: ErrorKind::BackendError
            }
        );
        assert!(matches!(outcomes[1], ConsensusOutcome::Resolved(_)));
    }

    #[tokio::test]
    async fn test_empty_tier_escalates() {
        let (orchestrator, sink) = swarm(ScriptedBackend::new("up", 0.6), fast_config());
        orchestrator.init_tier(Tier::Swarm, 1);

        let decision = orchestrator
            .submit(Task::new(text("climb"), Tier::Neuronal).with_id("t-e"))
            .await
            .unwrap();
        assert_eq!(decision.supporters, vec!["swarm-01"]);
        assert_eq!(sink.of_type("task_escalated").len(), 1);
        let records = orchestrator.consensus_records("t-e");
        assert_eq!(records.len(), 2);
        assert_eq!(records.iter().filter(|r| r.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_tier_summary_and_shutdown() {
        let (orchestrator, _) = swarm(ScriptedBackend::new("x", 0.5), fast_config());
        orchestrator.init_tier(Tier::Neuronal, 3);
        orchestrator.init_tier(Tier::Cognitive, 1);

        let summary = orchestrator.tier_summary();
        assert_eq!(summary[0].tier, Some(Tier::Neuronal));
        assert_eq!(summary[0].idle, 3);
        assert_eq!(summary[1].total, 0);
        assert_eq!(summary[2].total, 1);

        orchestrator.shutdown();
        assert!(orchestrator.agents(Tier::Neuronal).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_agent_is_reaped() {
        let mut config = fast_config();
        config.rebirth.heartbeat_timeout_ms = 100;
        let (orchestrator, sink) = swarm(ScriptedBackend::new("x", 0.5), config);
        orchestrator.init_tier(Tier::Neuronal, 1);

        // Simulate a wedged worker: claimed for a task but no longer beating
        orchestrator.inner.agents.claim_idle(Tier::Neuronal, "t-s", Some(1));
        orchestrator.inner.stop_worker("neuronal-01");
        orchestrator.inner.heartbeats.beat("neuronal-01");
        tokio::time::advance(Duration::from_millis(150)).await;

        assert_eq!(orchestrator.reap_stalled(), vec!["neuronal-01"]);
        assert_eq!(sink.of_type("agent_stalled").len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let agent = orchestrator.agent("neuronal-01").unwrap();
        assert_eq!(agent.state, AgentState::Idle);
        assert_eq!(agent.rebirths, 1);
    }
}
