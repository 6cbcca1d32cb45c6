//! Rebirth Manager
//!
//! Decides what happens to an agent after it fails: re-provision it after
//! an exponential, jittered backoff, or retire it for good once it has used
//! up its attempts. The orchestrator carries the decisions out; this module
//! owns the policy and the lifecycle log.
//!
//! ```text
//! failure ─▶ failures_since_rebirth >= threshold ? ─no─▶ Idle
//!                          │ yes
//!                          ▼
//!            attempt = rebirths + 1
//!            attempt <  max_attempts ─▶ Reprovision { attempt, backoff(attempt) }
//!            attempt >= max_attempts ─▶ Exhausted (retired, parent tier notified)
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::state::{AgentId, Tier};

/// Recovery policy shared by every agent of the swarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebirthPolicy {
    /// Failures since the last rebirth that trigger a rebirth
    pub failure_threshold: u32,
    /// Silence after which an agent counts as stalled
    pub heartbeat_timeout_ms: u64,
    /// First backoff delay
    pub backoff_base_ms: u64,
    /// Upper bound on any backoff delay
    pub backoff_cap_ms: u64,
    /// Fraction of the delay that may be shaved off at random, 0.0..=1.0
    pub jitter: f64,
    /// Rebirth attempts before the agent is retired
    pub max_attempts: u32,
}

impl Default for RebirthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            heartbeat_timeout_ms: 30_000,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            jitter: 0.2,
            max_attempts: 3,
        }
    }
}

impl RebirthPolicy {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Backoff before rebirth `attempt` (1-indexed), for a jitter sample
    /// `u` in 0.0..1.0. Never exceeds the cap.
    pub fn delay_with(&self, attempt: u32, u: f64) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let raw = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms);
        let shave = self.jitter.clamp(0.0, 1.0) * u.clamp(0.0, 1.0);
        Duration::from_millis((raw as f64 * (1.0 - shave)).round() as u64)
    }
}

/// What to do with a failed agent
#[derive(Debug, Clone, PartialEq)]
pub enum RebirthDecision {
    /// Re-provision after `delay`
    Reprovision { attempt: u32, delay: Duration },
    /// Out of attempts; retire and escalate
    Exhausted { attempts: u32 },
}

/// Entry in the agent lifecycle log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Failed { kind: ErrorKind },
    RebirthScheduled { attempt: u32, delay_ms: u64 },
    Reborn { attempt: u32 },
    Exhausted { attempts: u32 },
    Stalled { silent_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEntry {
    pub agent_id: AgentId,
    pub tier: Tier,
    #[serde(flatten)]
    pub event: LifecycleEvent,
    pub at: DateTime<Utc>,
}

/// Applies the rebirth policy and keeps the lifecycle log
pub struct RebirthManager {
    policy: RebirthPolicy,
    log: Mutex<VecDeque<LifecycleEntry>>,
    capacity: usize,
}

/// Lifecycle entries kept when no capacity is given
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

impl RebirthManager {
    pub fn new(policy: RebirthPolicy) -> Self {
        Self::with_capacity(policy, DEFAULT_LOG_CAPACITY)
    }

    /// Keep at most `capacity` lifecycle entries, dropping the oldest
    pub fn with_capacity(policy: RebirthPolicy, capacity: usize) -> Self {
        Self {
            policy,
            log: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn policy(&self) -> &RebirthPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LifecycleEntry>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, agent_id: &str, tier: Tier, event: LifecycleEvent) {
        let mut log = self.lock();
        if log.len() == self.capacity {
            log.pop_front();
        }
        log.push_back(LifecycleEntry {
            agent_id: agent_id.to_string(),
            tier,
            event,
            at: Utc::now(),
        });
    }

    /// Whether this many failures since the last rebirth call for one
    pub fn should_trigger(&self, failures_since_rebirth: u32) -> bool {
        failures_since_rebirth >= self.policy.failure_threshold.max(1)
    }

    /// Whether an agent silent for this long is stalled
    pub fn stalled(&self, silent_for: Duration) -> bool {
        silent_for >= self.policy.heartbeat_timeout()
    }

    /// Jittered backoff before rebirth `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let u: f64 = rand::thread_rng().gen();
        self.policy.delay_with(attempt, u)
    }

    /// Record a run failure in the lifecycle log
    pub fn record_failure(&self, agent_id: &str, tier: Tier, kind: ErrorKind) {
        self.append(agent_id, tier, LifecycleEvent::Failed { kind });
    }

    /// Record that an agent missed its heartbeat window
    pub fn record_stall(&self, agent_id: &str, tier: Tier, silent_for: Duration) {
        self.append(
            agent_id,
            tier,
            LifecycleEvent::Stalled {
                silent_ms: silent_for.as_millis() as u64,
            },
        );
    }

    /// Decide the fate of an agent that has just entered `Failed` after
    /// `rebirths` previous rebirths
    pub fn on_failed(&self, agent_id: &str, tier: Tier, rebirths: u32) -> RebirthDecision {
        let attempt = rebirths + 1;
        if attempt >= self.policy.max_attempts {
            warn!(agent_id, %tier, attempts = attempt, "Rebirth attempts exhausted");
            self.append(agent_id, tier, LifecycleEvent::Exhausted { attempts: attempt });
            return RebirthDecision::Exhausted { attempts: attempt };
        }

        let delay = self.backoff(attempt);
        info!(agent_id, %tier, attempt, delay_ms = delay.as_millis() as u64, "Rebirth scheduled");
        self.append(
            agent_id,
            tier,
            LifecycleEvent::RebirthScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
            },
        );
        RebirthDecision::Reprovision { attempt, delay }
    }

    /// Record a completed rebirth
    pub fn record_reborn(&self, agent_id: &str, tier: Tier, attempt: u32) {
        info!(agent_id, %tier, attempt, "Agent reborn");
        self.append(agent_id, tier, LifecycleEvent::Reborn { attempt });
    }

    /// Full lifecycle log, oldest first
    pub fn lifecycle(&self) -> Vec<LifecycleEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Lifecycle log of one agent
    pub fn lifecycle_of(&self, agent_id: &str) -> Vec<LifecycleEntry> {
        self.lock()
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect()
    }
}

impl Default for RebirthManager {
    fn default() -> Self {
        Self::new(RebirthPolicy::default())
    }
}
