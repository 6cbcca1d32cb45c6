//! Model Router Module
//!
//! Picks one backend for a task from the registry. Routing is a pure read:
//! it never mutates registry state, so the same registry snapshot and the
//! same task always yield the same backend.
//!
//! # Selection
//!
//! ```text
//! 1. filter   capabilities ⊇ required, health != unavailable, vram <= ceiling
//! 2. rank     meets deadline      (late backends last)
//!             latency bucket      (bucket width = tolerance / priority weight)
//!             VRAM headroom       (more headroom first)
//!             recency             (most recent success first)
//!             backend id          (stable tie-break)
//! ```
//!
//! Higher priority narrows the latency bucket, so a critical task separates
//! backends by speed before cost, while a low-priority task lets cost decide
//! among backends of similar speed.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SwarmError;
use crate::registry::{BackendDescriptor, BackendHealth, Candidate, SharedRegistry};
use crate::state::Task;

/// Router tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Backends with a larger VRAM footprint are never chosen
    pub vram_ceiling_gb: f64,
    /// Latency difference treated as equivalent at normal priority
    pub latency_tolerance_ms: f64,
    /// Throughput multiplier applied to degraded backends
    pub degraded_throughput_factor: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            vram_ceiling_gb: 24.0,
            latency_tolerance_ms: 250.0,
            degraded_throughput_factor: 0.5,
        }
    }
}

/// A routable backend with the figures it was ranked by
#[derive(Debug, Clone, PartialEq)]
pub struct RankedBackend {
    pub descriptor: BackendDescriptor,
    pub estimated_latency_ms: f64,
    pub meets_deadline: bool,
    pub headroom_gb: f64,
    pub last_success: Option<u64>,
    latency_bucket: u64,
}

/// Chooses a backend per task from the shared registry
pub struct ModelRouter {
    registry: SharedRegistry,
    config: RouterConfig,
}

impl ModelRouter {
    pub fn new(registry: SharedRegistry) -> Self {
        Self::with_config(registry, RouterConfig::default())
    }

    pub fn with_config(registry: SharedRegistry, config: RouterConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Pick the best backend for `task`
    pub fn route(&self, task: &Task) -> Result<BackendDescriptor, SwarmError> {
        let ranked = self.rank(task);
        match ranked.into_iter().next() {
            Some(best) => {
                debug!(
                    task_id = %task.id,
                    backend_id = %best.descriptor.id,
                    latency_ms = best.estimated_latency_ms,
                    headroom_gb = best.headroom_gb,
                    "Task routed"
                );
                Ok(best.descriptor)
            }
            None => Err(SwarmError::NoRouteAvailable {
                task_id: task.id.clone(),
                required: task.required().iter().copied().collect(),
            }),
        }
    }

    /// Every routable backend for `task`, best first
    pub fn rank(&self, task: &Task) -> Vec<RankedBackend> {
        let mut ranked: Vec<RankedBackend> = self
            .registry
            .candidates(task.required())
            .into_iter()
            .filter(|c| c.descriptor.is_routable())
            .filter(|c| c.descriptor.cost.vram_gb <= self.config.vram_ceiling_gb)
            .map(|c| self.score(task, c))
            .collect();
        ranked.sort_by(compare_ranked);
        ranked
    }

    fn score(&self, task: &Task, candidate: Candidate) -> RankedBackend {
        let latency = self.estimate_latency_ms(task, &candidate.descriptor);
        let meets_deadline = task
            .deadline
            .map_or(true, |d| latency <= d.as_secs_f64() * 1000.0);
        let bucket_width =
            (self.config.latency_tolerance_ms / task.priority.weight()).max(f64::EPSILON);
        let latency_bucket = if latency.is_finite() {
            (latency / bucket_width).floor() as u64
        } else {
            u64::MAX
        };

        RankedBackend {
            headroom_gb: self.config.vram_ceiling_gb - candidate.descriptor.cost.vram_gb,
            estimated_latency_ms: latency,
            meets_deadline,
            last_success: candidate.last_success,
            latency_bucket,
            descriptor: candidate.descriptor,
        }
    }

    /// Time to generate the task's token budget on this backend
    pub fn estimate_latency_ms(&self, task: &Task, backend: &BackendDescriptor) -> f64 {
        let mut throughput = backend.cost.tokens_per_sec;
        if backend.health == BackendHealth::Degraded {
            throughput *= self.config.degraded_throughput_factor;
        }
        if throughput <= 0.0 {
            return f64::INFINITY;
        }
        f64::from(task.payload.max_tokens) / throughput * 1000.0
    }
}

fn compare_ranked(a: &RankedBackend, b: &RankedBackend) -> Ordering {
    b.meets_deadline
        .cmp(&a.meets_deadline)
        .then_with(|| a.latency_bucket.cmp(&b.latency_bucket))
        .then_with(|| b.headroom_gb.total_cmp(&a.headroom_gb))
        .then_with(|| match (a.last_success, b.last_success) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.descriptor.id.cmp(&b.descriptor.id))
}
