//! Backend Registry: capability, cost and health metadata for local model backends
//!
//! Tracks which inference backends are registered, what they can do
//! (capability tags, throughput, VRAM footprint) and their live health as
//! reported by the health prober. Read-mostly: lookups take a shared lock,
//! registration and health updates take the write lock, so a health update
//! is visible to the very next lookup.

mod stats;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::SwarmError;
use crate::state::{BackendId, Capability};

pub use stats::{BackendStats, PerformanceReport};

/// Family of model served by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// State-space model (Mamba/Zamba); the preferred efficient path
    #[default]
    MambaSsm,
    /// Conventional transformer, usually the fallback
    Transformer,
    /// Code-tuned model
    CodeSpecialist,
    /// Long-form reasoning model
    Reasoning,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::MambaSsm => write!(f, "mamba_ssm"),
            BackendKind::Transformer => write!(f, "transformer"),
            BackendKind::CodeSpecialist => write!(f, "code_specialist"),
            BackendKind::Reasoning => write!(f, "reasoning"),
        }
    }
}

/// Health of a backend as last observed by the prober
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    #[default]
    Healthy,
    /// Reachable but slow or flaky; still routable
    Degraded,
    /// Never routed to
    Unavailable,
}

impl fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendHealth::Healthy => write!(f, "healthy"),
            BackendHealth::Degraded => write!(f, "degraded"),
            BackendHealth::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Resource cost estimate for a backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackendCost {
    /// Approximate generation throughput
    pub tokens_per_sec: f64,
    /// Resident VRAM footprint in GB
    pub vram_gb: f64,
}

impl BackendCost {
    pub fn new(tokens_per_sec: f64, vram_gb: f64) -> Self {
        Self {
            tokens_per_sec,
            vram_gb,
        }
    }
}

/// A registered backend: identity, capabilities, cost and health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: BackendId,
    #[serde(default)]
    pub kind: BackendKind,
    /// Model name as the serving endpoint knows it
    #[serde(default)]
    pub model: String,
    /// Base URL of the serving endpoint, if it is remote
    #[serde(default)]
    pub endpoint: Option<String>,
    pub capabilities: BTreeSet<Capability>,
    pub cost: BackendCost,
    #[serde(default)]
    pub health: BackendHealth,
}

impl BackendDescriptor {
    pub fn new(
        id: impl Into<BackendId>,
        capabilities: impl IntoIterator<Item = Capability>,
        cost: BackendCost,
    ) -> Self {
        let id = id.into();
        Self {
            model: id.clone(),
            id,
            kind: BackendKind::default(),
            endpoint: None,
            capabilities: capabilities.into_iter().collect(),
            cost,
            health: BackendHealth::Healthy,
        }
    }

    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_health(mut self, health: BackendHealth) -> Self {
        self.health = health;
        self
    }

    /// Whether this backend offers every capability in `required`
    pub fn supports(&self, required: &BTreeSet<Capability>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Whether the router may pick this backend at all
    pub fn is_routable(&self) -> bool {
        self.health != BackendHealth::Unavailable
    }
}

/// Registry entry with usage bookkeeping the router reads for recency
#[derive(Debug, Clone)]
struct RegistryEntry {
    descriptor: BackendDescriptor,
    /// Sequence number of the last successful call, higher is more recent
    last_success: Option<u64>,
    registered_at: DateTime<Utc>,
    stats: BackendStats,
}

/// Snapshot of a matching backend handed to the router
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub descriptor: BackendDescriptor,
    pub last_success: Option<u64>,
}

/// Shared reference to a BackendRegistry
pub type SharedRegistry = Arc<BackendRegistry>;

/// Registry of all local inference backends
pub struct BackendRegistry {
    entries: RwLock<HashMap<BackendId, RegistryEntry>>,
    success_seq: AtomicU64,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            success_seq: AtomicU64::new(0),
        }
    }

    /// Create a registry pre-populated with the given descriptors
    pub fn with_backends(descriptors: impl IntoIterator<Item = BackendDescriptor>) -> Self {
        let registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor);
        }
        registry
    }

    /// Create a shared reference to this registry
    pub fn shared(self) -> SharedRegistry {
        Arc::new(self)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<BackendId, RegistryEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<BackendId, RegistryEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a backend, replacing any previous descriptor with the same id.
    ///
    /// Returns the replaced descriptor.
    pub fn register(&self, descriptor: BackendDescriptor) -> Option<BackendDescriptor> {
        let id = descriptor.id.clone();
        info!(
            backend_id = %id,
            kind = %descriptor.kind,
            health = %descriptor.health,
            "Backend registered"
        );
        let stats = BackendStats::new(id.clone(), descriptor.kind);
        self.write()
            .insert(
                id,
                RegistryEntry {
                    descriptor,
                    last_success: None,
                    registered_at: Utc::now(),
                    stats,
                },
            )
            .map(|previous| previous.descriptor)
    }

    /// Remove a backend from the registry
    pub fn deregister(&self, id: &str) -> Result<BackendDescriptor, SwarmError> {
        let removed = self
            .write()
            .remove(id)
            .ok_or_else(|| SwarmError::UnknownBackend(id.to_string()))?;
        info!(backend_id = %id, "Backend deregistered");
        Ok(removed.descriptor)
    }

    /// Backends offering every required capability, best cost-fit first.
    ///
    /// Cost-fit orders by smallest VRAM footprint, then highest throughput,
    /// then id. Health is not filtered here; the router does that.
    pub fn list(&self, required: &BTreeSet<Capability>) -> Vec<BackendDescriptor> {
        let mut matching: Vec<BackendDescriptor> = self
            .read()
            .values()
            .filter(|e| e.descriptor.supports(required))
            .map(|e| e.descriptor.clone())
            .collect();
        matching.sort_by(|a, b| {
            a.cost
                .vram_gb
                .total_cmp(&b.cost.vram_gb)
                .then_with(|| b.cost.tokens_per_sec.total_cmp(&a.cost.tokens_per_sec))
                .then_with(|| a.id.cmp(&b.id))
        });
        matching
    }

    /// Matching backends with their usage recency, in id order
    pub fn candidates(&self, required: &BTreeSet<Capability>) -> Vec<Candidate> {
        let mut matching: Vec<Candidate> = self
            .read()
            .values()
            .filter(|e| e.descriptor.supports(required))
            .map(|e| Candidate {
                descriptor: e.descriptor.clone(),
                last_success: e.last_success,
            })
            .collect();
        matching.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        matching
    }

    /// Get a backend descriptor by id
    pub fn get(&self, id: &str) -> Option<BackendDescriptor> {
        self.read().get(id).map(|e| e.descriptor.clone())
    }

    /// When the backend was registered
    pub fn registered_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.read().get(id).map(|e| e.registered_at)
    }

    /// Update health for a backend; returns the previous status
    pub fn update_health(
        &self,
        id: &str,
        health: BackendHealth,
    ) -> Result<BackendHealth, SwarmError> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| SwarmError::UnknownBackend(id.to_string()))?;
        let previous = entry.descriptor.health;
        entry.descriptor.health = health;
        if previous != health {
            info!(backend_id = %id, from = %previous, to = %health, "Backend health changed");
        }
        Ok(previous)
    }

    /// Record a successful call so the router can prefer warm backends
    pub fn record_success(&self, id: &str) -> Result<(), SwarmError> {
        let seq = self.success_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entries = self.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| SwarmError::UnknownBackend(id.to_string()))?;
        entry.last_success = Some(seq);
        debug!(backend_id = %id, seq, "Backend success recorded");
        Ok(())
    }

    /// Count a finished call; `confidence` is `None` when it failed
    pub fn record_call(
        &self,
        id: &str,
        latency: Duration,
        confidence: Option<f32>,
    ) -> Result<(), SwarmError> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| SwarmError::UnknownBackend(id.to_string()))?;
        match confidence {
            Some(confidence) => entry.stats.record_success(latency, confidence),
            None => entry.stats.record_failure(),
        }
        Ok(())
    }

    pub fn stats(&self, id: &str) -> Option<BackendStats> {
        self.read().get(id).map(|e| e.stats.clone())
    }

    /// Statistics of every registered backend, in id order
    pub fn performance(&self) -> PerformanceReport {
        let mut backends: Vec<BackendStats> = self.read().values().map(|e| e.stats.clone()).collect();
        backends.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        PerformanceReport::from_stats(backends)
    }

    /// All registered backend ids, sorted
    pub fn ids(&self) -> Vec<BackendId> {
        let mut ids: Vec<BackendId> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text() -> BTreeSet<Capability> {
        [Capability::Text].into_iter().collect()
    }

    fn sample_registry() -> BackendRegistry {
        BackendRegistry::with_backends([
            BackendDescriptor::new("zamba", [Capability::Text], BackendCost::new(40.0, 10.0)),
            BackendDescriptor::new(
                "llava",
                [Capability::Text, Capability::Vision],
                BackendCost::new(40.0, 5.0),
            ),
            BackendDescriptor::new("whisper", [Capability::Audio], BackendCost::new(80.0, 2.0)),
        ])
    }

    #[test]
    fn test_list_orders_by_cost_fit() {
        let registry = sample_registry();
        let listed: Vec<String> = registry.list(&text()).into_iter().map(|d| d.id).collect();
        assert_eq!(listed, vec!["llava", "zamba"]);
    }

    #[test]
    fn test_list_requires_all_capabilities() {
        let registry = sample_registry();
        let required: BTreeSet<Capability> =
            [Capability::Text, Capability::Vision].into_iter().collect();
        let listed = registry.list(&required);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "llava");

        // Empty requirement matches everything
        assert_eq!(registry.list(&BTreeSet::new()).len(), 3);
    }

    #[test]
    fn test_register_replaces() {
        let registry = sample_registry();
        let previous = registry.register(BackendDescriptor::new(
            "zamba",
            [Capability::Text, Capability::Code],
            BackendCost::new(50.0, 10.0),
        ));
        assert_eq!(previous.unwrap().cost.tokens_per_sec, 40.0);
        assert_eq!(registry.len(), 3);
        assert!(registry
            .get("zamba")
            .unwrap()
            .capabilities
            .contains(&Capability::Code));
    }

    #[test]
    fn test_unknown_backend_errors() {
        let registry = sample_registry();
        assert!(matches!(
            registry.deregister("ghost"),
            Err(SwarmError::UnknownBackend(id)) if id == "ghost"
        ));
        assert!(matches!(
            registry.update_health("ghost", BackendHealth::Degraded),
            Err(SwarmError::UnknownBackend(_))
        ));
        assert!(registry.record_success("ghost").is_err());
    }

    #[test]
    fn test_health_update_visible_immediately() {
        let registry = sample_registry();
        let previous = registry
            .update_health("zamba", BackendHealth::Unavailable)
            .unwrap();
        assert_eq!(previous, BackendHealth::Healthy);
        let entry = registry.get("zamba").unwrap();
        assert_eq!(entry.health, BackendHealth::Unavailable);
        assert!(!entry.is_routable());
    }

    #[test]
    fn test_record_success_is_monotonic() {
        let registry = sample_registry();
        registry.record_success("zamba").unwrap();
        registry.record_success("llava").unwrap();
        let candidates = registry.candidates(&text());
        let zamba = candidates.iter().find(|c| c.descriptor.id == "zamba").unwrap();
        let llava = candidates.iter().find(|c| c.descriptor.id == "llava").unwrap();
        assert!(llava.last_success > zamba.last_success);
    }

    #[test]
    fn test_call_stats_follow_the_backend() {
        let registry = sample_registry();
        registry
            .record_call("zamba", Duration::from_millis(200), Some(0.5))
            .unwrap();
        registry.record_call("zamba", Duration::from_millis(50), None).unwrap();
        registry
            .record_call("llava", Duration::from_millis(400), Some(1.0))
            .unwrap();
        assert!(registry.record_call("ghost", Duration::ZERO, None).is_err());

        let zamba = registry.stats("zamba").unwrap();
        assert_eq!((zamba.calls, zamba.successes, zamba.failures), (2, 1, 1));
        assert_eq!(zamba.success_latency_ms, 200);

        let report = registry.performance();
        let ids: Vec<&str> = report.backends.iter().map(|s| s.backend_id.as_str()).collect();
        assert_eq!(ids, vec!["llava", "whisper", "zamba"]);
        assert_eq!(report.total_calls, 3);
        assert_eq!(report.usage["whisper"], 0.0);
        assert_eq!(report.usage["llava"], 0.5);

        // Health changes keep the counters; re-registration starts over
        registry.update_health("zamba", BackendHealth::Degraded).unwrap();
        assert_eq!(registry.stats("zamba").unwrap().calls, 2);
        registry.register(BackendDescriptor::new(
            "zamba",
            [Capability::Text],
            BackendCost::new(40.0, 10.0),
        ));
        assert_eq!(registry.stats("zamba").unwrap().calls, 0);
    }

    #[test]
    fn test_deregister_removes() {
        let registry = sample_registry();
        let removed = registry.deregister("whisper").unwrap();
        assert_eq!(removed.id, "whisper");
        assert_eq!(registry.ids(), vec!["llava", "zamba"]);
        assert!(registry.registered_at("whisper").is_none());
    }
}
