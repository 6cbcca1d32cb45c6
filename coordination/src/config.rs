//! Swarm configuration
//!
//! One YAML document supplies the rebirth policy, the consensus strategy,
//! router tuning, tier populations and the initial backend set. Loading
//! parses and validates in one step; anything malformed is a startup error.
//!
//! ```yaml
//! consensus:
//!   strategy: majority          # or weighted-confidence, or
//!   min_quorum: 2               #   { first-quorum: { k: 2, tolerance: 0.01 } }
//! rebirth:
//!   max_attempts: 3
//! tiers:
//!   - { tier: neuronal, agents: 3 }
//! backends:
//!   - id: zamba
//!     kind: mamba_ssm
//!     model: zamba2:2.7b
//!     capabilities: [text]
//!     tokens_per_sec: 45
//!     vram_gb: 6
//! ```

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::ConsensusStrategy;
use crate::rebirth::RebirthPolicy;
use crate::registry::{BackendCost, BackendDescriptor, BackendKind};
use crate::router::RouterConfig;
use crate::state::{BackendId, Capability, Tier};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "SWARM_CONFIG";

/// Environment variable with the endpoint for backends that do not set one
pub const OLLAMA_BASE_URL_ENV: &str = "OLLAMA_BASE_URL";

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Consensus defaults; tasks may override strategy and quorum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub strategy: ConsensusStrategy,
    /// Responses required before a consensus round may resolve
    pub min_quorum: usize,
    /// Quorum reduction applied on each escalation (never below 1)
    pub quorum_relaxation: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            strategy: ConsensusStrategy::Majority,
            min_quorum: 2,
            quorum_relaxation: 1,
        }
    }
}

impl ConsensusConfig {
    pub fn relax(&self, quorum: usize) -> usize {
        quorum.saturating_sub(self.quorum_relaxation).max(1)
    }

    /// Strategy for the parent tier: first-quorum's `k` drops with the quorum
    pub fn relax_strategy(&self, strategy: &ConsensusStrategy) -> ConsensusStrategy {
        match strategy {
            ConsensusStrategy::FirstQuorum { k, tolerance } => ConsensusStrategy::FirstQuorum {
                k: self.relax(*k),
                tolerance: *tolerance,
            },
            other => other.clone(),
        }
    }
}

/// Dispatch and supervision timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Re-dispatches within a tier after a timeout or backend error,
    /// before a single-agent task escalates
    pub max_redispatch: u32,
    /// Per-round wait for results
    pub round_timeout_ms: u64,
    /// How often idle and busy workers report liveness
    pub heartbeat_interval_ms: u64,
    /// How often the watchdog looks for stalled agents
    pub watchdog_interval_ms: u64,
    /// How long finished tasks stay queryable; the watchdog prunes older ones
    pub retention_ms: u64,
    /// Entries kept in each agent transition, lifecycle, escalation and
    /// event log
    pub audit_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_redispatch: 1,
            round_timeout_ms: 30_000,
            heartbeat_interval_ms: 1_000,
            watchdog_interval_ms: 5_000,
            retention_ms: 3_600_000,
            audit_capacity: 10_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Population of one tier at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub tier: Tier,
    pub agents: usize,
}

/// A backend entry as written in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: BackendId,
    #[serde(default)]
    pub kind: BackendKind,
    /// Served model name; defaults to the id
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL; defaults to `OLLAMA_BASE_URL`
    #[serde(default)]
    pub endpoint: Option<String>,
    pub capabilities: BTreeSet<Capability>,
    pub tokens_per_sec: f64,
    pub vram_gb: f64,
}

impl BackendConfig {
    pub fn to_descriptor(&self, default_endpoint: &str) -> BackendDescriptor {
        BackendDescriptor::new(
            self.id.clone(),
            self.capabilities.iter().copied(),
            BackendCost::new(self.tokens_per_sec, self.vram_gb),
        )
        .with_kind(self.kind)
        .with_model(self.model.clone().unwrap_or_else(|| self.id.clone()))
        .with_endpoint(
            self.endpoint
                .clone()
                .unwrap_or_else(|| default_endpoint.to_string()),
        )
    }
}

/// Backend health probing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    /// Bound on each probe request, connect included
    pub timeout_ms: u64,
    /// Extra attempts after a failed probe
    pub retries: u32,
    pub retry_backoff_ms: u64,
    /// Successful probes slower than this mark the backend degraded
    pub degraded_latency_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            timeout_ms: 2_000,
            retries: 2,
            retry_backoff_ms: 250,
            degraded_latency_ms: 1_000,
        }
    }
}

/// Top-level swarm configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub router: RouterConfig,
    pub consensus: ConsensusConfig,
    pub rebirth: RebirthPolicy,
    pub orchestrator: OrchestratorConfig,
    pub tiers: Vec<TierConfig>,
    pub backends: Vec<BackendConfig>,
    pub health: HealthConfig,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            consensus: ConsensusConfig::default(),
            rebirth: RebirthPolicy::default(),
            orchestrator: OrchestratorConfig::default(),
            tiers: vec![
                TierConfig { tier: Tier::Neuronal, agents: 3 },
                TierConfig { tier: Tier::Swarm, agents: 2 },
                TierConfig { tier: Tier::Cognitive, agents: 1 },
            ],
            backends: Vec::new(),
            health: HealthConfig::default(),
        }
    }
}

impl SwarmConfig {
    /// Read, parse and validate a YAML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SwarmConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `SWARM_CONFIG` if set, defaults otherwise
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    /// Endpoint for backends without their own
    pub fn default_endpoint() -> String {
        std::env::var(OLLAMA_BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_OLLAMA_BASE_URL.to_string())
    }

    /// Backend descriptors with endpoints filled in
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        let fallback = Self::default_endpoint();
        self.backends
            .iter()
            .map(|b| b.to_descriptor(&fallback))
            .collect()
    }

    /// Agents configured for a tier
    pub fn agents_in(&self, tier: Tier) -> usize {
        self.tiers
            .iter()
            .filter(|t| t.tier == tier)
            .map(|t| t.agents)
            .sum()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.consensus.min_quorum == 0 {
            return invalid("consensus.min_quorum must be at least 1".into());
        }
        if let ConsensusStrategy::FirstQuorum { k, tolerance } = &self.consensus.strategy {
            if *k == 0 {
                return invalid("consensus.strategy first-quorum k must be at least 1".into());
            }
            if !tolerance.is_finite() || *tolerance < 0.0 {
                return invalid("consensus.strategy first-quorum tolerance must be >= 0".into());
            }
        }

        let rebirth = &self.rebirth;
        if rebirth.max_attempts == 0 {
            return invalid("rebirth.max_attempts must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&rebirth.jitter) {
            return invalid(format!("rebirth.jitter {} outside 0.0..=1.0", rebirth.jitter));
        }
        if rebirth.backoff_cap_ms < rebirth.backoff_base_ms {
            return invalid("rebirth.backoff_cap_ms is below backoff_base_ms".into());
        }

        if self.router.vram_ceiling_gb <= 0.0 || self.router.latency_tolerance_ms <= 0.0 {
            return invalid("router ceilings and tolerances must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.router.degraded_throughput_factor) {
            return invalid("router.degraded_throughput_factor outside 0.0..=1.0".into());
        }

        if self.orchestrator.round_timeout_ms == 0 {
            return invalid("orchestrator.round_timeout_ms must be positive".into());
        }
        if self.orchestrator.audit_capacity == 0 {
            return invalid("orchestrator.audit_capacity must be at least 1".into());
        }

        let mut tiers = HashSet::new();
        for t in &self.tiers {
            if !tiers.insert(t.tier) {
                return invalid(format!("tier {} listed twice", t.tier));
            }
        }

        let mut ids = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return invalid("backend with empty id".into());
            }
            if !ids.insert(backend.id.as_str()) {
                return invalid(format!("backend {} listed twice", backend.id));
            }
            if backend.capabilities.is_empty() {
                return invalid(format!("backend {} has no capabilities", backend.id));
            }
            if backend.tokens_per_sec <= 0.0 || backend.vram_gb < 0.0 {
                return invalid(format!("backend {} has a nonsensical cost", backend.id));
            }
        }

        Ok(())
    }
}
