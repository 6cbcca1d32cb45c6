//! Per-backend call statistics and energy estimates
//!
//! Every backend call the runtime makes lands here. Successes carry their
//! latency and confidence; failures are only counted. Energy is an estimate
//! from the backend's model family, not a measurement.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::BackendKind;
use crate::state::BackendId;

/// Draw multiplier for state-space backends over their nominal power
const SSM_EFFICIENCY: f64 = 0.65;

impl BackendKind {
    /// Estimated draw while serving a call, in watts
    pub fn power_watts(&self) -> f64 {
        match self {
            BackendKind::MambaSsm => 50.0 * SSM_EFFICIENCY,
            BackendKind::CodeSpecialist => 80.0,
            BackendKind::Reasoning => 100.0,
            BackendKind::Transformer => 150.0,
        }
    }

    /// Estimated energy of a call that ran for `elapsed`, in watt-hours
    pub fn energy_wh(&self, elapsed: Duration) -> f64 {
        self.power_watts() * elapsed.as_secs_f64() / 3600.0
    }
}

/// Running totals for one backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub backend_id: BackendId,
    pub kind: BackendKind,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    /// Summed latency of successful calls
    pub success_latency_ms: u64,
    /// Summed confidence of successful calls
    pub confidence_sum: f64,
    /// Estimated energy of successful calls
    pub energy_wh: f64,
}

impl BackendStats {
    pub fn new(backend_id: impl Into<BackendId>, kind: BackendKind) -> Self {
        Self {
            backend_id: backend_id.into(),
            kind,
            ..Self::default()
        }
    }

    pub fn record_success(&mut self, latency: Duration, confidence: f32) {
        self.calls += 1;
        self.successes += 1;
        self.success_latency_ms += latency.as_millis() as u64;
        self.confidence_sum += f64::from(confidence);
        self.energy_wh += self.kind.energy_wh(latency);
    }

    pub fn record_failure(&mut self) {
        self.calls += 1;
        self.failures += 1;
    }

    /// Share of calls that succeeded; 0 before the first call
    pub fn success_rate(&self) -> f64 {
        ratio(self.successes as f64, self.calls)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        ratio(self.success_latency_ms as f64, self.successes)
    }

    pub fn avg_confidence(&self) -> f64 {
        ratio(self.confidence_sum, self.successes)
    }

    pub fn avg_energy_wh(&self) -> f64 {
        ratio(self.energy_wh, self.successes)
    }
}

fn ratio(total: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

/// Swarm-wide view over every backend's statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub success_rate: f64,
    pub total_energy_wh: f64,
    pub avg_energy_wh: f64,
    pub avg_latency_ms: f64,
    pub avg_confidence: f64,
    /// Share of successful calls served by each backend
    pub usage: BTreeMap<BackendId, f64>,
    pub backends: Vec<BackendStats>,
}

impl PerformanceReport {
    pub fn from_stats(backends: Vec<BackendStats>) -> Self {
        let total_calls: u64 = backends.iter().map(|s| s.calls).sum();
        let successful_calls: u64 = backends.iter().map(|s| s.successes).sum();
        let total_energy_wh: f64 = backends.iter().map(|s| s.energy_wh).sum();
        let latency_ms: u64 = backends.iter().map(|s| s.success_latency_ms).sum();
        let confidence: f64 = backends.iter().map(|s| s.confidence_sum).sum();
        let usage = backends
            .iter()
            .map(|s| (s.backend_id.clone(), ratio(s.successes as f64, successful_calls)))
            .collect();

        Self {
            total_calls,
            successful_calls,
            success_rate: ratio(successful_calls as f64, total_calls),
            total_energy_wh,
            avg_energy_wh: ratio(total_energy_wh, successful_calls),
            avg_latency_ms: ratio(latency_ms as f64, successful_calls),
            avg_confidence: ratio(confidence, successful_calls),
            usage,
            backends,
        }
    }
}
