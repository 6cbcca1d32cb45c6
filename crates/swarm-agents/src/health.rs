//! Backend health probing
//!
//! Periodically GETs `{endpoint}/api/tags` for every registered backend and
//! writes the result back through `BackendRegistry::update_health`, the only
//! path that changes backend health. The endpoint must also list the
//! backend's model; a server that answers without it cannot serve calls.
//!
//! | Probe result                               | Health      |
//! |--------------------------------------------|-------------|
//! | first attempt succeeds under the threshold | Healthy     |
//! | succeeds slowly, or only after a retry     | Degraded    |
//! | every attempt fails or times out           | Unavailable |
//! | answers, but the model is not listed       | Unavailable |

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use coordination::config::HealthConfig;
use coordination::events::{SharedEventSink, SwarmEvent};
use coordination::registry::{BackendHealth, SharedRegistry};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of probing one endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub ok: bool,
    /// Attempts made, first included
    pub attempts: u32,
    /// Latency of the successful attempt
    pub latency: Option<Duration>,
    pub timed_out: bool,
    /// The endpoint answered but does not serve the expected model
    pub model_missing: bool,
    pub last_error: Option<String>,
}

/// Body of `GET /api/tags`
#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Whether `model` is among the names an endpoint lists.
///
/// A name without a tag matches its `:latest` entry.
pub fn model_listed(listed: &[String], model: &str) -> bool {
    let wanted = if model.contains(':') {
        model.to_string()
    } else {
        format!("{}:latest", model)
    };
    listed.iter().any(|name| name == model || *name == wanted)
}

impl ProbeResult {
    /// Map a probe onto a health status
    pub fn classify(&self, degraded_latency: Duration) -> BackendHealth {
        if !self.ok {
            return BackendHealth::Unavailable;
        }
        let slow = self.latency.map_or(false, |l| l > degraded_latency);
        if self.attempts > 1 || slow {
            BackendHealth::Degraded
        } else {
            BackendHealth::Healthy
        }
    }
}

/// Probes registered backends and records their health
pub struct HealthProber {
    client: reqwest::Client,
    registry: SharedRegistry,
    events: SharedEventSink,
    config: HealthConfig,
    default_endpoint: String,
}

impl HealthProber {
    pub fn new(
        client: reqwest::Client,
        registry: SharedRegistry,
        events: SharedEventSink,
        config: HealthConfig,
        default_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client,
            registry,
            events,
            config,
            default_endpoint: default_endpoint.into(),
        }
    }

    /// GET `{base}/api/tags` with per-attempt timeout and retries, and check
    /// that `model` is listed when one is given
    pub async fn probe(&self, base_url: &str, model: Option<&str>) -> ProbeResult {
        let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let retries = self.config.retries;
        let mut last_error = None;
        let mut timed_out = false;

        for attempt in 0..=retries {
            let started = Instant::now();
            // Bound the whole exchange, body included, so a hung server counts as down
            let check = async {
                let resp = self.client.get(&url).send().await.map_err(|e| e.to_string())?;
                if !resp.status().is_success() {
                    return Err(format!("non-success status {}", resp.status()));
                }
                let body = resp.bytes().await.map_err(|e| e.to_string())?;
                let tags: TagList = serde_json::from_slice(&body)
                    .map_err(|e| format!("unreadable model list: {}", e))?;
                Ok::<Vec<String>, String>(tags.models.into_iter().map(|m| m.name).collect())
            };

            match tokio::time::timeout(timeout, check).await {
                Ok(Ok(listed)) => {
                    let latency = started.elapsed();
                    if let Some(model) = model.filter(|m| !m.is_empty()) {
                        if !model_listed(&listed, model) {
                            return ProbeResult {
                                ok: false,
                                attempts: attempt + 1,
                                latency: None,
                                timed_out,
                                model_missing: true,
                                last_error: Some(format!("model {} not listed", model)),
                            };
                        }
                    }
                    return ProbeResult {
                        ok: true,
                        attempts: attempt + 1,
                        latency: Some(latency),
                        timed_out,
                        model_missing: false,
                        last_error,
                    };
                }
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => {
                    timed_out = true;
                    last_error = Some("response timeout".to_string());
                }
            }

            if attempt < retries {
                tokio::time::sleep(backoff).await;
            }
        }

        ProbeResult {
            ok: false,
            attempts: retries + 1,
            latency: None,
            timed_out,
            model_missing: false,
            last_error,
        }
    }

    /// Record `health` for a backend, emitting an event when it changed.
    ///
    /// Returns the previous status, or `None` if the backend is gone.
    pub fn apply(&self, backend_id: &str, health: BackendHealth) -> Option<BackendHealth> {
        match self.registry.update_health(backend_id, health) {
            Ok(previous) => {
                if previous != health {
                    self.events.emit(SwarmEvent::BackendHealthChanged {
                        backend_id: backend_id.to_string(),
                        from: previous,
                        to: health,
                        timestamp: Utc::now(),
                    });
                }
                Some(previous)
            }
            Err(e) => {
                debug!(%backend_id, error = %e, "Backend vanished before health update");
                None
            }
        }
    }

    /// Probe every registered backend once; returns how many changed health
    pub async fn probe_all(&self) -> usize {
        let degraded_latency = Duration::from_millis(self.config.degraded_latency_ms);
        let mut changed = 0;

        for backend_id in self.registry.ids() {
            let Some(descriptor) = self.registry.get(&backend_id) else {
                continue;
            };
            let base = descriptor
                .endpoint
                .clone()
                .unwrap_or_else(|| self.default_endpoint.clone());
            let result = self.probe(&base, Some(descriptor.model.as_str())).await;
            let health = result.classify(degraded_latency);
            if health == BackendHealth::Unavailable {
                warn!(
                    %backend_id,
                    attempts = result.attempts,
                    timed_out = result.timed_out,
                    model_missing = result.model_missing,
                    error = result.last_error.as_deref().unwrap_or("-"),
                    "Backend probe failed"
                );
            }
            if matches!(self.apply(&backend_id, health), Some(previous) if previous != health) {
                changed += 1;
            }
        }
        changed
    }

    /// Probe on the configured interval until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_millis(self.config.interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let changed = self.probe_all().await;
                        if changed > 0 {
                            info!(changed, "Backend health updated");
                        }
                    }
                }
            }
            debug!("Health prober stopped");
        })
    }
}
