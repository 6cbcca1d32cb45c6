//! Assemble a running swarm from configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use coordination::events::{
    EventBus, EventFilter, EventHistory, EventStats, FanoutSink, FilteredReceiver,
    SharedEventBus, TracingSink,
};
use coordination::registry::{BackendRegistry, PerformanceReport};
use coordination::runtime::BackendPool;
use coordination::{HierarchyOrchestrator, SwarmConfig, SwarmContext};
use tokio::task::JoinHandle;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::health::HealthProber;
use crate::ollama::OllamaBackend;

/// Connect timeout for every backend HTTP client
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Event and backend figures for the life of a swarm
#[derive(Debug, Serialize)]
pub struct SwarmReport {
    pub events: EventStats,
    pub backends: PerformanceReport,
}

/// A configured swarm and the services around it
pub struct Swarm {
    pub orchestrator: HierarchyOrchestrator,
    pub bus: SharedEventBus,
    /// Most recent events, bounded by `orchestrator.audit_capacity`
    pub history: Arc<EventHistory>,
    pub prober: Arc<HealthProber>,
    shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl Swarm {
    /// Build the registry, backend clients, event plumbing and every
    /// configured tier.
    pub fn build(config: &SwarmConfig) -> Result<Self> {
        config.validate().context("invalid swarm configuration")?;

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        let history = Arc::new(EventHistory::with_capacity(config.orchestrator.audit_capacity));
        let bus = EventBus::with_history(history.clone()).shared();
        let sink = Arc::new(
            FanoutSink::new()
                .with(Arc::new(TracingSink))
                .with(bus.clone()),
        );

        let ctx = SwarmContext::new(
            BackendRegistry::new().shared(),
            BackendPool::new().shared(),
            sink.clone(),
        );
        let orchestrator = HierarchyOrchestrator::new(ctx, config);

        let default_endpoint = SwarmConfig::default_endpoint();
        for descriptor in config.descriptors() {
            let backend =
                OllamaBackend::for_descriptor(client.clone(), &descriptor, &default_endpoint);
            info!(
                backend_id = %descriptor.id,
                model = %backend.model(),
                endpoint = %backend.base_url(),
                "Registering backend"
            );
            orchestrator.register_backend(descriptor, Arc::new(backend));
        }

        for tier in &config.tiers {
            orchestrator.init_tier(tier.tier, tier.agents);
        }

        let prober = Arc::new(HealthProber::new(
            client,
            orchestrator.registry().clone(),
            sink,
            config.health.clone(),
            default_endpoint,
        ));

        Ok(Self {
            orchestrator,
            bus,
            history,
            prober,
            shutdown: CancellationToken::new(),
            background: Vec::new(),
        })
    }

    /// Load a config file and build from it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = SwarmConfig::load(path)
            .with_context(|| format!("failed to load swarm config from {}", path.display()))?;
        Self::build(&config)
    }

    /// Start the stall watchdog and the periodic health prober
    pub fn start_background(&mut self) -> Result<()> {
        if !self.background.is_empty() {
            bail!("background services already running");
        }
        self.background.push(self.orchestrator.spawn_watchdog());
        self.background
            .push(self.prober.clone().spawn(self.shutdown.child_token()));
        Ok(())
    }

    pub fn background_tasks(&self) -> usize {
        self.background.len()
    }

    /// Subscribe to live events matching `filter`
    pub fn watch(&self, filter: EventFilter) -> FilteredReceiver {
        self.bus.subscribe_filtered(filter)
    }

    pub fn report(&self) -> SwarmReport {
        SwarmReport {
            events: self.history.stats(),
            backends: self.orchestrator.registry().performance(),
        }
    }

    /// Stop background services, then the orchestrator
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        self.orchestrator.shutdown();
        for handle in self.background.drain(..) {
            let _ = handle.await;
        }
        info!("Swarm stopped");
    }
}
