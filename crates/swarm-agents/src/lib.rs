//! Swarm daemon pieces that talk to the outside world.
//!
//! The `coordination` crate holds the orchestration core and never touches
//! the network. This crate supplies the Ollama model client, the backend
//! health prober, tracing setup and the glue that builds a running swarm
//! from a YAML config.

pub mod bootstrap;
pub mod daemon;
pub mod health;
pub mod ollama;
pub mod telemetry;

pub use bootstrap::{Swarm, SwarmReport};
pub use health::{HealthProber, ProbeResult};
pub use ollama::OllamaBackend;
