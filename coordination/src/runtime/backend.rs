//! Uniform invocation interface over model-serving backends
//!
//! The core only needs `invoke(payload, deadline) -> reply | error` per
//! backend; transport lives in the implementations (see the Ollama client
//! in `swarm-agents`).

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::state::{BackendId, TaskId, TaskPayload};

/// Per-call context handed to a backend
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub task_id: TaskId,
    /// Absolute deadline for the call, if the task has one
    pub deadline: Option<Instant>,
    /// Cancelled when the deadline passes or the swarm shuts down
    pub cancel: CancellationToken,
}

impl InvocationContext {
    pub fn new(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// What a backend produced for one payload
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    pub value: String,
    /// Backend's own confidence in `value`, 0.0..=1.0
    pub confidence: f32,
    pub tokens_used: u32,
}

/// Error reported by a backend call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendFailure {
    #[error("request failed: {0}")]
    Request(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("call cancelled")]
    Cancelled,
}

/// A model-serving backend the runtime can call
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn invoke(
        &self,
        payload: &TaskPayload,
        ctx: InvocationContext,
    ) -> Result<BackendReply, BackendFailure>;
}

/// Shared reference to a BackendPool
pub type SharedBackendPool = Arc<BackendPool>;

/// Client handles keyed by registry backend id
#[derive(Default)]
pub struct BackendPool {
    clients: RwLock<HashMap<BackendId, Arc<dyn ModelBackend>>>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedBackendPool {
        Arc::new(self)
    }

    /// Attach a client to a backend id, returning the one it replaces
    pub fn insert(
        &self,
        id: impl Into<BackendId>,
        client: Arc<dyn ModelBackend>,
    ) -> Option<Arc<dyn ModelBackend>> {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), client)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<dyn ModelBackend>> {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ModelBackend>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
