//! Scripted backend for exercising the runtime and orchestrator without a
//! model server

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::backend::{BackendFailure, BackendReply, InvocationContext, ModelBackend};
use crate::state::TaskPayload;

/// One scripted call outcome
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Reply { value: String, confidence: f32 },
    Fail(String),
    /// Never answers; only a deadline or cancellation ends the call
    Hang,
    /// Wait, then play the inner step
    After(Duration, Box<ScriptStep>),
}

impl ScriptStep {
    pub fn reply(value: impl Into<String>, confidence: f32) -> Self {
        ScriptStep::Reply {
            value: value.into(),
            confidence,
        }
    }

    pub fn after(delay: Duration, step: ScriptStep) -> Self {
        ScriptStep::After(delay, Box::new(step))
    }
}

/// Backend that plays back scripted outcomes, then repeats a default one
pub struct ScriptedBackend {
    steps: Mutex<VecDeque<ScriptStep>>,
    fallback: ScriptStep,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    /// Always reply with `value` at `confidence`
    pub fn new(value: impl Into<String>, confidence: f32) -> Self {
        Self::with_fallback(ScriptStep::reply(value, confidence))
    }

    /// Always fail with a backend error
    pub fn failing(detail: impl Into<String>) -> Self {
        Self::with_fallback(ScriptStep::Fail(detail.into()))
    }

    /// Never answer
    pub fn hanging() -> Self {
        Self::with_fallback(ScriptStep::Hang)
    }

    pub fn with_fallback(fallback: ScriptStep) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Play these outcomes first, in order
    pub fn with_script(self, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(steps);
        self
    }

    /// Wait this long before every answer
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of invocations so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> ScriptStep {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Strip `After` wrappers, adding their waits to `delay`
fn unwrap_delays(mut step: ScriptStep, mut delay: Duration) -> (Duration, ScriptStep) {
    loop {
        match step {
            ScriptStep::After(extra, inner) => {
                delay += extra;
                step = *inner;
            }
            other => return (delay, other),
        }
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn invoke(
        &self,
        payload: &TaskPayload,
        ctx: InvocationContext,
    ) -> Result<BackendReply, BackendFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (delay, step) = unwrap_delays(self.next_step(), self.delay);

        if !delay.is_zero() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(BackendFailure::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match step {
            ScriptStep::Reply { value, confidence } => Ok(BackendReply {
                tokens_used: (value.len() as u32).min(payload.max_tokens),
                value,
                confidence,
            }),
            ScriptStep::Fail(detail) => Err(BackendFailure::Request(detail)),
            ScriptStep::Hang | ScriptStep::After(..) => {
                ctx.cancel.cancelled().await;
                Err(BackendFailure::Cancelled)
            }
        }
    }
}
