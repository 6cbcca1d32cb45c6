//! Ollama-served model backend
//!
//! Non-streaming `POST {base}/api/generate`. The call races the
//! invocation's cancellation token, so a timed-out or shut-down call stops
//! waiting on the socket at once.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use coordination::registry::BackendDescriptor;
use coordination::runtime::{BackendFailure, BackendReply, InvocationContext, ModelBackend};
use coordination::state::TaskPayload;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_TEMPERATURE: f32 = 0.7;
const TOP_P: f32 = 0.9;
const ERROR_WORDS: [&str; 4] = ["error", "failed", "cannot", "unable"];

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    options: GenerateOptions,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    eval_count: Option<u32>,
}

/// One Ollama model, reached over HTTP
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaBackend {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// Client for a registered backend; falls back to `default_endpoint`
    /// when the descriptor has none
    pub fn for_descriptor(
        client: reqwest::Client,
        descriptor: &BackendDescriptor,
        default_endpoint: &str,
    ) -> Self {
        let base = descriptor
            .endpoint
            .clone()
            .unwrap_or_else(|| default_endpoint.to_string());
        Self::new(client, base, descriptor.model.clone())
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, payload: &TaskPayload) -> Result<GenerateResponse, BackendFailure> {
        let body = GenerateRequest {
            model: &self.model,
            prompt: &payload.body,
            options: GenerateOptions {
                num_predict: payload.max_tokens,
                temperature: self.temperature,
                top_p: TOP_P,
            },
            stream: false,
        };

        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendFailure::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendFailure::Status {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<GenerateResponse>()
            .await
            .map_err(|e| BackendFailure::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    async fn invoke(
        &self,
        payload: &TaskPayload,
        ctx: InvocationContext,
    ) -> Result<BackendReply, BackendFailure> {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(BackendFailure::Cancelled),
            result = self.generate(payload) => result,
        };
        let generated = result?;
        let elapsed = started.elapsed();

        let tokens_used = generated
            .eval_count
            .unwrap_or_else(|| generated.response.split_whitespace().count() as u32);
        let confidence = heuristic_confidence(&generated.response, elapsed);
        debug!(
            task_id = %ctx.task_id,
            model = %self.model,
            tokens_used,
            confidence,
            elapsed_ms = elapsed.as_millis() as u64,
            "Ollama generation finished"
        );

        Ok(BackendReply {
            value: generated.response,
            confidence,
            tokens_used,
        })
    }
}

/// Confidence for a generated text from its length and generation speed.
///
/// Empty text scores 0.0, text under ten characters 0.2, text mentioning
/// an error 0.3. Anything else blends length (saturating at 200 chars) and
/// speed (saturating at 5s) and lands in 0.1..=0.95.
pub fn heuristic_confidence(text: &str, elapsed: Duration) -> f32 {
    if text.trim().is_empty() {
        return 0.0;
    }
    let chars = text.chars().count();
    if chars < 10 {
        return 0.2;
    }
    let lower = text.to_lowercase();
    if ERROR_WORDS.iter().any(|w| lower.contains(w)) {
        return 0.3;
    }

    let length_factor = (chars as f64 / 200.0).min(1.0);
    let ms = elapsed.as_secs_f64() * 1000.0;
    let speed_factor = if ms > 0.0 {
        (5000.0 / ms).clamp(0.1, 1.0)
    } else {
        0.1
    };
    (length_factor * 0.6 + speed_factor * 0.4).clamp(0.1, 0.95) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_floors() {
        assert_eq!(heuristic_confidence("   ", Duration::from_millis(10)), 0.0);
        assert_eq!(heuristic_confidence("ok", Duration::from_millis(10)), 0.2);
        assert_eq!(
            heuristic_confidence("Error: model not loaded", Duration::from_millis(10)),
            0.3
        );
    }

    #[test]
    fn test_confidence_blend() {
        let long = "a".repeat(400);
        // Full length, fast answer: capped
        assert!((heuristic_confidence(&long, Duration::from_millis(100)) - 0.95).abs() < 1e-6);
        // Full length, 10s answer: 0.6 + 0.4 * 0.5
        assert!((heuristic_confidence(&long, Duration::from_secs(10)) - 0.8).abs() < 1e-6);
        // Half length, very slow: 0.3 + 0.4 * 0.1
        let half = "b".repeat(100);
        assert!((heuristic_confidence(&half, Duration::from_secs(600)) - 0.34).abs() < 1e-6);
    }

    #[test]
    fn test_request_shape() {
        let body = GenerateRequest {
            model: "mamba-codestral",
            prompt: "fn main",
            options: GenerateOptions {
                num_predict: 64,
                temperature: 0.7,
                top_p: TOP_P,
            },
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "mamba-codestral");
        assert_eq!(json["options"]["num_predict"], 64);
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let backend = OllamaBackend::new(reqwest::Client::new(), "http://gpu-01:11434/", "zamba");
        assert_eq!(backend.base_url(), "http://gpu-01:11434");
        assert_eq!(backend.model(), "zamba");
    }

    #[tokio::test]
    async fn test_cancelled_call_returns_promptly() {
        let backend = OllamaBackend::new(reqwest::Client::new(), "http://127.0.0.1:9", "zamba");
        let ctx = InvocationContext::new("t-1");
        ctx.cancel.cancel();
        let err = backend
            .invoke(&TaskPayload::new("hi"), ctx)
            .await
            .unwrap_err();
        assert_eq!(err, BackendFailure::Cancelled);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_request_error() {
        let backend = OllamaBackend::new(reqwest::Client::new(), "http://127.0.0.1:9", "zamba");
        let err = backend
            .invoke(&TaskPayload::new("hi"), InvocationContext::new("t-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendFailure::Request(_)));
    }
}
