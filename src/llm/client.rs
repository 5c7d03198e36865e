//! LLM client abstraction.
//!
//! This module defines the `LlmClient` trait to abstract text-generation
//! calls, enabling testability with a mock implementation that records calls
//! and tracks in-flight concurrency.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::config::LlmSettings;
use crate::error::{ParleyError, Result};

/// One completed text-generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Raw model output
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Trait for issuing completion requests to a text-generation service.
///
/// The production implementation talks to a chat-completions endpoint over
/// HTTP; tests use [`MockLlmClient`] to avoid network calls.
#[async_trait]
pub trait LlmClient: Send + Sync + Clone {
    /// Send one prompt and return the raw completion.
    ///
    /// # Errors
    /// - `ParleyError::Http` / `ParleyError::Transient` for network-level
    ///   failures and non-success statuses
    /// - `ParleyError::RateLimitExceeded` when the upstream returns 429
    async fn complete(&self, prompt: &str) -> Result<Completion>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

#[derive(Debug, Deserialize)]
struct CompletionEnvelope {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Production LLM client speaking the chat-completions wire format.
#[derive(Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl HttpLlmClient {
    /// Build a client from settings.
    ///
    /// # Errors
    /// Returns an error when no API key is configured.
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.api_key is not configured"))?;

        Ok(Self {
            client: reqwest::Client::new(),
            url: format!("{}{}", settings.endpoint, settings.path),
            api_key,
            model: settings.model.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    #[tracing::instrument(skip(self, prompt), fields(model = %self.model, prompt_len = prompt.len()))]
    async fn complete(&self, prompt: &str) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            // Low temperature keeps the structured analyses deterministic
            "temperature": 0.3,
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            tracing::error!("upstream returned 429; the rate budget should prevent this");
            return Err(ParleyError::RateLimitExceeded);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "completion request failed");
            return Err(ParleyError::Transient(format!(
                "upstream returned {status}: {body}"
            )));
        }

        let envelope: CompletionEnvelope = response.json().await?;
        let usage = envelope.usage.unwrap_or_default();
        let text = envelope
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ParleyError::Transient("response contained no choices".to_string()))?;

        tracing::debug!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "completion received"
        );

        Ok(Completion {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}

// ============================================================================
// Test/Mock implementation
// ============================================================================

/// Mock LLM client for testing.
///
/// Responses are registered against a marker substring and matched against
/// incoming prompts. Two registration modes:
/// - [`add_response`](MockLlmClient::add_response): FIFO queue, consumed once
/// - [`stub`](MockLlmClient::stub): sticky response, returned every time
///
/// The mock records every prompt, counts calls, and tracks in-flight
/// concurrency (with a peak watermark). A [`hold`](MockLlmClient::hold) gate
/// lets tests freeze calls mid-flight to observe concurrency ceilings.
#[derive(Clone, Default)]
pub struct MockLlmClient {
    queued: Arc<Mutex<Vec<(String, VecDeque<Result<Completion>>)>>>,
    sticky: Arc<Mutex<Vec<(String, String)>>>,
    calls: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot response for prompts containing `marker`.
    pub fn add_response(&self, marker: &str, response: Result<Completion>) {
        let mut queued = self.queued.lock();
        if let Some((_, queue)) = queued.iter_mut().find(|(m, _)| m == marker) {
            queue.push_back(response);
        } else {
            queued.push((marker.to_string(), VecDeque::from([response])));
        }
    }

    /// Register a sticky JSON payload for prompts containing `marker`.
    pub fn stub(&self, marker: &str, payload: &str) {
        self.sticky.lock().push((marker.to_string(), payload.to_string()));
    }

    /// All prompts received so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Install a gate that blocks every call until a permit is released.
    /// Returns the semaphore; `add_permits(n)` lets `n` calls through.
    pub fn hold(&self) -> Arc<Semaphore> {
        let sem = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(sem.clone());
        sem
    }

    fn completion(text: String) -> Completion {
        Completion {
            text,
            prompt_tokens: 100,
            completion_tokens: 50,
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, prompt: &str) -> Result<Completion> {
        self.calls.lock().push(prompt.to_string());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |()| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let gate = self.gate.lock().clone();
        if let Some(sem) = gate {
            if let Ok(permit) = sem.acquire().await {
                permit.forget();
            }
        }

        {
            let mut queued = self.queued.lock();
            for (marker, queue) in queued.iter_mut() {
                if prompt.contains(marker.as_str()) {
                    if let Some(response) = queue.pop_front() {
                        return response;
                    }
                }
            }
        }

        let sticky = self.sticky.lock();
        for (marker, payload) in sticky.iter() {
            if prompt.contains(marker.as_str()) {
                return Ok(Self::completion(payload.clone()));
            }
        }

        let preview: String = prompt.chars().take(80).collect();
        Err(ParleyError::Transient(format!(
            "no mock response registered for prompt: {preview}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_settings(endpoint: &str) -> LlmSettings {
        LlmSettings {
            api_key: Some("test-key-123".to_string()),
            endpoint: endpoint.to_string(),
            ..LlmSettings::default()
        }
    }

    #[tokio::test]
    async fn test_http_client_parses_completion() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test-key-123"))
            .and(body_string_contains("hello model"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"ok\": true}"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 4}
            })))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(&test_settings(&server.uri())).unwrap();
        let completion = client.complete("hello model").await.unwrap();

        assert_eq!(completion.text, "{\"ok\": true}");
        assert_eq!(completion.prompt_tokens, 12);
        assert_eq!(completion.completion_tokens, 4);
    }

    #[tokio::test]
    async fn test_http_client_maps_429_to_rate_limit() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(&test_settings(&server.uri())).unwrap();
        let err = client.complete("anything").await.unwrap_err();
        assert!(matches!(err, ParleyError::RateLimitExceeded));
    }

    #[tokio::test]
    async fn test_http_client_maps_5xx_to_transient() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(&test_settings(&server.uri())).unwrap();
        let err = client.complete("anything").await.unwrap_err();
        assert!(matches!(err, ParleyError::Transient(_)));
    }

    #[test]
    fn test_http_client_requires_api_key() {
        let settings = LlmSettings::default();
        assert!(HttpLlmClient::new(&settings).is_err());
    }

    #[tokio::test]
    async fn test_mock_client_fifo_then_sticky() {
        let mock = MockLlmClient::new();
        mock.add_response(
            "sales",
            Ok(Completion {
                text: "first".to_string(),
                prompt_tokens: 1,
                completion_tokens: 1,
            }),
        );
        mock.stub("sales", "always");

        let r1 = mock.complete("a sales prompt").await.unwrap();
        assert_eq!(r1.text, "first");
        let r2 = mock.complete("a sales prompt").await.unwrap();
        assert_eq!(r2.text, "always");
        let r3 = mock.complete("a sales prompt").await.unwrap();
        assert_eq!(r3.text, "always");

        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_client_unmatched_prompt_errors() {
        let mock = MockLlmClient::new();
        let err = mock.complete("nothing registered").await.unwrap_err();
        assert!(matches!(err, ParleyError::Transient(_)));
    }

    #[tokio::test]
    async fn test_mock_gate_blocks_until_released() {
        let mock = MockLlmClient::new();
        mock.stub("prompt", "{}");
        let gate = mock.hold();

        let mock2 = mock.clone();
        let task = tokio::spawn(async move { mock2.complete("prompt one").await });

        // The call is parked behind the gate
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.in_flight(), 1);
        assert!(!task.is_finished());

        gate.add_permits(1);
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.text, "{}");
        assert_eq!(mock.in_flight(), 0);
        assert_eq!(mock.peak_in_flight(), 1);
    }
}
