//! HTTP plumbing and deadlines shared by the embedding and
//! text-generation oracles.
//!
//! [`HttpClient`] posts JSON with exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - other 4xx → fail immediately
//! - network errors → retry
//! - transport timeout → [`RelationError::Timeout`], not retried
//! - success with a non-JSON `content-type` → [`RelationError::Oracle`]
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! [`TimeoutEmbedder`] and [`TimeoutGenerator`] bound a whole oracle call,
//! retries included, with `tokio::time::timeout`.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use relate_core::classify::TextGenerator;
use relate_core::embedding::EmbeddingOracle;
use relate_core::{RelationError, Result};
use serde_json::Value;
use tracing::{debug, warn};

pub struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    label: &'static str,
}

impl HttpClient {
    /// `label` names the provider in error messages (e.g. `"OpenAI"`).
    pub fn new(label: &'static str, timeout: Duration, max_retries: u32) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            timeout,
            max_retries,
            label,
        })
    }

    pub async fn post_json(&self, url: &str, bearer: Option<&str>, body: &Value) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(provider = self.label, attempt, ?delay, "retrying oracle request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .json(body);
            if let Some(token) = bearer {
                request = request.header("Authorization", format!("Bearer {token}"));
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => return Err(RelationError::Timeout(self.timeout)),
                Err(e) => {
                    warn!(provider = self.label, url, error = %e, "oracle request failed");
                    last_err = Some(RelationError::oracle(format!(
                        "{} connection error: {e}",
                        self.label
                    )));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return self.read_json(response).await;
            }

            let body_text = response.text().await.unwrap_or_default();
            let err = RelationError::oracle(format!("{} API error {status}: {body_text}", self.label));
            if status.as_u16() == 429 || status.is_server_error() {
                last_err = Some(err);
                continue;
            }
            return Err(err);
        }

        Err(last_err.unwrap_or_else(|| {
            RelationError::oracle(format!("{} request failed after retries", self.label))
        }))
    }

    async fn read_json(&self, response: reqwest::Response) -> Result<Value> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !is_json_content_type(&content_type) {
            return Err(RelationError::oracle(format!(
                "{} returned non-JSON content-type '{content_type}'",
                self.label
            )));
        }
        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                RelationError::Timeout(self.timeout)
            } else {
                RelationError::oracle(format!("{} returned malformed JSON: {e}", self.label))
            }
        })
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || mime.ends_with("+json")
}

/// Bounds every `embed` call of the wrapped oracle.
pub struct TimeoutEmbedder {
    inner: Box<dyn EmbeddingOracle>,
    timeout: Duration,
}

impl TimeoutEmbedder {
    pub fn new(inner: Box<dyn EmbeddingOracle>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl EmbeddingOracle for TimeoutEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        tokio::time::timeout(self.timeout, self.inner.embed(text))
            .await
            .map_err(|_| RelationError::Timeout(self.timeout))?
    }
}

/// Bounds every `generate` call of the wrapped oracle.
pub struct TimeoutGenerator {
    inner: Box<dyn TextGenerator>,
    timeout: Duration,
}

impl TimeoutGenerator {
    pub fn new(inner: Box<dyn TextGenerator>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl TextGenerator for TimeoutGenerator {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        tokio::time::timeout(self.timeout, self.inner.generate(system_prompt, user_prompt))
            .await
            .map_err(|_| RelationError::Timeout(self.timeout))?
    }
}
