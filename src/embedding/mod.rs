//! Embedding oracle implementations.
//!
//! Concrete [`EmbeddingOracle`]s selected by `[embedding].provider`:
//! - **[`DisabledEmbedder`]**: fails every call; used when embeddings are not configured.
//! - **[`OpenAIEmbedder`]**: `POST /v1/embeddings` on the OpenAI API or a compatible server.
//! - **[`OllamaEmbedder`]**: `POST /api/embed` on a local Ollama instance.
//! - **`LocalEmbedder`**: fastembed inference, behind the `local-embeddings` feature.
//!
//! Use [`create_embedder`] to build the configured oracle:
//!
//! ```rust
//! # use relate::config::EmbeddingConfig;
//! # use relate::embedding::create_embedder;
//! # use relate_core::embedding::EmbeddingOracle;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.model_name(), "disabled");
//! ```

#[cfg(feature = "local-embeddings")]
mod local;

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use relate_core::embedding::EmbeddingOracle;
use relate_core::{RelationError, Result};
use serde_json::{json, Value};

use crate::config::EmbeddingConfig;
use crate::oracle::HttpClient;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Always fails; indexing is unavailable until a provider is configured.
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingOracle for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(RelationError::oracle(
            "embedding provider is disabled; set [embedding].provider in the config",
        ))
    }
}

/// Embeddings from the OpenAI API (or an OpenAI-compatible server).
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    http: HttpClient,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config.url.as_deref().unwrap_or(OPENAI_BASE_URL);

        Ok(Self {
            model,
            dims,
            url: format!("{}/v1/embeddings", base.trim_end_matches('/')),
            api_key,
            http: HttpClient::new("OpenAI", config.timeout(), config.max_retries)?,
        })
    }
}

#[async_trait]
impl EmbeddingOracle for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({ "model": self.model, "input": [text] });
        let response = self
            .http
            .post_json(&self.url, Some(&self.api_key), &body)
            .await?;
        first_vector(parse_openai_response(&response)?, self.dims)
    }
}

/// Embeddings from a local Ollama instance.
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    http: HttpClient,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for Ollama provider"))?;
        let base = config.url.as_deref().unwrap_or(OLLAMA_BASE_URL);

        Ok(Self {
            model,
            dims,
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            http: HttpClient::new("Ollama", config.timeout(), config.max_retries)?,
        })
    }
}

#[async_trait]
impl EmbeddingOracle for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({ "model": self.model, "input": [text] });
        let response = self.http.post_json(&self.url, None, &body).await?;
        first_vector(parse_ollama_response(&response)?, self.dims)
    }
}

fn to_vector(value: &Value) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| RelationError::oracle("embedding is not an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| RelationError::oracle("embedding contains a non-number"))
        })
        .collect()
}

/// Extract `data[].embedding`, ordered by `index` when present.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| RelationError::oracle("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| RelationError::oracle("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map_or(pos, |i| i as usize);
        indexed.push((index, to_vector(embedding)?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Extract `embeddings[]`.
fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| RelationError::oracle("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(to_vector)
        .collect()
}

/// The single vector of a one-text request, checked against `dims`.
fn first_vector(vectors: Vec<Vec<f32>>, dims: usize) -> Result<Vec<f32>> {
    let vector = vectors
        .into_iter()
        .next()
        .ok_or_else(|| RelationError::oracle("Empty embedding response"))?;
    if vector.len() != dims {
        return Err(RelationError::oracle(format!(
            "embedding has {} dimensions, expected {dims}",
            vector.len()
        )));
    }
    Ok(vector)
}

/// Create the configured [`EmbeddingOracle`].
///
/// | Config Value | Oracle |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires `--features local-embeddings`) |
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Box<dyn EmbeddingOracle>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "openai" => Ok(Box::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Box::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
