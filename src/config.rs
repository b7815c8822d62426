//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults.
//! [`load_config`] parses and validates; [`Config::from_toml_str`] does the
//! same for an in-memory string.

use anyhow::{bail, Context, Result};
use relate_core::decompose::FullContextBudget;
use relate_core::select::ComparisonParams;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub comparison: ComparisonConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmentationConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
            concurrency: default_concurrency(),
        }
    }
}

/// Model used by the `local` provider when `embedding.model` is unset.
pub const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Name the configured embedder reports, and the key cached vectors
    /// are stored under.
    pub fn model_name(&self) -> &str {
        match self.provider.as_str() {
            "disabled" => "disabled",
            _ => self.model.as_deref().unwrap_or(DEFAULT_LOCAL_MODEL),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
            temperature: default_temperature(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_embedding_timeout() -> u64 {
    30
}
fn default_embedding_retries() -> u32 {
    5
}
fn default_concurrency() -> usize {
    8
}
fn default_llm_timeout() -> u64 {
    180
}
fn default_llm_retries() -> u32 {
    2
}
fn default_temperature() -> f32 {
    0.2
}

/// Comparison defaults for interactive and automatic runs.
#[derive(Debug, Deserialize, Clone)]
pub struct ComparisonConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_auto_threshold")]
    pub auto_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_auto_top_k")]
    pub auto_top_k: usize,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_reserved_tokens")]
    pub reserved_tokens: usize,
    #[serde(default = "default_segments_per_batch")]
    pub segments_per_batch: usize,
    #[serde(default = "default_concurrency")]
    pub retrieval_concurrency: usize,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            auto_threshold: default_auto_threshold(),
            top_k: default_top_k(),
            auto_top_k: default_auto_top_k(),
            token_budget: default_token_budget(),
            reserved_tokens: default_reserved_tokens(),
            segments_per_batch: default_segments_per_batch(),
            retrieval_concurrency: default_concurrency(),
        }
    }
}

impl ComparisonConfig {
    /// Parameters for a user-directed comparison.
    pub fn interactive(&self) -> ComparisonParams {
        ComparisonParams::new(self.threshold, self.top_k)
    }

    /// Parameters for an unattended sweep. By default the similarity floor
    /// is lower than the interactive one (0.50 against 0.75) and fewer
    /// candidates reach the classifier per passage (3 against 5).
    pub fn automatic(&self) -> ComparisonParams {
        ComparisonParams::new(self.auto_threshold, self.auto_top_k)
    }

    pub fn budget(&self) -> FullContextBudget {
        FullContextBudget {
            token_budget: self.token_budget,
            reserved_tokens: self.reserved_tokens,
            segments_per_batch: self.segments_per_batch,
        }
    }
}

fn default_threshold() -> f32 {
    0.75
}
fn default_auto_threshold() -> f32 {
    0.50
}
fn default_top_k() -> usize {
    5
}
fn default_auto_top_k() -> usize {
    3
}
fn default_token_budget() -> usize {
    800_000
}
fn default_reserved_tokens() -> usize {
    50_000
}
fn default_segments_per_batch() -> usize {
    1
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.segmentation.max_tokens == 0 {
            bail!("segmentation.max_tokens must be > 0");
        }

        let cmp = &self.comparison;
        for (name, value) in [
            ("comparison.threshold", cmp.threshold),
            ("comparison.auto_threshold", cmp.auto_threshold),
        ] {
            if !value.is_finite() {
                bail!("{name} must be a finite number");
            }
        }
        if cmp.top_k < 1 || cmp.auto_top_k < 1 {
            bail!("comparison.top_k and comparison.auto_top_k must be >= 1");
        }
        if cmp.token_budget <= cmp.reserved_tokens {
            bail!(
                "comparison.token_budget ({}) must exceed comparison.reserved_tokens ({})",
                cmp.token_budget,
                cmp.reserved_tokens
            );
        }
        if cmp.segments_per_batch < 1 {
            bail!("comparison.segments_per_batch must be >= 1");
        }
        if cmp.retrieval_concurrency < 1 || self.embedding.concurrency < 1 {
            bail!("concurrency settings must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" | "local" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
                other
            ),
        }
        if self.embedding.is_enabled() && self.embedding.provider != "local" {
            if self.embedding.dims.unwrap_or(0) == 0 {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        match self.llm.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown llm provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if self.llm.is_enabled() && self.llm.model.is_none() {
            bail!(
                "llm.model must be specified when provider is '{}'",
                self.llm.provider
            );
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml_str(&content)
}
