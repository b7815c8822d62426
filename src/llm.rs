//! Text-generation oracle implementations.
//!
//! - **[`DisabledGenerator`]**: fails every call.
//! - **[`OpenAIGenerator`]**: chat completions on the OpenAI API or any
//!   OpenAI-compatible base url.
//! - **[`OllamaGenerator`]**: `POST /api/chat` with `stream: false`.
//!
//! Responses that are not JSON (an HTML error page from a proxy, say) are
//! rejected by [`HttpClient`] before they reach the classifier.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use relate_core::classify::TextGenerator;
use relate_core::{RelationError, Result};
use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::oracle::HttpClient;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
        Err(RelationError::oracle(
            "llm provider is disabled; set [llm].provider in the config",
        ))
    }
}

fn messages(system_prompt: &str, user_prompt: &str) -> Value {
    json!([
        { "role": "system", "content": system_prompt },
        { "role": "user", "content": user_prompt },
    ])
}

pub struct OpenAIGenerator {
    model: String,
    temperature: f32,
    url: String,
    api_key: String,
    http: HttpClient,
}

impl OpenAIGenerator {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config.url.as_deref().unwrap_or(OPENAI_BASE_URL);

        Ok(Self {
            model,
            temperature: config.temperature,
            url: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            api_key,
            http: HttpClient::new("OpenAI", config.timeout(), config.max_retries)?,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": messages(system_prompt, user_prompt),
        });
        let response = self
            .http
            .post_json(&self.url, Some(&self.api_key), &body)
            .await?;
        parse_openai_content(&response)
    }
}

pub struct OllamaGenerator {
    model: String,
    temperature: f32,
    url: String,
    http: HttpClient,
}

impl OllamaGenerator {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("llm.model required for Ollama provider"))?;
        let base = config.url.as_deref().unwrap_or(OLLAMA_BASE_URL);

        Ok(Self {
            model,
            temperature: config.temperature,
            url: format!("{}/api/chat", base.trim_end_matches('/')),
            http: HttpClient::new("Ollama", config.timeout(), config.max_retries)?,
        })
    }
}

#[async_trait]
impl TextGenerator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "stream": false,
            "options": { "temperature": self.temperature },
            "messages": messages(system_prompt, user_prompt),
        });
        let response = self.http.post_json(&self.url, None, &body).await?;
        parse_ollama_content(&response)
    }
}

/// `choices[0].message.content`.
fn parse_openai_content(json: &Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RelationError::oracle("Invalid chat response: missing choices[0].message.content"))
}

/// `message.content`.
fn parse_ollama_content(json: &Value) -> Result<String> {
    json.pointer("/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RelationError::oracle("Invalid Ollama response: missing message.content"))
}

/// Create the configured [`TextGenerator`].
pub fn create_generator(config: &LlmConfig) -> anyhow::Result<Box<dyn TextGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledGenerator)),
        "openai" => Ok(Box::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Box::new(OllamaGenerator::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_content() {
        let json = json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "[]"}}]
        });
        assert_eq!(parse_openai_content(&json).unwrap(), "[]");
        assert!(parse_openai_content(&json!({"choices": []})).is_err());
    }

    #[test]
    fn test_parse_ollama_content() {
        let json = json!({"message": {"role": "assistant", "content": "```json\n[]\n```"}, "done": true});
        assert_eq!(parse_ollama_content(&json).unwrap(), "```json\n[]\n```");
        assert!(matches!(
            parse_ollama_content(&json!({"error": "model not found"})),
            Err(RelationError::Oracle(_))
        ));
    }

    #[test]
    fn test_messages_shape() {
        let m = messages("sys", "usr");
        assert_eq!(m[0]["role"], "system");
        assert_eq!(m[1]["content"], "usr");
    }

    #[tokio::test]
    async fn test_disabled_generator() {
        let generator = create_generator(&LlmConfig::default()).unwrap();
        assert_eq!(generator.model_name(), "disabled");
        assert!(generator.generate("s", "u").await.is_err());
    }

    #[test]
    fn test_ollama_requires_model() {
        let config = LlmConfig {
            provider: "ollama".into(),
            ..LlmConfig::default()
        };
        assert!(create_generator(&config).is_err());
    }
}
