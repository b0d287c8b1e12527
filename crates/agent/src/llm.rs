//! HTTP adapters for the text-generation providers the oracles run on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use parley_core::config::{LlmConfig, LlmProvider};

const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com";
const DEFAULT_ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const DEFAULT_OLLAMA_BASE: &str = "http://localhost:11434";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 1024;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm provider is misconfigured: {0}")]
    Configuration(String),
    #[error("llm request timed out")]
    Timeout,
    #[error("llm request failed: {0}")]
    Transport(String),
    #[error("llm provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response could not be read: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_decode() {
            Self::Malformed(error.to_string())
        } else {
            Self::Transport(error.to_string())
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Runs one completion and returns the raw text of the first choice.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

pub struct HttpLlmClient {
    client: Client,
    provider: LlmProvider,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        if matches!(config.provider, LlmProvider::OpenAi | LlmProvider::Anthropic)
            && config.api_key.is_none()
        {
            return Err(LlmError::Configuration(format!(
                "{} requires an api key",
                config.provider.as_str()
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|error| LlmError::Configuration(error.to_string()))?;

        let default_base = match config.provider {
            LlmProvider::OpenAi => DEFAULT_OPENAI_BASE,
            LlmProvider::Anthropic => DEFAULT_ANTHROPIC_BASE,
            LlmProvider::Ollama => DEFAULT_OLLAMA_BASE,
        };
        let base_url = config
            .base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(default_base)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            provider: config.provider,
            base_url,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    fn api_key(&self) -> Result<&str, LlmError> {
        self.api_key.as_ref().map(|key| key.expose_secret()).ok_or_else(|| {
            LlmError::Configuration(format!("{} requires an api key", self.provider.as_str()))
        })
    }

    async fn post(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, LlmError> {
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body: truncate(&body, 320) });
        }
        Ok(response)
    }

    async fn complete_openai(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
            "response_format": { "type": "json_object" },
        });
        let request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(self.api_key()?)
            .json(&payload);

        let body: OpenAiResponse = self.post(request).await?.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Malformed("response did not include a choice".to_string()))
    }

    async fn complete_anthropic(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let payload = json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "system": system,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key()?)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload);

        let body: AnthropicResponse = self.post(request).await?.json().await?;
        let text: String = body
            .content
            .into_iter()
            .filter(|block| block.content_type == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.is_empty() {
            return Err(LlmError::Malformed("response contained no text blocks".to_string()));
        }
        Ok(text)
    }

    async fn complete_ollama(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let payload = json!({
            "model": self.model,
            "system": system,
            "prompt": prompt,
            "format": "json",
            "stream": false,
        });
        let request = self.client.post(format!("{}/api/generate", self.base_url)).json(&payload);

        let body: OllamaResponse = self.post(request).await?.json().await?;
        Ok(body.response)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        match self.provider {
            LlmProvider::OpenAi => self.complete_openai(system, prompt).await,
            LlmProvider::Anthropic => self.complete_anthropic(system, prompt).await,
            LlmProvider::Ollama => self.complete_ollama(system, prompt).await,
        }
    }
}

/// Pulls the first JSON object out of model output, tolerating code fences
/// and prose around it.
pub fn extract_json_object(text: &str) -> Result<Value, LlmError> {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&text[start..=end])
            .map_err(|error| LlmError::Malformed(format!("invalid json object: {error}"))),
        _ => Err(LlmError::Malformed("no json object in response".to_string())),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut truncated: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        truncated.push('…');
    }
    truncated
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use parley_core::config::{LlmConfig, LlmProvider};

    use super::{extract_json_object, HttpLlmClient, LlmError};

    fn config(provider: LlmProvider, api_key: Option<&str>) -> LlmConfig {
        LlmConfig {
            provider,
            api_key: api_key.map(|key| SecretString::from(key.to_string())),
            base_url: None,
            model: "test-model".to_string(),
            timeout_secs: 5,
            max_retries: 0,
        }
    }

    #[test]
    fn hosted_providers_require_api_key() {
        let error = HttpLlmClient::from_config(&config(LlmProvider::Anthropic, None))
            .err()
            .expect("missing key must be rejected");
        assert!(matches!(error, LlmError::Configuration(_)));

        assert!(HttpLlmClient::from_config(&config(LlmProvider::Ollama, None)).is_ok());
        assert!(HttpLlmClient::from_config(&config(LlmProvider::OpenAi, Some("sk-test"))).is_ok());
    }

    #[test]
    fn base_url_defaults_per_provider_and_drops_trailing_slash() {
        let client = HttpLlmClient::from_config(&config(LlmProvider::OpenAi, Some("sk-test")))
            .expect("client");
        assert_eq!(client.base_url, "https://api.openai.com");

        let mut custom = config(LlmProvider::Ollama, None);
        custom.base_url = Some("http://gpu-box:11434/".to_string());
        let client = HttpLlmClient::from_config(&custom).expect("client");
        assert_eq!(client.base_url, "http://gpu-box:11434");
    }

    #[test]
    fn json_object_is_found_inside_fenced_output() {
        let raw = "Sure, here you go:\n```json\n{\"confidence\": 0.7, \"scriptStub\": \"hold\"}\n```";
        let value = extract_json_object(raw).expect("object");
        assert_eq!(value["scriptStub"], "hold");

        assert!(matches!(extract_json_object("no braces here"), Err(LlmError::Malformed(_))));
    }
}
