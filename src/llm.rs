//! Chat-completion collaborator.
//!
//! Every model call ends in an [`LlmReply`]: plain text on success, an
//! [`LlmError`] otherwise. Nothing downstream inspects provider response
//! shapes.
//!
//! Providers:
//! - [`DisabledModel`]: always returns [`LlmError::Disabled`].
//! - [`OpenAIChat`]: OpenAI-compatible `/v1/chat/completions`.
//! - [`OllamaChat`]: Ollama `/api/chat` with streaming off.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{LlmError, LlmReply};
use crate::http::{self, HttpFailure};

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Send one user prompt and return the assistant's text.
    async fn chat(&self, prompt: &str) -> LlmReply;
}

/// Remove a surrounding Markdown code fence (```` ``` ```` or ```` ```json ````).
///
/// Text without a fence is returned trimmed.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) on the opening line.
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    body.trim_end().trim_end_matches("```").trim()
}

impl From<HttpFailure> for LlmError {
    fn from(failure: HttpFailure) -> Self {
        match failure {
            HttpFailure::Status { status, body, .. } => LlmError::Status { status, body },
            HttpFailure::Transport { message, .. } => LlmError::Transport(message),
            HttpFailure::Decode { message, .. } => LlmError::Malformed(message),
        }
    }
}

fn non_empty(text: Option<&str>) -> LlmReply {
    match text {
        Some(t) if !t.trim().is_empty() => Ok(t.to_string()),
        Some(_) => Err(LlmError::Empty),
        None => Err(LlmError::Malformed("missing message content".to_string())),
    }
}

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn chat(&self, _prompt: &str) -> LlmReply {
        Err(LlmError::Disabled)
    }
}

/// OpenAI-compatible chat completions. Reads `OPENAI_API_KEY`.
pub struct OpenAIChat {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            model,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, prompt: &str) -> LlmReply {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let json: Value = http::post_json(
            &self.client,
            &url,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI chat",
        )
        .await?;

        non_empty(json.pointer("/choices/0/message/content").and_then(|v| v.as_str()))
    }
}

/// Local Ollama chat endpoint.
pub struct OllamaChat {
    client: reqwest::Client,
    model: String,
    url: String,
    temperature: f32,
    max_retries: u32,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, prompt: &str) -> LlmReply {
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "options": { "temperature": self.temperature },
            "messages": [{ "role": "user", "content": prompt }],
        });
        let url = format!("{}/api/chat", self.url.trim_end_matches('/'));
        let json: Value =
            http::post_json(&self.client, &url, None, &body, self.max_retries, "Ollama chat")
                .await?;

        non_empty(json.pointer("/message/content").and_then(|v| v.as_str()))
    }
}

pub fn create_language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChat::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
