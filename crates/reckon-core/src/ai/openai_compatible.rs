//! OpenAI-compatible backend implementation
//!
//! Works with any server that implements the OpenAI chat completions API:
//! - Docker Model Runner (http://localhost:12434)
//! - vLLM (http://localhost:8000)
//! - LocalAI (http://localhost:8080)
//! - llama-server / llama.cpp (http://localhost:8080)
//! - hosted OpenAI-compatible APIs
//!
//! # Configuration
//!
//! Environment variables:
//! - `OPENAI_COMPATIBLE_HOST`: Server URL (required)
//! - `OPENAI_COMPATIBLE_MODEL`: Model name (default: gpt-3.5-turbo)
//! - `OPENAI_COMPATIBLE_API_KEY`: API key if required (optional)

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::prompts::{Prompt, PromptId};

use super::parsing::parse_batch_response;
use super::types::{BatchResponse, CategorizeItem};
use super::{render_items, CategorizationBackend};

/// OpenAI-compatible backend
#[derive(Clone)]
pub struct OpenAICompatibleBackend {
    http_client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAICompatibleBackend {
    /// Create a new OpenAI-compatible backend
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: None,
        }
    }

    /// Create with an API key
    pub fn with_api_key(base_url: &str, model: &str, api_key: &str) -> Self {
        let mut backend = Self::new(base_url, model);
        backend.api_key = Some(api_key.to_string());
        backend
    }

    /// Create a new instance with a different model
    pub fn with_model(&self, model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..self.clone()
        }
    }

    /// Create from environment variables
    ///
    /// Required: `OPENAI_COMPATIBLE_HOST`
    /// Optional: `OPENAI_COMPATIBLE_MODEL` (default: gpt-3.5-turbo)
    /// Optional: `OPENAI_COMPATIBLE_API_KEY`
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("OPENAI_COMPATIBLE_HOST").ok()?;
        let model = std::env::var("OPENAI_COMPATIBLE_MODEL")
            .unwrap_or_else(|_| "gpt-3.5-turbo".to_string());

        let mut backend = Self::new(&host, &model);
        backend.api_key = std::env::var("OPENAI_COMPATIBLE_API_KEY").ok();
        Some(backend)
    }

    pub fn host(&self) -> &str {
        &self.base_url
    }

    /// Make a chat completion request, returning the content and token usage
    async fn chat_completion(&self, system: &str, user: &str) -> Result<(String, u64)> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(0.1),
            stream: false,
        };

        let mut req_builder = self
            .http_client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request);

        if let Some(ref api_key) = self.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req_builder.send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited(self.base_url.clone()));
        }
        if status.is_server_error() {
            if let Err(e) = response.error_for_status_ref() {
                return Err(Error::Http(e));
            }
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(%status, body = %body, "OpenAI API rejected the request");
            return Err(Error::Llm(format!(
                "OpenAI API error {} ({} byte body)",
                status,
                body.len()
            )));
        }

        let chat_response: ChatCompletionResponse = response.json().await?;
        let tokens = chat_response.usage.map(|u| u.total_tokens).unwrap_or(0);

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| (c.message.content, tokens))
            .ok_or_else(|| Error::Llm("No response from OpenAI API".into()))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

#[async_trait]
impl CategorizationBackend for OpenAICompatibleBackend {
    async fn categorize(&self, items: &[CategorizeItem]) -> Result<BatchResponse> {
        let prompt = Prompt::load(PromptId::CategorizeTransactions)?;
        let lines = render_items(items);
        let mut vars = HashMap::new();
        vars.insert("items", lines.as_str());

        let (content, tokens_used) = self
            .chat_completion(
                prompt.system_section().unwrap_or_default(),
                &prompt.render_user(&vars),
            )
            .await?;
        debug!(items = items.len(), tokens_used, "Chat completion answered");

        Ok(BatchResponse {
            results: parse_batch_response(&content, items.len())?,
            tokens_used,
        })
    }

    async fn health_check(&self) -> bool {
        let mut req = self.http_client.get(format!("{}/v1/models", self.base_url));
        if let Some(ref api_key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }
        req.send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn provider_name(&self) -> &str {
        "openai_compatible"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
