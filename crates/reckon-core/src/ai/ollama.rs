//! Ollama backend implementation
//!
//! HTTP client for the Ollama `/api/generate` endpoint.

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

/// Ollama backend
#[derive(Clone)]
pub struct OllamaBackend {
    http_client: Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    /// Create a new instance with a different model
    pub fn with_model(&self, model: &str) -> Self {
        Self {
            http_client: self.http_client.clone(),
            base_url: self.base_url.clone(),
            model: model.to_string(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("OLLAMA_HOST").ok()?;
        let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2".to_string());
        Some(Self::new(&host, &model))
    }

    pub fn host(&self) -> &str {
        &self.base_url
    }
}

/// Request to Ollama API
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: &'static str,
}

/// Response from Ollama API
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[async_trait]
impl CategorizationBackend for OllamaBackend {
    async fn categorize(&self, items: &[CategorizeItem]) -> Result<BatchResponse> {
        let prompt = Prompt::load(PromptId::CategorizeTransactions)?;
        let lines = render_items(items);
        let mut vars = HashMap::new();
        vars.insert("items", lines.as_str());

        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.render_full(&vars),
            stream: false,
            format: "json",
        };

        let response = self
            .http_client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited("ollama".to_string()));
        }
        if status.is_server_error() {
            if let Err(e) = response.error_for_status_ref() {
                return Err(Error::Http(e));
            }
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(%status, body = %body, "Ollama API rejected the request");
            return Err(Error::Llm(format!(
                "Ollama API error {} ({} byte body)",
                status,
                body.len()
            )));
        }

        let ollama_response: OllamaResponse = response.json().await?;
        debug!(
            items = items.len(),
            tokens = ollama_response.prompt_eval_count + ollama_response.eval_count,
            "Ollama batch answered"
        );

        Ok(BatchResponse {
            results: parse_batch_response(&ollama_response.response, items.len())?,
            tokens_used: ollama_response.prompt_eval_count + ollama_response.eval_count,
        })
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
