//! Pluggable LLM backend abstraction
//!
//! # Architecture
//!
//! - `CategorizationBackend` trait: batch categorization of privacy-safe items
//! - `AIClient` enum: concrete wrapper providing Clone + compile-time dispatch
//! - Backend implementations: `OllamaBackend`, `OpenAICompatibleBackend`, `MockBackend`
//!
//! # Configuration
//!
//! Environment variables:
//! - `AI_BACKEND`: Backend to use (ollama, openai_compatible, mock). Default: ollama
//! - `OLLAMA_HOST`: Ollama server URL (required for ollama backend)
//! - `OLLAMA_MODEL`: Default model name (default: llama3.2)
//! - `OPENAI_COMPATIBLE_HOST`: Server URL (required for openai_compatible backend)
//! - `OPENAI_COMPATIBLE_MODEL`: Model name (default: gpt-3.5-turbo)
//! - `OPENAI_COMPATIBLE_API_KEY`: API key if required (optional)

mod mock;
mod ollama;
mod openai_compatible;
pub mod parsing;
pub mod types;

pub use mock::MockBackend;
pub use ollama::OllamaBackend;
pub use openai_compatible::OpenAICompatibleBackend;
pub use types::*;

use async_trait::async_trait;

use crate::error::Result;

/// Interface every LLM backend implements
#[async_trait]
pub trait CategorizationBackend: Send + Sync {
    /// Categorize a batch; `results` is aligned with `items`
    ///
    /// An `Err` means the whole call failed (transport, rate limit, garbage
    /// output). Items the model declined come back as `ItemResult::Failed`.
    async fn categorize(&self, items: &[CategorizeItem]) -> Result<BatchResponse>;

    /// Check if the backend is reachable
    async fn health_check(&self) -> bool;

    /// Provider profile name used for batching and pricing
    fn provider_name(&self) -> &str;

    /// Get the model name (recorded on results)
    fn model(&self) -> &str;
}

/// Render items as numbered prompt lines
pub(crate) fn render_items(items: &[CategorizeItem]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| item.prompt_line(i))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Concrete AI client enum
#[derive(Clone)]
pub enum AIClient {
    /// Ollama backend (HTTP API)
    Ollama(OllamaBackend),
    /// OpenAI-compatible backend (Docker Model Runner, vLLM, LocalAI, hosted APIs)
    OpenAICompatible(OpenAICompatibleBackend),
    /// Mock backend for testing
    Mock(MockBackend),
}

impl AIClient {
    /// Create an AI client from environment variables
    ///
    /// Returns None if the required environment variables are not set.
    pub fn from_env() -> Option<Self> {
        let backend = std::env::var("AI_BACKEND").unwrap_or_else(|_| "ollama".to_string());

        match backend.to_lowercase().as_str() {
            "ollama" => OllamaBackend::from_env().map(AIClient::Ollama),
            "openai_compatible" | "openai" | "vllm" | "localai" | "llamacpp" => {
                OpenAICompatibleBackend::from_env().map(AIClient::OpenAICompatible)
            }
            "mock" => Some(AIClient::Mock(MockBackend::new())),
            _ => {
                tracing::warn!(backend = %backend, "Unknown AI_BACKEND, falling back to ollama");
                OllamaBackend::from_env().map(AIClient::Ollama)
            }
        }
    }

    /// Create an Ollama backend directly
    pub fn ollama(host: &str, model: &str) -> Self {
        AIClient::Ollama(OllamaBackend::new(host, model))
    }

    /// Create an OpenAI-compatible backend directly
    pub fn openai_compatible(host: &str, model: &str) -> Self {
        AIClient::OpenAICompatible(OpenAICompatibleBackend::new(host, model))
    }

    /// Create a mock backend for testing
    pub fn mock() -> Self {
        AIClient::Mock(MockBackend::new())
    }

    /// Create a new instance with a different model
    pub fn with_model(&self, model: &str) -> Self {
        match self {
            AIClient::Ollama(b) => AIClient::Ollama(b.with_model(model)),
            AIClient::OpenAICompatible(b) => AIClient::OpenAICompatible(b.with_model(model)),
            AIClient::Mock(b) => AIClient::Mock(b.with_model(model)),
        }
    }

    /// Host URL for logging
    pub fn host(&self) -> &str {
        match self {
            AIClient::Ollama(b) => b.host(),
            AIClient::OpenAICompatible(b) => b.host(),
            AIClient::Mock(_) => "mock",
        }
    }
}

// Implement CategorizationBackend for AIClient by delegating to the inner backend
#[async_trait]
impl CategorizationBackend for AIClient {
    async fn categorize(&self, items: &[CategorizeItem]) -> Result<BatchResponse> {
        match self {
            AIClient::Ollama(b) => b.categorize(items).await,
            AIClient::OpenAICompatible(b) => b.categorize(items).await,
            AIClient::Mock(b) => b.categorize(items).await,
        }
    }

    async fn health_check(&self) -> bool {
        match self {
            AIClient::Ollama(b) => b.health_check().await,
            AIClient::OpenAICompatible(b) => b.health_check().await,
            AIClient::Mock(b) => b.health_check().await,
        }
    }

    fn provider_name(&self) -> &str {
        match self {
            AIClient::Ollama(b) => b.provider_name(),
            AIClient::OpenAICompatible(b) => b.provider_name(),
            AIClient::Mock(b) => b.provider_name(),
        }
    }

    fn model(&self) -> &str {
        match self {
            AIClient::Ollama(b) => b.model(),
            AIClient::OpenAICompatible(b) => b.model(),
            AIClient::Mock(b) => b.model(),
        }
    }
}
