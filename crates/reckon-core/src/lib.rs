//! Reckon Core Library
//!
//! Receipt reconciliation and transaction enrichment:
//! - Database access and migrations (SQLCipher, pooled)
//! - Normalization and batch deduplication of provider records
//! - Merchant normalization through an alias table
//! - Receipt ↔ transaction matching with confidence scores
//! - Rule, LLM and receipt enrichment merged by precedence
//! - Cost-aware LLM enrichment on pluggable backends (Ollama, OpenAI-compatible)
//! - Persisted, cancellable jobs on a bounded worker pool

pub mod ai;
pub mod config;
pub mod currency;
pub mod db;
pub mod dedup;
pub mod enrich;
pub mod error;
pub mod jobs;
pub mod matcher;
pub mod merchant;
pub mod merge;
pub mod models;
pub mod normalize;
pub mod prompts;
pub mod retry;
pub mod rules;
pub mod sources;
pub mod sync;

/// Test utilities including a mock LLM server and in-memory sources
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use ai::{AIClient, CategorizationBackend, CategorizeItem, MockBackend, OllamaBackend, OpenAICompatibleBackend};
pub use config::Config;
pub use currency::ExchangeRates;
pub use db::Database;
pub use enrich::{CostEstimate, EnrichmentOrchestrator};
pub use error::{Error, Result};
pub use jobs::{JobCoordinator, JobHandle, JobOutcome};
pub use matcher::{MatchRun, Matcher};
pub use merchant::MerchantNormalizer;
pub use prompts::{Prompt, PromptId};
pub use rules::RuleEngine;
pub use sources::{Aggregator, DateWindow, JsonFileAggregator, JsonFileReceiptSource, ReceiptClient};
pub use sync::{SyncReport, SyncService};
