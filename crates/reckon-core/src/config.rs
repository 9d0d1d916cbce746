//! Configuration for matching, enrichment and job execution
//!
//! ## Configuration Resolution
//!
//! Config is loaded with a two-layer resolution:
//! 1. An explicit path, or the override in the data dir
//!    (~/.local/share/reckon/config/reckon.toml)
//! 2. Fall back to embedded defaults (compiled into binary)
//!
//! An override is applied on top of the embedded defaults, so keys missing
//! from it keep their default values. Map sections (`[providers.*]`,
//! `[currency.rates]`, `[matcher.merchant_date_tolerance]`) merge per key.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::currency::ExchangeRates;
use crate::error::{Error, Result};

/// Embedded default config (compiled into binary)
const DEFAULT_CONFIG: &str = include_str!("../../../config/reckon.toml");

/// Matcher tolerances and acceptance policy
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub date_tolerance_days: i64,
    pub close_date_days: i64,
    pub amount_tolerance_percent: f64,
    pub amount_tolerance_fixed: f64,
    pub auto_accept_threshold: u8,
    pub min_store_confidence: u8,
    /// Canonical merchant id → candidate window in days
    pub merchant_date_tolerance: HashMap<String, i64>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            date_tolerance_days: 7,
            close_date_days: 3,
            amount_tolerance_percent: 0.02,
            amount_tolerance_fixed: 1.0,
            auto_accept_threshold: 70,
            min_store_confidence: 60,
            merchant_date_tolerance: HashMap::new(),
        }
    }
}

impl MatcherConfig {
    /// Candidate window for a receipt's merchant
    pub fn date_tolerance_for(&self, merchant: &str) -> i64 {
        self.merchant_date_tolerance
            .get(merchant)
            .copied()
            .unwrap_or(self.date_tolerance_days)
    }

    /// Absolute amount tolerance for a receipt total
    pub fn amount_tolerance_for(&self, total: f64) -> f64 {
        (total.abs() * self.amount_tolerance_percent).max(self.amount_tolerance_fixed)
    }
}

/// Per-provider batching and pricing
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderProfile {
    pub batch_size: usize,
    pub price_per_1k_tokens: f64,
}

impl Default for ProviderProfile {
    fn default() -> Self {
        Self {
            batch_size: 10,
            price_per_1k_tokens: 0.0,
        }
    }
}

/// LLM enrichment settings
#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Provider profile used when the backend doesn't name one we know
    pub provider: String,
    pub avg_tokens_per_transaction: u32,
    pub max_retries: i64,
    pub providers: HashMap<String, ProviderProfile>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            avg_tokens_per_transaction: 120,
            max_retries: 3,
            providers: HashMap::new(),
        }
    }
}

impl EnrichmentConfig {
    /// Profile for a provider, falling back to the configured default provider
    pub fn profile_for(&self, provider: &str) -> ProviderProfile {
        self.providers
            .get(provider)
            .or_else(|| self.providers.get(&self.provider))
            .cloned()
            .unwrap_or_default()
    }
}

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub concurrency: usize,
    pub unit_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            unit_timeout: Duration::from_secs(60),
            max_attempts: 4,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub matcher: MatcherConfig,
    pub rates: ExchangeRates,
    pub enrichment: EnrichmentConfig,
    pub jobs: JobsConfig,
    pub receipt_retention_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            rates: ExchangeRates::default(),
            enrichment: EnrichmentConfig::default(),
            jobs: JobsConfig::default(),
            receipt_retention_days: 730,
        }
    }
}

impl Config {
    /// Load configuration (override layered on the embedded default)
    pub fn load(override_path: Option<&Path>) -> Result<Self> {
        let path = override_path
            .map(Path::to_path_buf)
            .or_else(default_config_path);

        match path {
            Some(ref p) if p.exists() => {
                debug!(path = %p.display(), "Loading config override");
                let content = fs::read_to_string(p)
                    .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
                parse_config(&content)
            }
            _ => Self::embedded(),
        }
    }

    /// The embedded defaults only
    pub fn embedded() -> Result<Self> {
        parse_config(DEFAULT_CONFIG)
    }
}

/// Default config override path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("reckon").join("config").join("reckon.toml"))
}

/// Raw config structure for TOML parsing
#[derive(Debug, Deserialize)]
struct RawConfig {
    matcher: Option<RawMatcher>,
    currency: Option<RawCurrency>,
    enrichment: Option<RawEnrichment>,
    providers: Option<HashMap<String, RawProvider>>,
    jobs: Option<RawJobs>,
    retention: Option<RawRetention>,
}

#[derive(Debug, Deserialize)]
struct RawMatcher {
    date_tolerance_days: Option<i64>,
    close_date_days: Option<i64>,
    amount_tolerance_percent: Option<f64>,
    amount_tolerance_fixed: Option<f64>,
    auto_accept_threshold: Option<u8>,
    min_store_confidence: Option<u8>,
    merchant_date_tolerance: Option<HashMap<String, i64>>,
}

#[derive(Debug, Deserialize)]
struct RawCurrency {
    rates: Option<HashMap<String, f64>>,
}

#[derive(Debug, Deserialize)]
struct RawEnrichment {
    provider: Option<String>,
    avg_tokens_per_transaction: Option<u32>,
    max_retries: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawProvider {
    batch_size: Option<usize>,
    price_per_1k_tokens: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawJobs {
    concurrency: Option<usize>,
    unit_timeout_secs: Option<u64>,
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawRetention {
    receipt_retention_days: Option<i64>,
}

/// Parse an override on top of the embedded defaults
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config = Config::default();
    apply_layer(&mut config, DEFAULT_CONFIG)?;
    apply_layer(&mut config, content)?;

    if config.matcher.min_store_confidence > config.matcher.auto_accept_threshold {
        return Err(Error::Config(
            "min_store_confidence must not exceed auto_accept_threshold".into(),
        ));
    }
    Ok(config)
}

/// Overwrite the keys present in `content`
fn apply_layer(config: &mut Config, content: &str) -> Result<()> {
    let raw: RawConfig = toml::from_str(content)
        .map_err(|e| Error::Config(format!("Invalid config TOML: {}", e)))?;

    if let Some(m) = raw.matcher {
        let matcher = &mut config.matcher;
        if let Some(v) = m.date_tolerance_days {
            matcher.date_tolerance_days = v;
        }
        if let Some(v) = m.close_date_days {
            matcher.close_date_days = v;
        }
        if let Some(v) = m.amount_tolerance_percent {
            matcher.amount_tolerance_percent = v;
        }
        if let Some(v) = m.amount_tolerance_fixed {
            matcher.amount_tolerance_fixed = v;
        }
        if let Some(v) = m.auto_accept_threshold {
            matcher.auto_accept_threshold = v;
        }
        if let Some(v) = m.min_store_confidence {
            matcher.min_store_confidence = v;
        }
        if let Some(overrides) = m.merchant_date_tolerance {
            matcher.merchant_date_tolerance.extend(
                overrides
                    .into_iter()
                    .map(|(k, v)| (k.to_lowercase(), v)),
            );
        }
    }

    if let Some(rates) = raw.currency.and_then(|c| c.rates) {
        for (pair, rate) in rates {
            let (from, to) = pair
                .split_once('/')
                .ok_or_else(|| Error::Config(format!("Invalid currency pair: {}", pair)))?;
            config.rates.insert(from, to, rate);
        }
    }

    if let Some(e) = raw.enrichment {
        if let Some(v) = e.provider {
            config.enrichment.provider = v;
        }
        if let Some(v) = e.avg_tokens_per_transaction {
            config.enrichment.avg_tokens_per_transaction = v;
        }
        if let Some(v) = e.max_retries {
            config.enrichment.max_retries = v;
        }
    }

    if let Some(providers) = raw.providers {
        for (name, p) in providers {
            let defaults = config
                .enrichment
                .providers
                .get(&name)
                .cloned()
                .unwrap_or_default();
            config.enrichment.providers.insert(
                name,
                ProviderProfile {
                    batch_size: p.batch_size.unwrap_or(defaults.batch_size).max(1),
                    price_per_1k_tokens: p
                        .price_per_1k_tokens
                        .unwrap_or(defaults.price_per_1k_tokens),
                },
            );
        }
    }

    if let Some(j) = raw.jobs {
        if let Some(v) = j.concurrency {
            config.jobs.concurrency = v.max(1);
        }
        if let Some(v) = j.unit_timeout_secs {
            config.jobs.unit_timeout = Duration::from_secs(v);
        }
        if let Some(v) = j.max_attempts {
            config.jobs.max_attempts = v.max(1);
        }
        if let Some(v) = j.backoff_base_ms {
            config.jobs.backoff_base = Duration::from_millis(v);
        }
        if let Some(v) = j.backoff_max_ms {
            config.jobs.backoff_max = Duration::from_millis(v);
        }
    }

    if let Some(v) = raw.retention.and_then(|r| r.receipt_retention_days) {
        config.receipt_retention_days = v;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_config() {
        let config = parse_config(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.matcher.date_tolerance_days, 7);
        assert_eq!(config.matcher.auto_accept_threshold, 70);
        assert_eq!(config.matcher.date_tolerance_for("amazon"), 14);
        assert_eq!(config.matcher.date_tolerance_for("tesco"), 7);
        assert_eq!(config.enrichment.max_retries, 3);
        assert_eq!(config.enrichment.profile_for("ollama").batch_size, 5);
        assert_eq!(config.enrichment.profile_for("openai_compatible").batch_size, 25);
        assert_eq!(config.jobs.unit_timeout, Duration::from_secs(60));
        assert_eq!(config.rates.rate("EUR", "GBP"), Some(0.86));
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let config = parse_config(
            r#"
            [matcher]
            date_tolerance_days = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.matcher.date_tolerance_days, 10);
        assert_eq!(config.matcher.close_date_days, 3);
        assert_eq!(config.jobs.concurrency, 4);
        // Sections the override never mentions come from the embedded file
        assert_eq!(config.enrichment.profile_for("openai_compatible").batch_size, 25);
        assert_eq!(
            config.enrichment.profile_for("openai_compatible").price_per_1k_tokens,
            0.002
        );
        assert_eq!(config.matcher.date_tolerance_for("amazon"), 14);
        assert_eq!(config.rates.rate("EUR", "GBP"), Some(0.86));
    }

    #[test]
    fn test_override_maps_merge_per_key() {
        let config = parse_config(
            r#"
            [matcher.merchant_date_tolerance]
            argos = 10

            [currency.rates]
            "EUR/GBP" = 0.9

            [providers.openai_compatible]
            batch_size = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.matcher.date_tolerance_for("argos"), 10);
        assert_eq!(config.matcher.date_tolerance_for("amazon"), 14);
        assert_eq!(config.rates.rate("EUR", "GBP"), Some(0.9));
        assert_eq!(config.rates.rate("USD", "GBP"), Some(0.79));
        let profile = config.enrichment.profile_for("openai_compatible");
        assert_eq!(profile.batch_size, 50);
        assert_eq!(profile.price_per_1k_tokens, 0.002);
        assert_eq!(config.enrichment.profile_for("ollama").batch_size, 5);
    }

    #[test]
    fn test_unknown_provider_uses_default_profile() {
        let config = parse_config(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.enrichment.profile_for("something-else").batch_size, 5);
    }

    #[test]
    fn test_amount_tolerance_uses_larger_bound() {
        let matcher = MatcherConfig::default();
        assert_eq!(matcher.amount_tolerance_for(10.0), 1.0);
        assert!((matcher.amount_tolerance_for(500.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let result = parse_config(
            r#"
            [matcher]
            auto_accept_threshold = 50
            min_store_confidence = 60
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_currency_pair_rejected() {
        let result = parse_config(
            r#"
            [currency.rates]
            "EURGBP" = 0.86
            "#,
        );
        assert!(result.is_err());
    }
}
