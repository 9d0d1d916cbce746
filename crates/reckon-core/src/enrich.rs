//! LLM enrichment orchestration
//!
//! Picks the transactions that still need a categorization, answers what it
//! can from the cache, sends the rest to the configured backend in
//! provider-sized batches and records per-item failures. Runs as a job on
//! the [`JobCoordinator`].
//!
//! Selection rules:
//! - a rule or LLM result means the transaction is already enriched
//!   (`force_refresh` re-asks the LLM but never overrides a rule);
//! - a recorded failure is only picked up by [`EnrichmentOrchestrator::retry_failed`];
//! - transactions sharing `(normalized description, direction)` are sent once.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ai::{AIClient, CategorizationBackend, CategorizeItem, ItemResult};
use crate::config::{EnrichmentConfig, JobsConfig};
use crate::db::{CacheEntry, Database};
use crate::error::{Error, Result};
use crate::jobs::{JobCoordinator, JobHandle, JobUnit, TimeoutAction, UnitReport};
use crate::models::{
    Direction, EnrichmentFailure, EnrichmentFields, FailureStatus, Job, JobKind, NewLlmEnrichment,
    Transaction,
};
use crate::normalize::normalize_description;
use crate::retry::{with_backoff, RetryPolicy};

type CacheKey = (String, Direction);

/// Pre-flight classification of an enrichment run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostEstimate {
    pub candidates: usize,
    pub already_enriched: usize,
    /// Waiting for an explicit retry (or permanently failed)
    pub previously_failed: usize,
    pub cache_hits: usize,
    pub requires_api_call: usize,
    /// Distinct cache keys among `requires_api_call`; one LLM item each
    pub unique_descriptions: usize,
    pub estimated_tokens: u64,
    pub estimated_cost_usd: f64,
    pub provider: String,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    Normal,
    Retry,
}

/// Transactions sharing one cache key
#[derive(Debug, Clone)]
struct KeyGroup {
    key: CacheKey,
    transactions: Vec<Transaction>,
}

#[derive(Debug)]
struct Plan {
    estimate: CostEstimate,
    cache_hits: Vec<(Transaction, CacheEntry)>,
    groups: Vec<KeyGroup>,
}

/// Work unit of an enrichment job
enum EnrichmentUnit {
    CacheHits(Vec<(Transaction, CacheEntry)>),
    Batch {
        index: usize,
        groups: Vec<KeyGroup>,
        max_retries: i64,
    },
}

impl JobUnit for EnrichmentUnit {
    fn label(&self) -> String {
        match self {
            EnrichmentUnit::CacheHits(_) => "cache".to_string(),
            EnrichmentUnit::Batch { index, .. } => format!("batch-{}", index),
        }
    }

    fn weight(&self) -> i64 {
        match self {
            EnrichmentUnit::CacheHits(hits) => hits.len() as i64,
            EnrichmentUnit::Batch { groups, .. } => {
                groups.iter().map(|g| g.transactions.len() as i64).sum()
            }
        }
    }

    /// A timed-out batch leaves a failure per transaction for explicit retry
    fn on_timeout(&self) -> Option<TimeoutAction> {
        let EnrichmentUnit::Batch {
            groups,
            max_retries,
            ..
        } = self
        else {
            return None;
        };
        let ids: Vec<i64> = groups
            .iter()
            .flat_map(|g| g.transactions.iter().map(|t| t.id))
            .collect();
        let max_retries = *max_retries;
        Some(Box::new(move |db: &Database, job_id: i64, error: &Error| {
            for id in &ids {
                db.record_llm_failure(
                    *id,
                    error.kind(),
                    &error.to_string(),
                    Some(job_id),
                    max_retries,
                )?;
            }
            Ok(())
        }))
    }
}

/// Coordinates cache lookups, LLM batches and failure tracking
pub struct EnrichmentOrchestrator {
    db: Database,
    backend: AIClient,
    config: EnrichmentConfig,
    jobs: JobsConfig,
}

impl EnrichmentOrchestrator {
    pub fn new(db: Database, backend: AIClient, config: EnrichmentConfig, jobs: JobsConfig) -> Self {
        Self {
            db,
            backend,
            config,
            jobs,
        }
    }

    /// Classify candidates and price the run without touching anything
    ///
    /// `ids` of `None` means every stored transaction.
    pub fn estimate(&self, ids: Option<&[i64]>, force_refresh: bool) -> Result<CostEstimate> {
        let candidates = self.load_candidates(ids)?;
        Ok(self.plan(candidates, force_refresh, Selection::Normal)?.estimate)
    }

    /// Start an enrichment job
    ///
    /// Fails with [`Error::CostNotConfirmed`] before any side effect unless
    /// `confirm_cost` is set.
    pub fn trigger(
        &self,
        ids: Option<&[i64]>,
        confirm_cost: bool,
        force_refresh: bool,
    ) -> Result<JobHandle> {
        let candidates = self.load_candidates(ids)?;
        let plan = self.plan(candidates, force_refresh, Selection::Normal)?;
        if !confirm_cost {
            return Err(Error::CostNotConfirmed(describe_cost(&plan.estimate)));
        }
        self.start(JobKind::Enrichment, plan)
    }

    /// Retry transactions whose failure is still pending
    pub fn retry_failed(&self, confirm_cost: bool) -> Result<JobHandle> {
        let ids = self.db.retryable_failure_ids()?;
        let candidates = self.db.get_transactions_by_ids(&ids)?;
        let plan = self.plan(candidates, false, Selection::Retry)?;
        if !confirm_cost {
            return Err(Error::CostNotConfirmed(describe_cost(&plan.estimate)));
        }
        self.start(JobKind::EnrichmentRetry, plan)
    }

    pub fn status(&self, job_id: i64) -> Result<Job> {
        self.db
            .get_job(job_id)?
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))
    }

    /// Request cancellation; in-flight batches finish, nothing new starts
    pub fn cancel(&self, job_id: i64) -> Result<bool> {
        self.db.request_job_cancel(job_id)
    }

    /// Failures that still need attention (pending and permanent)
    pub fn list_failed(&self) -> Result<Vec<EnrichmentFailure>> {
        let mut failures = self.db.list_llm_failures(Some(FailureStatus::Pending))?;
        failures.extend(self.db.list_llm_failures(Some(FailureStatus::Permanent))?);
        Ok(failures)
    }

    fn load_candidates(&self, ids: Option<&[i64]>) -> Result<Vec<Transaction>> {
        match ids {
            Some(ids) => self.db.get_transactions_by_ids(ids),
            None => self.db.list_transactions(None, -1, 0),
        }
    }

    fn plan(
        &self,
        candidates: Vec<Transaction>,
        force_refresh: bool,
        selection: Selection,
    ) -> Result<Plan> {
        let profile = self.config.profile_for(self.backend.provider_name());
        let mut estimate = CostEstimate {
            candidates: candidates.len(),
            provider: self.backend.provider_name().to_string(),
            batch_size: profile.batch_size,
            ..Default::default()
        };

        let ids: Vec<i64> = candidates.iter().map(|t| t.id).collect();
        let states = self.db.enrichment_states(&ids)?;

        let mut slots: HashMap<CacheKey, usize> = HashMap::new();
        let mut groups: Vec<KeyGroup> = Vec::new();
        for tx in candidates {
            let state = states.get(&tx.id).copied().unwrap_or_default();
            if state.has_rule || (state.has_llm && !force_refresh) {
                estimate.already_enriched += 1;
                continue;
            }
            let waiting = match selection {
                Selection::Normal => state.is_failed(),
                Selection::Retry => state.failure != Some(FailureStatus::Pending),
            };
            if waiting {
                estimate.previously_failed += 1;
                continue;
            }

            let key = (normalize_description(&tx.description), tx.direction);
            match slots.get(&key) {
                Some(&slot) => groups[slot].transactions.push(tx),
                None => {
                    slots.insert(key.clone(), groups.len());
                    groups.push(KeyGroup {
                        key,
                        transactions: vec![tx],
                    });
                }
            }
        }

        let mut cache = if force_refresh {
            HashMap::new()
        } else {
            let keys: Vec<CacheKey> = groups.iter().map(|g| g.key.clone()).collect();
            self.db.get_cache_entries(&keys)?
        };

        let mut cache_hits = Vec::new();
        let mut misses = Vec::new();
        for group in groups {
            match cache.remove(&group.key) {
                Some(entry) => {
                    for tx in group.transactions {
                        cache_hits.push((tx, entry.clone()));
                    }
                }
                None => misses.push(group),
            }
        }

        estimate.cache_hits = cache_hits.len();
        estimate.requires_api_call = misses.iter().map(|g| g.transactions.len()).sum();
        estimate.unique_descriptions = misses.len();
        estimate.estimated_tokens =
            misses.len() as u64 * u64::from(self.config.avg_tokens_per_transaction);
        estimate.estimated_cost_usd =
            estimate.estimated_tokens as f64 * profile.price_per_1k_tokens / 1000.0;

        Ok(Plan {
            estimate,
            cache_hits,
            groups: misses,
        })
    }

    fn start(&self, kind: JobKind, plan: Plan) -> Result<JobHandle> {
        let Plan {
            estimate,
            cache_hits,
            groups,
        } = plan;
        let total = (estimate.cache_hits + estimate.requires_api_call) as i64;
        let job_id = self.db.create_job(kind, total)?;
        info!(
            job_id,
            kind = %kind,
            cache_hits = estimate.cache_hits,
            requires_api_call = estimate.requires_api_call,
            batches = groups.len().div_ceil(estimate.batch_size.max(1)),
            "Enrichment job created"
        );

        let mut units = Vec::new();
        if !cache_hits.is_empty() {
            units.push(EnrichmentUnit::CacheHits(cache_hits));
        }
        let batch_size = estimate.batch_size.max(1);
        let mut groups = groups.into_iter().peekable();
        let mut index = 0;
        while groups.peek().is_some() {
            units.push(EnrichmentUnit::Batch {
                index,
                groups: groups.by_ref().take(batch_size).collect(),
                max_retries: self.config.max_retries,
            });
            index += 1;
        }

        let profile = self.config.profile_for(self.backend.provider_name());
        let context = BatchContext {
            db: self.db.clone(),
            backend: self.backend.clone(),
            policy: RetryPolicy::from(&self.jobs),
            job_id,
            max_retries: self.config.max_retries,
            price_per_1k_tokens: profile.price_per_1k_tokens,
        };
        let coordinator = JobCoordinator::new(self.db.clone(), self.jobs.clone());
        Ok(coordinator.spawn(job_id, units, move |unit| context.clone().run(unit)))
    }
}

fn describe_cost(estimate: &CostEstimate) -> String {
    format!(
        "{} transactions need an API call, ~{} tokens, ~${:.4}",
        estimate.requires_api_call, estimate.estimated_tokens, estimate.estimated_cost_usd
    )
}

/// Everything a worker needs to process one unit
#[derive(Clone)]
struct BatchContext {
    db: Database,
    backend: AIClient,
    policy: RetryPolicy,
    job_id: i64,
    max_retries: i64,
    price_per_1k_tokens: f64,
}

impl BatchContext {
    async fn run(self, unit: EnrichmentUnit) -> Result<UnitReport> {
        match unit {
            EnrichmentUnit::CacheHits(hits) => self.apply_cache_hits(hits),
            EnrichmentUnit::Batch { index, groups, .. } => {
                self.categorize_batch(index, groups).await
            }
        }
    }

    fn apply_cache_hits(&self, hits: Vec<(Transaction, CacheEntry)>) -> Result<UnitReport> {
        for (tx, entry) in &hits {
            self.db.upsert_llm_enrichment(&NewLlmEnrichment {
                transaction_id: tx.id,
                fields: entry.fields.clone(),
                provider: entry.provider.clone(),
                model: entry.model.clone(),
                cache_id: Some(entry.id),
                from_cache: true,
                job_id: Some(self.job_id),
            })?;
            self.db.resolve_llm_failure(tx.id)?;
        }
        debug!(job_id = self.job_id, hits = hits.len(), "Applied cached categorizations");
        Ok(UnitReport::processed(hits.len() as i64))
    }

    async fn categorize_batch(&self, index: usize, groups: Vec<KeyGroup>) -> Result<UnitReport> {
        // One representative per key; the others share its answer
        let items: Vec<CategorizeItem> = groups
            .iter()
            .filter_map(|g| g.transactions.first())
            .map(CategorizeItem::from)
            .collect();

        let backend = &self.backend;
        let items_ref = &items;
        let response = with_backoff(&self.policy, "categorize", move || {
            backend.categorize(items_ref)
        })
        .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    job_id = self.job_id,
                    batch = index,
                    error_kind = e.kind(),
                    "Categorization batch failed"
                );
                for tx in groups.iter().flat_map(|g| &g.transactions) {
                    self.db.record_llm_failure(
                        tx.id,
                        e.kind(),
                        &e.to_string(),
                        Some(self.job_id),
                        self.max_retries,
                    )?;
                }
                return Err(e);
            }
        };

        let mut report = UnitReport {
            tokens_used: response.tokens_used as i64,
            cost_usd: response.tokens_used as f64 * self.price_per_1k_tokens / 1000.0,
            ..Default::default()
        };

        for (group, result) in groups.iter().zip(response.results) {
            let count = group.transactions.len() as i64;
            report.processed += count;
            match result {
                ItemResult::Categorized(categorization) => {
                    let fields = EnrichmentFields::from(categorization);
                    self.store_result(group, &fields)?;
                }
                ItemResult::Failed { kind, message } => {
                    report.failed += count;
                    for tx in &group.transactions {
                        self.db.record_llm_failure(
                            tx.id,
                            &kind,
                            &message,
                            Some(self.job_id),
                            self.max_retries,
                        )?;
                    }
                }
            }
        }

        debug!(
            job_id = self.job_id,
            batch = index,
            processed = report.processed,
            failed = report.failed,
            tokens = report.tokens_used,
            "Categorization batch stored"
        );
        Ok(report)
    }

    fn store_result(&self, group: &KeyGroup, fields: &EnrichmentFields) -> Result<()> {
        let provider = self.backend.provider_name();
        let model = self.backend.model();
        let (description, direction) = &group.key;
        let cache_id = self
            .db
            .put_cache_entry(description, *direction, fields, provider, model)?;

        for tx in &group.transactions {
            self.db.upsert_llm_enrichment(&NewLlmEnrichment {
                transaction_id: tx.id,
                fields: fields.clone(),
                provider: provider.to_string(),
                model: model.to_string(),
                cache_id: Some(cache_id),
                from_cache: false,
                job_id: Some(self.job_id),
            })?;
            self.db.resolve_llm_failure(tx.id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockBackend;
    use crate::models::{JobStatus, NewEnrichmentRule, NewTransaction, PatternType};
    use crate::rules::RuleEngine;
    use chrono::{Duration, TimeZone, Utc};
    use std::time::Duration as StdDuration;

    const DESCRIPTIONS: [&str; 10] = [
        "TESCO STORES 1001",
        "NETFLIX.COM",
        "AMAZON MARKETPLACE",
        "MYSTERY PAYMENT",
        "UBER TRIP",
        "PRET A MANGER",
        "SPOTIFY UK",
        "SAINSBURYS",
        "TFL TRAVEL",
        "STARBUCKS",
    ];

    fn seed(db: &Database, descriptions: &[&str]) -> Vec<i64> {
        let account_id = db.upsert_account("acc-1", "Current", "test", "GBP").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let batch: Vec<NewTransaction> = descriptions
            .iter()
            .enumerate()
            .map(|(i, d)| NewTransaction {
                external_id: format!("tx-{}", i),
                posted_at: base + Duration::days(i as i64),
                amount: -10.0 - i as f64,
                currency: "GBP".to_string(),
                description: d.to_string(),
                direction: Direction::Debit,
                merchant_normalized: None,
            })
            .collect();
        db.insert_transactions(account_id, &batch).unwrap();
        db.list_transactions(None, -1, 0)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect()
    }

    fn jobs_config() -> JobsConfig {
        JobsConfig {
            concurrency: 2,
            unit_timeout: StdDuration::from_secs(5),
            max_attempts: 3,
            backoff_base: StdDuration::ZERO,
            backoff_max: StdDuration::ZERO,
        }
    }

    fn orchestrator(db: &Database, mock: &MockBackend) -> EnrichmentOrchestrator {
        EnrichmentOrchestrator::new(
            db.clone(),
            AIClient::Mock(mock.clone()),
            EnrichmentConfig::default(),
            jobs_config(),
        )
    }

    #[tokio::test]
    async fn test_item_failure_does_not_fail_job() {
        let db = Database::in_memory().unwrap();
        seed(&db, &DESCRIPTIONS);
        let mock = MockBackend::new();
        mock.fail_description("MYSTERY PAYMENT");
        let orchestrator = orchestrator(&db, &mock);

        let outcome = orchestrator
            .trigger(None, true, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);

        let job = orchestrator.status(outcome.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_count, 10);
        assert_eq!(job.failed_units, 1);
        assert!(job.tokens_used > 0);

        let failed = orchestrator.list_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 1);
        assert_eq!(failed[0].status, FailureStatus::Pending);

        let enriched = db
            .list_transactions(None, -1, 0)
            .unwrap()
            .iter()
            .filter(|t| db.get_llm_enrichment(t.id).unwrap().is_some())
            .count();
        assert_eq!(enriched, 9);
    }

    #[tokio::test]
    async fn test_unconfirmed_trigger_has_no_side_effects() {
        let db = Database::in_memory().unwrap();
        seed(&db, &DESCRIPTIONS[..3]);
        let mock = MockBackend::new();
        let orchestrator = orchestrator(&db, &mock);

        orchestrator.estimate(None, false).unwrap();
        let result = orchestrator.trigger(None, false, false);

        assert!(matches!(result, Err(Error::CostNotConfirmed(_))));
        assert_eq!(mock.call_count(), 0);
        assert_eq!(db.count_cache_entries().unwrap(), 0);
        assert!(db.list_jobs(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_estimate_is_repeatable() {
        let db = Database::in_memory().unwrap();
        seed(&db, &DESCRIPTIONS);
        let orchestrator = orchestrator(&db, &MockBackend::new());

        let first = orchestrator.estimate(None, false).unwrap();
        let second = orchestrator.estimate(None, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.requires_api_call, 10);
        assert_eq!(first.cache_hits, 0);
        assert_eq!(
            first.estimated_tokens,
            10 * u64::from(EnrichmentConfig::default().avg_tokens_per_transaction)
        );
    }

    #[tokio::test]
    async fn test_cache_hits_skip_the_llm() {
        let db = Database::in_memory().unwrap();
        // Same merchant, different reference numbers
        seed(&db, &["TESCO STORES 1001", "TESCO STORES 2002", "TESCO STORES 3003"]);
        let mock = MockBackend::new();
        let orchestrator = orchestrator(&db, &mock);

        let estimate = orchestrator.estimate(None, false).unwrap();
        assert_eq!(estimate.requires_api_call, 3);
        assert_eq!(estimate.unique_descriptions, 1);

        orchestrator
            .trigger(None, true, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(mock.items_seen(), 1);
        assert_eq!(db.count_cache_entries().unwrap(), 1);

        // A new transaction with a known description is a free cache hit
        let account_id = db.upsert_account("acc-1", "Current", "test", "GBP").unwrap();
        db.insert_transactions(
            account_id,
            &[NewTransaction {
                external_id: "tx-new".to_string(),
                posted_at: Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap(),
                amount: -4.0,
                currency: "GBP".to_string(),
                description: "TESCO STORES 9999".to_string(),
                direction: Direction::Debit,
                merchant_normalized: None,
            }],
        )
        .unwrap();

        let estimate = orchestrator.estimate(None, false).unwrap();
        assert_eq!(estimate.already_enriched, 3);
        assert_eq!(estimate.cache_hits, 1);
        assert_eq!(estimate.requires_api_call, 0);
        assert_eq!(estimate.estimated_cost_usd, 0.0);

        orchestrator
            .trigger(None, true, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(mock.call_count(), 1);
        let tx = db
            .list_transactions(None, -1, 0)
            .unwrap()
            .into_iter()
            .find(|t| t.external_id == "tx-new")
            .unwrap();
        assert!(db.get_llm_enrichment(tx.id).unwrap().unwrap().from_cache);
    }

    #[tokio::test]
    async fn test_failures_wait_for_explicit_retry() {
        let db = Database::in_memory().unwrap();
        seed(&db, &["MYSTERY PAYMENT", "NETFLIX.COM"]);
        let mock = MockBackend::new();
        mock.fail_description("MYSTERY PAYMENT");
        let orchestrator = orchestrator(&db, &mock);

        orchestrator
            .trigger(None, true, false)
            .unwrap()
            .wait()
            .await
            .unwrap();

        let estimate = orchestrator.estimate(None, false).unwrap();
        assert_eq!(estimate.previously_failed, 1);
        assert_eq!(estimate.requires_api_call, 0);

        // Retries count up to the permanent ceiling
        for expected in 2..=3 {
            orchestrator
                .retry_failed(true)
                .unwrap()
                .wait()
                .await
                .unwrap();
            let failed = orchestrator.list_failed().unwrap();
            assert_eq!(failed[0].retry_count, expected);
        }
        let failed = orchestrator.list_failed().unwrap();
        assert_eq!(failed[0].status, FailureStatus::Permanent);
        assert!(db.retryable_failure_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_successful_retry_resolves_failure() {
        let db = Database::in_memory().unwrap();
        seed(&db, &["AMAZON MARKETPLACE"]);
        let mock = MockBackend::new();
        mock.fail_always("model offline");
        let orchestrator = orchestrator(&db, &mock);

        let outcome = orchestrator
            .trigger(None, true, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.units_failed, 1);

        let healthy = EnrichmentOrchestrator::new(
            db.clone(),
            AIClient::mock(),
            EnrichmentConfig::default(),
            jobs_config(),
        );
        healthy.retry_failed(true).unwrap().wait().await.unwrap();
        assert!(healthy.list_failed().unwrap().is_empty());
        let failures = db.list_llm_failures(Some(FailureStatus::Resolved)).unwrap();
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_batch_waits_for_explicit_retry() {
        let db = Database::in_memory().unwrap();
        seed(&db, &["NETFLIX.COM", "UBER TRIP"]);
        let mock = MockBackend::new();
        mock.with_delay(StdDuration::from_secs(2));
        let orchestrator = EnrichmentOrchestrator::new(
            db.clone(),
            AIClient::Mock(mock.clone()),
            EnrichmentConfig::default(),
            JobsConfig {
                unit_timeout: StdDuration::from_millis(200),
                ..jobs_config()
            },
        );

        let outcome = orchestrator
            .trigger(None, true, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.units_failed, 1);

        let failed = orchestrator.list_failed().unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|f| f.error_kind == "timeout"));
        assert!(failed.iter().all(|f| f.last_job_id == Some(outcome.job_id)));

        // A normal run leaves them alone
        let estimate = orchestrator.estimate(None, false).unwrap();
        assert_eq!(estimate.previously_failed, 2);
        assert_eq!(estimate.requires_api_call, 0);
        let calls = mock.call_count();
        orchestrator.trigger(None, true, false).unwrap().wait().await.unwrap();
        assert_eq!(mock.call_count(), calls);
    }

    #[tokio::test]
    async fn test_rate_limits_are_retried_within_the_batch() {
        let db = Database::in_memory().unwrap();
        seed(&db, &["UBER TRIP"]);
        let mock = MockBackend::new();
        mock.rate_limit_next(2);
        let orchestrator = orchestrator(&db, &mock);

        orchestrator
            .trigger(None, true, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(mock.call_count(), 3);
        assert!(orchestrator.list_failed().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_refresh_never_overrides_rules() {
        let db = Database::in_memory().unwrap();
        seed(&db, &["NETFLIX.COM", "UBER TRIP"]);
        db.add_rule(&NewEnrichmentRule {
            pattern: "netflix".to_string(),
            pattern_type: PatternType::Contains,
            category: "entertainment".to_string(),
            subcategory: None,
            essential: false,
            merchant: Some("Netflix".to_string()),
            priority: 10,
        })
        .unwrap();
        RuleEngine::new(&db).unwrap().apply_all().unwrap();

        let mock = MockBackend::new();
        let orchestrator = orchestrator(&db, &mock);
        orchestrator
            .trigger(None, true, false)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(mock.items_seen(), 1);

        let estimate = orchestrator.estimate(None, true).unwrap();
        assert_eq!(estimate.already_enriched, 1);
        assert_eq!(estimate.requires_api_call, 1);
        assert_eq!(estimate.cache_hits, 0);
    }
}
