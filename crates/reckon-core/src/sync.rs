//! Aggregator and receipt sync
//!
//! Each sync is a job with one unit per bank account or receipt connection.
//! A unit fetches its records through the source trait (with backoff),
//! normalizes, deduplicates and writes them idempotently, so re-running a
//! window is a no-op. After ingestion, rules are applied and the matcher
//! runs over whatever receipts are still unmatched.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::dedup::{dedupe_receipts, dedupe_transactions};
use crate::error::Result;
use crate::jobs::{JobCoordinator, JobOutcome, JobUnit, UnitReport};
use crate::matcher::{MatchRun, Matcher};
use crate::merchant::MerchantNormalizer;
use crate::models::{IngestCounts, InsertStats, JobKind, NewTransaction};
use crate::normalize::{normalize_receipt, normalize_transaction};
use crate::retry::{with_backoff, RetryPolicy};
use crate::rules::{RuleEngine, RuleRunStats};
use crate::sources::{Aggregator, DateWindow, RawAccount, ReceiptClient};

/// Everything a full sync did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub transactions_job: Option<JobOutcome>,
    pub receipts_job: Option<JobOutcome>,
    pub transactions_added: i64,
    pub receipts_added: i64,
    pub rules: RuleRunStats,
    pub matching: MatchRun,
}

struct AccountUnit {
    index: usize,
    account: RawAccount,
}

impl JobUnit for AccountUnit {
    fn label(&self) -> String {
        format!("account-{}", self.index)
    }
}

struct ConnectionUnit {
    index: usize,
    connection_id: String,
}

impl JobUnit for ConnectionUnit {
    fn label(&self) -> String {
        format!("connection-{}", self.index)
    }
}

/// Runs sync jobs against the configured sources
pub struct SyncService {
    db: Database,
    config: Config,
}

impl SyncService {
    pub fn new(db: Database, config: Config) -> Self {
        Self { db, config }
    }

    /// Sync transactions and receipts, then apply rules and match
    pub async fn sync_all(
        &self,
        aggregator: Arc<dyn Aggregator>,
        receipts: Option<Arc<dyn ReceiptClient>>,
        window: DateWindow,
    ) -> Result<SyncReport> {
        let transactions_before = self.db.count_transactions()?;
        let receipts_before = self.db.count_receipts(None)?;

        let mut report = SyncReport {
            transactions_job: Some(self.sync_transactions(aggregator, window).await?),
            ..Default::default()
        };
        if let Some(client) = receipts {
            report.receipts_job = Some(self.sync_receipts(client, window).await?);
        }

        report.transactions_added = self.db.count_transactions()? - transactions_before;
        report.receipts_added = self.db.count_receipts(None)? - receipts_before;
        report.rules = RuleEngine::new(&self.db)?.apply_all()?;
        report.matching = self.matcher().run(&self.db)?;

        info!(
            transactions_added = report.transactions_added,
            receipts_added = report.receipts_added,
            rules_matched = report.rules.matched,
            matched = report.matching.stored,
            "Sync complete"
        );
        Ok(report)
    }

    /// One job, one unit per aggregator account
    ///
    /// Failing to list accounts fails the job; a failing account is a unit error.
    pub async fn sync_transactions(
        &self,
        aggregator: Arc<dyn Aggregator>,
        window: DateWindow,
    ) -> Result<JobOutcome> {
        let job_id = self.db.create_job(JobKind::Sync, 0)?;
        let coordinator = self.coordinator();
        let policy = RetryPolicy::from(&self.config.jobs);

        let accounts = match with_backoff(&policy, "list_accounts", || aggregator.list_accounts())
            .await
        {
            Ok(accounts) => accounts,
            Err(e) => {
                coordinator.fail(job_id, &e);
                return Err(e);
            }
        };
        self.db.set_job_total(job_id, accounts.len() as i64)?;

        let context = SyncContext {
            db: self.db.clone(),
            merchants: Arc::new(MerchantNormalizer::from_db(&self.db)?),
            policy,
            window,
        };
        let units = accounts
            .into_iter()
            .enumerate()
            .map(|(index, account)| AccountUnit { index, account })
            .collect();

        coordinator
            .spawn(job_id, units, move |unit: AccountUnit| {
                let context = context.clone();
                let aggregator = aggregator.clone();
                async move { context.sync_account(aggregator.as_ref(), unit).await }
            })
            .wait()
            .await
    }

    /// One job, one unit per receipt connection
    pub async fn sync_receipts(
        &self,
        client: Arc<dyn ReceiptClient>,
        window: DateWindow,
    ) -> Result<JobOutcome> {
        let job_id = self.db.create_job(JobKind::Sync, 0)?;
        let coordinator = self.coordinator();
        let policy = RetryPolicy::from(&self.config.jobs);

        let connections =
            match with_backoff(&policy, "list_connections", || client.list_connections()).await {
                Ok(connections) => connections,
                Err(e) => {
                    coordinator.fail(job_id, &e);
                    return Err(e);
                }
            };
        self.db.set_job_total(job_id, connections.len() as i64)?;

        let context = SyncContext {
            db: self.db.clone(),
            merchants: Arc::new(MerchantNormalizer::from_db(&self.db)?),
            policy,
            window,
        };
        let units = connections
            .into_iter()
            .enumerate()
            .map(|(index, connection_id)| ConnectionUnit {
                index,
                connection_id,
            })
            .collect();

        coordinator
            .spawn(job_id, units, move |unit: ConnectionUnit| {
                let context = context.clone();
                let client = client.clone();
                async move { context.sync_connection(client.as_ref(), unit).await }
            })
            .wait()
            .await
    }

    pub fn matcher(&self) -> Matcher {
        Matcher::new(self.config.matcher.clone(), self.config.rates.clone())
    }

    fn coordinator(&self) -> JobCoordinator {
        JobCoordinator::new(self.db.clone(), self.config.jobs.clone())
    }
}

#[derive(Clone)]
struct SyncContext {
    db: Database,
    merchants: Arc<MerchantNormalizer>,
    policy: RetryPolicy,
    window: DateWindow,
}

impl SyncContext {
    async fn sync_account(&self, aggregator: &dyn Aggregator, unit: AccountUnit) -> Result<UnitReport> {
        let raw = &unit.account;
        let account_id =
            self.db
                .upsert_account(&raw.external_id, &raw.name, &raw.provider, &raw.currency)?;

        let mut batch: Vec<NewTransaction> = Vec::new();
        let mut rejected = 0;
        let mut cursor: Option<String> = None;
        let window = self.window;
        loop {
            let external_id = raw.external_id.as_str();
            let page_cursor = cursor.as_deref();
            let page = with_backoff(&self.policy, "list_transactions", move || {
                aggregator.list_transactions(external_id, window, page_cursor)
            })
            .await?;

            for record in &page.transactions {
                match normalize_transaction(record, &self.merchants) {
                    Ok(tx) => batch.push(tx),
                    Err(e) => {
                        rejected += 1;
                        debug!(account = unit.index, error_kind = e.kind(), "Rejected transaction");
                    }
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let stats: InsertStats = self
            .db
            .insert_transactions(account_id, &dedupe_transactions(batch))?;
        if rejected > 0 {
            warn!(account = unit.index, rejected, "Skipped inconsistent transactions");
        }
        info!(
            account = unit.index,
            inserted = stats.inserted,
            duplicates = stats.duplicates,
            "Account synced"
        );
        Ok(UnitReport {
            ingest: IngestCounts {
                rejected,
                ..IngestCounts::from(stats)
            },
            ..UnitReport::processed(1)
        })
    }

    async fn sync_connection(
        &self,
        client: &dyn ReceiptClient,
        unit: ConnectionUnit,
    ) -> Result<UnitReport> {
        let connection = unit.connection_id.as_str();
        let window = self.window;
        let events = with_backoff(&self.policy, "list_candidate_events", move || {
            client.list_candidate_events(connection, window)
        })
        .await?;

        let receipts: Vec<_> = events
            .iter()
            .map(|raw| normalize_receipt(connection, raw, &self.merchants))
            .collect();
        let seen = receipts.len();
        let stats = self.db.upsert_receipts(&dedupe_receipts(receipts))?;
        info!(
            connection = unit.index,
            events = seen,
            inserted = stats.inserted,
            replaced = stats.replaced,
            duplicates = stats.duplicates,
            "Connection synced"
        );
        Ok(UnitReport {
            ingest: IngestCounts::from(stats),
            ..UnitReport::processed(1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{ExtractionMethod, JobStatus, ReceiptSource, ReceiptStatus};
    use crate::sources::RawReceipt;
    use crate::test_utils::{InMemoryAggregator, InMemoryReceiptClient};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn window() -> DateWindow {
        DateWindow::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        )
        .unwrap()
    }

    fn service(db: &Database) -> SyncService {
        let mut config = Config::default();
        config.jobs.backoff_base = std::time::Duration::ZERO;
        config.jobs.backoff_max = std::time::Duration::ZERO;
        SyncService::new(db.clone(), config)
    }

    fn aggregator() -> InMemoryAggregator {
        let mut aggregator = InMemoryAggregator::new();
        aggregator.add_account("acc-1", "Current", "GBP");
        aggregator.add_transaction(
            "acc-1",
            "t1",
            Utc.with_ymd_and_hms(2024, 1, 16, 9, 0, 0).unwrap(),
            -42.50,
            "TESCO STORES 1234",
        );
        aggregator.add_transaction(
            "acc-1",
            "t2",
            Utc.with_ymd_and_hms(2024, 1, 17, 9, 0, 0).unwrap(),
            -9.99,
            "NETFLIX.COM",
        );
        aggregator
    }

    fn email(order: &str, confidence: u8) -> RawReceipt {
        RawReceipt {
            source_type: ReceiptSource::Email,
            merchant: "Tesco".to_string(),
            order_ref: Some(order.to_string()),
            total: 42.50,
            currency: "GBP".to_string(),
            event_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            line_items: vec![],
            extraction_confidence: confidence,
            extraction_method: ExtractionMethod::Pattern,
        }
    }

    #[tokio::test]
    async fn test_resync_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let service = service(&db);
        let aggregator: Arc<dyn Aggregator> = Arc::new(aggregator());

        let first = service
            .sync_transactions(aggregator.clone(), window())
            .await
            .unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!(db.count_transactions().unwrap(), 2);

        let second = service.sync_transactions(aggregator, window()).await.unwrap();
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(second.units_failed, 0);
        assert_eq!(db.count_transactions().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_job_counts_duplicates_and_rejects_apart_from_errors() {
        let db = Database::in_memory().unwrap();
        let service = service(&db);
        let mut source = aggregator();
        source.add_transaction(
            "acc-1",
            "t3",
            Utc.with_ymd_and_hms(2024, 1, 18, 9, 0, 0).unwrap(),
            0.0,
            "PENDING AUTH",
        );
        let source: Arc<dyn Aggregator> = Arc::new(source);

        let first = service
            .sync_transactions(source.clone(), window())
            .await
            .unwrap();
        let job = db.get_job(first.job_id).unwrap().unwrap();
        assert_eq!(job.ingest.inserted, 2);
        assert_eq!(job.ingest.duplicates, 0);
        assert_eq!(job.ingest.rejected, 1);
        assert_eq!(job.failed_units, 0);

        let second = service.sync_transactions(source, window()).await.unwrap();
        let job = db.get_job(second.job_id).unwrap().unwrap();
        assert_eq!(job.ingest.inserted, 0);
        assert_eq!(job.ingest.duplicates, 2);
        assert_eq!(job.ingest.rejected, 1);
        assert_eq!(job.failed_units, 0);
        assert!(db.list_job_unit_errors(second.job_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receipt_job_counts_replacements() {
        let db = Database::in_memory().unwrap();
        let service = service(&db);
        let mut client = InMemoryReceiptClient::new();
        client.add_receipt("mail-1", email("ORD-1", 60));
        let outcome = service
            .sync_receipts(Arc::new(client), window())
            .await
            .unwrap();
        assert_eq!(db.get_job(outcome.job_id).unwrap().unwrap().ingest.inserted, 1);

        let mut client = InMemoryReceiptClient::new();
        client.add_receipt("mail-1", email("ORD-1", 90));
        client.add_receipt("mail-1", email("ORD-2", 80));
        let outcome = service
            .sync_receipts(Arc::new(client), window())
            .await
            .unwrap();
        let ingest = db.get_job(outcome.job_id).unwrap().unwrap().ingest;
        assert_eq!(ingest.inserted, 1);
        assert_eq!(ingest.replaced, 1);
    }

    #[tokio::test]
    async fn test_duplicate_emails_collapse_to_one_receipt() {
        let db = Database::in_memory().unwrap();
        let service = service(&db);
        let mut client = InMemoryReceiptClient::new();
        // Confirmation, shipping and delivery emails for one order
        client.add_receipt("mail-1", email("ORD-1", 60));
        client.add_receipt("mail-1", email("ORD-1", 90));
        client.add_receipt("mail-1", email("ORD-1", 75));

        service
            .sync_receipts(Arc::new(client), window())
            .await
            .unwrap();

        let receipts = db.list_receipts(ReceiptStatus::Active).unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].extraction_confidence, 90);
    }

    #[tokio::test]
    async fn test_list_accounts_failure_fails_job() {
        let db = Database::in_memory().unwrap();
        let service = service(&db);
        let mut aggregator = aggregator();
        aggregator.fail_list_accounts("aggregator unavailable");

        let result = service
            .sync_transactions(Arc::new(aggregator), window())
            .await;
        assert!(matches!(result, Err(Error::Upstream(_))));

        let jobs = db.list_jobs(None, 10).unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].error_message.is_some());
    }

    #[tokio::test]
    async fn test_failing_account_is_a_unit_error() {
        let db = Database::in_memory().unwrap();
        let service = service(&db);
        let mut aggregator = aggregator();
        aggregator.add_account("acc-2", "Savings", "GBP");
        aggregator.fail_account("acc-2", "provider timeout");

        let outcome = service
            .sync_transactions(Arc::new(aggregator), window())
            .await
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.units_failed, 1);
        assert_eq!(db.count_transactions().unwrap(), 2);
        assert_eq!(db.list_job_unit_errors(outcome.job_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_all_matches_receipts() {
        let db = Database::in_memory().unwrap();
        let service = service(&db);
        let mut client = InMemoryReceiptClient::new();
        client.add_receipt("mail-1", email("ORD-1", 90));

        let report = service
            .sync_all(Arc::new(aggregator()), Some(Arc::new(client)), window())
            .await
            .unwrap();

        assert_eq!(report.transactions_added, 2);
        assert_eq!(report.receipts_added, 1);
        assert_eq!(report.matching.stored, 1);
        // exact amount, one day apart, same merchant
        assert_eq!(report.matching.matches[0].confidence, 90);
    }
}
