//! CLI command tests
//!
//! Commands run against on-disk unencrypted databases in a temp dir, fed by
//! exported provider files written next to them.

use std::path::PathBuf;

use chrono::{Datelike, NaiveDate, Utc};
use reckon_core::db::{Database, MatchFilter};
use reckon_core::models::{EnrichmentSource, JobKind, JobStatus, ReceiptStatus};
use reckon_core::{AIClient, Config, DateWindow, EnrichmentOrchestrator};
use tempfile::TempDir;

use crate::commands::{self, truncate};

const TRANSACTIONS_JSON: &str = r#"{
  "accounts": [
    {
      "external_id": "acc-001",
      "name": "Current Account",
      "provider": "test-bank",
      "currency": "GBP",
      "transactions": [
        {"transaction_id": "tx-01", "timestamp": "2024-03-05T09:12:00Z", "amount": -42.50, "currency": "GBP", "description": "TESCO STORES 1234"},
        {"transaction_id": "tx-02", "timestamp": "2024-03-06T10:00:00Z", "amount": -9.99, "currency": "GBP", "description": "NETFLIX.COM"},
        {"transaction_id": "tx-03", "timestamp": "2024-03-07T11:00:00Z", "amount": -20.00, "currency": "GBP", "description": "AMAZON MKTPLACE"},
        {"transaction_id": "tx-04", "timestamp": "2024-03-07T11:05:00Z", "amount": -15.00, "currency": "GBP", "description": "AMAZON MKTPLACE"}
      ]
    }
  ]
}"#;

const RECEIPTS_JSON: &str = r#"{
  "connections": [
    {
      "connection_id": "mailbox-1",
      "receipts": [
        {
          "source_type": "email",
          "merchant": "Tesco",
          "total": 42.50,
          "currency": "GBP",
          "event_date": "2024-03-05",
          "line_items": [{"name": "Groceries", "quantity": 1.0, "unit_price": 42.50}],
          "extraction_confidence": 90,
          "extraction_method": "structured_markup"
        },
        {
          "source_type": "email",
          "merchant": "Amazon",
          "order_ref": "AMZ-1",
          "total": 35.00,
          "currency": "GBP",
          "event_date": "2024-03-07",
          "line_items": [],
          "extraction_confidence": 85,
          "extraction_method": "pattern"
        }
      ]
    }
  ]
}"#;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn db_path(&self) -> PathBuf {
        self.dir.path().join("reckon.db")
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn open(&self) -> Database {
        commands::open_db(&self.db_path(), true).unwrap()
    }
}

fn test_config() -> Config {
    let mut config = Config::embedded().unwrap();
    config.jobs.backoff_base = std::time::Duration::ZERO;
    config.jobs.backoff_max = std::time::Duration::ZERO;
    config
}

fn march() -> DateWindow {
    DateWindow::new(
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
    )
    .unwrap()
}

async fn synced(ws: &Workspace, config: &Config) -> Database {
    commands::cmd_init(&ws.db_path(), true).unwrap();
    let db = ws.open();
    let transactions = ws.write("bank.json", TRANSACTIONS_JSON);
    let receipts = ws.write("receipts.json", RECEIPTS_JSON);
    commands::cmd_sync(&db, config, &transactions, Some(receipts.as_path()), march())
        .await
        .unwrap();
    db
}

fn tx_id(db: &Database, description: &str) -> i64 {
    db.list_transactions(None, -1, 0)
        .unwrap()
        .into_iter()
        .find(|t| t.description == description)
        .map(|t| t.id)
        .unwrap()
}

fn receipt_id(db: &Database, merchant: &str) -> i64 {
    db.list_receipts(ReceiptStatus::Active)
        .unwrap()
        .into_iter()
        .find(|r| r.merchant_raw == merchant)
        .map(|r| r.id)
        .unwrap()
}

fn orchestrator(db: &Database, config: &Config) -> EnrichmentOrchestrator {
    EnrichmentOrchestrator::new(
        db.clone(),
        AIClient::mock(),
        config.enrichment.clone(),
        config.jobs.clone(),
    )
}

// ========== Helpers ==========

#[test]
fn test_truncate() {
    assert_eq!(truncate("short", 10), "short");
    assert_eq!(truncate("exactly10!", 10), "exactly10!");
    assert_eq!(truncate("this is longer than ten", 10), "this is...");
    // Multi-byte characters are never split
    assert_eq!(truncate("café crème brûlée", 8), "café ...");
}

#[test]
fn test_resolve_window_explicit() {
    let window = commands::resolve_window(Some("2024-01-01"), Some("2024-01-31"), 90).unwrap();
    assert_eq!(window.from, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    assert_eq!(window.to, NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
}

#[test]
fn test_resolve_window_from_days_before_to() {
    let window = commands::resolve_window(None, Some("2024-03-31"), 30).unwrap();
    assert_eq!(window.from, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
}

#[test]
fn test_resolve_window_defaults_to_last_days() {
    let window = commands::resolve_window(None, None, 90).unwrap();
    let today = Utc::now().date_naive();
    assert_eq!(window.to, today);
    assert_eq!((window.to - window.from).num_days(), 90);
}

#[test]
fn test_resolve_window_rejects_bad_input() {
    assert!(commands::resolve_window(Some("01/02/2024"), None, 90).is_err());
    assert!(commands::resolve_window(Some("2024-02-01"), Some("2024-01-01"), 90).is_err());
}

// ========== Init / Status ==========

#[test]
fn test_cmd_init_seeds_aliases() {
    let ws = Workspace::new();
    commands::cmd_init(&ws.db_path(), true).unwrap();
    assert!(ws.db_path().exists());

    let db = ws.open();
    let seeded = db.list_merchant_aliases().unwrap().len();
    assert!(seeded > 0);

    // Re-running init is harmless
    commands::cmd_init(&ws.db_path(), true).unwrap();
    assert_eq!(db.list_merchant_aliases().unwrap().len(), seeded);
}

#[test]
fn test_cmd_status_without_database() {
    let ws = Workspace::new();
    assert!(commands::cmd_status(&ws.db_path(), true).is_ok());
    assert!(!ws.db_path().exists());
}

#[test]
fn test_cmd_status_with_database() {
    let ws = Workspace::new();
    commands::cmd_init(&ws.db_path(), true).unwrap();
    assert!(commands::cmd_status(&ws.db_path(), true).is_ok());
}

// ========== Sync / Match ==========

#[tokio::test]
async fn test_cmd_sync_stores_and_matches() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;

    assert_eq!(db.count_transactions().unwrap(), 4);
    assert_eq!(db.count_receipts(Some(ReceiptStatus::Active)).unwrap(), 2);

    let tesco = tx_id(&db, "TESCO STORES 1234");
    let matches = db
        .list_matches(&MatchFilter {
            transaction_id: Some(tesco),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].confidence, 100);
    assert_eq!(db.resolve(tesco).unwrap().source, EnrichmentSource::External);
}

#[tokio::test]
async fn test_cmd_sync_missing_file() {
    let ws = Workspace::new();
    commands::cmd_init(&ws.db_path(), true).unwrap();
    let db = ws.open();
    let missing = ws.dir.path().join("nope.json");
    let result = commands::cmd_sync(&db, &test_config(), &missing, None, march()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_cmd_match_is_idempotent() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;
    let before = db.count_matches(None).unwrap();

    commands::cmd_match(&db, &config).unwrap();
    assert_eq!(db.count_matches(None).unwrap(), before);
}

// ========== Matches ==========

#[tokio::test]
async fn test_cmd_matches_list_and_preview() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;

    assert!(commands::cmd_matches_list(&db, &config, false, None).is_ok());
    assert!(commands::cmd_matches_list(&db, &config, true, None).is_ok());

    let amazon = receipt_id(&db, "Amazon");
    assert!(commands::cmd_matches_preview(&db, &config, amazon).is_ok());
    assert!(commands::cmd_matches_preview(&db, &config, 9999).is_err());
}

#[tokio::test]
async fn test_cmd_matches_reject_withdraws_enrichment() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;

    let tesco = tx_id(&db, "TESCO STORES 1234");
    let m = db
        .list_matches(&MatchFilter {
            transaction_id: Some(tesco),
            ..Default::default()
        })
        .unwrap()
        .remove(0);

    commands::cmd_matches_reject(&db, m.id).unwrap();
    assert!(db.get_match(m.id).unwrap().is_none());
    assert_eq!(db.resolve(tesco).unwrap().source, EnrichmentSource::Unenriched);

    // A rerun does not bring the pair back
    commands::cmd_match(&db, &config).unwrap();
    assert!(db.get_match_for_pair(tesco, m.receipt_id).unwrap().is_none());

    assert!(commands::cmd_matches_reject(&db, m.id).is_err());
}

#[tokio::test]
async fn test_cmd_matches_split_and_confirm() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;

    // 20.00 + 15.00 paid for one 35.00 Amazon order
    let amazon = receipt_id(&db, "Amazon");
    let ids: Vec<i64> = db
        .list_transactions(None, -1, 0)
        .unwrap()
        .into_iter()
        .filter(|t| t.description == "AMAZON MKTPLACE")
        .map(|t| t.id)
        .collect();
    commands::cmd_matches_split(&db, &config, amazon, &ids).unwrap();

    let split = db
        .list_matches(&MatchFilter {
            receipt_id: Some(amazon),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(split.len(), 2);

    commands::cmd_matches_confirm(&db, &config, split[0].id).unwrap();
    assert!(db.get_match(split[0].id).unwrap().unwrap().user_confirmed);
    assert!(commands::cmd_matches_confirm(&db, &config, 9999).is_err());
}

#[tokio::test]
async fn test_cmd_matches_split_rejects_wrong_total() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;

    let amazon = receipt_id(&db, "Amazon");
    let netflix = tx_id(&db, "NETFLIX.COM");
    assert!(commands::cmd_matches_split(&db, &config, amazon, &[netflix]).is_err());
}

#[tokio::test]
async fn test_cmd_matches_primary_requires_own_enrichment() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;

    let tesco = tx_id(&db, "TESCO STORES 1234");
    let primary = db.get_primary_external(tesco).unwrap().unwrap();
    commands::cmd_matches_primary(&db, tesco, primary.id).unwrap();

    let netflix = tx_id(&db, "NETFLIX.COM");
    assert!(commands::cmd_matches_primary(&db, netflix, primary.id).is_err());
}

// ========== Enrichment ==========

#[tokio::test]
async fn test_cmd_enrich_run_needs_confirmation() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;
    let orchestrator = orchestrator(&db, &config);

    commands::cmd_enrich_estimate(&orchestrator, None, false).unwrap();
    commands::cmd_enrich_run(&orchestrator, None, false, false)
        .await
        .unwrap();

    let enrichment_jobs = db
        .list_jobs(None, 50)
        .unwrap()
        .into_iter()
        .filter(|j| j.kind == JobKind::Enrichment)
        .count();
    assert_eq!(enrichment_jobs, 0, "No job without --yes");
    assert_eq!(db.count_cache_entries().unwrap(), 0);
}

#[tokio::test]
async fn test_cmd_enrich_run_confirmed() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;
    let orchestrator = orchestrator(&db, &config);

    commands::cmd_enrich_run(&orchestrator, None, false, true)
        .await
        .unwrap();

    let job = db
        .list_jobs(None, 50)
        .unwrap()
        .into_iter()
        .find(|j| j.kind == JobKind::Enrichment)
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let netflix = tx_id(&db, "NETFLIX.COM");
    assert_eq!(db.resolve(netflix).unwrap().source, EnrichmentSource::Llm);

    assert!(commands::cmd_enrich_failed(&db).is_ok());
    // Nothing pending, so retry exits without a job
    commands::cmd_enrich_retry(&orchestrator, true).await.unwrap();
    assert!(db
        .list_jobs(None, 50)
        .unwrap()
        .iter()
        .all(|j| j.kind != JobKind::EnrichmentRetry));
}

// ========== Jobs / Resolve ==========

#[tokio::test]
async fn test_cmd_jobs() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;

    assert!(commands::cmd_jobs_list(&db, None, 20).is_ok());
    assert!(commands::cmd_jobs_list(&db, Some("completed"), 20).is_ok());
    assert!(commands::cmd_jobs_list(&db, Some("sleeping"), 20).is_err());

    // Sync jobs carry what they stored
    let stored: i64 = db
        .list_jobs(None, 20)
        .unwrap()
        .iter()
        .filter(|j| j.kind == JobKind::Sync)
        .map(|j| j.ingest.inserted)
        .sum();
    assert_eq!(stored, 6);

    let job = db.list_jobs(None, 1).unwrap().remove(0);
    assert!(commands::cmd_jobs_show(&db, job.id).is_ok());
    assert!(commands::cmd_jobs_show(&db, 9999).is_err());

    // Finished jobs stay finished
    commands::cmd_jobs_cancel(&db, job.id).unwrap();
    assert!(!db.get_job(job.id).unwrap().unwrap().cancel_requested);

    assert!(commands::cmd_jobs_recover(&db).is_ok());
}

#[tokio::test]
async fn test_cmd_resolve() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;

    let tesco = tx_id(&db, "TESCO STORES 1234");
    assert!(commands::cmd_resolve(&db, tesco).is_ok());
    assert!(commands::cmd_resolve(&db, 9999).is_err());
}

// ========== Rules / Aliases ==========

fn rule(pattern: &str, category: &str, pattern_type: &str) -> commands::RuleArgs {
    commands::RuleArgs {
        pattern: pattern.to_string(),
        category: category.to_string(),
        pattern_type: pattern_type.to_string(),
        subcategory: None,
        merchant: None,
        essential: false,
        priority: 0,
    }
}

#[tokio::test]
async fn test_cmd_rules_add_and_apply() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;

    commands::cmd_rules_add(&db, &rule("NETFLIX", "Entertainment", "contains")).unwrap();
    assert_eq!(db.list_rules().unwrap().len(), 1);
    assert!(commands::cmd_rules_test(&db, "NETFLIX.COM 866-579").is_ok());

    commands::cmd_rules_apply(&db).unwrap();
    let netflix = tx_id(&db, "NETFLIX.COM");
    let effective = db.resolve(netflix).unwrap();
    assert_eq!(effective.source, EnrichmentSource::Rule);
    assert_eq!(effective.fields.unwrap().category, "Entertainment");

    assert!(commands::cmd_rules_list(&db).is_ok());
    let id = db.list_rules().unwrap()[0].id;
    commands::cmd_rules_delete(&db, id).unwrap();
    assert!(db.list_rules().unwrap().is_empty());
}

#[test]
fn test_cmd_rules_add_validates() {
    let ws = Workspace::new();
    commands::cmd_init(&ws.db_path(), true).unwrap();
    let db = ws.open();

    assert!(commands::cmd_rules_add(&db, &rule("X", "Misc", "fuzzy")).is_err());
    assert!(commands::cmd_rules_add(&db, &rule("([unclosed", "Misc", "regex")).is_err());
    assert!(commands::cmd_rules_add(&db, &rule("  ", "Misc", "contains")).is_err());
    assert!(db.list_rules().unwrap().is_empty());
}

#[test]
fn test_cmd_aliases() {
    let ws = Workspace::new();
    commands::cmd_init(&ws.db_path(), true).unwrap();
    let db = ws.open();

    commands::cmd_aliases_add(&db, "CORNER SHOP 42", "corner-shop", Some("Groceries"), None, true)
        .unwrap();
    let alias_map = db.load_alias_map().unwrap();
    assert!(alias_map.values().any(|v| v == "corner-shop"));

    assert!(commands::cmd_aliases_list(&db).is_ok());
    assert!(commands::cmd_aliases_test(&db, "CORNER SHOP 42").is_ok());
    assert!(commands::cmd_aliases_add(&db, "", "corner-shop", None, None, false).is_err());
}

// ========== Retention / Disconnect / Delete ==========

#[tokio::test]
async fn test_cmd_retention_tombstones_old_receipts() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;

    // Receipts are from March 2024
    let age = (Utc::now().date_naive() - NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()).num_days();
    commands::cmd_retention(&db, age + 30).unwrap();
    assert_eq!(db.count_receipts(Some(ReceiptStatus::Active)).unwrap(), 2);

    commands::cmd_retention(&db, 1).unwrap();
    assert_eq!(db.count_receipts(Some(ReceiptStatus::Active)).unwrap(), 0);

    let tesco = tx_id(&db, "TESCO STORES 1234");
    assert_eq!(db.resolve(tesco).unwrap().source, EnrichmentSource::Unenriched);
}

#[tokio::test]
async fn test_cmd_disconnect() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;

    commands::cmd_disconnect(&db, "mailbox-1", true).unwrap();
    assert_eq!(db.count_receipts(Some(ReceiptStatus::Tombstoned)).unwrap(), 2);

    // Unknown connections remove nothing
    commands::cmd_disconnect(&db, "mailbox-9", true).unwrap();
}

#[tokio::test]
async fn test_cmd_delete_account() {
    let ws = Workspace::new();
    let config = test_config();
    let db = synced(&ws, &config).await;

    let account = db.list_accounts().unwrap().remove(0);
    commands::cmd_delete_account(&db, account.id, true).unwrap();
    assert_eq!(db.count_transactions().unwrap(), 0);
    assert_eq!(db.count_matches(None).unwrap(), 0);
    assert!(db.get_account(account.id).unwrap().is_none());

    assert!(commands::cmd_delete_account(&db, account.id, true).is_err());
}

// ========== Prompts ==========

#[test]
fn test_cmd_prompts() {
    assert!(commands::cmd_prompts_list().is_ok());
    assert!(commands::cmd_prompts_show("categorize_transactions").is_ok());
    assert!(commands::cmd_prompts_show("write_poetry").is_err());
    assert!(commands::cmd_prompts_path().is_ok());
}

#[test]
fn test_state_persists_across_opens() {
    let ws = Workspace::new();
    commands::cmd_init(&ws.db_path(), true).unwrap();
    {
        let db = ws.open();
        commands::cmd_rules_add(&db, &rule("TFL", "Transport", "starts_with")).unwrap();
    }
    let db = ws.open();
    let rules = db.list_rules().unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].created_at.year(), Utc::now().year());
}
