//! Sync and matching command implementations

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use reckon_core::db::Database;
use reckon_core::{
    Aggregator, Config, DateWindow, JsonFileAggregator, JsonFileReceiptSource, JobOutcome,
    MatchRun, ReceiptClient, SyncService,
};

/// Sync from exported provider files, apply rules, then match
pub async fn cmd_sync(
    db: &Database,
    config: &Config,
    transactions: &Path,
    receipts: Option<&Path>,
    window: DateWindow,
) -> Result<()> {
    let aggregator: Arc<dyn Aggregator> = Arc::new(
        JsonFileAggregator::from_path(transactions)
            .with_context(|| format!("Failed to read {}", transactions.display()))?,
    );
    let receipts: Option<Arc<dyn ReceiptClient>> = match receipts {
        Some(path) => Some(Arc::new(
            JsonFileReceiptSource::from_path(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
        )),
        None => None,
    };

    println!("🔄 Syncing {} to {}...", window.from, window.to);

    let report = SyncService::new(db.clone(), config.clone())
        .sync_all(aggregator, receipts, window)
        .await
        .context("Sync failed")?;

    println!();
    if let Some(ref job) = report.transactions_job {
        print_job_line("Transactions", job);
    }
    if let Some(ref job) = report.receipts_job {
        print_job_line("Receipts", job);
    }
    println!("   New transactions: {}", report.transactions_added);
    println!("   New receipts: {}", report.receipts_added);
    println!("   Rule matches: {}", report.rules.matched);
    print_match_run(&report.matching);

    Ok(())
}

/// Match unmatched receipts against stored transactions
pub fn cmd_match(db: &Database, config: &Config) -> Result<()> {
    let matcher = SyncService::new(db.clone(), config.clone()).matcher();
    let run = matcher.run(db)?;
    print_match_run(&run);
    Ok(())
}

fn print_job_line(label: &str, job: &JobOutcome) {
    let icon = if job.units_failed > 0 { "⚠️ " } else { "✓" };
    println!(
        "   {} {} job #{}: {} ({} units, {} failed)",
        icon, label, job.job_id, job.status, job.units_run, job.units_failed
    );
    if job.units_failed > 0 {
        println!("      Details: reckon jobs show {}", job.job_id);
    }
}

fn print_match_run(run: &MatchRun) {
    println!();
    println!("🔗 Matching");
    println!("   ─────────────────────────────");
    println!("   Receipts considered: {}", run.receipts_considered);
    println!("   New matches: {}", run.stored);
    println!("   Unmatched receipts: {}", run.unmatched_receipts);
    if run.needs_review > 0 {
        println!(
            "   ⚠️  {} matches need review: reckon matches list --review",
            run.needs_review
        );
    }
    if run.missing_rate > 0 {
        println!(
            "   💱 {} candidates skipped for a missing exchange rate",
            run.missing_rate
        );
    }
    if run.enrichments_created > 0 {
        println!("   Receipt enrichments created: {}", run.enrichments_created);
    }
}
