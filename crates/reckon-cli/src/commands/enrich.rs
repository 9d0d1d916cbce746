//! Enrichment command implementations

use anyhow::Result;
use reckon_core::db::Database;
use reckon_core::models::FailureStatus;
use reckon_core::{CostEstimate, EnrichmentOrchestrator, JobHandle};
use tracing::warn;

pub fn cmd_enrich_estimate(
    orchestrator: &EnrichmentOrchestrator,
    ids: Option<&[i64]>,
    force_refresh: bool,
) -> Result<()> {
    let estimate = orchestrator.estimate(ids, force_refresh)?;
    print_estimate(&estimate);
    Ok(())
}

/// Print the estimate, then start the job only when the cost is confirmed
pub async fn cmd_enrich_run(
    orchestrator: &EnrichmentOrchestrator,
    ids: Option<&[i64]>,
    force_refresh: bool,
    yes: bool,
) -> Result<()> {
    let estimate = orchestrator.estimate(ids, force_refresh)?;
    print_estimate(&estimate);

    if estimate.requires_api_call == 0 && estimate.cache_hits == 0 {
        println!("\nNothing to enrich.");
        return Ok(());
    }
    if !yes {
        println!();
        println!("Re-run with --yes to confirm this cost and start the job.");
        return Ok(());
    }

    let handle = orchestrator.trigger(ids, true, force_refresh)?;
    wait_for_job(orchestrator, handle).await
}

pub async fn cmd_enrich_retry(orchestrator: &EnrichmentOrchestrator, yes: bool) -> Result<()> {
    let pending = orchestrator
        .list_failed()?
        .into_iter()
        .filter(|f| f.status == FailureStatus::Pending)
        .count();
    if pending == 0 {
        println!("No failures waiting for retry.");
        return Ok(());
    }
    if !yes {
        println!(
            "{} transactions are waiting for retry. Re-run with --yes to confirm the cost.",
            pending
        );
        return Ok(());
    }

    let handle = orchestrator.retry_failed(true)?;
    wait_for_job(orchestrator, handle).await
}

pub fn cmd_enrich_failed(db: &Database) -> Result<()> {
    let mut failures = db.list_llm_failures(Some(FailureStatus::Pending))?;
    failures.extend(db.list_llm_failures(Some(FailureStatus::Permanent))?);

    if failures.is_empty() {
        println!("No failed enrichments.");
        return Ok(());
    }

    println!();
    println!(
        "{:>6}  {:<10}  {:>7}  {:<16}  {}",
        "TX", "STATUS", "TRIES", "ERROR", "MESSAGE"
    );
    println!("{}", "─".repeat(80));
    for f in &failures {
        println!(
            "{:>6}  {:<10}  {:>7}  {:<16}  {}",
            f.transaction_id,
            f.status.as_str(),
            f.retry_count,
            f.error_kind,
            super::truncate(&f.message, 36)
        );
    }
    println!();
    println!("Retry pending failures with: reckon enrich retry --yes");
    Ok(())
}

fn print_estimate(estimate: &CostEstimate) {
    println!();
    println!("💰 Enrichment Estimate");
    println!("   ─────────────────────────────");
    println!("   Candidates: {}", estimate.candidates);
    println!("   Already enriched: {}", estimate.already_enriched);
    if estimate.previously_failed > 0 {
        println!(
            "   Previously failed: {} (use 'reckon enrich retry')",
            estimate.previously_failed
        );
    }
    println!("   Cache hits: {}", estimate.cache_hits);
    println!(
        "   Need LLM: {} ({} unique descriptions)",
        estimate.requires_api_call, estimate.unique_descriptions
    );
    println!(
        "   Provider: {} (batches of {})",
        estimate.provider, estimate.batch_size
    );
    println!("   Estimated tokens: {}", estimate.estimated_tokens);
    println!("   Estimated cost: ${:.4}", estimate.estimated_cost_usd);
}

/// Wait for a job, cancelling it cleanly on Ctrl-C
async fn wait_for_job(orchestrator: &EnrichmentOrchestrator, handle: JobHandle) -> Result<()> {
    let job_id = handle.job_id;
    println!();
    println!("⏳ Job #{} started (Ctrl-C to cancel)", job_id);

    let wait = handle.wait();
    tokio::pin!(wait);
    let outcome = tokio::select! {
        outcome = &mut wait => outcome?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id, "Cancellation requested from terminal");
            orchestrator.cancel(job_id)?;
            wait.await?
        }
    };

    let job = orchestrator.status(job_id)?;
    println!();
    println!("✓ Job #{} {}", job_id, outcome.status);
    println!(
        "   Processed: {}/{}  Failed: {}",
        job.processed_count, job.total_count, job.failed_units
    );
    println!(
        "   Tokens: {}  Cost: ${:.4}",
        job.tokens_used, job.cost_usd
    );
    if outcome.units_skipped > 0 {
        println!("   Skipped batches: {}", outcome.units_skipped);
    }
    if job.failed_units > 0 {
        println!("   See failures: reckon enrich failed");
    }
    Ok(())
}
