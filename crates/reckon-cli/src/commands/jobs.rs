//! Job and enrichment-state commands

use anyhow::{anyhow, Result};
use reckon_core::db::Database;
use reckon_core::models::{EnrichmentSource, Job, JobStatus};

pub fn cmd_jobs_list(db: &Database, status: Option<&str>, limit: i64) -> Result<()> {
    let status = status
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(|e: String| anyhow!(e))?;
    let jobs = db.list_jobs(status, limit)?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!();
    println!(
        "{:>6}  {:<18}  {:<10}  {:>11}  {:>6}  {:>9}  {}",
        "ID", "KIND", "STATUS", "PROGRESS", "FAILED", "COST", "CREATED"
    );
    println!("{}", "─".repeat(86));
    for job in &jobs {
        println!(
            "{:>6}  {:<18}  {:<10}  {:>11}  {:>6}  {:>9}  {}",
            job.id,
            job.kind.as_str(),
            job.status.as_str(),
            format!("{}/{}", job.processed_count, job.total_count),
            job.failed_units,
            format!("${:.4}", job.cost_usd),
            job.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub fn cmd_jobs_show(db: &Database, id: i64) -> Result<()> {
    let job = db
        .get_job(id)?
        .ok_or_else(|| anyhow!("Job #{} not found", id))?;
    print_job(&job);

    let errors = db.list_job_unit_errors(id)?;
    if !errors.is_empty() {
        println!();
        println!("   Unit errors:");
        for e in &errors {
            println!("   - [{}] {}: {}", e.unit, e.error_kind, e.message);
        }
    }
    Ok(())
}

fn print_job(job: &Job) {
    println!();
    println!("📋 Job #{} ({})", job.id, job.kind);
    println!("   ─────────────────────────────");
    println!("   Status: {}", job.status);
    if job.cancel_requested && !job.status.is_terminal() {
        println!("   ⏳ Cancellation requested");
    }
    println!(
        "   Progress: {}/{} ({} failed)",
        job.processed_count, job.total_count, job.failed_units
    );
    if !job.ingest.is_empty() {
        println!(
            "   Stored: {} new, {} replaced  Skipped: {} already seen, {} rejected",
            job.ingest.inserted, job.ingest.replaced, job.ingest.duplicates, job.ingest.rejected
        );
    }
    if job.tokens_used > 0 || job.cost_usd > 0.0 {
        println!("   Tokens: {}  Cost: ${:.4}", job.tokens_used, job.cost_usd);
    }
    println!("   Created: {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(started) = job.started_at {
        println!("   Started: {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(completed) = job.completed_at {
        println!("   Finished: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref error) = job.error_message {
        println!("   ❌ Error: {}", error);
    }
    if let Some(ref summary) = job.summary {
        println!("   Summary: {}", summary);
    }
}

pub fn cmd_jobs_cancel(db: &Database, id: i64) -> Result<()> {
    if db.request_job_cancel(id)? {
        println!("✓ Cancellation requested for job #{}", id);
    } else {
        println!("Job #{} has already finished.", id);
    }
    Ok(())
}

/// Fail jobs left running by a process that exited
pub fn cmd_jobs_recover(db: &Database) -> Result<()> {
    let recovered = db.recover_interrupted_jobs()?;
    if recovered == 0 {
        println!("No interrupted jobs.");
    } else {
        println!("✓ Marked {} interrupted jobs as failed", recovered);
    }
    Ok(())
}

/// Effective category for a transaction and where it came from
pub fn cmd_resolve(db: &Database, transaction_id: i64) -> Result<()> {
    let tx = db
        .get_transaction(transaction_id)?
        .ok_or_else(|| anyhow!("Transaction #{} not found", transaction_id))?;
    let effective = db.resolve(transaction_id)?;

    println!();
    println!(
        "🏷️  {} {:.2} {} on {}",
        tx.description,
        tx.amount,
        tx.currency,
        tx.posted_at.format("%Y-%m-%d")
    );

    match (effective.source, &effective.fields) {
        (EnrichmentSource::Unenriched, _) | (_, None) => {
            println!("   Not enriched yet.");
        }
        (source, Some(fields)) => {
            let subcategory = fields
                .subcategory
                .as_deref()
                .map(|s| format!(" / {}", s))
                .unwrap_or_default();
            println!("   Category: {}{}", fields.category, subcategory);
            if let Some(ref merchant) = fields.merchant {
                println!("   Merchant: {}", merchant);
            }
            println!("   Essential: {}", if fields.essential { "yes" } else { "no" });
            println!("   Confidence: {}", fields.confidence);
            println!("   Source: {}", source);
        }
    }
    println!("   {}", effective.explanation);

    let externals = db.list_external_enrichments(transaction_id)?;
    if externals.len() > 1 {
        println!();
        println!("   Receipt enrichments:");
        for e in &externals {
            let marker = if e.is_primary { "★" } else { " " };
            println!(
                "   {} #{} receipt #{} ({}) {}",
                marker, e.id, e.receipt_id, e.source_type, e.fields.category
            );
        }
        println!("   Change primary: reckon matches primary {} <id>", transaction_id);
    }
    Ok(())
}
