//! Match review commands

use anyhow::{anyhow, Result};
use reckon_core::db::{Database, MatchFilter};
use reckon_core::models::ReceiptMatch;
use reckon_core::{Config, Matcher};

use super::truncate;

fn matcher(config: &Config) -> Matcher {
    Matcher::new(config.matcher.clone(), config.rates.clone())
}

/// List matches, optionally only those awaiting confirmation
pub fn cmd_matches_list(
    db: &Database,
    config: &Config,
    review: bool,
    transaction_id: Option<i64>,
) -> Result<()> {
    let threshold = config.matcher.auto_accept_threshold;
    let filter = MatchFilter {
        transaction_id,
        needs_review_below: review.then_some(threshold),
        ..Default::default()
    };
    let matches = db.list_matches(&filter)?;

    if matches.is_empty() {
        if review {
            println!("No matches awaiting review.");
        } else {
            println!("No matches found. Run 'reckon match' after syncing receipts.");
        }
        return Ok(());
    }

    println!();
    println!(
        "{:>6}  {:>6}  {:>7}  {:>4}  {:<14}  {:<20}  {}",
        "ID", "TX", "RECEIPT", "CONF", "TYPE", "METHOD", "STATE"
    );
    println!("{}", "─".repeat(80));
    for m in &matches {
        print_match_row(m, threshold);
    }
    println!();
    println!("{} matches", matches.len());
    Ok(())
}

fn print_match_row(m: &ReceiptMatch, threshold: u8) {
    let state = if m.user_confirmed {
        "✓ confirmed"
    } else if m.confidence >= threshold {
        "auto"
    } else {
        "⚠️  review"
    };
    println!(
        "{:>6}  {:>6}  {:>7}  {:>4}  {:<14}  {:<20}  {}",
        m.id,
        m.transaction_id,
        m.receipt_id,
        m.confidence,
        m.match_type.as_str(),
        m.method.as_str(),
        state
    );
}

/// Scored candidates for a receipt; nothing is stored
pub fn cmd_matches_preview(db: &Database, config: &Config, receipt_id: i64) -> Result<()> {
    let receipt = db
        .get_receipt(receipt_id)?
        .ok_or_else(|| anyhow!("Receipt #{} not found", receipt_id))?;
    let candidates = matcher(config).preview_for_receipt(db, receipt_id)?;

    println!();
    println!(
        "🧾 Receipt #{}: {} {:.2} {} on {}",
        receipt.id, receipt.merchant_raw, receipt.total, receipt.currency, receipt.event_date
    );

    if candidates.is_empty() {
        println!("   No candidate transactions.");
        return Ok(());
    }

    println!();
    for c in &candidates {
        let tx = db.get_transaction(c.transaction_id)?;
        let description = tx
            .as_ref()
            .map(|t| truncate(&t.description, 32))
            .unwrap_or_default();
        let converted = c
            .conversion_rate
            .map(|r| format!(" (rate {:.4})", r))
            .unwrap_or_default();
        println!(
            "   [{:>3}] tx #{:<6} {:<32}  Δdays {:>2}  Δamount {:.2}{}  {}",
            c.confidence,
            c.transaction_id,
            description,
            c.date_delta_days,
            c.amount_delta,
            converted,
            c.method.as_str()
        );
    }
    Ok(())
}

/// Confirm a match and create its receipt enrichment if it has none yet
pub fn cmd_matches_confirm(db: &Database, config: &Config, id: i64) -> Result<()> {
    let m = db.confirm_match(id)?;
    let created = db.refresh_external_enrichment(m.id, config.matcher.auto_accept_threshold)?;

    println!(
        "✓ Confirmed match #{} (transaction #{} ↔ receipt #{})",
        m.id, m.transaction_id, m.receipt_id
    );
    if created.is_some() {
        println!("   Receipt enrichment added to transaction #{}", m.transaction_id);
    }
    Ok(())
}

pub fn cmd_matches_reject(db: &Database, id: i64) -> Result<()> {
    db.reject_match(id)?;
    println!("✓ Rejected match #{}; the pair will not be proposed again", id);
    Ok(())
}

pub fn cmd_matches_split(
    db: &Database,
    config: &Config,
    receipt_id: i64,
    transaction_ids: &[i64],
) -> Result<()> {
    let matches = matcher(config).create_split_match(db, receipt_id, transaction_ids)?;
    println!(
        "✓ Linked receipt #{} to {} transactions (split payment)",
        receipt_id,
        matches.len()
    );
    Ok(())
}

pub fn cmd_matches_bundle(
    db: &Database,
    config: &Config,
    transaction_id: i64,
    receipt_ids: &[i64],
) -> Result<()> {
    let matches = matcher(config).create_bundle_match(db, transaction_id, receipt_ids)?;
    println!(
        "✓ Linked transaction #{} to {} receipts (bundled order)",
        transaction_id,
        matches.len()
    );
    Ok(())
}

pub fn cmd_matches_primary(db: &Database, transaction_id: i64, external_id: i64) -> Result<()> {
    db.set_primary_external(transaction_id, external_id)?;
    println!(
        "✓ Receipt enrichment #{} is now primary for transaction #{}",
        external_id, transaction_id
    );
    Ok(())
}
