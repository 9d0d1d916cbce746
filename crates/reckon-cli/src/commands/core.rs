//! Core command implementations and shared utilities
//!
//! This module contains:
//! - `open_db` - Shared utility to open the database
//! - `load_config` - Config with override resolution
//! - `resolve_window` - Sync date window from flags
//! - `cmd_init` - Initialize the database
//! - `cmd_status` - Database status and counts

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use reckon_core::db::{Database, DB_KEY_ENV};
use reckon_core::models::{JobStatus, ReceiptStatus};
use reckon_core::{AIClient, Config, DateWindow, EnrichmentOrchestrator};

/// Open database with encryption by default, or unencrypted if --no-encrypt
pub fn open_db(db_path: &Path, no_encrypt: bool) -> Result<Database> {
    let path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow!("Database path is not valid UTF-8: {}", db_path.display()))?;
    if no_encrypt {
        Database::new_unencrypted(path_str).context("Failed to open database (unencrypted)")
    } else {
        Database::new(path_str).context("Failed to open database")
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load(path).context("Failed to load configuration")
}

/// Explicit --from/--to, or the last `days` days
pub fn resolve_window(from: Option<&str>, to: Option<&str>, days: i64) -> Result<DateWindow> {
    let parse = |s: &str, flag: &str| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("Invalid {} date format (use YYYY-MM-DD)", flag))
    };

    match (from, to) {
        (None, None) => Ok(DateWindow::last_days(days)),
        (from, to) => {
            let to = match to {
                Some(s) => parse(s, "--to")?,
                None => Utc::now().date_naive(),
            };
            let from = match from {
                Some(s) => parse(s, "--from")?,
                None => to - chrono::Duration::days(days.max(0)),
            };
            Ok(DateWindow::new(from, to)?)
        }
    }
}

/// Build the enrichment orchestrator on the LLM backend configured in the environment
pub fn orchestrator(db: &Database, config: &Config) -> Result<EnrichmentOrchestrator> {
    let backend = AIClient::from_env().ok_or_else(|| {
        anyhow!("No LLM backend configured. Set OLLAMA_HOST, or AI_BACKEND=openai_compatible with OPENAI_COMPATIBLE_HOST")
    })?;
    Ok(EnrichmentOrchestrator::new(
        db.clone(),
        backend,
        config.enrichment.clone(),
        config.jobs.clone(),
    ))
}

pub fn cmd_init(db_path: &Path, no_encrypt: bool) -> Result<()> {
    println!("🔧 Initializing database at {}...", db_path.display());

    let db = open_db(db_path, no_encrypt)?;

    let seeded = db
        .seed_merchant_aliases()
        .context("Failed to seed merchant aliases")?;
    println!("   Seeded {} merchant aliases", seeded);

    if no_encrypt {
        println!("   ⚠️  Encryption: DISABLED (--no-encrypt)");
    } else {
        println!("   🔒 Encryption: ENABLED");
    }

    println!("✅ Database initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  1. Sync: reckon sync --transactions bank.json --receipts receipts.json");
    println!("  2. Review matches: reckon matches list --review");
    println!("  3. Enrich: reckon enrich estimate");

    Ok(())
}

pub fn cmd_status(db_path: &Path, no_encrypt: bool) -> Result<()> {
    println!();
    println!("📊 Reckon Status");
    println!("   ─────────────────────────────────────────────────────────────");
    println!("   Database: {}", db_path.display());

    if db_path.exists() {
        if let Ok(metadata) = std::fs::metadata(db_path) {
            let size_kb = metadata.len() as f64 / 1024.0;
            if size_kb < 1024.0 {
                println!("   Size: {:.1} KB", size_kb);
            } else {
                println!("   Size: {:.1} MB", size_kb / 1024.0);
            }
        }
    } else {
        println!("   Size: (database not initialized)");
        println!();
        return Ok(());
    }

    let has_key = std::env::var(DB_KEY_ENV).is_ok();
    if no_encrypt {
        println!("   ⚠️  Encryption: DISABLED (--no-encrypt)");
    } else if has_key {
        println!("   🔒 Encryption: ENABLED ({}=***)", DB_KEY_ENV);
    } else {
        println!("   ❌ Encryption: REQUIRED but {} not set", DB_KEY_ENV);
    }

    match open_db(db_path, no_encrypt) {
        Ok(db) => print_counts(&db)?,
        Err(e) => {
            println!();
            println!("   ❌ Error opening database: {}", e);
            if !no_encrypt && !has_key {
                println!("      Set {} or use --no-encrypt", DB_KEY_ENV);
            } else if has_key {
                println!("      (Check if {} is correct)", DB_KEY_ENV);
            }
        }
    }

    println!();
    Ok(())
}

fn print_counts(db: &Database) -> Result<()> {
    println!();
    println!("   Accounts: {}", db.list_accounts()?.len());
    println!("   Transactions: {}", db.count_transactions()?);
    println!(
        "   Receipts: {} active, {} unparseable, {} tombstoned",
        db.count_receipts(Some(ReceiptStatus::Active))?,
        db.count_receipts(Some(ReceiptStatus::Unparseable))?,
        db.count_receipts(Some(ReceiptStatus::Tombstoned))?
    );
    println!("   Matches: {}", db.count_matches(None)?);
    println!("   LLM cache entries: {}", db.count_cache_entries()?);

    let running = db.list_jobs(Some(JobStatus::Running), 100)?.len();
    if running > 0 {
        println!("   ⏳ Running jobs: {}", running);
    }
    Ok(())
}
