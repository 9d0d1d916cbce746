//! Database access layer with connection pooling and migrations
//!
//! This module is organized by domain:
//! - `accounts` - Bank account operations and user data removal
//! - `transactions` - Idempotent batch ingestion and queries
//! - `receipts` - Receipt upsert, retention and tombstoning
//! - `matches` - Receipt/transaction links, confirmation and rejection
//! - `aliases` - Merchant alias table
//! - `rules` - Deterministic enrichment rules
//! - `enrichment` - Rule/LLM/external result tables and the precedence view
//! - `llm` - LLM categorization cache and failure tracking
//! - `jobs` - Persisted job state machine and progress counters

use chrono::{DateTime, NaiveDate, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

use crate::error::{Error, Result};

mod accounts;
mod aliases;
mod enrichment;
mod jobs;
mod llm;
mod matches;
mod receipts;
mod rules;
mod transactions;

pub use enrichment::TransactionEnrichmentState;
pub use llm::CacheEntry;
pub use matches::MatchFilter;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Environment variable for database encryption key
pub const DB_KEY_ENV: &str = "RECKON_DB_KEY";

/// Largest number of bound parameters we put in a single IN (...) list
pub(crate) const MAX_IN_PARAMS: usize = 500;

/// Derive an encryption key from a passphrase using Argon2
///
/// Uses a fixed application salt so the same passphrase always produces the same key,
/// regardless of database path. This allows moving/renaming/restoring the database freely.
fn derive_key(passphrase: &str) -> Result<String> {
    use argon2::{password_hash::SaltString, Argon2, PasswordHasher};

    // Fixed application salt - changing this would invalidate all existing encrypted databases
    const APP_SALT: &[u8; 16] = b"reckon-salt-v1-f";

    let salt = SaltString::encode_b64(APP_SALT)
        .map_err(|e| Error::Encryption(format!("Failed to create salt: {}", e)))?;

    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| Error::Encryption(format!("Failed to derive key: {}", e)))?;

    let hash_str = hash
        .hash
        .ok_or_else(|| Error::Encryption("No hash output".to_string()))?;
    Ok(hex::encode(hash_str.as_bytes()))
}

/// Parse a SQLite datetime string into a DateTime<Utc>
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    // SQLite stores as "YYYY-MM-DD HH:MM:SS" format
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)))
        .unwrap_or_else(|_| Utc::now())
}

/// Format a timestamp the way SQLite's CURRENT_TIMESTAMP does
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub(crate) fn parse_date(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Map a string column through `FromStr`, surfacing bad values as conversion errors
pub(crate) fn parse_enum<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

/// Build "?, ?, ?" for an IN list
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    /// Path to the database file
    db_path: String,
}

impl Database {
    /// Create a new database connection pool with encryption
    ///
    /// Requires `RECKON_DB_KEY` environment variable to be set.
    /// The database will be encrypted using SQLCipher with a key derived
    /// from the passphrase via Argon2.
    pub fn new(path: &str) -> Result<Self> {
        match std::env::var(DB_KEY_ENV).ok() {
            Some(key) => Self::new_with_key(path, Some(&key)),
            None => Err(Error::Encryption(format!(
                "Database encryption required. Set {} environment variable with your passphrase, \
                or use --no-encrypt for unencrypted databases (not recommended for production).",
                DB_KEY_ENV
            ))),
        }
    }

    /// Create a new unencrypted database connection pool
    ///
    /// WARNING: Only use for development or testing.
    pub fn new_unencrypted(path: &str) -> Result<Self> {
        Self::new_with_key(path, None)
    }

    /// Create a new database with an explicit encryption key
    pub fn new_with_key(path: &str, passphrase: Option<&str>) -> Result<Self> {
        let key_pragma = passphrase
            .map(derive_key)
            .transpose()?
            .map(|key| format!("PRAGMA key = 'x\"{}\"';", key));

        // Every pooled connection needs the key, foreign keys and a busy timeout;
        // workers write concurrently and must wait rather than fail on SQLITE_BUSY
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            if let Some(ref pragma) = key_pragma {
                conn.execute_batch(pragma)?;
            }
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
            Ok(())
        });

        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self {
            pool,
            db_path: path.to_string(),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create an in-memory database (for testing)
    ///
    /// Note: Uses a temporary file rather than `:memory:` because SQLCipher
    /// has issues with in-memory databases in the connection pool.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "reckon_test_{}_{}.db",
            std::process::id(),
            id
        ));
        let path = path.to_string_lossy().to_string();

        let _ = std::fs::remove_file(&path);

        Self::new_unencrypted(&path)
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- WAL mode: readers don't block the writer while workers persist results
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            -- Accounts (as reported by the aggregator)
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                provider TEXT NOT NULL,
                currency TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Canonical bank transactions
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                external_id TEXT NOT NULL,                 -- provider's stable id
                posted_at DATETIME NOT NULL,
                amount REAL NOT NULL,                      -- signed: debits negative
                currency TEXT NOT NULL,
                description TEXT NOT NULL,
                direction TEXT NOT NULL,                   -- debit, credit
                merchant_normalized TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(account_id, external_id)
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_posted ON transactions(posted_at);
            CREATE INDEX IF NOT EXISTS idx_transactions_merchant ON transactions(merchant_normalized);

            -- Canonical receipts (deduplicated per connection by receipt_hash)
            CREATE TABLE IF NOT EXISTS receipts (
                id INTEGER PRIMARY KEY,
                connection_id TEXT NOT NULL,
                source_type TEXT NOT NULL,                 -- email, marketplace_purchase, marketplace_return
                merchant_raw TEXT NOT NULL,
                merchant_normalized TEXT NOT NULL,
                order_ref TEXT,
                total REAL NOT NULL,
                currency TEXT NOT NULL,
                event_date DATE NOT NULL,
                line_items TEXT NOT NULL DEFAULT '[]',     -- JSON array of LineItem
                extraction_confidence INTEGER NOT NULL,
                extraction_method TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',     -- active, unparseable, tombstoned
                receipt_hash TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                tombstoned_at DATETIME,
                UNIQUE(connection_id, receipt_hash)
            );

            CREATE INDEX IF NOT EXISTS idx_receipts_status ON receipts(status);
            CREATE INDEX IF NOT EXISTS idx_receipts_event_date ON receipts(event_date);

            -- Matches (many-to-many, unique per pair)
            CREATE TABLE IF NOT EXISTS receipt_matches (
                id INTEGER PRIMARY KEY,
                transaction_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
                receipt_id INTEGER NOT NULL REFERENCES receipts(id) ON DELETE CASCADE,
                confidence INTEGER NOT NULL,
                match_type TEXT NOT NULL DEFAULT 'standard',
                method TEXT NOT NULL,
                currency_converted BOOLEAN NOT NULL DEFAULT 0,
                conversion_rate REAL,
                date_delta_days INTEGER NOT NULL,
                amount_delta REAL NOT NULL,
                user_confirmed BOOLEAN NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(transaction_id, receipt_id)
            );

            CREATE INDEX IF NOT EXISTS idx_matches_receipt ON receipt_matches(receipt_id);

            -- Pairs the user removed; never re-proposed by the matcher
            CREATE TABLE IF NOT EXISTS match_rejections (
                transaction_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
                receipt_id INTEGER NOT NULL REFERENCES receipts(id) ON DELETE CASCADE,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (transaction_id, receipt_id)
            );

            -- Merchant aliases (bank or receipt spelling → canonical id)
            CREATE TABLE IF NOT EXISTS merchant_aliases (
                id INTEGER PRIMARY KEY,
                alias TEXT NOT NULL UNIQUE COLLATE NOCASE,
                canonical_id TEXT NOT NULL,
                category TEXT,
                subcategory TEXT,
                essential BOOLEAN NOT NULL DEFAULT 0,
                source TEXT NOT NULL DEFAULT 'user',       -- seed, user
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_merchant_aliases_canonical ON merchant_aliases(canonical_id);

            -- Deterministic categorization rules
            CREATE TABLE IF NOT EXISTS enrichment_rules (
                id INTEGER PRIMARY KEY,
                pattern TEXT NOT NULL,
                pattern_type TEXT NOT NULL DEFAULT 'contains',
                category TEXT NOT NULL,
                subcategory TEXT,
                essential BOOLEAN NOT NULL DEFAULT 0,
                merchant TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_enrichment_rules_priority ON enrichment_rules(priority DESC);

            -- Rule-derived results (at most one per transaction)
            CREATE TABLE IF NOT EXISTS rule_enrichments (
                id INTEGER PRIMARY KEY,
                transaction_id INTEGER NOT NULL UNIQUE REFERENCES transactions(id) ON DELETE CASCADE,
                rule_id INTEGER NOT NULL REFERENCES enrichment_rules(id) ON DELETE CASCADE,
                pattern TEXT NOT NULL,
                category TEXT NOT NULL,
                subcategory TEXT,
                essential BOOLEAN NOT NULL DEFAULT 0,
                merchant TEXT,
                confidence INTEGER NOT NULL DEFAULT 100,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- LLM categorization cache keyed by (normalized description, direction)
            CREATE TABLE IF NOT EXISTS llm_cache (
                id INTEGER PRIMARY KEY,
                normalized_description TEXT NOT NULL,
                direction TEXT NOT NULL,
                category TEXT NOT NULL,
                subcategory TEXT,
                essential BOOLEAN NOT NULL DEFAULT 0,
                merchant TEXT,
                confidence INTEGER NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(normalized_description, direction)
            );

            -- LLM-derived results (at most one per transaction)
            CREATE TABLE IF NOT EXISTS llm_enrichments (
                id INTEGER PRIMARY KEY,
                transaction_id INTEGER NOT NULL UNIQUE REFERENCES transactions(id) ON DELETE CASCADE,
                category TEXT NOT NULL,
                subcategory TEXT,
                essential BOOLEAN NOT NULL DEFAULT 0,
                merchant TEXT,
                confidence INTEGER NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                cache_id INTEGER REFERENCES llm_cache(id) ON DELETE SET NULL,
                from_cache BOOLEAN NOT NULL DEFAULT 0,
                job_id INTEGER REFERENCES jobs(id) ON DELETE SET NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Receipt-derived results (one per usable match)
            CREATE TABLE IF NOT EXISTS external_enrichments (
                id INTEGER PRIMARY KEY,
                transaction_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
                match_id INTEGER NOT NULL UNIQUE REFERENCES receipt_matches(id) ON DELETE CASCADE,
                receipt_id INTEGER NOT NULL REFERENCES receipts(id) ON DELETE CASCADE,
                source_type TEXT NOT NULL,
                category TEXT NOT NULL,
                subcategory TEXT,
                essential BOOLEAN NOT NULL DEFAULT 0,
                merchant TEXT,
                confidence INTEGER NOT NULL,
                line_items TEXT NOT NULL DEFAULT '[]',
                is_primary BOOLEAN NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_external_enrichments_tx ON external_enrichments(transaction_id);
            -- Two primaries for one transaction cannot exist
            CREATE UNIQUE INDEX IF NOT EXISTS idx_external_enrichments_primary
                ON external_enrichments(transaction_id) WHERE is_primary = 1;

            -- LLM enrichment failures awaiting explicit retry
            CREATE TABLE IF NOT EXISTS llm_failures (
                id INTEGER PRIMARY KEY,
                transaction_id INTEGER NOT NULL UNIQUE REFERENCES transactions(id) ON DELETE CASCADE,
                error_kind TEXT NOT NULL,
                message TEXT NOT NULL,                     -- redacted
                retry_count INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'pending',    -- pending, permanent, resolved
                last_job_id INTEGER REFERENCES jobs(id) ON DELETE SET NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_llm_failures_status ON llm_failures(status);

            -- Asynchronous jobs (persisted state machine)
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,                        -- sync, enrichment, enrichment_retry
                status TEXT NOT NULL DEFAULT 'queued',     -- queued, running, completed, failed, cancelled
                processed_count INTEGER NOT NULL DEFAULT 0,
                total_count INTEGER NOT NULL DEFAULT 0,
                failed_units INTEGER NOT NULL DEFAULT 0,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0,
                inserted_count INTEGER NOT NULL DEFAULT 0,
                replaced_count INTEGER NOT NULL DEFAULT 0,
                duplicate_count INTEGER NOT NULL DEFAULT 0,
                rejected_count INTEGER NOT NULL DEFAULT 0,
                cancel_requested BOOLEAN NOT NULL DEFAULT 0,
                error_message TEXT,
                summary TEXT,                              -- JSON
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                started_at DATETIME,
                completed_at DATETIME
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

            -- Per-unit failures collected while a job ran
            CREATE TABLE IF NOT EXISTS job_unit_errors (
                id INTEGER PRIMARY KEY,
                job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                unit TEXT NOT NULL,
                error_kind TEXT NOT NULL,
                message TEXT NOT NULL,                     -- redacted
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_job_unit_errors_job ON job_unit_errors(job_id);
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }
}
