//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Reckon - Match receipts to bank transactions and enrich them
#[derive(Parser)]
#[command(name = "reckon")]
#[command(about = "Receipt reconciliation and transaction enrichment", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database path
    #[arg(long, default_value = "reckon.db", global = true)]
    pub db: PathBuf,

    /// Config file (defaults to the override in the data dir, then built-in defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable database encryption (not recommended for production)
    ///
    /// By default, the database is encrypted using SQLCipher.
    /// Set RECKON_DB_KEY environment variable with your passphrase.
    /// Use --no-encrypt only for development or testing.
    #[arg(long, global = true)]
    pub no_encrypt: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database and seed merchant aliases
    Init,

    /// Show database status and counts
    Status,

    /// Sync transactions and receipts from exported provider files, then match
    Sync {
        /// Aggregator export (JSON)
        #[arg(short, long)]
        transactions: PathBuf,

        /// Receipt source export (JSON)
        #[arg(short, long)]
        receipts: Option<PathBuf>,

        /// Window start (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,

        /// Window end (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,

        /// Window length in days when --from is not given
        #[arg(long, default_value = "90")]
        days: i64,
    },

    /// Match unmatched receipts against stored transactions
    Match,

    /// Review matches (list, preview, confirm, reject, split, bundle)
    Matches {
        #[command(subcommand)]
        action: Option<MatchesAction>,
    },

    /// LLM enrichment (estimate, run, failed, retry)
    Enrich {
        #[command(subcommand)]
        action: EnrichAction,
    },

    /// Inspect and cancel jobs
    Jobs {
        #[command(subcommand)]
        action: Option<JobsAction>,
    },

    /// Show the effective categorization of a transaction and where it came from
    Resolve {
        /// Transaction ID
        transaction_id: i64,
    },

    /// Manage merchant aliases
    Aliases {
        #[command(subcommand)]
        action: Option<AliasesAction>,
    },

    /// Manage enrichment rules (list, add, delete, test, apply)
    Rules {
        #[command(subcommand)]
        action: Option<RulesAction>,
    },

    /// Tombstone receipts older than the retention window
    Retention {
        /// Override the configured retention in days
        #[arg(long)]
        days: Option<i64>,
    },

    /// Tombstone every receipt from a disconnected receipt source
    Disconnect {
        /// Connection ID
        connection_id: String,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete an account and everything derived from its transactions
    DeleteAccount {
        /// Local account ID
        account_id: i64,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage LLM prompts (list, show, path)
    Prompts {
        #[command(subcommand)]
        action: Option<PromptsAction>,
    },
}

#[derive(Subcommand)]
pub enum MatchesAction {
    /// List matches
    List {
        /// Only matches awaiting confirmation
        #[arg(long)]
        review: bool,

        /// Only matches for this transaction
        #[arg(long)]
        transaction: Option<i64>,
    },

    /// Show scored candidates for a receipt without storing anything
    Preview {
        /// Receipt ID
        receipt_id: i64,
    },

    /// Confirm a match, making it eligible to enrich its transaction
    Confirm {
        /// Match ID
        id: i64,
    },

    /// Reject a match; the pair is never proposed again
    Reject {
        /// Match ID
        id: i64,
    },

    /// Link one receipt to several transactions (split payment)
    Split {
        /// Receipt ID
        receipt_id: i64,

        /// Transaction IDs (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        transactions: Vec<i64>,
    },

    /// Link several receipts to one transaction (bundled order)
    Bundle {
        /// Transaction ID
        transaction_id: i64,

        /// Receipt IDs (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        receipts: Vec<i64>,
    },

    /// Choose which receipt enrichment is primary for a transaction
    Primary {
        /// Transaction ID
        transaction_id: i64,

        /// External enrichment ID
        external_id: i64,
    },
}

#[derive(Subcommand)]
pub enum EnrichAction {
    /// Estimate cost without calling the LLM
    Estimate {
        /// Transaction IDs (comma-separated, default: all)
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<i64>>,

        /// Ignore cached and previous LLM results (rules still win)
        #[arg(long)]
        force_refresh: bool,
    },

    /// Run enrichment as a job
    Run {
        /// Transaction IDs (comma-separated, default: all)
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<i64>>,

        /// Ignore cached and previous LLM results (rules still win)
        #[arg(long)]
        force_refresh: bool,

        /// Confirm the estimated cost
        #[arg(short, long)]
        yes: bool,
    },

    /// List transactions whose enrichment failed
    Failed,

    /// Retry pending failures
    Retry {
        /// Confirm the estimated cost
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum JobsAction {
    /// List recent jobs
    List {
        /// Filter by status (queued, running, completed, failed, cancelled)
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of jobs to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show a job with its unit errors
    Show {
        /// Job ID
        id: i64,
    },

    /// Request cancellation of a job
    Cancel {
        /// Job ID
        id: i64,
    },

    /// Mark jobs left running by a crashed process as failed
    Recover,
}

#[derive(Subcommand)]
pub enum AliasesAction {
    /// List aliases
    List,

    /// Add or replace an alias
    Add {
        /// Observed merchant spelling
        alias: String,

        /// Canonical merchant id
        canonical: String,

        /// Category for receipt-derived enrichment
        #[arg(long)]
        category: Option<String>,

        /// Subcategory
        #[arg(long)]
        subcategory: Option<String>,

        /// Mark spend at this merchant as essential
        #[arg(long)]
        essential: bool,
    },

    /// Show how a merchant string normalizes
    Test {
        /// Raw merchant or description
        merchant: String,
    },
}

#[derive(Subcommand)]
pub enum RulesAction {
    /// List rules
    List,

    /// Add a rule
    Add {
        /// Pattern to match against transaction descriptions
        pattern: String,

        /// Category to assign
        category: String,

        /// Pattern type: contains, starts_with, exact, regex
        #[arg(long, default_value = "contains")]
        pattern_type: String,

        /// Subcategory
        #[arg(long)]
        subcategory: Option<String>,

        /// Merchant to record
        #[arg(long)]
        merchant: Option<String>,

        /// Mark matching spend as essential
        #[arg(long)]
        essential: bool,

        /// Priority (higher wins)
        #[arg(long, default_value = "0")]
        priority: i32,
    },

    /// Delete a rule
    Delete {
        /// Rule ID
        id: i64,
    },

    /// Show which rule a description would match
    Test {
        /// Transaction description
        description: String,
    },

    /// Apply rules to every stored transaction
    Apply,
}

#[derive(Subcommand)]
pub enum PromptsAction {
    /// List prompts and whether they are overridden
    List,

    /// Show a prompt
    Show {
        /// Prompt ID
        prompt_id: String,
    },

    /// Print the override directory
    Path,
}
