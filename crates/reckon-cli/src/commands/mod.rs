//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `core` - Init, status and shared utilities (open_db, config, date windows)
//! - `sync` - Provider sync and matching runs
//! - `matches` - Match review (list, preview, confirm, reject, split, bundle)
//! - `enrich` - Cost estimate, enrichment runs, failures and retries
//! - `jobs` - Job listing, inspection and cancellation
//! - `rules` - Enrichment rules and merchant aliases
//! - `retention` - Receipt retention, disconnects and account deletion
//! - `prompts` - Prompt library commands

pub mod core;
pub mod enrich;
pub mod jobs;
pub mod matches;
pub mod prompts;
pub mod retention;
pub mod rules;
pub mod sync;

// Re-export command functions for main.rs
pub use self::core::*;
pub use enrich::*;
pub use jobs::*;
pub use matches::*;
pub use prompts::*;
pub use retention::*;
pub use rules::*;
pub use sync::*;

use std::io::{self, Write};

use anyhow::Result;

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Ask a yes/no question on stdin; anything but "y" declines
pub fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}
