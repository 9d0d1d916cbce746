//! Receipt retention, disconnects and account deletion

use anyhow::{anyhow, Result};
use reckon_core::db::Database;

use super::confirm;

pub fn cmd_retention(db: &Database, days: i64) -> Result<()> {
    let count = db.tombstone_expired_receipts(days)?;
    if count == 0 {
        println!("No receipts older than {} days.", days);
    } else {
        println!(
            "✓ Tombstoned {} receipts older than {} days; their enrichment was withdrawn",
            count, days
        );
    }
    Ok(())
}

/// Tombstone every receipt from a source the user disconnected
pub fn cmd_disconnect(db: &Database, connection_id: &str, yes: bool) -> Result<()> {
    if !yes
        && !confirm(&format!(
            "Remove all receipts from connection '{}'?",
            connection_id
        ))?
    {
        println!("Cancelled.");
        return Ok(());
    }

    let count = db.disconnect_connection(connection_id)?;
    println!(
        "✓ Disconnected '{}': {} receipts tombstoned",
        connection_id, count
    );
    Ok(())
}

/// Remove an account and everything derived from its transactions
pub fn cmd_delete_account(db: &Database, account_id: i64, yes: bool) -> Result<()> {
    let account = db
        .get_account(account_id)?
        .ok_or_else(|| anyhow!("Account #{} not found", account_id))?;

    if !yes
        && !confirm(&format!(
            "Delete account '{}' ({}) and all of its transactions?",
            account.name, account.provider
        ))?
    {
        println!("Cancelled.");
        return Ok(());
    }

    let removed = db.delete_account_data(account_id)?;
    println!(
        "✓ Deleted account '{}' and {} transactions",
        account.name, removed
    );
    Ok(())
}
