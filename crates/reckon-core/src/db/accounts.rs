//! Account operations

use rusqlite::{params, OptionalExtension};
use tracing::info;

use super::{parse_datetime, Database};
use crate::error::Result;
use crate::models::Account;

impl Database {
    /// Create or update an account by its aggregator id, returning the local ID
    pub fn upsert_account(
        &self,
        external_id: &str,
        name: &str,
        provider: &str,
        currency: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO accounts (external_id, name, provider, currency) VALUES (?, ?, ?, ?)
             ON CONFLICT(external_id) DO UPDATE SET name = excluded.name,
                 provider = excluded.provider, currency = excluded.currency",
            params![external_id, name, provider, currency.to_uppercase()],
        )?;

        let id = conn.query_row(
            "SELECT id FROM accounts WHERE external_id = ?",
            params![external_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Get an account by local ID
    pub fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let conn = self.conn()?;
        let account = conn
            .query_row(
                "SELECT id, external_id, name, provider, currency, created_at
                 FROM accounts WHERE id = ?",
                params![id],
                Self::row_to_account,
            )
            .optional()?;
        Ok(account)
    }

    /// List all accounts
    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, external_id, name, provider, currency, created_at
             FROM accounts ORDER BY name",
        )?;
        let accounts = stmt
            .query_map([], Self::row_to_account)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
        let created_at: String = row.get(5)?;
        Ok(Account {
            id: row.get(0)?,
            external_id: row.get(1)?,
            name: row.get(2)?,
            provider: row.get(3)?,
            currency: row.get(4)?,
            created_at: parse_datetime(&created_at),
        })
    }

    /// Explicit user data removal: delete an account and everything derived
    /// from its transactions (matches and enrichment results cascade).
    /// Returns the number of transactions removed.
    pub fn delete_account_data(&self, account_id: i64) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let removed = tx.execute(
            "DELETE FROM transactions WHERE account_id = ?",
            params![account_id],
        )?;
        tx.execute("DELETE FROM accounts WHERE id = ?", params![account_id])?;
        tx.commit()?;

        info!(account_id, removed, "Deleted account data");
        Ok(removed)
    }
}
