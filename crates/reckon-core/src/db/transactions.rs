//! Transaction operations

use std::collections::HashSet;

use chrono::NaiveDate;
use rusqlite::{params, params_from_iter, OptionalExtension};
use tracing::debug;

use super::{format_datetime, parse_datetime, parse_enum, placeholders, Database, MAX_IN_PARAMS};
use crate::error::Result;
use crate::models::{InsertStats, NewTransaction, Transaction};

pub(crate) const TRANSACTION_COLUMNS: &str = "t.id, t.account_id, t.external_id, t.posted_at, t.amount, t.currency,
     t.description, t.direction, t.merchant_normalized, t.created_at";

impl Database {
    /// Insert a batch of transactions for one account, skipping ones already stored
    ///
    /// Existing keys are found with one set-membership lookup per chunk of the
    /// batch (never one query per record) and rows are written with
    /// `ON CONFLICT DO NOTHING` inside a single SQLite transaction, so a
    /// concurrent writer racing us on the same id also lands in `duplicates`.
    pub fn insert_transactions(
        &self,
        account_id: i64,
        batch: &[NewTransaction],
    ) -> Result<InsertStats> {
        let mut stats = InsertStats::default();
        if batch.is_empty() {
            return Ok(stats);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut existing: HashSet<String> = HashSet::new();
        for chunk in batch.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT external_id FROM transactions WHERE account_id = ? AND external_id IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = tx.prepare(&sql)?;
            let mut values: Vec<&dyn rusqlite::ToSql> = vec![&account_id];
            values.extend(chunk.iter().map(|t| &t.external_id as &dyn rusqlite::ToSql));
            let rows = stmt.query_map(values.as_slice(), |row| row.get::<_, String>(0))?;
            for id in rows {
                existing.insert(id?);
            }
        }

        {
            let mut insert = tx.prepare(
                "INSERT INTO transactions (account_id, external_id, posted_at, amount, currency,
                    description, direction, merchant_normalized)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(account_id, external_id) DO NOTHING",
            )?;

            for record in batch {
                // Also covers repeats inside this batch
                if !existing.insert(record.external_id.clone()) {
                    stats.duplicates += 1;
                    continue;
                }
                let changed = insert.execute(params![
                    account_id,
                    record.external_id,
                    format_datetime(&record.posted_at),
                    record.amount,
                    record.currency,
                    record.description,
                    record.direction.as_str(),
                    record.merchant_normalized,
                ])?;
                if changed == 0 {
                    stats.duplicates += 1;
                } else {
                    stats.inserted += 1;
                }
            }
        }

        tx.commit()?;
        debug!(
            account_id,
            inserted = stats.inserted,
            duplicates = stats.duplicates,
            "Inserted transaction batch"
        );
        Ok(stats)
    }

    /// Get a transaction by ID
    pub fn get_transaction(&self, id: i64) -> Result<Option<Transaction>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM transactions t WHERE t.id = ?", TRANSACTION_COLUMNS);
        let tx = conn
            .query_row(&sql, params![id], Self::row_to_transaction)
            .optional()?;
        Ok(tx)
    }

    /// Get several transactions by ID (missing IDs are skipped)
    pub fn get_transactions_by_ids(&self, ids: &[i64]) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT {} FROM transactions t WHERE t.id IN ({}) ORDER BY t.id",
                TRANSACTION_COLUMNS,
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), Self::row_to_transaction)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    /// List transactions, newest first
    pub fn list_transactions(
        &self,
        account_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM transactions t
             WHERE (?1 IS NULL OR t.account_id = ?1)
             ORDER BY t.posted_at DESC, t.id DESC
             LIMIT ?2 OFFSET ?3",
            TRANSACTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let transactions = stmt
            .query_map(params![account_id, limit, offset], Self::row_to_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(transactions)
    }

    /// Transactions posted within a date range (inclusive), for matching
    pub fn list_transactions_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM transactions t
             WHERE date(t.posted_at) >= ? AND date(t.posted_at) <= ?
             ORDER BY t.posted_at, t.id",
            TRANSACTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let transactions = stmt
            .query_map(
                params![from.to_string(), to.to_string()],
                Self::row_to_transaction,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(transactions)
    }

    /// Count stored transactions
    pub fn count_transactions(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(count)
    }

    pub(crate) fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
        let posted_at: String = row.get(3)?;
        let direction: String = row.get(7)?;
        let created_at: String = row.get(9)?;

        Ok(Transaction {
            id: row.get(0)?,
            account_id: row.get(1)?,
            external_id: row.get(2)?,
            posted_at: parse_datetime(&posted_at),
            amount: row.get(4)?,
            currency: row.get(5)?,
            description: row.get(6)?,
            direction: parse_enum(7, &direction)?,
            merchant_normalized: row.get(8)?,
            created_at: parse_datetime(&created_at),
        })
    }
}
