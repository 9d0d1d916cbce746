//! Receipt match operations

use std::collections::HashSet;

use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use super::{parse_datetime, parse_enum, Database};
use crate::error::{Error, Result};
use crate::models::{NewMatch, ReceiptMatch};

const MATCH_COLUMNS: &str = "id, transaction_id, receipt_id, confidence, match_type, method,
     currency_converted, conversion_rate, date_delta_days, amount_delta, user_confirmed, created_at";

/// Filters for listing matches
#[derive(Debug, Clone, Default)]
pub struct MatchFilter {
    pub transaction_id: Option<i64>,
    pub receipt_id: Option<i64>,
    /// Only matches still waiting for the user (below the auto-accept threshold, unconfirmed)
    pub needs_review_below: Option<u8>,
}

impl Database {
    /// Store proposed matches, skipping pairs already linked or rejected by the user
    ///
    /// Returns the number of new rows.
    pub fn insert_matches(&self, matches: &[NewMatch]) -> Result<usize> {
        if matches.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO receipt_matches (transaction_id, receipt_id, confidence, match_type,
                    method, currency_converted, conversion_rate, date_delta_days, amount_delta)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
                 WHERE NOT EXISTS (
                    SELECT 1 FROM match_rejections WHERE transaction_id = ?1 AND receipt_id = ?2
                 )
                 ON CONFLICT(transaction_id, receipt_id) DO NOTHING",
            )?;
            for m in matches {
                inserted += stmt.execute(params![
                    m.transaction_id,
                    m.receipt_id,
                    m.confidence,
                    m.match_type.as_str(),
                    m.method.as_str(),
                    m.conversion_rate.is_some(),
                    m.conversion_rate,
                    m.date_delta_days,
                    m.amount_delta,
                ])?;
            }
        }
        tx.commit()?;

        debug!(proposed = matches.len(), inserted, "Stored matches");
        Ok(inserted)
    }

    /// Get a match by ID
    pub fn get_match(&self, id: i64) -> Result<Option<ReceiptMatch>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM receipt_matches WHERE id = ?", MATCH_COLUMNS);
        let m = conn
            .query_row(&sql, params![id], Self::row_to_match)
            .optional()?;
        Ok(m)
    }

    /// Get the match for a (transaction, receipt) pair
    pub fn get_match_for_pair(
        &self,
        transaction_id: i64,
        receipt_id: i64,
    ) -> Result<Option<ReceiptMatch>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM receipt_matches WHERE transaction_id = ? AND receipt_id = ?",
            MATCH_COLUMNS
        );
        let m = conn
            .query_row(&sql, params![transaction_id, receipt_id], Self::row_to_match)
            .optional()?;
        Ok(m)
    }

    /// List matches, highest confidence first
    pub fn list_matches(&self, filter: &MatchFilter) -> Result<Vec<ReceiptMatch>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM receipt_matches
             WHERE (?1 IS NULL OR transaction_id = ?1)
               AND (?2 IS NULL OR receipt_id = ?2)
               AND (?3 IS NULL OR (confidence < ?3 AND user_confirmed = 0))
             ORDER BY confidence DESC, id",
            MATCH_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let matches = stmt
            .query_map(
                params![filter.transaction_id, filter.receipt_id, filter.needs_review_below],
                Self::row_to_match,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(matches)
    }

    /// Transactions and receipts that already have any match (standard matching is one-to-one)
    pub fn matched_ids(&self) -> Result<(HashSet<i64>, HashSet<i64>)> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT transaction_id, receipt_id FROM receipt_matches")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;

        let mut transactions = HashSet::new();
        let mut receipts = HashSet::new();
        for row in rows {
            let (tx_id, receipt_id) = row?;
            transactions.insert(tx_id);
            receipts.insert(receipt_id);
        }
        Ok((transactions, receipts))
    }

    /// Pairs the user removed
    pub fn rejected_pairs(&self) -> Result<HashSet<(i64, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT transaction_id, receipt_id FROM match_rejections")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(pairs)
    }

    /// Mark a match as confirmed by the user, making it primary-eligible
    pub fn confirm_match(&self, id: i64) -> Result<ReceiptMatch> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE receipt_matches SET user_confirmed = 1 WHERE id = ?",
            params![id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Match {}", id)));
        }
        drop(conn);

        info!(match_id = id, "Match confirmed");
        self.get_match(id)?
            .ok_or_else(|| Error::NotFound(format!("Match {}", id)))
    }

    /// Remove a match the user says is wrong
    ///
    /// The transaction and receipt are untouched. The external enrichment the
    /// match produced is withdrawn (promoting the next primary if needed) and
    /// the pair is remembered so the matcher never proposes it again.
    pub fn reject_match(&self, id: i64) -> Result<()> {
        let m = self
            .get_match(id)?
            .ok_or_else(|| Error::NotFound(format!("Match {}", id)))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::remove_external_for_match_in(&tx, id)?;
        tx.execute("DELETE FROM receipt_matches WHERE id = ?", params![id])?;
        tx.execute(
            "INSERT OR IGNORE INTO match_rejections (transaction_id, receipt_id) VALUES (?, ?)",
            params![m.transaction_id, m.receipt_id],
        )?;
        tx.commit()?;

        info!(match_id = id, "Match rejected");
        Ok(())
    }

    /// Count matches (all, or only those awaiting review)
    pub fn count_matches(&self, needs_review_below: Option<u8>) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM receipt_matches
             WHERE ?1 IS NULL OR (confidence < ?1 AND user_confirmed = 0)",
            params![needs_review_below],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn row_to_match(row: &rusqlite::Row) -> rusqlite::Result<ReceiptMatch> {
        let match_type: String = row.get(4)?;
        let method: String = row.get(5)?;
        let created_at: String = row.get(11)?;

        Ok(ReceiptMatch {
            id: row.get(0)?,
            transaction_id: row.get(1)?,
            receipt_id: row.get(2)?,
            confidence: row.get(3)?,
            match_type: parse_enum(4, &match_type)?,
            method: parse_enum(5, &method)?,
            currency_converted: row.get(6)?,
            conversion_rate: row.get(7)?,
            date_delta_days: row.get(8)?,
            amount_delta: row.get(9)?,
            user_confirmed: row.get(10)?,
            created_at: parse_datetime(&created_at),
        })
    }
}
