//! Receipt operations

use std::collections::HashMap;

use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::info;

use super::{parse_date, parse_datetime, parse_enum, placeholders, Database, MAX_IN_PARAMS};
use crate::error::Result;
use crate::models::{InsertStats, NewReceipt, Receipt, ReceiptStatus};

const RECEIPT_COLUMNS: &str = "id, connection_id, source_type, merchant_raw, merchant_normalized, order_ref,
     total, currency, event_date, line_items, extraction_confidence, extraction_method,
     status, receipt_hash, created_at, tombstoned_at";

impl Database {
    /// Upsert a batch of (already deduplicated) receipts
    ///
    /// One lookup finds the stored hashes for the batch. A stored receipt is
    /// replaced only when the incoming copy has strictly higher extraction
    /// confidence; the conflict clause enforces the same rule in SQL so
    /// concurrent writers can't regress a receipt. Tombstoned receipts stay
    /// tombstoned.
    pub fn upsert_receipts(&self, batch: &[NewReceipt]) -> Result<InsertStats> {
        let mut stats = InsertStats::default();
        if batch.is_empty() {
            return Ok(stats);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        // (connection_id, receipt_hash) → stored confidence
        let mut existing: HashMap<(String, String), u8> = HashMap::new();
        for chunk in batch.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT connection_id, receipt_hash, extraction_confidence FROM receipts
                 WHERE receipt_hash IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(chunk.iter().map(|r| &r.receipt_hash)),
                |row| Ok(((row.get(0)?, row.get(1)?), row.get(2)?)),
            )?;
            for row in rows {
                let (key, confidence) = row?;
                existing.insert(key, confidence);
            }
        }

        {
            let mut upsert = tx.prepare(
                "INSERT INTO receipts (connection_id, source_type, merchant_raw, merchant_normalized,
                    order_ref, total, currency, event_date, line_items, extraction_confidence,
                    extraction_method, status, receipt_hash)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(connection_id, receipt_hash) DO UPDATE SET
                    source_type = excluded.source_type,
                    merchant_raw = excluded.merchant_raw,
                    line_items = excluded.line_items,
                    extraction_confidence = excluded.extraction_confidence,
                    extraction_method = excluded.extraction_method,
                    status = excluded.status
                 WHERE excluded.extraction_confidence > receipts.extraction_confidence
                   AND receipts.status != 'tombstoned'",
            )?;

            for receipt in batch {
                let key = (receipt.connection_id.clone(), receipt.receipt_hash.clone());
                let line_items = serde_json::to_string(&receipt.line_items)?;
                let changed = upsert.execute(params![
                    receipt.connection_id,
                    receipt.source_type.as_str(),
                    receipt.merchant_raw,
                    receipt.merchant_normalized,
                    receipt.order_ref,
                    receipt.total,
                    receipt.currency,
                    receipt.event_date.to_string(),
                    line_items,
                    receipt.extraction_confidence,
                    receipt.extraction_method.as_str(),
                    receipt.status.as_str(),
                    receipt.receipt_hash,
                ])?;

                match (existing.get(&key), changed) {
                    (None, 0) => stats.duplicates += 1,
                    (None, _) => {
                        stats.inserted += 1;
                        existing.insert(key, receipt.extraction_confidence);
                    }
                    (Some(_), 0) => stats.duplicates += 1,
                    (Some(_), _) => {
                        stats.replaced += 1;
                        existing.insert(key, receipt.extraction_confidence);
                    }
                }
            }
        }

        tx.commit()?;
        Ok(stats)
    }

    /// Get receipt by ID
    pub fn get_receipt(&self, id: i64) -> Result<Option<Receipt>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM receipts WHERE id = ?", RECEIPT_COLUMNS);
        let receipt = conn
            .query_row(&sql, params![id], Self::row_to_receipt)
            .optional()?;
        Ok(receipt)
    }

    /// Get receipt by its dedup key
    pub fn get_receipt_by_hash(
        &self,
        connection_id: &str,
        receipt_hash: &str,
    ) -> Result<Option<Receipt>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM receipts WHERE connection_id = ? AND receipt_hash = ?",
            RECEIPT_COLUMNS
        );
        let receipt = conn
            .query_row(&sql, params![connection_id, receipt_hash], Self::row_to_receipt)
            .optional()?;
        Ok(receipt)
    }

    /// Get receipts by status
    pub fn list_receipts(&self, status: ReceiptStatus) -> Result<Vec<Receipt>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM receipts WHERE status = ? ORDER BY event_date DESC, id DESC",
            RECEIPT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let receipts = stmt
            .query_map(params![status.as_str()], Self::row_to_receipt)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(receipts)
    }

    /// Active receipts that have no match yet
    pub fn list_unmatched_receipts(&self) -> Result<Vec<Receipt>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM receipts r
             WHERE r.status = 'active'
               AND NOT EXISTS (SELECT 1 FROM receipt_matches m WHERE m.receipt_id = r.id)
             ORDER BY r.event_date, r.id",
            RECEIPT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let receipts = stmt
            .query_map([], Self::row_to_receipt)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(receipts)
    }

    /// Count receipts, optionally by status
    pub fn count_receipts(&self, status: Option<ReceiptStatus>) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM receipts WHERE ?1 IS NULL OR status = ?1",
            params![status.map(|s| s.as_str())],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Flag a receipt whose extracted fields can't be matched on
    pub fn mark_receipt_unparseable(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE receipts SET status = 'unparseable' WHERE id = ? AND status = 'active'",
            params![id],
        )?;
        Ok(())
    }

    /// Tombstone receipts whose event date is older than the retention window
    pub fn tombstone_expired_receipts(&self, retention_days: i64) -> Result<usize> {
        let cutoff: NaiveDate = (Utc::now() - Duration::days(retention_days)).date_naive();
        let ids = self.receipt_ids_where(
            "status != 'tombstoned' AND event_date < ?",
            &cutoff.to_string(),
        )?;
        let count = self.tombstone_receipts(&ids)?;
        info!(count, %cutoff, "Tombstoned expired receipts");
        Ok(count)
    }

    /// Tombstone every receipt from a connection (user disconnected the source)
    pub fn disconnect_connection(&self, connection_id: &str) -> Result<usize> {
        let ids = self.receipt_ids_where(
            "status != 'tombstoned' AND connection_id = ?",
            connection_id,
        )?;
        let count = self.tombstone_receipts(&ids)?;
        info!(count, "Tombstoned receipts for disconnected connection");
        Ok(count)
    }

    fn receipt_ids_where(&self, condition: &str, value: &str) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let sql = format!("SELECT id FROM receipts WHERE {}", condition);
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params![value], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Soft-delete receipts and withdraw the enrichment they fed
    ///
    /// Each receipt's withdrawal and tombstone commit together.
    fn tombstone_receipts(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn()?;
        let mut count = 0;
        for &id in ids {
            let tx = conn.transaction()?;
            Self::remove_external_for_receipt_in(&tx, id)?;
            count += tx.execute(
                "UPDATE receipts SET status = 'tombstoned', tombstoned_at = CURRENT_TIMESTAMP
                 WHERE id = ? AND status != 'tombstoned'",
                params![id],
            )?;
            tx.commit()?;
        }
        Ok(count)
    }

    fn row_to_receipt(row: &rusqlite::Row) -> rusqlite::Result<Receipt> {
        let source_type: String = row.get(2)?;
        let event_date: String = row.get(8)?;
        let line_items: String = row.get(9)?;
        let method: String = row.get(11)?;
        let status: String = row.get(12)?;
        let created_at: String = row.get(14)?;
        let tombstoned_at: Option<String> = row.get(15)?;

        Ok(Receipt {
            id: row.get(0)?,
            connection_id: row.get(1)?,
            source_type: parse_enum(2, &source_type)?,
            merchant_raw: row.get(3)?,
            merchant_normalized: row.get(4)?,
            order_ref: row.get(5)?,
            total: row.get(6)?,
            currency: row.get(7)?,
            event_date: parse_date(&event_date)?,
            line_items: serde_json::from_str(&line_items).unwrap_or_default(),
            extraction_confidence: row.get(10)?,
            extraction_method: parse_enum(11, &method)?,
            status: parse_enum(12, &status)?,
            receipt_hash: row.get(13)?,
            created_at: parse_datetime(&created_at),
            tombstoned_at: tombstoned_at.map(|s| parse_datetime(&s)),
        })
    }
}
