//! LLM categorization cache and failure tracking

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};

use super::{parse_datetime, parse_enum, Database, MAX_IN_PARAMS};
use crate::error::{redact, Result};
use crate::models::{Direction, EnrichmentFailure, EnrichmentFields, FailureStatus};

/// A cached categorization, keyed by (normalized description, direction)
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: i64,
    pub normalized_description: String,
    pub direction: Direction,
    pub fields: EnrichmentFields,
    pub provider: String,
    pub model: String,
}

const FAILURE_COLUMNS: &str =
    "id, transaction_id, error_kind, message, retry_count, status, last_job_id, updated_at";

impl Database {
    /// Look up cache entries for a batch of keys in as few queries as possible
    pub fn get_cache_entries(
        &self,
        keys: &[(String, Direction)],
    ) -> Result<HashMap<(String, Direction), CacheEntry>> {
        let conn = self.conn()?;
        let mut found = HashMap::new();

        // Two bound parameters per key
        for chunk in keys.chunks(MAX_IN_PARAMS / 2) {
            let conditions = vec!["(normalized_description = ? AND direction = ?)"; chunk.len()]
                .join(" OR ");
            let sql = format!(
                "SELECT id, normalized_description, direction, category, subcategory, essential,
                        merchant, confidence, provider, model
                 FROM llm_cache WHERE {}",
                conditions
            );
            let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() * 2);
            let directions: Vec<&'static str> = chunk.iter().map(|(_, d)| d.as_str()).collect();
            for ((description, _), direction) in chunk.iter().zip(directions.iter()) {
                values.push(description);
                values.push(direction);
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(values.as_slice(), Self::row_to_cache_entry)?;
            for row in rows {
                let entry = row?;
                found.insert(
                    (entry.normalized_description.clone(), entry.direction),
                    entry,
                );
            }
        }

        Ok(found)
    }

    /// Write (or overwrite) a cache entry after a successful LLM call
    pub fn put_cache_entry(
        &self,
        normalized_description: &str,
        direction: Direction,
        fields: &EnrichmentFields,
        provider: &str,
        model: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO llm_cache (normalized_description, direction, category, subcategory,
                essential, merchant, confidence, provider, model)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(normalized_description, direction) DO UPDATE SET
                category = excluded.category, subcategory = excluded.subcategory,
                essential = excluded.essential, merchant = excluded.merchant,
                confidence = excluded.confidence, provider = excluded.provider,
                model = excluded.model, created_at = CURRENT_TIMESTAMP",
            params![
                normalized_description,
                direction.as_str(),
                fields.category,
                fields.subcategory,
                fields.essential,
                fields.merchant,
                fields.confidence,
                provider,
                model,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM llm_cache WHERE normalized_description = ? AND direction = ?",
            params![normalized_description, direction.as_str()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn count_cache_entries(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM llm_cache", [], |row| row.get(0))?;
        Ok(count)
    }

    fn row_to_cache_entry(row: &rusqlite::Row) -> rusqlite::Result<CacheEntry> {
        let direction: String = row.get(2)?;
        Ok(CacheEntry {
            id: row.get(0)?,
            normalized_description: row.get(1)?,
            direction: parse_enum(2, &direction)?,
            fields: EnrichmentFields {
                category: row.get(3)?,
                subcategory: row.get(4)?,
                essential: row.get(5)?,
                merchant: row.get(6)?,
                confidence: row.get(7)?,
            },
            provider: row.get(8)?,
            model: row.get(9)?,
        })
    }

    // ========== Failures ==========

    /// Record a failed LLM enrichment for a transaction
    ///
    /// The first failure starts at `retry_count = 1`; each later failure
    /// increments it, and reaching `max_retries` makes the failure permanent.
    /// A transaction that had been resolved starts over at 1.
    pub fn record_llm_failure(
        &self,
        transaction_id: i64,
        error_kind: &str,
        message: &str,
        job_id: Option<i64>,
        max_retries: i64,
    ) -> Result<EnrichmentFailure> {
        let message = redact(message);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO llm_failures (transaction_id, error_kind, message, retry_count, status, last_job_id)
             VALUES (?1, ?2, ?3, 1, CASE WHEN 1 >= ?5 THEN 'permanent' ELSE 'pending' END, ?4)
             ON CONFLICT(transaction_id) DO UPDATE SET
                error_kind = excluded.error_kind,
                message = excluded.message,
                last_job_id = excluded.last_job_id,
                updated_at = CURRENT_TIMESTAMP,
                retry_count = CASE WHEN llm_failures.status = 'resolved' THEN 1
                                   ELSE llm_failures.retry_count + 1 END,
                status = CASE WHEN (CASE WHEN llm_failures.status = 'resolved' THEN 1
                                         ELSE llm_failures.retry_count + 1 END) >= ?5
                              THEN 'permanent' ELSE 'pending' END",
            params![transaction_id, error_kind, message, job_id, max_retries],
        )?;
        drop(conn);

        let failure = self.get_llm_failure(transaction_id)?.ok_or_else(|| {
            crate::error::Error::NotFound(format!("Failure for transaction {}", transaction_id))
        })?;
        if failure.status == FailureStatus::Permanent {
            warn!(
                transaction_id,
                retry_count = failure.retry_count,
                "Enrichment failure is now permanent"
            );
        }
        Ok(failure)
    }

    /// Mark a failure resolved after a successful retry
    pub fn resolve_llm_failure(&self, transaction_id: i64) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE llm_failures SET status = 'resolved', updated_at = CURRENT_TIMESTAMP
             WHERE transaction_id = ? AND status != 'resolved'",
            params![transaction_id],
        )?;
        if updated > 0 {
            debug!(transaction_id, "Enrichment failure resolved");
        }
        Ok(())
    }

    pub fn get_llm_failure(&self, transaction_id: i64) -> Result<Option<EnrichmentFailure>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM llm_failures WHERE transaction_id = ?",
            FAILURE_COLUMNS
        );
        let failure = conn
            .query_row(&sql, params![transaction_id], Self::row_to_failure)
            .optional()?;
        Ok(failure)
    }

    /// List failures, optionally by status
    pub fn list_llm_failures(&self, status: Option<FailureStatus>) -> Result<Vec<EnrichmentFailure>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM llm_failures WHERE ?1 IS NULL OR status = ?1
             ORDER BY updated_at DESC, id DESC",
            FAILURE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let failures = stmt
            .query_map(params![status.map(|s| s.as_str())], Self::row_to_failure)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(failures)
    }

    /// Transactions whose failure is still eligible for an explicit retry
    pub fn retryable_failure_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT transaction_id FROM llm_failures WHERE status = 'pending' ORDER BY transaction_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    fn row_to_failure(row: &rusqlite::Row) -> rusqlite::Result<EnrichmentFailure> {
        let status: String = row.get(5)?;
        let updated_at: String = row.get(7)?;
        Ok(EnrichmentFailure {
            id: row.get(0)?,
            transaction_id: row.get(1)?,
            error_kind: row.get(2)?,
            message: row.get(3)?,
            retry_count: row.get(4)?,
            status: parse_enum(5, &status)?,
            last_job_id: row.get(6)?,
            updated_at: parse_datetime(&updated_at),
        })
    }
}
