//! Enrichment result tables and the precedence view
//!
//! Rule, LLM and external results live in separate tables and are never
//! overwritten by each other; `resolve` picks the effective one.

use std::collections::HashMap;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use super::{parse_datetime, parse_enum, placeholders, Database, MAX_IN_PARAMS};
use crate::error::{Error, Result};
use crate::merge;
use crate::models::{
    EffectiveEnrichment, EnrichmentFields, ExternalEnrichment, FailureStatus, LlmEnrichment,
    NewExternalEnrichment, NewLlmEnrichment, ReceiptStatus, RuleEnrichment,
};

const EXTERNAL_COLUMNS: &str = "id, transaction_id, match_id, receipt_id, source_type, category,
     subcategory, essential, merchant, confidence, line_items, is_primary, created_at";

/// What the orchestrator needs to know about one transaction before enriching it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionEnrichmentState {
    pub has_rule: bool,
    pub has_llm: bool,
    /// Recorded LLM failure, if any
    pub failure: Option<FailureStatus>,
}

impl TransactionEnrichmentState {
    /// Already categorized by a deterministic rule or a previous LLM call
    pub fn is_enriched(&self) -> bool {
        self.has_rule || self.has_llm
    }

    /// Waiting for an explicit retry (or past the retry ceiling)
    pub fn is_failed(&self) -> bool {
        matches!(
            self.failure,
            Some(FailureStatus::Pending) | Some(FailureStatus::Permanent)
        )
    }
}

impl Database {
    // ========== Rule results ==========

    /// Record the rule result for a transaction (replaces an earlier rule result)
    pub fn upsert_rule_enrichment(
        &self,
        transaction_id: i64,
        rule_id: i64,
        pattern: &str,
        fields: &EnrichmentFields,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO rule_enrichments (transaction_id, rule_id, pattern, category, subcategory,
                essential, merchant, confidence)
             VALUES (?, ?, ?, ?, ?, ?, ?, 100)
             ON CONFLICT(transaction_id) DO UPDATE SET rule_id = excluded.rule_id,
                pattern = excluded.pattern, category = excluded.category,
                subcategory = excluded.subcategory, essential = excluded.essential,
                merchant = excluded.merchant, created_at = CURRENT_TIMESTAMP",
            params![
                transaction_id,
                rule_id,
                pattern,
                fields.category,
                fields.subcategory,
                fields.essential,
                fields.merchant,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM rule_enrichments WHERE transaction_id = ?",
            params![transaction_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_rule_enrichment(&self, transaction_id: i64) -> Result<Option<RuleEnrichment>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT id, transaction_id, rule_id, pattern, category, subcategory, essential,
                        merchant, confidence, created_at
                 FROM rule_enrichments WHERE transaction_id = ?",
                params![transaction_id],
                |row| {
                    let created_at: String = row.get(9)?;
                    Ok(RuleEnrichment {
                        id: row.get(0)?,
                        transaction_id: row.get(1)?,
                        rule_id: row.get(2)?,
                        pattern: row.get(3)?,
                        fields: EnrichmentFields {
                            category: row.get(4)?,
                            subcategory: row.get(5)?,
                            essential: row.get(6)?,
                            merchant: row.get(7)?,
                            confidence: row.get(8)?,
                        },
                        created_at: parse_datetime(&created_at),
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    // ========== LLM results ==========

    /// Record the LLM result for a transaction (a forced refresh replaces the old one)
    pub fn upsert_llm_enrichment(&self, result: &NewLlmEnrichment) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO llm_enrichments (transaction_id, category, subcategory, essential, merchant,
                confidence, provider, model, cache_id, from_cache, job_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(transaction_id) DO UPDATE SET category = excluded.category,
                subcategory = excluded.subcategory, essential = excluded.essential,
                merchant = excluded.merchant, confidence = excluded.confidence,
                provider = excluded.provider, model = excluded.model,
                cache_id = excluded.cache_id, from_cache = excluded.from_cache,
                job_id = excluded.job_id, created_at = CURRENT_TIMESTAMP",
            params![
                result.transaction_id,
                result.fields.category,
                result.fields.subcategory,
                result.fields.essential,
                result.fields.merchant,
                result.fields.confidence,
                result.provider,
                result.model,
                result.cache_id,
                result.from_cache,
                result.job_id,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM llm_enrichments WHERE transaction_id = ?",
            params![result.transaction_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_llm_enrichment(&self, transaction_id: i64) -> Result<Option<LlmEnrichment>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT id, transaction_id, category, subcategory, essential, merchant, confidence,
                        provider, model, cache_id, from_cache, job_id, created_at
                 FROM llm_enrichments WHERE transaction_id = ?",
                params![transaction_id],
                |row| {
                    let created_at: String = row.get(12)?;
                    Ok(LlmEnrichment {
                        id: row.get(0)?,
                        transaction_id: row.get(1)?,
                        fields: EnrichmentFields {
                            category: row.get(2)?,
                            subcategory: row.get(3)?,
                            essential: row.get(4)?,
                            merchant: row.get(5)?,
                            confidence: row.get(6)?,
                        },
                        provider: row.get(7)?,
                        model: row.get(8)?,
                        cache_id: row.get(9)?,
                        from_cache: row.get(10)?,
                        job_id: row.get(11)?,
                        created_at: parse_datetime(&created_at),
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    // ========== External results ==========

    /// Store a receipt-derived result for a match
    ///
    /// The first external result for a transaction becomes primary. The
    /// primary check runs inside the insert under an immediate write lock, so
    /// concurrent first inserts land as one primary and the rest non-primary.
    /// Returns `None` when the match already produced one.
    pub fn insert_external_enrichment(&self, result: &NewExternalEnrichment) -> Result<Option<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted: Option<(i64, bool)> = tx
            .query_row(
                "INSERT INTO external_enrichments (transaction_id, match_id, receipt_id, source_type,
                    category, subcategory, essential, merchant, confidence, line_items, is_primary)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                    NOT EXISTS (SELECT 1 FROM external_enrichments
                                WHERE transaction_id = ?1 AND is_primary = 1)
                 WHERE true
                 ON CONFLICT(match_id) DO NOTHING
                 RETURNING id, is_primary",
                params![
                    result.transaction_id,
                    result.match_id,
                    result.receipt_id,
                    result.source_type.as_str(),
                    result.fields.category,
                    result.fields.subcategory,
                    result.fields.essential,
                    result.fields.merchant,
                    result.fields.confidence,
                    serde_json::to_string(&result.line_items)?,
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        tx.commit()?;

        if let Some((id, primary)) = inserted {
            debug!(
                transaction_id = result.transaction_id,
                external_id = id,
                primary,
                "Stored external enrichment"
            );
        }
        Ok(inserted.map(|(id, _)| id))
    }

    /// External results for a transaction, primary first
    pub fn list_external_enrichments(&self, transaction_id: i64) -> Result<Vec<ExternalEnrichment>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM external_enrichments WHERE transaction_id = ?
             ORDER BY is_primary DESC, confidence DESC, id",
            EXTERNAL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let results = stmt
            .query_map(params![transaction_id], Self::row_to_external)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(results)
    }

    pub fn get_primary_external(&self, transaction_id: i64) -> Result<Option<ExternalEnrichment>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM external_enrichments WHERE transaction_id = ? AND is_primary = 1",
            EXTERNAL_COLUMNS
        );
        let result = conn
            .query_row(&sql, params![transaction_id], Self::row_to_external)
            .optional()?;
        Ok(result)
    }

    /// Make one external result the primary for its transaction
    ///
    /// Clearing the old primary and setting the new one happen in one SQLite
    /// transaction; the partial unique index rejects any interleaving that
    /// would leave two.
    pub fn set_primary_external(&self, transaction_id: i64, external_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let belongs: bool = tx
            .query_row(
                "SELECT 1 FROM external_enrichments WHERE id = ? AND transaction_id = ?",
                params![external_id, transaction_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !belongs {
            return Err(Error::NotFound(format!(
                "External enrichment {} for transaction {}",
                external_id, transaction_id
            )));
        }

        tx.execute(
            "UPDATE external_enrichments SET is_primary = 0
             WHERE transaction_id = ? AND is_primary = 1",
            params![transaction_id],
        )?;
        tx.execute(
            "UPDATE external_enrichments SET is_primary = 1 WHERE id = ?",
            params![external_id],
        )?;
        tx.commit()?;

        info!(transaction_id, external_id, "Primary external enrichment changed");
        Ok(())
    }

    /// Withdraw the result a match produced, promoting the next best if it was primary
    pub fn remove_external_enrichment_for_match(&self, match_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::remove_external_for_match_in(&tx, match_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Withdraw every result a receipt produced
    pub fn remove_external_enrichments_for_receipt(&self, receipt_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::remove_external_for_receipt_in(&tx, receipt_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Receipt-wide withdrawal within an open SQLite transaction
    pub(super) fn remove_external_for_receipt_in(conn: &Connection, receipt_id: i64) -> Result<()> {
        let match_ids: Vec<i64> = {
            let mut stmt =
                conn.prepare("SELECT match_id FROM external_enrichments WHERE receipt_id = ?")?;
            let ids = stmt
                .query_map(params![receipt_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };
        for match_id in match_ids {
            Self::remove_external_for_match_in(conn, match_id)?;
        }
        Ok(())
    }

    /// Delete within an open SQLite transaction and re-elect a primary
    pub(super) fn remove_external_for_match_in(conn: &Connection, match_id: i64) -> Result<()> {
        let removed: Option<(i64, bool)> = conn
            .query_row(
                "SELECT transaction_id, is_primary FROM external_enrichments WHERE match_id = ?",
                params![match_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((transaction_id, was_primary)) = removed else {
            return Ok(());
        };

        conn.execute(
            "DELETE FROM external_enrichments WHERE match_id = ?",
            params![match_id],
        )?;

        if was_primary {
            // Next best: highest confidence, then oldest
            conn.execute(
                "UPDATE external_enrichments SET is_primary = 1
                 WHERE id = (SELECT id FROM external_enrichments WHERE transaction_id = ?
                             ORDER BY confidence DESC, id LIMIT 1)",
                params![transaction_id],
            )?;
        }
        Ok(())
    }

    /// Create the external result for a match if it is eligible and doesn't have one
    ///
    /// Eligible means the match is confirmed or at/above the auto-accept
    /// threshold, and its receipt is still active.
    pub fn refresh_external_enrichment(
        &self,
        match_id: i64,
        auto_accept_threshold: u8,
    ) -> Result<Option<i64>> {
        let m = self
            .get_match(match_id)?
            .ok_or_else(|| Error::NotFound(format!("Match {}", match_id)))?;
        if !m.is_primary_eligible(auto_accept_threshold) {
            return Ok(None);
        }

        let receipt = self
            .get_receipt(m.receipt_id)?
            .ok_or_else(|| Error::NotFound(format!("Receipt {}", m.receipt_id)))?;
        if receipt.status != ReceiptStatus::Active {
            return Ok(None);
        }

        let merchant_category = self.merchant_category(&receipt.merchant_normalized)?;
        let result = NewExternalEnrichment {
            transaction_id: m.transaction_id,
            match_id: m.id,
            receipt_id: receipt.id,
            source_type: receipt.source_type,
            fields: merge::external_fields(&receipt, &m, merchant_category),
            line_items: receipt.line_items.clone(),
        };
        self.insert_external_enrichment(&result)
    }

    /// Create external results for every eligible match that lacks one
    pub fn refresh_all_external_enrichments(&self, auto_accept_threshold: u8) -> Result<usize> {
        let match_ids: Vec<i64> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT m.id FROM receipt_matches m
                 JOIN receipts r ON r.id = m.receipt_id
                 WHERE r.status = 'active'
                   AND (m.user_confirmed = 1 OR m.confidence >= ?)
                   AND NOT EXISTS (SELECT 1 FROM external_enrichments e WHERE e.match_id = m.id)
                 ORDER BY m.confidence DESC, m.id",
            )?;
            let ids = stmt
                .query_map(params![auto_accept_threshold], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };

        let mut created = 0;
        for match_id in match_ids {
            if self
                .refresh_external_enrichment(match_id, auto_accept_threshold)?
                .is_some()
            {
                created += 1;
            }
        }
        Ok(created)
    }

    // ========== Precedence view ==========

    /// Effective categorization for a transaction: rule > LLM > primary external
    pub fn resolve(&self, transaction_id: i64) -> Result<EffectiveEnrichment> {
        if self.get_transaction(transaction_id)?.is_none() {
            return Err(Error::NotFound(format!("Transaction {}", transaction_id)));
        }

        let rule = self.get_rule_enrichment(transaction_id)?;
        let llm = self.get_llm_enrichment(transaction_id)?;
        let external = self.get_primary_external(transaction_id)?;

        Ok(merge::resolve_effective(
            transaction_id,
            rule.as_ref(),
            llm.as_ref(),
            external.as_ref(),
        ))
    }

    /// Enrichment state for a set of transactions, loaded in batch
    pub fn enrichment_states(
        &self,
        transaction_ids: &[i64],
    ) -> Result<HashMap<i64, TransactionEnrichmentState>> {
        let conn = self.conn()?;
        let mut states: HashMap<i64, TransactionEnrichmentState> = transaction_ids
            .iter()
            .map(|id| (*id, TransactionEnrichmentState::default()))
            .collect();

        for chunk in transaction_ids.chunks(MAX_IN_PARAMS) {
            let marks = placeholders(chunk.len());

            let sql = format!(
                "SELECT transaction_id FROM rule_enrichments WHERE transaction_id IN ({})",
                marks
            );
            let mut stmt = conn.prepare(&sql)?;
            for id in stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, i64>(0))? {
                if let Some(state) = states.get_mut(&id?) {
                    state.has_rule = true;
                }
            }

            let sql = format!(
                "SELECT transaction_id FROM llm_enrichments WHERE transaction_id IN ({})",
                marks
            );
            let mut stmt = conn.prepare(&sql)?;
            for id in stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, i64>(0))? {
                if let Some(state) = states.get_mut(&id?) {
                    state.has_llm = true;
                }
            }

            let sql = format!(
                "SELECT transaction_id, status FROM llm_failures WHERE transaction_id IN ({})",
                marks
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                let status: String = row.get(1)?;
                Ok((row.get::<_, i64>(0)?, parse_enum::<FailureStatus>(1, &status)?))
            })?;
            for row in rows {
                let (id, status) = row?;
                if let Some(state) = states.get_mut(&id) {
                    state.failure = Some(status);
                }
            }
        }

        Ok(states)
    }

    fn row_to_external(row: &rusqlite::Row) -> rusqlite::Result<ExternalEnrichment> {
        let source_type: String = row.get(4)?;
        let line_items: String = row.get(10)?;
        let created_at: String = row.get(12)?;

        Ok(ExternalEnrichment {
            id: row.get(0)?,
            transaction_id: row.get(1)?,
            match_id: row.get(2)?,
            receipt_id: row.get(3)?,
            source_type: parse_enum(4, &source_type)?,
            fields: EnrichmentFields {
                category: row.get(5)?,
                subcategory: row.get(6)?,
                essential: row.get(7)?,
                merchant: row.get(8)?,
                confidence: row.get(9)?,
            },
            line_items: serde_json::from_str(&line_items).unwrap_or_default(),
            is_primary: row.get(11)?,
            created_at: parse_datetime(&created_at),
        })
    }
}
