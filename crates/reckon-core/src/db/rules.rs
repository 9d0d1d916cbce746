//! Enrichment rule operations

use rusqlite::params;

use super::{parse_datetime, parse_enum, Database};
use crate::error::{Error, Result};
use crate::models::{EnrichmentRule, NewEnrichmentRule, PatternType};

impl Database {
    /// Add a rule, returning its ID
    pub fn add_rule(&self, rule: &NewEnrichmentRule) -> Result<i64> {
        if rule.pattern.trim().is_empty() {
            return Err(Error::InvalidData("Rule pattern must not be empty".to_string()));
        }
        if rule.pattern_type == PatternType::Regex {
            // Reject bad patterns up front rather than at match time
            regex::Regex::new(&rule.pattern)?;
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO enrichment_rules (pattern, pattern_type, category, subcategory, essential,
                merchant, priority)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                rule.pattern,
                rule.pattern_type.as_str(),
                rule.category,
                rule.subcategory,
                rule.essential,
                rule.merchant,
                rule.priority,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List rules, highest priority first
    pub fn list_rules(&self) -> Result<Vec<EnrichmentRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, pattern, pattern_type, category, subcategory, essential, merchant,
                    priority, created_at
             FROM enrichment_rules ORDER BY priority DESC, id",
        )?;
        let rules = stmt
            .query_map([], |row| {
                let pattern_type: String = row.get(2)?;
                let created_at: String = row.get(8)?;
                Ok(EnrichmentRule {
                    id: row.get(0)?,
                    pattern: row.get(1)?,
                    pattern_type: parse_enum(2, &pattern_type)?,
                    category: row.get(3)?,
                    subcategory: row.get(4)?,
                    essential: row.get(5)?,
                    merchant: row.get(6)?,
                    priority: row.get(7)?,
                    created_at: parse_datetime(&created_at),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Delete a rule (its rule enrichments cascade)
    pub fn delete_rule(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM enrichment_rules WHERE id = ?", params![id])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("Rule {}", id)));
        }
        Ok(())
    }
}
