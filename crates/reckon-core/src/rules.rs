//! Deterministic rule enrichment
//!
//! Rules are checked in priority order (highest first, then oldest); the
//! first match writes a rule result at confidence 100. Rule results take
//! precedence over everything else when the effective category is resolved.

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::Result;
use crate::models::{EnrichmentFields, EnrichmentRule, PatternType, Transaction};

/// A rule with its pattern prepared for matching
struct CompiledRule {
    rule: EnrichmentRule,
    regex: Option<Regex>,
}

/// Counters from a rule pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleRunStats {
    pub checked: usize,
    pub matched: usize,
}

pub struct RuleEngine<'a> {
    db: &'a Database,
    rules: Vec<CompiledRule>,
}

impl<'a> RuleEngine<'a> {
    /// Load and compile the rule table
    pub fn new(db: &'a Database) -> Result<Self> {
        let rules = db
            .list_rules()?
            .into_iter()
            .map(|rule| -> Result<CompiledRule> {
                let regex = match rule.pattern_type {
                    PatternType::Regex => Some(Regex::new(&format!("(?i){}", rule.pattern))?),
                    _ => None,
                };
                Ok(CompiledRule { rule, regex })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { db, rules })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// First rule matching a bank description
    pub fn match_description(&self, description: &str) -> Option<&EnrichmentRule> {
        let desc_upper = description.trim().to_uppercase();
        self.rules
            .iter()
            .find(|c| pattern_matches(&desc_upper, c))
            .map(|c| &c.rule)
    }

    /// Apply rules to the given transactions, recording a result for each match
    pub fn apply(&self, transactions: &[Transaction]) -> Result<RuleRunStats> {
        let mut stats = RuleRunStats::default();
        if self.rules.is_empty() {
            return Ok(stats);
        }

        for tx in transactions {
            stats.checked += 1;
            let Some(rule) = self.match_description(&tx.description) else {
                continue;
            };
            let fields = EnrichmentFields {
                category: rule.category.clone(),
                subcategory: rule.subcategory.clone(),
                essential: rule.essential,
                merchant: rule
                    .merchant
                    .clone()
                    .or_else(|| tx.merchant_normalized.clone()),
                confidence: 100,
            };
            self.db
                .upsert_rule_enrichment(tx.id, rule.id, &rule.pattern, &fields)?;
            debug!(transaction_id = tx.id, rule_id = rule.id, "Rule matched");
            stats.matched += 1;
        }

        info!(
            checked = stats.checked,
            matched = stats.matched,
            "Rule pass complete"
        );
        Ok(stats)
    }

    /// Apply rules to every stored transaction
    pub fn apply_all(&self) -> Result<RuleRunStats> {
        let transactions = self.db.list_transactions(None, -1, 0)?;
        self.apply(&transactions)
    }
}

fn pattern_matches(desc_upper: &str, compiled: &CompiledRule) -> bool {
    let pattern = &compiled.rule.pattern;
    match compiled.rule.pattern_type {
        // Pipe-separated alternatives
        PatternType::Contains => pattern
            .split('|')
            .map(|p| p.trim().to_uppercase())
            .any(|p| !p.is_empty() && desc_upper.contains(&p)),
        PatternType::StartsWith => pattern
            .split('|')
            .map(|p| p.trim().to_uppercase())
            .any(|p| !p.is_empty() && desc_upper.starts_with(&p)),
        PatternType::Exact => desc_upper == pattern.trim().to_uppercase(),
        PatternType::Regex => compiled
            .regex
            .as_ref()
            .is_some_and(|re| re.is_match(desc_upper)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewEnrichmentRule;

    fn add(db: &Database, pattern: &str, pattern_type: PatternType, category: &str, priority: i32) -> i64 {
        db.add_rule(&NewEnrichmentRule {
            pattern: pattern.to_string(),
            pattern_type,
            category: category.to_string(),
            subcategory: None,
            essential: false,
            merchant: None,
            priority,
        })
        .unwrap()
    }

    #[test]
    fn test_pattern_types() {
        let db = Database::in_memory().unwrap();
        add(&db, "SHELL|ESSO", PatternType::Contains, "fuel", 0);
        add(&db, "TFL", PatternType::StartsWith, "transport", 0);
        add(&db, "NETFLIX", PatternType::Exact, "subscriptions", 0);
        add(&db, r"^amzn\s+mktp", PatternType::Regex, "shopping", 0);
        let engine = RuleEngine::new(&db).unwrap();

        let category = |d: &str| engine.match_description(d).map(|r| r.category.clone());
        assert_eq!(category("esso garage 12").as_deref(), Some("fuel"));
        assert_eq!(category("TFL TRAVEL CH").as_deref(), Some("transport"));
        assert_eq!(category("PAYMENT TFL"), None);
        assert_eq!(category("netflix").as_deref(), Some("subscriptions"));
        assert_eq!(category("NETFLIX.COM"), None);
        assert_eq!(category("AMZN Mktp UK*2K4").as_deref(), Some("shopping"));
    }

    #[test]
    fn test_priority_wins() {
        let db = Database::in_memory().unwrap();
        add(&db, "UBER", PatternType::Contains, "transport", 10);
        add(&db, "UBER EATS", PatternType::Contains, "dining", 100);
        let engine = RuleEngine::new(&db).unwrap();

        let rule = engine.match_description("UBER EATS LONDON").unwrap();
        assert_eq!(rule.category, "dining");
        assert_eq!(engine.rule_count(), 2);
    }

    #[test]
    fn test_empty_rule_table_matches_nothing() {
        let db = Database::in_memory().unwrap();
        let engine = RuleEngine::new(&db).unwrap();
        assert!(engine.match_description("TESCO").is_none());
        assert_eq!(engine.apply(&[]).unwrap(), RuleRunStats::default());
    }
}
