//! Enrichment rule and merchant alias commands

use anyhow::{anyhow, Result};
use reckon_core::db::Database;
use reckon_core::models::{NewEnrichmentRule, PatternType};
use reckon_core::{MerchantNormalizer, RuleEngine};

use super::truncate;

/// Fields for a new rule, as given on the command line
pub struct RuleArgs {
    pub pattern: String,
    pub category: String,
    pub pattern_type: String,
    pub subcategory: Option<String>,
    pub merchant: Option<String>,
    pub essential: bool,
    pub priority: i32,
}

pub fn cmd_rules_list(db: &Database) -> Result<()> {
    let rules = db.list_rules()?;
    if rules.is_empty() {
        println!("No rules defined. Add one with: reckon rules add <pattern> <category>");
        return Ok(());
    }

    println!();
    println!(
        "{:>4}  {:>4}  {:<11}  {:<28}  {}",
        "ID", "PRI", "TYPE", "PATTERN", "CATEGORY"
    );
    println!("{}", "─".repeat(72));
    for rule in &rules {
        let category = match rule.subcategory {
            Some(ref sub) => format!("{} / {}", rule.category, sub),
            None => rule.category.clone(),
        };
        println!(
            "{:>4}  {:>4}  {:<11}  {:<28}  {}{}",
            rule.id,
            rule.priority,
            rule.pattern_type.as_str(),
            truncate(&rule.pattern, 28),
            category,
            if rule.essential { " (essential)" } else { "" }
        );
    }
    Ok(())
}

pub fn cmd_rules_add(db: &Database, args: &RuleArgs) -> Result<()> {
    let pattern_type: PatternType = args
        .pattern_type
        .parse()
        .map_err(|e: String| anyhow!(e))?;

    let id = db.add_rule(&NewEnrichmentRule {
        pattern: args.pattern.clone(),
        pattern_type,
        category: args.category.clone(),
        subcategory: args.subcategory.clone(),
        essential: args.essential,
        merchant: args.merchant.clone(),
        priority: args.priority,
    })?;

    println!(
        "✓ Added rule #{}: {} '{}' → {}",
        id,
        pattern_type.as_str(),
        args.pattern,
        args.category
    );
    println!("   Apply to stored transactions with: reckon rules apply");
    Ok(())
}

pub fn cmd_rules_delete(db: &Database, id: i64) -> Result<()> {
    db.delete_rule(id)?;
    println!("✓ Deleted rule #{}", id);
    Ok(())
}

/// Show which rule, if any, would categorize a description
pub fn cmd_rules_test(db: &Database, description: &str) -> Result<()> {
    let engine = RuleEngine::new(db)?;
    match engine.match_description(description) {
        Some(rule) => {
            println!(
                "✓ Rule #{} ({} '{}') → {}",
                rule.id,
                rule.pattern_type.as_str(),
                rule.pattern,
                rule.category
            );
        }
        None => println!("No rule matches '{}'", description),
    }
    Ok(())
}

pub fn cmd_rules_apply(db: &Database) -> Result<()> {
    let stats = RuleEngine::new(db)?.apply_all()?;
    println!(
        "✓ Checked {} transactions, {} matched a rule",
        stats.checked, stats.matched
    );
    Ok(())
}

pub fn cmd_aliases_list(db: &Database) -> Result<()> {
    let aliases = db.list_merchant_aliases()?;
    if aliases.is_empty() {
        println!("No merchant aliases. Run 'reckon init' to load the defaults.");
        return Ok(());
    }

    println!();
    println!(
        "{:<28}  {:<20}  {:<16}  {}",
        "ALIAS", "CANONICAL", "CATEGORY", "SOURCE"
    );
    println!("{}", "─".repeat(76));
    for alias in &aliases {
        println!(
            "{:<28}  {:<20}  {:<16}  {}",
            truncate(&alias.alias, 28),
            truncate(&alias.canonical_id, 20),
            alias.category.as_deref().unwrap_or("-"),
            alias.source
        );
    }
    println!();
    println!("{} aliases", aliases.len());
    Ok(())
}

pub fn cmd_aliases_add(
    db: &Database,
    alias: &str,
    canonical: &str,
    category: Option<&str>,
    subcategory: Option<&str>,
    essential: bool,
) -> Result<()> {
    db.add_merchant_alias(alias, canonical, category, subcategory, essential)?;
    println!(
        "✓ '{}' now normalizes to '{}'",
        MerchantNormalizer::clean(alias),
        canonical.trim().to_lowercase()
    );
    Ok(())
}

/// Show how a raw merchant string normalizes
pub fn cmd_aliases_test(db: &Database, merchant: &str) -> Result<()> {
    let normalizer = MerchantNormalizer::from_db(db)?;
    let cleaned = MerchantNormalizer::clean(merchant);
    let normalized = normalizer.normalize(merchant);

    println!("   Raw:        {}", merchant);
    println!("   Cleaned:    {}", cleaned);
    println!("   Normalized: {}", normalized);
    if let Some((category, subcategory, essential)) = db.merchant_category(&normalized)? {
        let sub = subcategory.map(|s| format!(" / {}", s)).unwrap_or_default();
        println!(
            "   Category:   {}{}{}",
            category,
            sub,
            if essential { " (essential)" } else { "" }
        );
    }
    Ok(())
}
