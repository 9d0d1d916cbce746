//! Enrichment precedence
//!
//! The three result tables are independent; nothing overwrites another
//! source's row. The effective categorization is computed on read:
//! rule > LLM > primary external > unenriched.

use crate::models::{
    EffectiveEnrichment, EnrichmentFields, EnrichmentSource, ExternalEnrichment, LlmEnrichment,
    Receipt, ReceiptMatch, ReceiptSource, RuleEnrichment,
};

/// Pick the effective enrichment for one transaction
pub fn resolve_effective(
    transaction_id: i64,
    rule: Option<&RuleEnrichment>,
    llm: Option<&LlmEnrichment>,
    primary_external: Option<&ExternalEnrichment>,
) -> EffectiveEnrichment {
    let mut shadowed = Vec::new();
    if llm.is_some() {
        shadowed.push("llm");
    }
    if primary_external.is_some() {
        shadowed.push("external");
    }

    if let Some(rule) = rule {
        return EffectiveEnrichment {
            transaction_id,
            source: EnrichmentSource::Rule,
            fields: Some(rule.fields.clone()),
            source_id: Some(rule.id),
            explanation: explain(
                format!("rule {} matched pattern {:?}", rule.rule_id, rule.pattern),
                &shadowed,
            ),
        };
    }

    shadowed.retain(|s| *s != "llm");
    if let Some(llm) = llm {
        let origin = if llm.from_cache { "cached " } else { "" };
        return EffectiveEnrichment {
            transaction_id,
            source: EnrichmentSource::Llm,
            fields: Some(llm.fields.clone()),
            source_id: Some(llm.id),
            explanation: explain(
                format!("{}LLM categorization from {}/{}", origin, llm.provider, llm.model),
                &shadowed,
            ),
        };
    }

    if let Some(ext) = primary_external {
        return EffectiveEnrichment {
            transaction_id,
            source: EnrichmentSource::External,
            fields: Some(ext.fields.clone()),
            source_id: Some(ext.id),
            explanation: format!(
                "primary {} receipt {} (match {}, confidence {})",
                ext.source_type, ext.receipt_id, ext.match_id, ext.fields.confidence
            ),
        };
    }

    EffectiveEnrichment {
        transaction_id,
        source: EnrichmentSource::Unenriched,
        fields: None,
        source_id: None,
        explanation: "no rule, LLM or usable receipt result".to_string(),
    }
}

fn explain(winner: String, shadowed: &[&str]) -> String {
    if shadowed.is_empty() {
        winner
    } else {
        format!("{} (overrides {})", winner, shadowed.join(", "))
    }
}

/// Categorization derived from a matched receipt
///
/// `merchant_category` is the alias table's category for the receipt's
/// canonical merchant, when one is recorded.
pub fn external_fields(
    receipt: &Receipt,
    m: &ReceiptMatch,
    merchant_category: Option<(String, Option<String>, bool)>,
) -> EnrichmentFields {
    let (category, subcategory, essential) = merchant_category.unwrap_or_else(|| {
        let fallback = match receipt.source_type {
            ReceiptSource::MarketplacePurchase | ReceiptSource::MarketplaceReturn => "shopping",
            ReceiptSource::Email => "uncategorized",
        };
        (fallback.to_string(), None, false)
    });

    EnrichmentFields {
        category,
        subcategory,
        essential,
        merchant: Some(receipt.merchant_normalized.clone()),
        confidence: m.confidence.min(receipt.extraction_confidence),
    }
}
