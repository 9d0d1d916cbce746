//! Backend-agnostic categorization types

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{EnrichmentFields, Transaction};

/// The only transaction data that leaves the process for an LLM call
///
/// Fields are private and the only constructor is `From<&Transaction>`, so
/// account ids, provider ids and receipt content can't be attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorizeItem {
    description: String,
    date: NaiveDate,
    amount: f64,
}

impl CategorizeItem {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// One prompt line: `index. description | date | amount`
    pub fn prompt_line(&self, index: usize) -> String {
        format!(
            "{}. {} | {} | {:.2}",
            index, self.description, self.date, self.amount
        )
    }
}

impl From<&Transaction> for CategorizeItem {
    fn from(tx: &Transaction) -> Self {
        Self {
            description: tx.description.clone(),
            date: tx.date(),
            amount: tx.amount,
        }
    }
}

/// A categorization returned for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Categorization {
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub essential: bool,
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: u8,
}

fn default_confidence() -> u8 {
    50
}

impl From<Categorization> for EnrichmentFields {
    fn from(c: Categorization) -> Self {
        Self {
            category: c.category.trim().to_lowercase(),
            subcategory: c.subcategory.filter(|s| !s.trim().is_empty()),
            essential: c.essential,
            merchant: c.merchant.filter(|m| !m.trim().is_empty()),
            confidence: c.confidence.min(100),
        }
    }
}

/// Outcome for one item of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum ItemResult {
    Categorized(Categorization),
    /// The backend answered but couldn't categorize this item
    Failed { kind: String, message: String },
}

impl ItemResult {
    pub fn failed(kind: &str, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

/// A backend's answer to one batch, aligned with the request order
#[derive(Debug, Clone, Default)]
pub struct BatchResponse {
    pub results: Vec<ItemResult>,
    /// Tokens reported by the backend (0 when unknown)
    pub tokens_used: u64,
}
