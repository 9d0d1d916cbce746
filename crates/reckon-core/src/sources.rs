//! External data sources: the bank aggregator and receipt providers
//!
//! Sync only ever talks to these traits. Token handling and document parsing
//! live on the other side of them; what arrives here is already a structured
//! record with an explicit date window.
//!
//! `JsonFileAggregator` and `JsonFileReceiptSource` read exported provider
//! records from disk so the CLI can run a full sync without network access.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{ExtractionMethod, LineItem, ReceiptSource};

/// An inclusive date window. Aggregator calls are never unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self> {
        if from > to {
            return Err(Error::InvalidData(format!(
                "Date window starts after it ends ({} > {})",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    /// The last `days` days up to and including today
    pub fn last_days(days: i64) -> Self {
        let to = Utc::now().date_naive();
        Self {
            from: to - Duration::days(days.max(0)),
            to,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }
}

/// Account as reported by the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAccount {
    pub external_id: String,
    pub name: String,
    pub provider: String,
    pub currency: String,
}

/// Transaction as reported by the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    /// Provider's stable transaction id
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    /// Signed: money out is negative
    pub amount: f64,
    pub currency: String,
    pub description: String,
    /// "DEBIT"/"CREDIT" when the provider reports it
    #[serde(default)]
    pub transaction_type: Option<String>,
}

/// One page of transactions
#[derive(Debug, Clone, Default)]
pub struct TransactionPage {
    pub transactions: Vec<RawTransaction>,
    /// Pass back to fetch the next page; `None` on the last page
    pub next_cursor: Option<String>,
}

/// A purchase event extracted by a receipt provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReceipt {
    pub source_type: ReceiptSource,
    pub merchant: String,
    #[serde(default)]
    pub order_ref: Option<String>,
    pub total: f64,
    pub currency: String,
    pub event_date: NaiveDate,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    pub extraction_confidence: u8,
    pub extraction_method: ExtractionMethod,
}

/// Open-Banking aggregator client
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<RawAccount>>;

    /// One page of transactions for an account within `window`
    async fn list_transactions(
        &self,
        account_id: &str,
        window: DateWindow,
        cursor: Option<&str>,
    ) -> Result<TransactionPage>;
}

/// Email / marketplace receipt client
#[async_trait]
pub trait ReceiptClient: Send + Sync {
    /// Connected receipt sources (mailboxes, marketplace accounts)
    async fn list_connections(&self) -> Result<Vec<String>>;

    async fn list_candidate_events(
        &self,
        connection: &str,
        window: DateWindow,
    ) -> Result<Vec<RawReceipt>>;
}

// ========== File-backed sources ==========

#[derive(Debug, Deserialize)]
struct AccountExport {
    #[serde(flatten)]
    account: RawAccount,
    #[serde(default)]
    transactions: Vec<RawTransaction>,
}

#[derive(Debug, Deserialize)]
struct AggregatorExport {
    accounts: Vec<AccountExport>,
}

/// Aggregator backed by a JSON export:
/// `{"accounts": [{"external_id", "name", "provider", "currency", "transactions": [...]}]}`
pub struct JsonFileAggregator {
    accounts: Vec<AccountExport>,
    page_size: usize,
}

impl JsonFileAggregator {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let export: AggregatorExport = serde_json::from_str(content)?;
        Ok(Self {
            accounts: export.accounts,
            page_size: 100,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[async_trait]
impl Aggregator for JsonFileAggregator {
    async fn list_accounts(&self) -> Result<Vec<RawAccount>> {
        Ok(self.accounts.iter().map(|a| a.account.clone()).collect())
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        window: DateWindow,
        cursor: Option<&str>,
    ) -> Result<TransactionPage> {
        let account = self
            .accounts
            .iter()
            .find(|a| a.account.external_id == account_id)
            .ok_or_else(|| Error::NotFound(format!("Account {}", account_id)))?;

        let offset: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| Error::InvalidData(format!("Bad cursor: {}", c)))?,
            None => 0,
        };

        let in_window: Vec<&RawTransaction> = account
            .transactions
            .iter()
            .filter(|t| window.contains(t.timestamp.date_naive()))
            .collect();

        let end = (offset + self.page_size).min(in_window.len());
        let transactions = in_window
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|t| (*t).clone())
            .collect();
        let next_cursor = (end < in_window.len()).then(|| end.to_string());

        Ok(TransactionPage {
            transactions,
            next_cursor,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ConnectionExport {
    connection_id: String,
    #[serde(default)]
    receipts: Vec<RawReceipt>,
}

#[derive(Debug, Deserialize)]
struct ReceiptExport {
    connections: Vec<ConnectionExport>,
}

/// Receipt source backed by a JSON export:
/// `{"connections": [{"connection_id", "receipts": [...]}]}`
pub struct JsonFileReceiptSource {
    connections: Vec<ConnectionExport>,
}

impl JsonFileReceiptSource {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let export: ReceiptExport = serde_json::from_str(content)?;
        Ok(Self {
            connections: export.connections,
        })
    }
}

#[async_trait]
impl ReceiptClient for JsonFileReceiptSource {
    async fn list_connections(&self) -> Result<Vec<String>> {
        Ok(self
            .connections
            .iter()
            .map(|c| c.connection_id.clone())
            .collect())
    }

    async fn list_candidate_events(
        &self,
        connection: &str,
        window: DateWindow,
    ) -> Result<Vec<RawReceipt>> {
        let export = self
            .connections
            .iter()
            .find(|c| c.connection_id == connection)
            .ok_or_else(|| Error::NotFound(format!("Connection {}", connection)))?;

        Ok(export
            .receipts
            .iter()
            .filter(|r| window.contains(r.event_date))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = r#"{
        "accounts": [{
            "external_id": "acc-1",
            "name": "Current",
            "provider": "mockbank",
            "currency": "GBP",
            "transactions": [
                {"transaction_id": "t1", "timestamp": "2024-01-10T09:00:00Z", "amount": -5.0,
                 "currency": "GBP", "description": "COFFEE"},
                {"transaction_id": "t2", "timestamp": "2024-01-11T09:00:00Z", "amount": -6.0,
                 "currency": "GBP", "description": "COFFEE"},
                {"transaction_id": "t3", "timestamp": "2024-01-12T09:00:00Z", "amount": -7.0,
                 "currency": "GBP", "description": "COFFEE"},
                {"transaction_id": "t4", "timestamp": "2024-03-01T09:00:00Z", "amount": -8.0,
                 "currency": "GBP", "description": "COFFEE"}
            ]
        }]
    }"#;

    fn jan() -> DateWindow {
        DateWindow::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_window_rejects_inverted_range() {
        let a = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let b = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(DateWindow::new(a, b).is_err());
    }

    #[tokio::test]
    async fn test_json_aggregator_paginates_within_window() {
        let aggregator = JsonFileAggregator::from_json(EXPORT).unwrap().with_page_size(2);

        let first = aggregator.list_transactions("acc-1", jan(), None).await.unwrap();
        assert_eq!(first.transactions.len(), 2);
        let cursor = first.next_cursor.expect("second page");

        let second = aggregator
            .list_transactions("acc-1", jan(), Some(&cursor))
            .await
            .unwrap();
        assert_eq!(second.transactions.len(), 1);
        assert_eq!(second.transactions[0].transaction_id, "t3");
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_json_aggregator_unknown_account() {
        let aggregator = JsonFileAggregator::from_json(EXPORT).unwrap();
        assert!(aggregator.list_transactions("nope", jan(), None).await.is_err());
    }
}
