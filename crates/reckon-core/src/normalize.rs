//! Provider records → canonical shapes
//!
//! Transactions keep the provider's id as their natural key and are rejected
//! when their sign disagrees with their direction. Receipts never fail here:
//! anything we can't match on is kept with `unparseable` status.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::merchant::MerchantNormalizer;
use crate::models::{Direction, NewReceipt, NewTransaction, ReceiptStatus};
use crate::sources::{RawReceipt, RawTransaction};

/// Upper-case ISO-4217 code, or an error for anything that isn't three letters
pub fn normalize_currency(code: &str) -> Result<String> {
    let code = code.trim().to_uppercase();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code)
    } else {
        Err(Error::InvalidData(format!("Invalid currency code: {:?}", code)))
    }
}

/// Convert an aggregator transaction, validating sign against direction
pub fn normalize_transaction(
    raw: &RawTransaction,
    merchants: &MerchantNormalizer,
) -> Result<NewTransaction> {
    let external_id = raw.transaction_id.trim();
    if external_id.is_empty() {
        return Err(Error::InvalidData("Transaction has no provider id".to_string()));
    }
    if !raw.amount.is_finite() || raw.amount == 0.0 {
        return Err(Error::InvalidData(format!(
            "Transaction {} has no usable amount",
            external_id
        )));
    }

    let direction = match raw.transaction_type.as_deref() {
        Some(kind) => kind.parse::<Direction>().map_err(Error::InvalidData)?,
        None => Direction::from_amount(raw.amount),
    };
    if !direction.is_consistent_with(raw.amount) {
        return Err(Error::InvalidData(format!(
            "Transaction {} is a {} with a {} amount",
            external_id,
            direction,
            if raw.amount < 0.0 { "negative" } else { "positive" }
        )));
    }

    let merchant = merchants.normalize(&raw.description);
    Ok(NewTransaction {
        external_id: external_id.to_string(),
        posted_at: raw.timestamp,
        amount: raw.amount,
        currency: normalize_currency(&raw.currency)?,
        description: raw.description.trim().to_string(),
        direction,
        merchant_normalized: (!merchant.is_empty()).then_some(merchant),
    })
}

/// Dedup key for a receipt: sha256 of merchant | amount (2dp) | date | order ref
pub fn receipt_hash(
    merchant_normalized: &str,
    total: f64,
    event_date: NaiveDate,
    order_ref: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(merchant_normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{:.2}", total).as_bytes());
    hasher.update(b"|");
    hasher.update(event_date.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(order_ref.map(str::trim).unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}

/// Convert a receipt event from a connection
pub fn normalize_receipt(
    connection_id: &str,
    raw: &RawReceipt,
    merchants: &MerchantNormalizer,
) -> NewReceipt {
    let merchant_normalized = merchants.normalize(&raw.merchant);
    let order_ref = raw
        .order_ref
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    // Returns are reported either signed or unsigned; keep magnitudes
    let total = raw.total.abs();
    let currency = normalize_currency(&raw.currency);

    let usable = !merchant_normalized.is_empty()
        && total.is_finite()
        && total > 0.0
        && currency.is_ok();

    NewReceipt {
        connection_id: connection_id.to_string(),
        source_type: raw.source_type,
        merchant_raw: raw.merchant.trim().to_string(),
        receipt_hash: receipt_hash(
            &merchant_normalized,
            total,
            raw.event_date,
            order_ref.as_deref(),
        ),
        merchant_normalized,
        order_ref,
        total: if total.is_finite() { total } else { 0.0 },
        currency: currency.unwrap_or_else(|_| raw.currency.trim().to_uppercase()),
        event_date: raw.event_date,
        line_items: raw.line_items.clone(),
        extraction_confidence: raw.extraction_confidence.min(100),
        extraction_method: raw.extraction_method,
        status: if usable {
            ReceiptStatus::Active
        } else {
            ReceiptStatus::Unparseable
        },
    }
}

/// Cache key form of a bank description
///
/// Reference numbers differ between otherwise identical purchases
/// ("TESCO STORES 1234" / "TESCO STORES 5678"), so words containing digits
/// and punctuation are dropped.
pub fn normalize_description(description: &str) -> String {
    let lowered = description.trim().to_lowercase();
    let words: Vec<String> = lowered
        .split_whitespace()
        .filter(|w| !w.chars().any(|c| c.is_ascii_digit()))
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '&')
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .collect();

    if words.is_empty() {
        lowered.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        words.join(" ")
    }
}
