//! In-batch deduplication
//!
//! Order-confirmation, shipping and delivery emails for one order all hash to
//! the same receipt; repeated sync windows return the same provider ids.
//! Both collapse here before anything touches the database.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::models::{NewReceipt, NewTransaction};

/// Collapse receipts sharing `(connection_id, receipt_hash)`, keeping the
/// highest extraction confidence (first seen wins ties). Output keeps the
/// order in which each event was first seen.
pub fn dedupe_receipts(raw: Vec<NewReceipt>) -> Vec<NewReceipt> {
    let mut slots: HashMap<(String, String), usize> = HashMap::new();
    let mut kept: Vec<NewReceipt> = Vec::with_capacity(raw.len());

    for receipt in raw {
        let key = (receipt.connection_id.clone(), receipt.receipt_hash.clone());
        match slots.entry(key) {
            Entry::Occupied(slot) => {
                let current = &mut kept[*slot.get()];
                if receipt.extraction_confidence > current.extraction_confidence {
                    *current = receipt;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(kept.len());
                kept.push(receipt);
            }
        }
    }

    kept
}

/// Drop repeated provider ids within one batch (first seen wins)
pub fn dedupe_transactions(raw: Vec<NewTransaction>) -> Vec<NewTransaction> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|t| seen.insert(t.external_id.clone()))
        .collect()
}
