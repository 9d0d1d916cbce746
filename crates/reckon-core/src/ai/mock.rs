//! Mock backend for testing
//!
//! Categorizes by keyword and can be scripted to fail: per item (by
//! description), for the next N calls (rate limited), or always.
//! Clones share their script and counters.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::types::{BatchResponse, Categorization, CategorizeItem, ItemResult};
use super::CategorizationBackend;

const TOKENS_PER_ITEM: u64 = 100;

#[derive(Default)]
struct MockScript {
    calls: AtomicUsize,
    items_seen: AtomicUsize,
    rate_limited_calls: AtomicU32,
    failing_descriptions: Mutex<HashSet<String>>,
    always_fail: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
}

/// Mock categorization backend
#[derive(Clone)]
pub struct MockBackend {
    model: String,
    script: Arc<MockScript>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            script: Arc::new(MockScript::default()),
        }
    }

    /// Same script and counters under another model name
    pub fn with_model(&self, model: &str) -> Self {
        Self {
            model: model.to_string(),
            script: self.script.clone(),
        }
    }

    /// Report a per-item failure for any item with this description
    pub fn fail_description(&self, description: &str) -> &Self {
        if let Ok(mut set) = self.script.failing_descriptions.lock() {
            set.insert(description.to_string());
        }
        self
    }

    /// Reject the next `n` calls as rate limited
    pub fn rate_limit_next(&self, n: u32) -> &Self {
        self.script.rate_limited_calls.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every call with a permanent error
    pub fn fail_always(&self, message: &str) -> &Self {
        if let Ok(mut slot) = self.script.always_fail.lock() {
            *slot = Some(message.to_string());
        }
        self
    }

    /// Sleep before answering (for timeout and cancellation tests)
    pub fn with_delay(&self, delay: Duration) -> &Self {
        if let Ok(mut slot) = self.script.delay.lock() {
            *slot = Some(delay);
        }
        self
    }

    /// Number of `categorize` calls received
    pub fn call_count(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }

    /// Number of items received across all calls
    pub fn items_seen(&self) -> usize {
        self.script.items_seen.load(Ordering::SeqCst)
    }

    pub(crate) fn categorize_one(description: &str) -> Categorization {
        let upper = description.to_uppercase();
        let (category, subcategory, essential, merchant) = match upper.as_str() {
            d if d.contains("TESCO") || d.contains("SAINSBURY") || d.contains("LIDL") => {
                ("groceries", Some("supermarket"), true, Some("Tesco"))
            }
            d if d.contains("NETFLIX") || d.contains("SPOTIFY") => {
                ("subscriptions", Some("streaming"), false, None)
            }
            d if d.contains("AMAZON") || d.contains("AMZN") => {
                ("shopping", Some("online"), false, Some("Amazon"))
            }
            d if d.contains("UBER") || d.contains("TFL") => ("transport", None, true, None),
            d if d.contains("PRET") || d.contains("STARBUCKS") || d.contains("DELIVEROO") => {
                ("dining", None, false, None)
            }
            d if d.contains("SALARY") => ("income", None, false, None),
            _ => ("uncategorized", None, false, None),
        };
        Categorization {
            category: category.to_string(),
            subcategory: subcategory.map(str::to_string),
            essential,
            merchant: merchant.map(str::to_string),
            confidence: if category == "uncategorized" { 30 } else { 85 },
        }
    }
}

#[async_trait]
impl CategorizationBackend for MockBackend {
    async fn categorize(&self, items: &[CategorizeItem]) -> Result<BatchResponse> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        self.script.items_seen.fetch_add(items.len(), Ordering::SeqCst);

        let delay = self.script.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let limited = self
            .script
            .rate_limited_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            return Err(Error::RateLimited("mock".to_string()));
        }

        let always_fail = self.script.always_fail.lock().ok().and_then(|m| m.clone());
        if let Some(message) = always_fail {
            return Err(Error::Llm(message));
        }

        let failing = self
            .script
            .failing_descriptions
            .lock()
            .map(|set| set.clone())
            .unwrap_or_default();

        let results = items
            .iter()
            .map(|item| {
                if failing.contains(item.description()) {
                    ItemResult::failed("llm", "Model could not categorize this item")
                } else {
                    ItemResult::Categorized(Self::categorize_one(item.description()))
                }
            })
            .collect();

        Ok(BatchResponse {
            results,
            tokens_used: TOKENS_PER_ITEM * items.len() as u64,
        })
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
