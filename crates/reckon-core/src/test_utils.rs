//! Test utilities for reckon-core
//!
//! - `MockLlmServer`: an HTTP server speaking the Ollama and OpenAI-compatible
//!   APIs, answering categorization prompts by keyword. Used to exercise the
//!   real HTTP backends end to end.
//! - `InMemoryAggregator` / `InMemoryReceiptClient`: scripted data sources.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;

use crate::ai::MockBackend;
use crate::error::{Error, Result};
use crate::sources::{
    Aggregator, DateWindow, RawAccount, RawReceipt, RawTransaction, ReceiptClient, TransactionPage,
};

/// Tokens reported per categorized line
const TOKENS_PER_LINE: u64 = 100;

#[derive(Default)]
struct ServerState {
    requests: AtomicUsize,
    rate_limited: AtomicU32,
    failing: Mutex<HashSet<String>>,
}

impl ServerState {
    fn take_rate_limit(&self) -> bool {
        self.rate_limited
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn failing(&self) -> HashSet<String> {
        self.failing.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

/// Mock LLM server for integration tests
pub struct MockLlmServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockLlmServer {
    /// Start the mock server on an available port
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/api/tags", get(handle_tags))
            .route("/api/generate", post(handle_generate))
            .route("/v1/models", get(handle_models))
            .route("/v1/chat/completions", post(handle_chat))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the base URL for this mock server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Answer the next `n` generation requests with HTTP 429
    pub fn rate_limit_next(&self, n: u32) {
        self.state.rate_limited.store(n, Ordering::SeqCst);
    }

    /// Return a per-item error for lines with this description
    pub fn fail_description(&self, description: &str) {
        if let Ok(mut failing) = self.state.failing.lock() {
            failing.insert(description.to_string());
        }
    }

    /// Generation requests received (including rate-limited ones)
    pub fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Stop the mock server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockLlmServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Descriptions from the numbered `index. description | date | amount` lines
fn prompt_descriptions(prompt: &str) -> Vec<(usize, String)> {
    prompt
        .lines()
        .filter_map(|line| {
            let (index, rest) = line.split_once(". ")?;
            let index = index.trim().parse().ok()?;
            let description = rest.split(" | ").next()?;
            Some((index, description.to_string()))
        })
        .collect()
}

/// Build the JSON answer for a prompt, returning it with the tokens used
fn answer(state: &ServerState, prompt: &str) -> (String, u64) {
    let failing = state.failing();
    let lines = prompt_descriptions(prompt);
    let results: Vec<serde_json::Value> = lines
        .iter()
        .map(|(index, description)| {
            if failing.contains(description) {
                json!({"index": index, "error": "unrecognised merchant"})
            } else {
                let c = MockBackend::categorize_one(description);
                json!({
                    "index": index,
                    "category": c.category,
                    "subcategory": c.subcategory,
                    "essential": c.essential,
                    "merchant": c.merchant,
                    "confidence": c.confidence,
                })
            }
        })
        .collect();
    (
        json!({ "results": results }).to_string(),
        TOKENS_PER_LINE * lines.len() as u64,
    )
}

fn rate_limited() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({"error": "rate limited"})),
    )
        .into_response()
}

/// Ollama tags endpoint response (health check)
async fn handle_tags() -> Json<serde_json::Value> {
    Json(json!({"models": [{"name": "llama3.2:latest", "size": 4_000_000_000u64}]}))
}

/// Ollama generate endpoint
async fn handle_generate(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if state.take_rate_limit() {
        return rate_limited();
    }

    let (response, tokens) = answer(&state, &request.prompt);
    Json(GenerateResponse {
        model: request.model,
        response,
        done: true,
        prompt_eval_count: tokens / 2,
        eval_count: tokens - tokens / 2,
    })
    .into_response()
}

async fn handle_models() -> Json<serde_json::Value> {
    Json(json!({"object": "list", "data": [{"id": "mock-model", "object": "model"}]}))
}

/// OpenAI-compatible chat completions endpoint
async fn handle_chat(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if state.take_rate_limit() {
        return rate_limited();
    }

    let prompt = request
        .messages
        .iter()
        .filter(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let (content, tokens) = answer(&state, &prompt);
    Json(json!({
        "model": request.model,
        "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}],
        "usage": {"total_tokens": tokens},
    }))
    .into_response()
}

// Request/Response types for the mock server

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    model: String,
    response: String,
    done: bool,
    prompt_eval_count: u64,
    eval_count: u64,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

// ========== In-memory sources ==========

/// Scripted aggregator
#[derive(Default)]
pub struct InMemoryAggregator {
    accounts: Vec<RawAccount>,
    transactions: HashMap<String, Vec<RawTransaction>>,
    failing_accounts: HashMap<String, String>,
    list_accounts_error: Option<String>,
    page_size: usize,
}

impl InMemoryAggregator {
    pub fn new() -> Self {
        Self {
            page_size: 50,
            ..Default::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn add_account(&mut self, external_id: &str, name: &str, currency: &str) {
        self.accounts.push(RawAccount {
            external_id: external_id.to_string(),
            name: name.to_string(),
            provider: "in-memory".to_string(),
            currency: currency.to_string(),
        });
    }

    /// Add a transaction in the account's currency
    pub fn add_transaction(
        &mut self,
        account: &str,
        transaction_id: &str,
        timestamp: DateTime<Utc>,
        amount: f64,
        description: &str,
    ) {
        let currency = self
            .accounts
            .iter()
            .find(|a| a.external_id == account)
            .map(|a| a.currency.clone())
            .unwrap_or_else(|| "GBP".to_string());
        self.push_transaction(
            account,
            RawTransaction {
                transaction_id: transaction_id.to_string(),
                timestamp,
                amount,
                currency,
                description: description.to_string(),
                transaction_type: None,
            },
        );
    }

    pub fn push_transaction(&mut self, account: &str, transaction: RawTransaction) {
        self.transactions
            .entry(account.to_string())
            .or_default()
            .push(transaction);
    }

    /// Make `list_accounts` fail
    pub fn fail_list_accounts(&mut self, message: &str) {
        self.list_accounts_error = Some(message.to_string());
    }

    /// Make every page request for one account fail
    pub fn fail_account(&mut self, account: &str, message: &str) {
        self.failing_accounts
            .insert(account.to_string(), message.to_string());
    }
}

#[async_trait]
impl Aggregator for InMemoryAggregator {
    async fn list_accounts(&self) -> Result<Vec<RawAccount>> {
        match &self.list_accounts_error {
            Some(message) => Err(Error::Upstream(message.clone())),
            None => Ok(self.accounts.clone()),
        }
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        window: DateWindow,
        cursor: Option<&str>,
    ) -> Result<TransactionPage> {
        if let Some(message) = self.failing_accounts.get(account_id) {
            return Err(Error::Upstream(message.clone()));
        }
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let in_window: Vec<RawTransaction> = self
            .transactions
            .get(account_id)
            .map(|txs| {
                txs.iter()
                    .filter(|t| window.contains(t.timestamp.date_naive()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let end = (offset + self.page_size).min(in_window.len());
        Ok(TransactionPage {
            transactions: in_window.get(offset..end).unwrap_or_default().to_vec(),
            next_cursor: (end < in_window.len()).then(|| end.to_string()),
        })
    }
}

/// Scripted receipt client
#[derive(Default)]
pub struct InMemoryReceiptClient {
    connections: Vec<String>,
    receipts: HashMap<String, Vec<RawReceipt>>,
}

impl InMemoryReceiptClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_receipt(&mut self, connection: &str, receipt: RawReceipt) {
        if !self.connections.iter().any(|c| c == connection) {
            self.connections.push(connection.to_string());
        }
        self.receipts
            .entry(connection.to_string())
            .or_default()
            .push(receipt);
    }
}

#[async_trait]
impl ReceiptClient for InMemoryReceiptClient {
    async fn list_connections(&self) -> Result<Vec<String>> {
        Ok(self.connections.clone())
    }

    async fn list_candidate_events(
        &self,
        connection: &str,
        window: DateWindow,
    ) -> Result<Vec<RawReceipt>> {
        Ok(self
            .receipts
            .get(connection)
            .map(|receipts| {
                receipts
                    .iter()
                    .filter(|r| window.contains(r.event_date))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{
        CategorizationBackend, CategorizeItem, ItemResult, OllamaBackend, OpenAICompatibleBackend,
    };
    use crate::models::{Direction, Transaction};
    use chrono::TimeZone;

    fn items(descriptions: &[&str]) -> Vec<CategorizeItem> {
        let posted_at = Utc.with_ymd_and_hms(2024, 1, 16, 9, 30, 0).unwrap();
        descriptions
            .iter()
            .enumerate()
            .map(|(i, d)| {
                CategorizeItem::from(&Transaction {
                    id: i as i64,
                    account_id: 1,
                    external_id: format!("tx-{}", i),
                    posted_at,
                    amount: -12.0,
                    currency: "GBP".to_string(),
                    description: d.to_string(),
                    direction: Direction::Debit,
                    merchant_normalized: None,
                    created_at: posted_at,
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn test_mock_server_health_check() {
        let server = MockLlmServer::start().await;
        assert!(OllamaBackend::new(&server.url(), "test-model").health_check().await);
        assert!(
            OpenAICompatibleBackend::new(&server.url(), "test-model")
                .health_check()
                .await
        );
    }

    #[tokio::test]
    async fn test_ollama_backend_categorizes_batch() {
        let server = MockLlmServer::start().await;
        server.fail_description("MYSTERY 1");
        let client = OllamaBackend::new(&server.url(), "test-model");

        let response = client
            .categorize(&items(&["TESCO STORES 1234", "MYSTERY 1", "NETFLIX.COM"]))
            .await
            .unwrap();

        assert_eq!(response.results.len(), 3);
        assert!(
            matches!(&response.results[0], ItemResult::Categorized(c) if c.category == "groceries")
        );
        assert!(matches!(response.results[1], ItemResult::Failed { .. }));
        assert_eq!(response.tokens_used, 300);
    }

    #[tokio::test]
    async fn test_openai_backend_categorizes_batch() {
        let server = MockLlmServer::start().await;
        let client = OpenAICompatibleBackend::new(&server.url(), "mock-model");

        let response = client.categorize(&items(&["UBER TRIP"])).await.unwrap();
        assert!(
            matches!(&response.results[0], ItemResult::Categorized(c) if c.category == "transport")
        );
        assert_eq!(response.tokens_used, 100);
    }

    #[tokio::test]
    async fn test_http_429_is_rate_limited() {
        let server = MockLlmServer::start().await;
        server.rate_limit_next(1);
        let client = OllamaBackend::new(&server.url(), "test-model");

        let first = client.categorize(&items(&["TESCO"])).await;
        assert!(matches!(first, Err(Error::RateLimited(_))));
        assert!(client.categorize(&items(&["TESCO"])).await.is_ok());
        assert_eq!(server.request_count(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_aggregator_pages() {
        let mut aggregator = InMemoryAggregator::new().with_page_size(1);
        aggregator.add_account("acc-1", "Current", "GBP");
        for i in 0..3 {
            aggregator.add_transaction(
                "acc-1",
                &format!("t{}", i),
                Utc.with_ymd_and_hms(2024, 1, 10 + i, 9, 0, 0).unwrap(),
                -1.0,
                "COFFEE",
            );
        }
        let window = DateWindow::last_days(10_000);

        let first = aggregator.list_transactions("acc-1", window, None).await.unwrap();
        assert_eq!(first.transactions.len(), 1);
        assert_eq!(first.next_cursor.as_deref(), Some("1"));
    }
}
