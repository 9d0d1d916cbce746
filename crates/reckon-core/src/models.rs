//! Domain models for Reckon

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A bank account known to the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    /// Aggregator's account identifier
    pub external_id: String,
    pub name: String,
    pub provider: String,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Direction of money movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }

    /// Direction implied by a signed amount (money out is negative)
    pub fn from_amount(amount: f64) -> Self {
        if amount < 0.0 {
            Self::Debit
        } else {
            Self::Credit
        }
    }

    /// Whether a signed amount agrees with this direction
    pub fn is_consistent_with(&self, amount: f64) -> bool {
        match self {
            Self::Debit => amount < 0.0,
            Self::Credit => amount > 0.0,
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debit" | "dr" | "out" => Ok(Self::Debit),
            "credit" | "cr" | "in" => Ok(Self::Credit),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A canonical, posted bank transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub account_id: i64,
    /// Provider's stable transaction id (unique per account)
    pub external_id: String,
    pub posted_at: DateTime<Utc>,
    /// Signed amount: negative for debits
    pub amount: f64,
    pub currency: String,
    pub description: String,
    pub direction: Direction,
    /// Canonical merchant id from the merchant normalizer
    pub merchant_normalized: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Calendar day of the posting (UTC)
    pub fn date(&self) -> NaiveDate {
        self.posted_at.date_naive()
    }
}

/// New transaction for insertion (before it has an ID)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub external_id: String,
    pub posted_at: DateTime<Utc>,
    pub amount: f64,
    pub currency: String,
    pub description: String,
    pub direction: Direction,
    pub merchant_normalized: Option<String>,
}

/// Where a receipt came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptSource {
    Email,
    MarketplacePurchase,
    MarketplaceReturn,
}

impl ReceiptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::MarketplacePurchase => "marketplace_purchase",
            Self::MarketplaceReturn => "marketplace_return",
        }
    }
}

impl std::str::FromStr for ReceiptSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "marketplace_purchase" | "marketplace-purchase" => Ok(Self::MarketplacePurchase),
            "marketplace_return" | "marketplace-return" => Ok(Self::MarketplaceReturn),
            _ => Err(format!("Unknown receipt source: {}", s)),
        }
    }
}

impl std::fmt::Display for ReceiptSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the receipt fields were extracted upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    StructuredMarkup,
    Pattern,
    AiFallback,
    VendorSpecific,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StructuredMarkup => "structured_markup",
            Self::Pattern => "pattern",
            Self::AiFallback => "ai_fallback",
            Self::VendorSpecific => "vendor_specific",
        }
    }
}

impl std::str::FromStr for ExtractionMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "structured_markup" => Ok(Self::StructuredMarkup),
            "pattern" => Ok(Self::Pattern),
            "ai_fallback" => Ok(Self::AiFallback),
            "vendor_specific" => Ok(Self::VendorSpecific),
            _ => Err(format!("Unknown extraction method: {}", s)),
        }
    }
}

/// Lifecycle status of a stored receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    #[default]
    Active,
    /// Upstream extraction produced something we can't match on
    Unparseable,
    /// Soft-deleted after retention or disconnect
    Tombstoned,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Unparseable => "unparseable",
            Self::Tombstoned => "tombstoned",
        }
    }
}

impl std::str::FromStr for ReceiptStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "unparseable" => Ok(Self::Unparseable),
            "tombstoned" => Ok(Self::Tombstoned),
            _ => Err(format!("Unknown receipt status: {}", s)),
        }
    }
}

/// One line of a receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
}

/// A canonical receipt (deduplicated purchase event)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: i64,
    pub connection_id: String,
    pub source_type: ReceiptSource,
    pub merchant_raw: String,
    pub merchant_normalized: String,
    pub order_ref: Option<String>,
    pub total: f64,
    pub currency: String,
    pub event_date: NaiveDate,
    pub line_items: Vec<LineItem>,
    /// 0-100
    pub extraction_confidence: u8,
    pub extraction_method: ExtractionMethod,
    pub status: ReceiptStatus,
    pub receipt_hash: String,
    pub created_at: DateTime<Utc>,
    pub tombstoned_at: Option<DateTime<Utc>>,
}

/// New receipt for insertion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReceipt {
    pub connection_id: String,
    pub source_type: ReceiptSource,
    pub merchant_raw: String,
    pub merchant_normalized: String,
    pub order_ref: Option<String>,
    pub total: f64,
    pub currency: String,
    pub event_date: NaiveDate,
    pub line_items: Vec<LineItem>,
    pub extraction_confidence: u8,
    pub extraction_method: ExtractionMethod,
    pub status: ReceiptStatus,
    pub receipt_hash: String,
}

/// Cardinality of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// One receipt, one transaction
    #[default]
    Standard,
    /// One receipt paid across several transactions
    SplitPayment,
    /// Several receipts settled by one transaction
    BundledOrder,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::SplitPayment => "split_payment",
            Self::BundledOrder => "bundled_order",
        }
    }
}

impl std::str::FromStr for MatchType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "standard" => Ok(Self::Standard),
            "split_payment" | "split" => Ok(Self::SplitPayment),
            "bundled_order" | "bundle" => Ok(Self::BundledOrder),
            _ => Err(format!("Unknown match type: {}", s)),
        }
    }
}

/// Which signal produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    ExactAmountDate,
    TolerantAmountDate,
    FuzzyMerchant,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExactAmountDate => "exact_amount_date",
            Self::TolerantAmountDate => "tolerant_amount_date",
            Self::FuzzyMerchant => "fuzzy_merchant",
        }
    }
}

impl std::str::FromStr for MatchMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "exact_amount_date" => Ok(Self::ExactAmountDate),
            "tolerant_amount_date" => Ok(Self::TolerantAmountDate),
            "fuzzy_merchant" => Ok(Self::FuzzyMerchant),
            _ => Err(format!("Unknown match method: {}", s)),
        }
    }
}

/// A stored link between a transaction and a receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptMatch {
    pub id: i64,
    pub transaction_id: i64,
    pub receipt_id: i64,
    /// 0-100
    pub confidence: u8,
    pub match_type: MatchType,
    pub method: MatchMethod,
    pub currency_converted: bool,
    pub conversion_rate: Option<f64>,
    pub date_delta_days: i64,
    pub amount_delta: f64,
    pub user_confirmed: bool,
    pub created_at: DateTime<Utc>,
}

impl ReceiptMatch {
    /// Whether this match may feed the primary external enrichment
    pub fn is_primary_eligible(&self, auto_accept_threshold: u8) -> bool {
        self.user_confirmed || self.confidence >= auto_accept_threshold
    }
}

/// A scored match proposal (stored or previewed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMatch {
    pub transaction_id: i64,
    pub receipt_id: i64,
    pub confidence: u8,
    pub match_type: MatchType,
    pub method: MatchMethod,
    pub conversion_rate: Option<f64>,
    pub date_delta_days: i64,
    pub amount_delta: f64,
}

/// Categorization fields shared by every enrichment variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentFields {
    pub category: String,
    pub subcategory: Option<String>,
    /// Essential (true) vs discretionary (false)
    pub essential: bool,
    pub merchant: Option<String>,
    /// 0-100
    pub confidence: u8,
}

/// Deterministic rule-derived enrichment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEnrichment {
    pub id: i64,
    pub transaction_id: i64,
    pub fields: EnrichmentFields,
    pub rule_id: i64,
    pub pattern: String,
    pub created_at: DateTime<Utc>,
}

/// LLM-derived enrichment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmEnrichment {
    pub id: i64,
    pub transaction_id: i64,
    pub fields: EnrichmentFields,
    pub provider: String,
    pub model: String,
    /// Cache entry this result was produced from or written to
    pub cache_id: Option<i64>,
    pub from_cache: bool,
    pub job_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// LLM result ready to store
#[derive(Debug, Clone)]
pub struct NewLlmEnrichment {
    pub transaction_id: i64,
    pub fields: EnrichmentFields,
    pub provider: String,
    pub model: String,
    pub cache_id: Option<i64>,
    pub from_cache: bool,
    pub job_id: Option<i64>,
}

/// Receipt-derived enrichment (one per usable match)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEnrichment {
    pub id: i64,
    pub transaction_id: i64,
    pub fields: EnrichmentFields,
    pub source_type: ReceiptSource,
    pub receipt_id: i64,
    pub match_id: i64,
    pub line_items: Vec<LineItem>,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// Receipt-derived enrichment ready to store
#[derive(Debug, Clone)]
pub struct NewExternalEnrichment {
    pub transaction_id: i64,
    pub match_id: i64,
    pub receipt_id: i64,
    pub source_type: ReceiptSource,
    pub fields: EnrichmentFields,
    pub line_items: Vec<LineItem>,
}

/// Which variant supplied the effective categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentSource {
    Rule,
    Llm,
    External,
    Unenriched,
}

impl EnrichmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Llm => "llm",
            Self::External => "external",
            Self::Unenriched => "unenriched",
        }
    }
}

impl std::fmt::Display for EnrichmentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The single read view of a transaction's categorization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveEnrichment {
    pub transaction_id: i64,
    pub source: EnrichmentSource,
    pub fields: Option<EnrichmentFields>,
    /// Row id in the winning result table
    pub source_id: Option<i64>,
    /// Human-readable account of why this source won
    pub explanation: String,
}

/// Pattern types for enrichment rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    #[default]
    Contains,
    StartsWith,
    Exact,
    Regex,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::Exact => "exact",
            Self::Regex => "regex",
        }
    }
}

impl std::str::FromStr for PatternType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "contains" => Ok(Self::Contains),
            "starts_with" | "prefix" => Ok(Self::StartsWith),
            "exact" => Ok(Self::Exact),
            "regex" => Ok(Self::Regex),
            _ => Err(format!("Unknown pattern type: {}", s)),
        }
    }
}

/// A deterministic categorization rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRule {
    pub id: i64,
    pub pattern: String,
    pub pattern_type: PatternType,
    pub category: String,
    pub subcategory: Option<String>,
    pub essential: bool,
    pub merchant: Option<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// New rule for insertion
#[derive(Debug, Clone)]
pub struct NewEnrichmentRule {
    pub pattern: String,
    pub pattern_type: PatternType,
    pub category: String,
    pub subcategory: Option<String>,
    pub essential: bool,
    pub merchant: Option<String>,
    pub priority: i32,
}

/// Merchant alias (bank or receipt spelling → canonical id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantAlias {
    pub id: i64,
    /// Lowercased, noise-stripped observed string
    pub alias: String,
    pub canonical_id: String,
    /// Category used for receipt-derived enrichment
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub essential: bool,
    /// seed, user
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Kind of asynchronous job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Enrichment,
    EnrichmentRetry,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Enrichment => "enrichment",
            Self::EnrichmentRetry => "enrichment_retry",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "enrichment" => Ok(Self::Enrichment),
            "enrichment_retry" => Ok(Self::EnrichmentRetry),
            _ => Err(format!("Unknown job kind: {}", s)),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job state machine: queued → running → {completed | failed | cancelled}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States a job may move into this one from. Never backwards.
    pub fn allowed_predecessors(&self) -> &'static [JobStatus] {
        match self {
            Self::Queued => &[],
            Self::Running => &[Self::Queued],
            Self::Completed => &[Self::Running],
            // A queued job can be failed or cancelled before a worker picks it up
            Self::Failed | Self::Cancelled => &[Self::Queued, Self::Running],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted asynchronous job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub processed_count: i64,
    pub total_count: i64,
    pub failed_units: i64,
    pub tokens_used: i64,
    pub cost_usd: f64,
    /// What sync units stored, skipped as already seen, or rejected
    pub ingest: IngestCounts,
    pub cancel_requested: bool,
    pub error_message: Option<String>,
    /// JSON summary written when the job finishes
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A per-unit failure collected while a job ran
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobUnitError {
    pub id: i64,
    pub job_id: i64,
    pub unit: String,
    pub error_kind: String,
    /// Redacted message
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Status of a recorded LLM enrichment failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailureStatus {
    /// Eligible for an explicit retry
    #[default]
    Pending,
    /// Hit the retry ceiling
    Permanent,
    /// A later retry succeeded
    Resolved,
}

impl FailureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Permanent => "permanent",
            Self::Resolved => "resolved",
        }
    }
}

impl std::str::FromStr for FailureStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "permanent" => Ok(Self::Permanent),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!("Unknown failure status: {}", s)),
        }
    }
}

/// A transaction whose LLM enrichment failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentFailure {
    pub id: i64,
    pub transaction_id: i64,
    pub error_kind: String,
    pub message: String,
    pub retry_count: i64,
    pub status: FailureStatus,
    pub last_job_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// Per-job ingestion statistics, kept apart from unit failures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCounts {
    pub inserted: i64,
    pub replaced: i64,
    /// Already stored before this job
    pub duplicates: i64,
    /// Failed normalization (inconsistent provider data)
    pub rejected: i64,
}

impl IngestCounts {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl From<InsertStats> for IngestCounts {
    fn from(stats: InsertStats) -> Self {
        Self {
            inserted: stats.inserted as i64,
            replaced: stats.replaced as i64,
            duplicates: stats.duplicates as i64,
            rejected: 0,
        }
    }
}

/// Counters from an idempotent batch insert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertStats {
    pub inserted: usize,
    /// Already stored (natural key seen before); not an error
    pub duplicates: usize,
    /// Stored row superseded by a higher-confidence copy
    pub replaced: usize,
    pub errors: usize,
}

impl InsertStats {
    pub fn merge(&mut self, other: InsertStats) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.replaced += other.replaced;
        self.errors += other.errors;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_consistency() {
        assert!(Direction::Debit.is_consistent_with(-4.0));
        assert!(!Direction::Debit.is_consistent_with(4.0));
        assert!(Direction::Credit.is_consistent_with(4.0));
        assert_eq!(Direction::from_amount(-1.0), Direction::Debit);
    }

    #[test]
    fn test_job_transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Queued, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_match_primary_eligibility() {
        let m = ReceiptMatch {
            id: 1,
            transaction_id: 1,
            receipt_id: 1,
            confidence: 60,
            match_type: MatchType::Standard,
            method: MatchMethod::TolerantAmountDate,
            currency_converted: false,
            conversion_rate: None,
            date_delta_days: 5,
            amount_delta: 0.0,
            user_confirmed: false,
            created_at: Utc::now(),
        };
        assert!(!m.is_primary_eligible(70));
        let confirmed = ReceiptMatch {
            user_confirmed: true,
            ..m
        };
        assert!(confirmed.is_primary_eligible(70));
    }

    #[test]
    fn test_enum_round_trip_strings() {
        assert_eq!(
            "marketplace-purchase".parse::<ReceiptSource>().unwrap(),
            ReceiptSource::MarketplacePurchase
        );
        assert_eq!("split".parse::<MatchType>().unwrap(), MatchType::SplitPayment);
        assert!("sideways".parse::<JobStatus>().is_err());
    }
}
