//! Receipt ↔ transaction matching
//!
//! Scoring table (first row that applies wins):
//!
//! | amount   | date                  | merchant | score |
//! |----------|-----------------------|----------|-------|
//! | exact    | same day              | yes      | 100   |
//! | exact    | within close window   | yes      | 90    |
//! | tolerant | within window         | yes      | 80    |
//! | tolerant | within window         | differs  | 70    |
//! | tolerant | within window         | unknown  | 60    |
//!
//! "Unknown" means one side has no merchant id, so only the amount and date
//! back the match.
//!
//! "Exact" is a difference under half a cent after currency conversion;
//! "tolerant" is within `max(percent * total, fixed)`. Scores depend only on
//! the pair being scored, so equal inputs always give equal scores.
//!
//! Standard matches are assigned one-to-one, greedily in score order. Split
//! payments and bundled orders are never guessed; they are created
//! explicitly and validated against the same tolerances.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::MatcherConfig;
use crate::currency::ExchangeRates;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::merchant::{merchants_match, MerchantSimilarity};
use crate::models::{
    Direction, MatchMethod, MatchType, NewMatch, Receipt, ReceiptSource, ReceiptStatus,
    Transaction,
};

/// Amount differences below this are "exact"
const EXACT_EPSILON: f64 = 0.005;

/// A scored (transaction, receipt) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub transaction_id: i64,
    pub receipt_id: i64,
    pub confidence: u8,
    pub method: MatchMethod,
    /// Set when the receipt total was converted into the transaction currency
    pub conversion_rate: Option<f64>,
    pub date_delta_days: i64,
    pub amount_delta: f64,
}

impl ScoredCandidate {
    pub fn to_new_match(&self, match_type: MatchType) -> NewMatch {
        NewMatch {
            transaction_id: self.transaction_id,
            receipt_id: self.receipt_id,
            confidence: self.confidence,
            match_type,
            method: self.method,
            conversion_rate: self.conversion_rate,
            date_delta_days: self.date_delta_days,
            amount_delta: self.amount_delta,
        }
    }

    /// Highest score first; ties by smallest date delta, then amount delta, then ids
    fn rank(&self, other: &Self) -> Ordering {
        other
            .confidence
            .cmp(&self.confidence)
            .then(self.date_delta_days.cmp(&other.date_delta_days))
            .then(
                self.amount_delta
                    .partial_cmp(&other.amount_delta)
                    .unwrap_or(Ordering::Equal),
            )
            .then(self.receipt_id.cmp(&other.receipt_id))
            .then(self.transaction_id.cmp(&other.transaction_id))
    }
}

/// Pairs already linked or rejected, excluded from standard matching
#[derive(Debug, Clone, Default)]
pub struct ExistingMatches {
    pub matched_transactions: HashSet<i64>,
    pub matched_receipts: HashSet<i64>,
    pub rejected: HashSet<(i64, i64)>,
}

impl ExistingMatches {
    pub fn load(db: &Database) -> Result<Self> {
        let (matched_transactions, matched_receipts) = db.matched_ids()?;
        Ok(Self {
            matched_transactions,
            matched_receipts,
            rejected: db.rejected_pairs()?,
        })
    }
}

/// Outcome of a matching pass. Nothing found is a count, not an error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchRun {
    pub matches: Vec<NewMatch>,
    pub receipts_considered: usize,
    pub unmatched_receipts: usize,
    /// Candidates skipped because no exchange rate was configured
    pub missing_rate: usize,
    /// Stored but awaiting confirmation before feeding enrichment
    pub needs_review: usize,
    /// Rows actually written (set by `Matcher::run`)
    pub stored: usize,
    /// External enrichments created from the new matches
    pub enrichments_created: usize,
}

enum Scored {
    Candidate(ScoredCandidate),
    MissingRate,
    NoMatch,
}

pub struct Matcher {
    config: MatcherConfig,
    rates: ExchangeRates,
}

impl Matcher {
    pub fn new(config: MatcherConfig, rates: ExchangeRates) -> Self {
        Self { config, rates }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Widest candidate window across all merchants
    fn max_window(&self) -> i64 {
        self.config
            .merchant_date_tolerance
            .values()
            .copied()
            .chain(std::iter::once(self.config.date_tolerance_days))
            .max()
            .unwrap_or(self.config.date_tolerance_days)
    }

    fn direction_for(source: ReceiptSource) -> Direction {
        match source {
            ReceiptSource::MarketplaceReturn => Direction::Credit,
            ReceiptSource::Email | ReceiptSource::MarketplacePurchase => Direction::Debit,
        }
    }

    /// Score from the table, or `None` outside tolerance / below the store minimum
    fn score_amounts(
        &self,
        bank_amount: f64,
        receipt_amount: f64,
        date_delta: i64,
        window: i64,
        merchant: MerchantSimilarity,
    ) -> Option<(u8, MatchMethod, f64)> {
        if date_delta > window {
            return None;
        }
        let amount_delta = (bank_amount - receipt_amount).abs();
        let exact = amount_delta < EXACT_EPSILON;
        if !exact && amount_delta > self.config.amount_tolerance_for(receipt_amount) {
            return None;
        }

        let close = date_delta <= self.config.close_date_days;
        let confidence = match merchant {
            m if m.is_match() && exact && date_delta == 0 => 100,
            m if m.is_match() && exact && close => 90,
            m if m.is_match() => 80,
            MerchantSimilarity::Unknown => 60,
            _ => 70,
        };
        if confidence < self.config.min_store_confidence {
            return None;
        }

        let method = if merchant == MerchantSimilarity::Fuzzy {
            MatchMethod::FuzzyMerchant
        } else if exact && close {
            MatchMethod::ExactAmountDate
        } else {
            MatchMethod::TolerantAmountDate
        };

        // Round away float noise so equal inputs store equal deltas
        let amount_delta = (amount_delta * 100.0).round() / 100.0;
        Some((confidence, method, amount_delta))
    }

    fn score_pair(&self, tx: &Transaction, receipt: &Receipt) -> Scored {
        if receipt.status != ReceiptStatus::Active
            || tx.direction != Self::direction_for(receipt.source_type)
        {
            return Scored::NoMatch;
        }

        let date_delta = (tx.date() - receipt.event_date).num_days().abs();
        let window = self.config.date_tolerance_for(&receipt.merchant_normalized);
        if date_delta > window {
            return Scored::NoMatch;
        }

        let Some((converted, rate)) =
            self.rates
                .convert(receipt.total, &receipt.currency, &tx.currency)
        else {
            return Scored::MissingRate;
        };

        let merchant = merchants_match(
            tx.merchant_normalized.as_deref().unwrap_or(""),
            &receipt.merchant_normalized,
        );

        match self.score_amounts(tx.amount.abs(), converted, date_delta, window, merchant) {
            Some((confidence, method, amount_delta)) => Scored::Candidate(ScoredCandidate {
                transaction_id: tx.id,
                receipt_id: receipt.id,
                confidence,
                method,
                conversion_rate: (!receipt.currency.eq_ignore_ascii_case(&tx.currency))
                    .then_some(rate),
                date_delta_days: date_delta,
                amount_delta,
            }),
            None => Scored::NoMatch,
        }
    }

    /// Score a single pair (for previews and tests)
    pub fn score(&self, tx: &Transaction, receipt: &Receipt) -> Option<ScoredCandidate> {
        match self.score_pair(tx, receipt) {
            Scored::Candidate(c) => Some(c),
            _ => None,
        }
    }

    /// Propose standard one-to-one matches for unmatched receipts
    pub fn match_all(
        &self,
        transactions: &[Transaction],
        receipts: &[Receipt],
        existing: &ExistingMatches,
    ) -> MatchRun {
        let mut run = MatchRun::default();
        let mut candidates = Vec::new();

        for receipt in receipts {
            if receipt.status != ReceiptStatus::Active
                || existing.matched_receipts.contains(&receipt.id)
            {
                continue;
            }
            run.receipts_considered += 1;

            for tx in transactions {
                if existing.matched_transactions.contains(&tx.id)
                    || existing.rejected.contains(&(tx.id, receipt.id))
                {
                    continue;
                }
                match self.score_pair(tx, receipt) {
                    Scored::Candidate(c) => candidates.push(c),
                    Scored::MissingRate => run.missing_rate += 1,
                    Scored::NoMatch => {}
                }
            }
        }

        candidates.sort_by(|a, b| a.rank(b));

        let mut used_transactions = HashSet::new();
        let mut used_receipts = HashSet::new();
        for candidate in candidates {
            if used_transactions.contains(&candidate.transaction_id)
                || used_receipts.contains(&candidate.receipt_id)
            {
                continue;
            }
            used_transactions.insert(candidate.transaction_id);
            used_receipts.insert(candidate.receipt_id);
            if candidate.confidence < self.config.auto_accept_threshold {
                run.needs_review += 1;
            }
            run.matches.push(candidate.to_new_match(MatchType::Standard));
        }

        run.unmatched_receipts = run.receipts_considered - run.matches.len();
        run
    }

    /// Scored candidates for one receipt, best first, without storing anything
    pub fn preview_candidates(
        &self,
        receipt: &Receipt,
        transactions: &[Transaction],
        rejected: &HashSet<(i64, i64)>,
    ) -> Vec<ScoredCandidate> {
        let mut candidates: Vec<ScoredCandidate> = transactions
            .iter()
            .filter(|tx| !rejected.contains(&(tx.id, receipt.id)))
            .filter_map(|tx| self.score(tx, receipt))
            .collect();
        candidates.sort_by(|a, b| a.rank(b));
        candidates
    }

    /// One receipt paid across several transactions
    pub fn split_match(&self, receipt: &Receipt, transactions: &[Transaction]) -> Result<Vec<NewMatch>> {
        if transactions.len() < 2 {
            return Err(Error::InvalidData(
                "A split payment needs at least two transactions".to_string(),
            ));
        }
        let currency = single_currency(transactions.iter().map(|t| t.currency.as_str()))?;
        let expected = Self::direction_for(receipt.source_type);
        if transactions.iter().any(|t| t.direction != expected) {
            return Err(Error::InvalidData(
                "Split transactions must all move money the same way as the receipt".to_string(),
            ));
        }

        let (converted, rate) = self
            .rates
            .convert(receipt.total, &receipt.currency, currency)
            .ok_or_else(|| missing_rate(&receipt.currency, currency))?;
        let paid: f64 = transactions.iter().map(|t| t.amount.abs()).sum();
        let date_delta = max_delta(transactions.iter().map(|t| t.date()), receipt.event_date);
        let merchant = best_similarity(
            transactions
                .iter()
                .map(|t| t.merchant_normalized.as_deref().unwrap_or("")),
            &receipt.merchant_normalized,
        );

        let (confidence, method, amount_delta) = self
            .score_amounts(
                paid,
                converted,
                date_delta,
                self.config.date_tolerance_for(&receipt.merchant_normalized),
                merchant,
            )
            .ok_or_else(|| {
                Error::InvalidData(format!(
                    "Transactions total {:.2} {} but the receipt is {:.2} {}",
                    paid, currency, converted, currency
                ))
            })?;

        let conversion_rate = (!receipt.currency.eq_ignore_ascii_case(currency)).then_some(rate);
        Ok(transactions
            .iter()
            .map(|tx| NewMatch {
                transaction_id: tx.id,
                receipt_id: receipt.id,
                confidence,
                match_type: MatchType::SplitPayment,
                method,
                conversion_rate,
                date_delta_days: (tx.date() - receipt.event_date).num_days().abs(),
                amount_delta,
            })
            .collect())
    }

    /// Several receipts settled by one transaction
    pub fn bundle_match(&self, transaction: &Transaction, receipts: &[Receipt]) -> Result<Vec<NewMatch>> {
        if receipts.len() < 2 {
            return Err(Error::InvalidData(
                "A bundled order needs at least two receipts".to_string(),
            ));
        }
        if receipts.iter().any(|r| r.status != ReceiptStatus::Active) {
            return Err(Error::InvalidData("Bundled receipts must be active".to_string()));
        }
        let currency = single_currency(receipts.iter().map(|r| r.currency.as_str()))?;
        if receipts
            .iter()
            .any(|r| Self::direction_for(r.source_type) != transaction.direction)
        {
            return Err(Error::InvalidData(
                "Bundled receipts must move money the same way as the transaction".to_string(),
            ));
        }

        let total: f64 = receipts.iter().map(|r| r.total).sum();
        let (converted, rate) = self
            .rates
            .convert(total, currency, &transaction.currency)
            .ok_or_else(|| missing_rate(currency, &transaction.currency))?;
        let date_delta = max_delta(receipts.iter().map(|r| r.event_date), transaction.date());
        let merchant = best_similarity(
            receipts.iter().map(|r| r.merchant_normalized.as_str()),
            transaction.merchant_normalized.as_deref().unwrap_or(""),
        );
        let window = receipts
            .iter()
            .map(|r| self.config.date_tolerance_for(&r.merchant_normalized))
            .max()
            .unwrap_or(self.config.date_tolerance_days);

        let (confidence, method, amount_delta) = self
            .score_amounts(transaction.amount.abs(), converted, date_delta, window, merchant)
            .ok_or_else(|| {
                Error::InvalidData(format!(
                    "Receipts total {:.2} {} but the transaction is {:.2} {}",
                    converted,
                    transaction.currency,
                    transaction.amount.abs(),
                    transaction.currency
                ))
            })?;

        let conversion_rate =
            (!transaction.currency.eq_ignore_ascii_case(currency)).then_some(rate);
        Ok(receipts
            .iter()
            .map(|r| NewMatch {
                transaction_id: transaction.id,
                receipt_id: r.id,
                confidence,
                match_type: MatchType::BundledOrder,
                method,
                conversion_rate,
                date_delta_days: (transaction.date() - r.event_date).num_days().abs(),
                amount_delta,
            })
            .collect())
    }

    // ========== Database-backed operations ==========

    /// Match every unmatched active receipt, store the results and create
    /// external enrichments for the usable ones
    pub fn run(&self, db: &Database) -> Result<MatchRun> {
        let receipts = db.list_unmatched_receipts()?;
        if receipts.is_empty() {
            debug!("No unmatched receipts");
            return Ok(MatchRun::default());
        }

        let transactions = self.transactions_around(db, receipts.iter().map(|r| r.event_date))?;
        let existing = ExistingMatches::load(db)?;

        let mut run = self.match_all(&transactions, &receipts, &existing);
        run.stored = db.insert_matches(&run.matches)?;
        run.enrichments_created =
            db.refresh_all_external_enrichments(self.config.auto_accept_threshold)?;

        info!(
            considered = run.receipts_considered,
            matched = run.matches.len(),
            unmatched = run.unmatched_receipts,
            needs_review = run.needs_review,
            missing_rate = run.missing_rate,
            "Matching complete"
        );
        Ok(run)
    }

    /// Candidate preview for a stored receipt
    pub fn preview_for_receipt(&self, db: &Database, receipt_id: i64) -> Result<Vec<ScoredCandidate>> {
        let receipt = db
            .get_receipt(receipt_id)?
            .ok_or_else(|| Error::NotFound(format!("Receipt {}", receipt_id)))?;
        let transactions = self.transactions_around(db, std::iter::once(receipt.event_date))?;
        let rejected = db.rejected_pairs()?;
        Ok(self.preview_candidates(&receipt, &transactions, &rejected))
    }

    /// Validate and store a split payment
    pub fn create_split_match(
        &self,
        db: &Database,
        receipt_id: i64,
        transaction_ids: &[i64],
    ) -> Result<Vec<NewMatch>> {
        let receipt = db
            .get_receipt(receipt_id)?
            .ok_or_else(|| Error::NotFound(format!("Receipt {}", receipt_id)))?;
        let transactions = load_all_transactions(db, transaction_ids)?;

        let matches = self.split_match(&receipt, &transactions)?;
        self.store_explicit(db, &matches)?;
        Ok(matches)
    }

    /// Validate and store a bundled order
    pub fn create_bundle_match(
        &self,
        db: &Database,
        transaction_id: i64,
        receipt_ids: &[i64],
    ) -> Result<Vec<NewMatch>> {
        let transaction = db
            .get_transaction(transaction_id)?
            .ok_or_else(|| Error::NotFound(format!("Transaction {}", transaction_id)))?;
        let mut receipts = Vec::with_capacity(receipt_ids.len());
        for id in receipt_ids {
            receipts.push(
                db.get_receipt(*id)?
                    .ok_or_else(|| Error::NotFound(format!("Receipt {}", id)))?,
            );
        }

        let matches = self.bundle_match(&transaction, &receipts)?;
        self.store_explicit(db, &matches)?;
        Ok(matches)
    }

    fn store_explicit(&self, db: &Database, matches: &[NewMatch]) -> Result<()> {
        db.insert_matches(matches)?;
        for m in matches {
            if let Some(stored) = db.get_match_for_pair(m.transaction_id, m.receipt_id)? {
                db.refresh_external_enrichment(stored.id, self.config.auto_accept_threshold)?;
            }
        }
        Ok(())
    }

    fn transactions_around(
        &self,
        db: &Database,
        dates: impl Iterator<Item = NaiveDate>,
    ) -> Result<Vec<Transaction>> {
        let (min, max) = dates.fold((None, None), |(lo, hi): (Option<NaiveDate>, Option<NaiveDate>), d| {
            (
                Some(lo.map_or(d, |lo| lo.min(d))),
                Some(hi.map_or(d, |hi| hi.max(d))),
            )
        });
        let (Some(min), Some(max)) = (min, max) else {
            return Ok(Vec::new());
        };
        let window = Duration::days(self.max_window());
        db.list_transactions_between(min - window, max + window)
    }
}

fn load_all_transactions(db: &Database, ids: &[i64]) -> Result<Vec<Transaction>> {
    let transactions = db.get_transactions_by_ids(ids)?;
    if transactions.len() != ids.iter().collect::<HashSet<_>>().len() {
        return Err(Error::NotFound("One or more transactions".to_string()));
    }
    Ok(transactions)
}

fn single_currency<'a>(mut codes: impl Iterator<Item = &'a str>) -> Result<&'a str> {
    let first = codes
        .next()
        .ok_or_else(|| Error::InvalidData("Nothing to combine".to_string()))?;
    if codes.any(|c| !c.eq_ignore_ascii_case(first)) {
        return Err(Error::InvalidData(
            "Combined records must share one currency".to_string(),
        ));
    }
    Ok(first)
}

fn missing_rate(from: &str, to: &str) -> Error {
    Error::Config(format!("No exchange rate configured for {}/{}", from, to))
}

fn max_delta(dates: impl Iterator<Item = NaiveDate>, anchor: NaiveDate) -> i64 {
    dates
        .map(|d| (d - anchor).num_days().abs())
        .max()
        .unwrap_or(0)
}

fn best_similarity<'a>(names: impl Iterator<Item = &'a str>, other: &str) -> MerchantSimilarity {
    let mut best = MerchantSimilarity::Unknown;
    for name in names {
        match merchants_match(name, other) {
            MerchantSimilarity::Same => return MerchantSimilarity::Same,
            MerchantSimilarity::Fuzzy => best = MerchantSimilarity::Fuzzy,
            MerchantSimilarity::Different if best == MerchantSimilarity::Unknown => {
                best = MerchantSimilarity::Different
            }
            MerchantSimilarity::Different | MerchantSimilarity::Unknown => {}
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionMethod, ReceiptStatus};
    use chrono::{TimeZone, Utc};

    fn matcher() -> Matcher {
        let mut config = MatcherConfig::default();
        config.merchant_date_tolerance.insert("amazon".to_string(), 14);
        Matcher::new(config, ExchangeRates::new().with_rate("EUR", "GBP", 0.5))
    }

    fn tx(id: i64, amount: f64, day: u32, merchant: &str) -> Transaction {
        let posted_at = Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap();
        Transaction {
            id,
            account_id: 1,
            external_id: format!("ext-{}", id),
            posted_at,
            amount,
            currency: "GBP".to_string(),
            description: merchant.to_uppercase(),
            direction: Direction::from_amount(amount),
            merchant_normalized: Some(merchant.to_string()),
            created_at: posted_at,
        }
    }

    fn unnamed_tx(id: i64, amount: f64, day: u32) -> Transaction {
        Transaction {
            merchant_normalized: None,
            ..tx(id, amount, day, "")
        }
    }

    fn receipt(id: i64, total: f64, day: u32, merchant: &str) -> Receipt {
        Receipt {
            id,
            connection_id: "mail".to_string(),
            source_type: ReceiptSource::Email,
            merchant_raw: merchant.to_string(),
            merchant_normalized: merchant.to_string(),
            order_ref: None,
            total,
            currency: "GBP".to_string(),
            event_date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            line_items: vec![],
            extraction_confidence: 90,
            extraction_method: ExtractionMethod::StructuredMarkup,
            status: ReceiptStatus::Active,
            receipt_hash: format!("hash-{}", id),
            created_at: Utc::now(),
            tombstoned_at: None,
        }
    }

    fn score(t: &Transaction, r: &Receipt) -> Option<u8> {
        matcher().score(t, r).map(|c| c.confidence)
    }

    #[test]
    fn test_scoring_table() {
        let r = receipt(1, 42.50, 15, "tesco");
        assert_eq!(score(&tx(1, -42.50, 15, "tesco"), &r), Some(100));
        assert_eq!(score(&tx(1, -42.50, 16, "tesco"), &r), Some(90));
        assert_eq!(score(&tx(1, -42.50, 20, "tesco"), &r), Some(80));
        assert_eq!(score(&tx(1, -43.00, 16, "tesco"), &r), Some(80));
        assert_eq!(score(&tx(1, -43.00, 16, "corner shop"), &r), Some(70));
        assert_eq!(score(&tx(1, -42.50, 21, "corner shop"), &r), Some(70));
        assert_eq!(score(&unnamed_tx(1, -42.50, 16), &r), Some(60));
        // Outside the window or the amount tolerance
        assert_eq!(score(&tx(1, -42.50, 23, "tesco"), &r), None);
        assert_eq!(score(&tx(1, -50.00, 15, "tesco"), &r), None);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let r = receipt(1, 42.50, 15, "tesco");
        let t = tx(1, -42.80, 17, "tesco");
        let m = matcher();
        assert_eq!(m.score(&t, &r), m.score(&t, &r));
    }

    #[test]
    fn test_direction_must_agree() {
        let r = receipt(1, 42.50, 15, "tesco");
        assert_eq!(score(&tx(1, 42.50, 15, "tesco"), &r), None);

        let mut refund = receipt(2, 42.50, 15, "tesco");
        refund.source_type = ReceiptSource::MarketplaceReturn;
        assert_eq!(score(&tx(1, 42.50, 15, "tesco"), &refund), Some(100));
    }

    #[test]
    fn test_fuzzy_merchant_method() {
        let r = receipt(1, 12.00, 15, "uber");
        let c = matcher().score(&tx(1, -12.00, 15, "uber eats"), &r).unwrap();
        assert_eq!(c.confidence, 100);
        assert_eq!(c.method, MatchMethod::FuzzyMerchant);
    }

    #[test]
    fn test_per_merchant_window() {
        let r = receipt(1, 30.00, 1, "amazon");
        assert_eq!(score(&tx(1, -30.00, 13, "amazon"), &r), Some(80));
        let other = receipt(2, 30.00, 1, "argos");
        assert_eq!(score(&tx(1, -30.00, 13, "argos"), &other), None);
    }

    #[test]
    fn test_currency_conversion_recorded() {
        let mut r = receipt(1, 20.00, 15, "tesco");
        r.currency = "EUR".to_string();
        let c = matcher().score(&tx(1, -10.00, 15, "tesco"), &r).unwrap();
        assert_eq!(c.confidence, 100);
        assert_eq!(c.conversion_rate, Some(0.5));

        r.currency = "JPY".to_string();
        let run = matcher().match_all(&[tx(1, -10.00, 15, "tesco")], &[r], &ExistingMatches::default());
        assert_eq!(run.matches.len(), 0);
        assert_eq!(run.missing_rate, 1);
        assert_eq!(run.unmatched_receipts, 1);
    }

    #[test]
    fn test_match_all_is_one_to_one() {
        let receipts = vec![receipt(1, 10.00, 15, "tesco"), receipt(2, 10.00, 15, "tesco")];
        let transactions = vec![tx(1, -10.00, 15, "tesco")];
        let run = matcher().match_all(&transactions, &receipts, &ExistingMatches::default());
        assert_eq!(run.matches.len(), 1);
        assert_eq!(run.matches[0].receipt_id, 1);
        assert_eq!(run.unmatched_receipts, 1);
    }

    #[test]
    fn test_match_all_prefers_higher_score() {
        let receipts = vec![receipt(1, 10.00, 15, "tesco")];
        let transactions = vec![tx(1, -10.00, 17, "tesco"), tx(2, -10.00, 15, "tesco")];
        let run = matcher().match_all(&transactions, &receipts, &ExistingMatches::default());
        assert_eq!(run.matches[0].transaction_id, 2);
        assert_eq!(run.matches[0].confidence, 100);
    }

    #[test]
    fn test_rejected_pairs_are_skipped() {
        let mut existing = ExistingMatches::default();
        existing.rejected.insert((1, 1));
        let run = matcher().match_all(
            &[tx(1, -10.00, 15, "tesco")],
            &[receipt(1, 10.00, 15, "tesco")],
            &existing,
        );
        assert!(run.matches.is_empty());
    }

    #[test]
    fn test_different_merchant_scores_by_window_not_closeness() {
        let r = receipt(1, 42.50, 15, "tesco");
        // Five days out: beyond the close window but inside the match window
        let c = matcher().score(&tx(1, -43.00, 20, "corner shop"), &r).unwrap();
        assert_eq!(c.confidence, 70);
        assert_eq!(c.method, MatchMethod::TolerantAmountDate);

        let run = matcher().match_all(
            &[tx(1, -43.00, 20, "corner shop")],
            &[r],
            &ExistingMatches::default(),
        );
        assert_eq!(run.needs_review, 0);
    }

    #[test]
    fn test_missing_merchant_is_amount_only() {
        let r = receipt(1, 42.50, 15, "tesco");
        assert_eq!(score(&unnamed_tx(1, -42.50, 16), &r), Some(60));
        assert_eq!(score(&unnamed_tx(1, -42.50, 15), &r), Some(60));
        let mut blank = tx(1, -42.50, 15, "");
        blank.merchant_normalized = Some(String::new());
        assert_eq!(score(&blank, &r), Some(60));
    }

    #[test]
    fn test_split_with_one_named_part_is_not_amount_only() {
        let r = receipt(1, 100.00, 15, "tesco");
        let parts = vec![unnamed_tx(1, -60.00, 15), tx(2, -40.00, 16, "corner shop")];
        let matches = matcher().split_match(&r, &parts).unwrap();
        assert_eq!(matches[0].confidence, 70);
    }

    #[test]
    fn test_low_confidence_counts_for_review() {
        let run = matcher().match_all(
            &[unnamed_tx(1, -10.00, 21)],
            &[receipt(1, 10.00, 15, "tesco")],
            &ExistingMatches::default(),
        );
        assert_eq!(run.matches[0].confidence, 60);
        assert_eq!(run.needs_review, 1);
    }

    #[test]
    fn test_split_payment_sums_amounts() {
        let r = receipt(1, 100.00, 15, "tesco");
        let parts = vec![tx(1, -60.00, 15, "tesco"), tx(2, -40.00, 16, "tesco")];
        let matches = matcher().split_match(&r, &parts).unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.match_type == MatchType::SplitPayment));
        assert_eq!(matches[0].confidence, 90);

        let short = vec![tx(1, -60.00, 15, "tesco"), tx(2, -10.00, 16, "tesco")];
        assert!(matcher().split_match(&r, &short).is_err());
    }

    #[test]
    fn test_bundle_sums_receipts() {
        let t = tx(1, -30.00, 15, "amazon");
        let receipts = vec![receipt(1, 10.00, 14, "amazon"), receipt(2, 20.00, 15, "amazon")];
        let matches = matcher().bundle_match(&t, &receipts).unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.match_type == MatchType::BundledOrder));
        assert!(matcher().bundle_match(&t, &receipts[..1]).is_err());
    }
}
