//! Merchant normalization
//!
//! Bank descriptions ("TESCO STORES 1234", "SQ *BLUE BOTTLE") and receipt
//! senders ("Tesco", "orders@bluebottle.com") are reduced to one canonical
//! merchant id so the matcher can compare them:
//!
//! 1. lowercase and strip noise (processor prefixes, domains, reference and
//!    store numbers, punctuation)
//! 2. look the cleaned string up in the alias table (longest alias that
//!    covers a leading run of words wins)
//! 3. otherwise the cleaned string is its own canonical id

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::db::Database;
use crate::error::Result;

struct NoisePatterns {
    processor_prefix: Regex,
    domain_suffix: Regex,
    punctuation: Regex,
}

fn noise() -> &'static NoisePatterns {
    static PATTERNS: OnceLock<NoisePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| NoisePatterns {
        processor_prefix: Regex::new(
            r"^(sq ?\*|tst ?\*|paypal ?\*|pp ?\*|sumup ?\*|zettle_?\*|iz ?\*|crv ?\*|sp )\s*",
        )
        .expect("valid regex"),
        domain_suffix: Regex::new(r"\.(com|co\.uk|net|org|io|uk|de|fr|eu)\b").expect("valid regex"),
        punctuation: Regex::new(r"[^a-z0-9& ]+").expect("valid regex"),
    })
}

/// How two canonical merchant ids relate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerchantSimilarity {
    Same,
    /// One is a whole-word prefix of the other ("uber" / "uber eats")
    Fuzzy,
    Different,
    /// At least one side has no merchant id
    Unknown,
}

impl MerchantSimilarity {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Same | Self::Fuzzy)
    }
}

/// Maps free-text merchant strings to canonical ids
#[derive(Debug, Clone, Default)]
pub struct MerchantNormalizer {
    /// Cleaned alias → canonical id
    aliases: HashMap<String, String>,
    /// Longest alias in words, bounds the prefix search
    max_alias_words: usize,
}

impl MerchantNormalizer {
    pub fn new(aliases: HashMap<String, String>) -> Self {
        let aliases: HashMap<String, String> = aliases
            .into_iter()
            .map(|(alias, canonical)| (Self::clean(&alias), canonical.to_lowercase()))
            .filter(|(alias, _)| !alias.is_empty())
            .collect();
        let max_alias_words = aliases
            .keys()
            .map(|a| a.split(' ').count())
            .max()
            .unwrap_or(0);
        Self {
            aliases,
            max_alias_words,
        }
    }

    /// Load the alias table from the database
    pub fn from_db(db: &Database) -> Result<Self> {
        Ok(Self::new(db.load_alias_map()?))
    }

    /// Strip noise, keeping only the words that identify the merchant
    pub fn clean(raw: &str) -> String {
        let patterns = noise();
        let mut s = raw.trim().to_lowercase().replace('\'', "");

        s = patterns.processor_prefix.replace(&s, "").into_owned();
        if let Some(rest) = s.strip_prefix("www.") {
            s = rest.to_string();
        }
        // Email senders: keep the domain part
        if let Some((_, domain)) = s.rsplit_once('@') {
            s = domain.to_string();
        }
        s = patterns.domain_suffix.replace_all(&s, " ").into_owned();
        // "amzn mktp uk*2k4rt5": everything after '*' is a reference
        if let Some((head, _)) = s.split_once('*') {
            if !head.trim().is_empty() {
                s = head.to_string();
            }
        }
        s = patterns.punctuation.replace_all(&s, " ").into_owned();

        let mut words: Vec<&str> = s.split_whitespace().collect();
        // Trailing store / reference numbers
        while words.len() > 1 && words.last().is_some_and(|w| w.chars().any(|c| c.is_ascii_digit())) {
            words.pop();
        }
        words.join(" ")
    }

    /// Canonical merchant id for a raw string
    pub fn normalize(&self, raw: &str) -> String {
        let cleaned = Self::clean(raw);
        if cleaned.is_empty() {
            return cleaned;
        }
        if let Some(canonical) = self.aliases.get(&cleaned) {
            return canonical.clone();
        }

        let words: Vec<&str> = cleaned.split(' ').collect();
        let longest = self.max_alias_words.min(words.len().saturating_sub(1));
        for n in (1..=longest).rev() {
            let prefix = words[..n].join(" ");
            if let Some(canonical) = self.aliases.get(&prefix) {
                return canonical.clone();
            }
        }
        cleaned
    }

    /// Register an alias for this session (persist with `Database::add_merchant_alias`)
    pub fn insert_alias(&mut self, alias: &str, canonical_id: &str) {
        let alias = Self::clean(alias);
        if alias.is_empty() {
            return;
        }
        self.max_alias_words = self.max_alias_words.max(alias.split(' ').count());
        self.aliases.insert(alias, canonical_id.to_lowercase());
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }
}

/// Compare two canonical merchant ids
pub fn merchants_match(a: &str, b: &str) -> MerchantSimilarity {
    if a.is_empty() || b.is_empty() {
        return MerchantSimilarity::Unknown;
    }
    if a == b {
        return MerchantSimilarity::Same;
    }
    let (short, long) = if a.len() < b.len() { (a, b) } else { (b, a) };
    match long.strip_prefix(short) {
        Some(rest) if rest.starts_with(' ') => MerchantSimilarity::Fuzzy,
        _ => MerchantSimilarity::Different,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> MerchantNormalizer {
        let mut aliases = HashMap::new();
        aliases.insert("tesco stores".to_string(), "tesco".to_string());
        aliases.insert("amzn mktp".to_string(), "amazon".to_string());
        aliases.insert("AMAZON".to_string(), "amazon".to_string());
        MerchantNormalizer::new(aliases)
    }

    #[test]
    fn test_clean_strips_noise() {
        assert_eq!(MerchantNormalizer::clean("TESCO STORES 1234"), "tesco stores");
        assert_eq!(MerchantNormalizer::clean("SQ *BLUE BOTTLE"), "blue bottle");
        assert_eq!(MerchantNormalizer::clean("TST* Joe's Pizza #42"), "joes pizza");
        assert_eq!(MerchantNormalizer::clean("www.netflix.com"), "netflix");
        assert_eq!(MerchantNormalizer::clean("AMZN Mktp UK*2K4RT5"), "amzn mktp uk");
        assert_eq!(MerchantNormalizer::clean("orders@amazon.co.uk"), "amazon");
    }

    #[test]
    fn test_clean_keeps_numeric_only_name() {
        assert_eq!(MerchantNormalizer::clean("7-ELEVEN"), "7 eleven");
        assert_eq!(MerchantNormalizer::clean("1234"), "1234");
    }

    #[test]
    fn test_alias_lookup_bank_and_receipt_side() {
        let n = normalizer();
        assert_eq!(n.normalize("TESCO STORES 1234"), "tesco");
        assert_eq!(n.normalize("AMZN MKTP UK*2K4RT5"), "amazon");
        assert_eq!(n.normalize("Amazon.co.uk"), "amazon");
    }

    #[test]
    fn test_unknown_merchant_is_self_mapped() {
        let n = normalizer();
        assert_eq!(n.normalize("Corner Cafe"), "corner cafe");
        assert_eq!(n.normalize("CORNER CAFE"), n.normalize("corner cafe"));
    }

    #[test]
    fn test_merchants_match() {
        assert_eq!(merchants_match("tesco", "tesco"), MerchantSimilarity::Same);
        assert_eq!(merchants_match("uber", "uber eats"), MerchantSimilarity::Fuzzy);
        assert_eq!(merchants_match("uber", "ubereats"), MerchantSimilarity::Different);
        assert_eq!(merchants_match("", "tesco"), MerchantSimilarity::Unknown);
        assert!(!MerchantSimilarity::Unknown.is_match());
    }
}
