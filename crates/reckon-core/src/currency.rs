//! Currency conversion for cross-currency matching
//!
//! Every monetary comparison carries its currency explicitly; when two sides
//! differ, the rate used is returned so it can be recorded on the match.

use std::collections::HashMap;

/// A table of conversion rates keyed by (from, to) ISO codes
#[derive(Debug, Clone, Default)]
pub struct ExchangeRates {
    rates: HashMap<(String, String), f64>,
}

impl ExchangeRates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `1 from = rate to`
    pub fn insert(&mut self, from: &str, to: &str, rate: f64) {
        self.rates
            .insert((from.trim().to_uppercase(), to.trim().to_uppercase()), rate);
    }

    /// Builder-style insert
    pub fn with_rate(mut self, from: &str, to: &str, rate: f64) -> Self {
        self.insert(from, to, rate);
        self
    }

    /// Rate for converting `from` into `to`; identity for equal codes, and
    /// the inverse of a reverse entry when only that one is known
    pub fn rate(&self, from: &str, to: &str) -> Option<f64> {
        let from = from.to_uppercase();
        let to = to.to_uppercase();
        if from == to {
            return Some(1.0);
        }
        if let Some(rate) = self.rates.get(&(from.clone(), to.clone())) {
            return Some(*rate);
        }
        self.rates
            .get(&(to, from))
            .filter(|r| **r > 0.0)
            .map(|r| 1.0 / r)
    }

    /// Convert an amount, returning the converted value and the rate used
    pub fn convert(&self, amount: f64, from: &str, to: &str) -> Option<(f64, f64)> {
        self.rate(from, to).map(|rate| (amount * rate, rate))
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_and_inverse() {
        let rates = ExchangeRates::new().with_rate("eur", "gbp", 0.8);
        assert_eq!(rates.rate("GBP", "GBP"), Some(1.0));
        assert_eq!(rates.rate("EUR", "GBP"), Some(0.8));
        assert_eq!(rates.rate("GBP", "EUR"), Some(1.25));
        assert_eq!(rates.rate("USD", "GBP"), None);
    }

    #[test]
    fn test_convert_returns_rate() {
        let rates = ExchangeRates::new().with_rate("EUR", "GBP", 0.5);
        let (amount, rate) = rates.convert(10.0, "EUR", "GBP").unwrap();
        assert_eq!(amount, 5.0);
        assert_eq!(rate, 0.5);
    }
}
