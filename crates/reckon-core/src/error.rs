//! Error types for Reckon

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cost not confirmed: enrichment requires confirm_cost=true ({0})")]
    CostNotConfirmed(String),

    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Rate limited by {0}")]
    RateLimited(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Job error: {0}")]
    Job(String),
}

impl Error {
    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::RateLimited(_) | Error::Timeout(_) => true,
            Error::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| {
                        s == reqwest::StatusCode::TOO_MANY_REQUESTS || s.is_server_error()
                    })
            }
            _ => false,
        }
    }

    /// Short classification stored alongside recorded failures
    pub fn kind(&self) -> &'static str {
        match self {
            Error::RateLimited(_) => "rate_limited",
            Error::Timeout(_) => "timeout",
            Error::Http(_) if self.is_transient() => "transient_http",
            Error::Http(_) => "http",
            Error::Json(_) | Error::InvalidData(_) => "malformed_response",
            Error::Llm(_) => "llm",
            Error::Upstream(_) => "upstream",
            Error::Job(_) => "job",
            Error::Database(_) | Error::Pool(_) => "database",
            _ => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Strip anything that could carry PII from an error message before it is
/// persisted or logged: long digit runs are masked and the text is truncated.
pub fn redact(message: &str) -> String {
    const MAX_LEN: usize = 160;

    let mut out = String::with_capacity(message.len().min(MAX_LEN));
    let mut digits = String::new();
    for c in message.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        flush_digits(&mut out, &mut digits);
        out.push(c);
    }
    flush_digits(&mut out, &mut digits);

    if out.chars().count() > MAX_LEN {
        let truncated: String = out.chars().take(MAX_LEN).collect();
        format!("{}...", truncated)
    } else {
        out
    }
}

fn flush_digits(out: &mut String, digits: &mut String) {
    if digits.len() >= 4 {
        out.push_str("****");
    } else {
        out.push_str(digits);
    }
    digits.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_masks_long_numbers() {
        assert_eq!(
            redact("account 12345678 failed with 503"),
            "account **** failed with 503"
        );
    }

    #[test]
    fn test_redact_truncates() {
        let long = "x".repeat(500);
        let redacted = redact(&long);
        assert!(redacted.ends_with("..."));
        assert_eq!(redacted.chars().count(), 163);
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::RateLimited("ollama".into()).is_transient());
        assert!(Error::Timeout(60).is_transient());
        assert!(!Error::InvalidData("bad".into()).is_transient());
        assert_eq!(Error::Timeout(60).kind(), "timeout");
        assert_eq!(Error::InvalidData("x".into()).kind(), "malformed_response");
    }
}
