//! JSON parsing helpers for LLM responses
//!
//! Models often wrap the JSON payload in prose or code fences, so the
//! outermost `{ ... }` span is extracted before deserializing. Errors carry
//! sizes and positions only; the model's text is logged at debug level.

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

use super::types::{Categorization, ItemResult};

#[derive(Debug, Deserialize)]
struct RawBatch {
    results: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    index: usize,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    categorization: Option<Categorization>,
}

/// The outermost JSON object in a response
pub fn extract_json(response: &str) -> Result<&str> {
    let response = response.trim();
    match (response.find('{'), response.rfind('}')) {
        (Some(s), Some(e)) if s < e => Ok(&response[s..=e]),
        _ => {
            debug!(raw = %truncate(response, 200), "No JSON in LLM response");
            Err(Error::Llm(format!(
                "No JSON found in response ({} bytes)",
                response.len()
            )))
        }
    }
}

/// Parse a batch answer into one result per requested item
///
/// Items the model skipped or answered twice are reported as per-item
/// failures; a response that isn't JSON at all fails the whole batch.
pub fn parse_batch_response(response: &str, expected: usize) -> Result<Vec<ItemResult>> {
    let json = extract_json(response)?;
    let batch: RawBatch = serde_json::from_str(json).map_err(|e| {
        debug!(raw = %truncate(json, 200), error = %e, "Unparseable LLM response");
        Error::Llm(format!(
            "Invalid JSON from LLM ({:?} error at line {} column {}, {} bytes)",
            e.classify(),
            e.line(),
            e.column(),
            json.len()
        ))
    })?;

    let mut results: Vec<Option<ItemResult>> = vec![None; expected];
    for item in batch.results {
        let Some(slot) = results.get_mut(item.index) else {
            continue;
        };
        if slot.is_some() {
            continue;
        }
        *slot = Some(match (item.error, item.categorization) {
            (Some(error), _) => {
                debug!(index = item.index, reason = %truncate(&error, 200), "LLM declined item");
                ItemResult::failed("llm", "Model declined the item")
            }
            (None, Some(c)) if !c.category.trim().is_empty() => ItemResult::Categorized(c),
            _ => ItemResult::failed("invalid_response", "No category in response"),
        });
    }

    Ok(results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| ItemResult::failed("invalid_response", "Missing from response")))
        .collect())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_wrapped_json() {
        let response = r#"Sure! Here you go:
```json
{"results": [{"index": 0, "category": "groceries", "essential": true, "confidence": 92},
             {"index": 1, "category": "dining", "merchant": "Pret"}]}
```"#;
        let results = parse_batch_response(response, 2).unwrap();
        match &results[0] {
            ItemResult::Categorized(c) => {
                assert_eq!(c.category, "groceries");
                assert!(c.essential);
                assert_eq!(c.confidence, 92);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &results[1] {
            ItemResult::Categorized(c) => assert_eq!(c.confidence, 50),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_item_errors_and_missing_items() {
        let response = r#"{"results": [{"index": 0, "error": "ambiguous"}, {"index": 7, "category": "x"}]}"#;
        let results = parse_batch_response(response, 2).unwrap();
        assert!(matches!(&results[0], ItemResult::Failed { kind, .. } if kind == "llm"));
        assert!(
            matches!(&results[1], ItemResult::Failed { message, .. } if message == "Missing from response")
        );
    }

    #[test]
    fn test_no_json_is_batch_error() {
        assert!(matches!(
            parse_batch_response("I can't help with that", 1),
            Err(Error::Llm(_))
        ));
    }

    #[test]
    fn test_errors_do_not_carry_model_text() {
        let err = parse_batch_response("Sorry, I cannot categorize JOHN SMITH RENT", 1).unwrap_err();
        assert!(!err.to_string().contains("JOHN SMITH"));

        let err = parse_batch_response(r#"{"results": "payee jane doe"}"#, 1).unwrap_err();
        assert!(!err.to_string().contains("jane doe"));

        let response = r#"{"results": [{"index": 0, "error": "payee JOHN SMITH is a person"}]}"#;
        match &parse_batch_response(response, 1).unwrap()[0] {
            ItemResult::Failed { message, .. } => assert!(!message.contains("JOHN")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
