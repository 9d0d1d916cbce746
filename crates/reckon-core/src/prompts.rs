//! Prompt templates for the LLM backends
//!
//! Prompts are loaded with a two-layer resolution:
//! 1. Check for override in data dir (~/.local/share/reckon/prompts/overrides/)
//! 2. Fall back to embedded defaults (compiled into binary)

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::error::{Error, Result};

/// Embedded default prompts (compiled into binary)
mod defaults {
    pub const CATEGORIZE_TRANSACTIONS: &str =
        include_str!("../../../prompts/categorize_transactions.md");
}

/// Known prompt IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptId {
    CategorizeTransactions,
}

impl PromptId {
    pub fn all() -> &'static [PromptId] {
        &[Self::CategorizeTransactions]
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|id| id.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CategorizeTransactions => "categorize_transactions",
        }
    }

    fn default_content(&self) -> &'static str {
        match self {
            Self::CategorizeTransactions => defaults::CATEGORIZE_TRANSACTIONS,
        }
    }
}

/// Prompt frontmatter metadata
#[derive(Debug, Clone)]
pub struct PromptMetadata {
    pub id: String,
    pub version: u32,
}

/// A loaded prompt
#[derive(Debug, Clone)]
pub struct Prompt {
    pub metadata: PromptMetadata,
    pub content: String,
    pub is_override: bool,
}

impl Prompt {
    /// Load a prompt, preferring an override file when one exists
    pub fn load(id: PromptId) -> Result<Self> {
        if let Some(path) = default_prompts_dir().map(|d| d.join(format!("{}.md", id.as_str()))) {
            if path.exists() {
                debug!(path = %path.display(), "Using prompt override");
                let content = fs::read_to_string(&path).map_err(|e| {
                    Error::Config(format!("Failed to read prompt override: {}", e))
                })?;
                return Self::parse(&content, true);
            }
        }
        Self::parse(id.default_content(), false)
    }

    /// The embedded prompt only
    pub fn embedded(id: PromptId) -> Result<Self> {
        Self::parse(id.default_content(), false)
    }

    fn parse(content: &str, is_override: bool) -> Result<Self> {
        let (metadata, body) = parse_frontmatter(content)?;
        Ok(Self {
            metadata,
            content: body,
            is_override,
        })
    }

    pub fn system_section(&self) -> Option<&str> {
        extract_section(&self.content, "# System")
    }

    pub fn user_section(&self) -> Option<&str> {
        extract_section(&self.content, "# User")
    }

    /// Render the user section (or the whole prompt) with `{{var}}` replaced
    pub fn render_user(&self, vars: &HashMap<&str, &str>) -> String {
        let mut result = self.user_section().unwrap_or(&self.content).to_string();
        for (key, value) in vars {
            result = result.replace(&format!("{{{{{}}}}}", key), value);
        }
        result
    }

    /// System and user sections joined, for completion-style APIs
    pub fn render_full(&self, vars: &HashMap<&str, &str>) -> String {
        match self.system_section() {
            Some(system) => format!("{}\n\n{}", system, self.render_user(vars)),
            None => self.render_user(vars),
        }
    }
}

/// Default prompts override directory
pub fn default_prompts_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("reckon").join("prompts").join("overrides"))
}

fn parse_frontmatter(content: &str) -> Result<(PromptMetadata, String)> {
    let content = content.trim_start();
    let rest = content
        .strip_prefix("---")
        .ok_or_else(|| Error::Config("Prompt is missing frontmatter".to_string()))?;
    let (front, body) = rest
        .split_once("\n---")
        .ok_or_else(|| Error::Config("Prompt frontmatter is not closed".to_string()))?;

    let metadata = parse_metadata(front)?;
    Ok((metadata, body.trim_start_matches('-').trim().to_string()))
}

/// Frontmatter is flat `key: value` lines
fn parse_metadata(front: &str) -> Result<PromptMetadata> {
    let mut id = None;
    let mut version = None;
    for line in front.lines() {
        if let Some((key, value)) = line.split_once(':') {
            match key.trim() {
                "id" => id = Some(value.trim().to_string()),
                "version" => version = value.trim().parse().ok(),
                _ => {}
            }
        }
    }
    match (id, version) {
        (Some(id), Some(version)) => Ok(PromptMetadata { id, version }),
        _ => Err(Error::Config("Prompt frontmatter needs id and version".to_string())),
    }
}

fn extract_section<'a>(content: &'a str, heading: &str) -> Option<&'a str> {
    let start = content.find(heading)? + heading.len();
    let rest = &content[start..];
    let end = rest.find("\n# ").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_prompt_parses() {
        let prompt = Prompt::embedded(PromptId::CategorizeTransactions).unwrap();
        assert_eq!(prompt.metadata.id, "categorize_transactions");
        assert_eq!(prompt.metadata.version, 1);
        assert!(prompt.system_section().unwrap().contains("JSON only"));
        assert!(prompt.user_section().unwrap().contains("{{items}}"));
    }

    #[test]
    fn test_render_replaces_items() {
        let prompt = Prompt::embedded(PromptId::CategorizeTransactions).unwrap();
        let mut vars = HashMap::new();
        vars.insert("items", "0. TESCO | 2024-01-16 | -42.50");
        let rendered = prompt.render_full(&vars);
        assert!(rendered.contains("0. TESCO"));
        assert!(!rendered.contains("{{items}}"));
    }
}
