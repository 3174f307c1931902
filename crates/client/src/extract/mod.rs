//! Per-request entity extraction.
//!
//! Entities go back to the caller with the answer. They never influence the
//! canonical key, never reach the store, and are never logged.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use vetcache_core::EntityMap;
use vetcache_core::config::{AppConfig, EntityPatternConfig};

/// Extraction errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractError {
    #[error("invalid entity pattern {name:?}: {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Pulls named values out of raw request text.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, raw_text: &str) -> Result<EntityMap, ExtractError>;
}

/// Extracts nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExtractor;

#[async_trait]
impl EntityExtractor for NoopExtractor {
    async fn extract(&self, _raw_text: &str) -> Result<EntityMap, ExtractError> {
        Ok(EntityMap::new())
    }
}

/// Named regex patterns.
///
/// For each name, the first match is taken; its first capture group if the
/// pattern has one, the whole match otherwise.
#[derive(Debug, Clone, Default)]
pub struct PatternExtractor {
    patterns: Vec<(String, Regex)>,
}

impl PatternExtractor {
    pub fn new(patterns: &[EntityPatternConfig]) -> Result<Self, ExtractError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&p.pattern)
                    .map(|re| (p.name.clone(), re))
                    .map_err(|e| ExtractError::InvalidPattern { name: p.name.clone(), reason: e.to_string() })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    fn extract_sync(&self, raw_text: &str) -> EntityMap {
        let mut entities = EntityMap::new();
        for (name, pattern) in &self.patterns {
            let Some(caps) = pattern.captures(raw_text) else { continue };
            let value = caps.get(1).or_else(|| caps.get(0)).map(|m| m.as_str().to_string());
            if let Some(value) = value {
                entities.insert(name.clone(), value);
            }
        }
        entities
    }
}

#[async_trait]
impl EntityExtractor for PatternExtractor {
    async fn extract(&self, raw_text: &str) -> Result<EntityMap, ExtractError> {
        Ok(self.extract_sync(raw_text))
    }
}

/// No configured patterns means no extraction.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn EntityExtractor>, ExtractError> {
    let extractor = PatternExtractor::new(&config.entities)?;
    if extractor.is_empty() { Ok(Arc::new(NoopExtractor)) } else { Ok(Arc::new(extractor)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(name: &str, pattern: &str) -> EntityPatternConfig {
        EntityPatternConfig { name: name.into(), pattern: pattern.into() }
    }

    #[tokio::test]
    async fn test_noop_is_empty() {
        assert!(NoopExtractor.extract("order #123").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capture_group_preferred() {
        let extractor =
            PatternExtractor::new(&[pattern("order_id", r"#?(\d{2,})"), pattern("email", r"\S+@\S+")]).unwrap();

        let entities = extractor.extract("cancel order #123 for me@example.com").await.unwrap();
        assert_eq!(entities.get("order_id").map(String::as_str), Some("123"));
        assert_eq!(entities.get("email").map(String::as_str), Some("me@example.com"));

        let none = extractor.extract("cancel my order").await.unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_invalid_pattern() {
        let err = PatternExtractor::new(&[pattern("bad", "(")]).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidPattern { ref name, .. } if name == "bad"));
    }
}
