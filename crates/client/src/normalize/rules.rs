//! Rule-based normalizer.
//!
//! Text is cleaned first (lowercased, punctuation stripped, whitespace
//! collapsed), then matched against ordered `pattern -> key` rules. The first
//! matching rule wins. Unmatched text keys on its cleaned form.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use vetcache_core::CanonicalKey;
use vetcache_core::config::RuleConfig;

use super::{NormalizeError, Normalizer};

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s_]").expect("valid punctuation regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Lowercase, drop punctuation, collapse runs of whitespace.
pub fn clean(raw_text: &str) -> String {
    let lower = raw_text.to_lowercase();
    let stripped = PUNCTUATION.replace_all(&lower, "");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Regex,
    key: CanonicalKey,
}

impl Rule {
    pub fn new(pattern: &str, key: &str) -> Result<Self, NormalizeError> {
        if key.trim().is_empty() {
            return Err(NormalizeError::EmptyKey(pattern.to_string()));
        }
        let pattern = Regex::new(pattern)
            .map_err(|source| NormalizeError::InvalidPattern { pattern: pattern.to_string(), source })?;
        Ok(Self { pattern, key: CanonicalKey::new(key) })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleNormalizer {
    rules: Vec<Rule>,
}

impl RuleNormalizer {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn from_config(rules: &[RuleConfig]) -> Result<Self, NormalizeError> {
        let rules = rules.iter().map(|r| Rule::new(&r.pattern, &r.key)).collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    fn key_for(&self, raw_text: &str) -> CanonicalKey {
        let cleaned = clean(raw_text);
        if cleaned.is_empty() {
            return CanonicalKey::unknown();
        }
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(&cleaned))
            .map(|rule| rule.key.clone())
            .unwrap_or_else(|| CanonicalKey::new(cleaned))
    }
}

#[async_trait]
impl Normalizer for RuleNormalizer {
    async fn normalize(&self, raw_text: &str) -> CanonicalKey {
        self.key_for(raw_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> RuleNormalizer {
        RuleNormalizer::new(vec![
            Rule::new(r"\bcancel\b.*\border\b", "cancel_order").unwrap(),
            Rule::new(r"\border\b", "order_general").unwrap(),
            Rule::new(r"\brefund\b", "refund_status").unwrap(),
        ])
    }

    #[test]
    fn test_clean() {
        assert_eq!(clean("  How do I   CANCEL order #123?? "), "how do i cancel order 123");
        assert_eq!(clean("?!#"), "");
    }

    #[tokio::test]
    async fn test_equivalent_requests_share_a_key() {
        let n = normalizer();
        let a = n.normalize("How do I cancel order #123?").await;
        let b = n.normalize("cancel my order 456 please").await;
        assert_eq!(a.as_str(), "cancel_order");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_first_rule_wins() {
        let n = normalizer();
        assert_eq!(n.normalize("where is my order").await.as_str(), "order_general");
        assert_eq!(n.normalize("cancel the order").await.as_str(), "cancel_order");
    }

    #[tokio::test]
    async fn test_unmatched_and_empty() {
        let n = normalizer();
        assert_eq!(n.normalize("Opening HOURS?").await.as_str(), "opening hours");
        assert!(n.normalize("??").await.is_unknown());
    }

    #[tokio::test]
    async fn test_deterministic() {
        let n = normalizer();
        for _ in 0..10 {
            assert_eq!(n.normalize("Refund for #9").await.as_str(), "refund_status");
        }
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(matches!(Rule::new("(unclosed", "k"), Err(NormalizeError::InvalidPattern { .. })));
        assert!(matches!(Rule::new("ok", " "), Err(NormalizeError::EmptyKey(_))));
    }
}
