//! Tweet normalization: raw backend output → the unified post shape the
//! store persists.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::providers::social::RawTweet;

static CA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[a-fA-F0-9]{40}\b").unwrap());
// The regex crate has no lookbehind; the leading group stands in for
// "not preceded by a word character".
static SYMBOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^A-Za-z0-9_])(\$[A-Za-z][A-Za-z0-9]{1,9})\b").unwrap());

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedPost {
    pub source: String,
    pub author: String,
    pub text: String,
    pub ts: String,
    pub urls: Vec<String>,
    pub token_ca: Option<String>,
    pub symbol: Option<String>,
    pub is_candidate: bool,
}

/// Normalize one raw tweet; posts with no text, author or timestamp are
/// dropped.
pub fn normalize_tweet(raw: &RawTweet) -> Option<NormalizedPost> {
    let text = raw.text.trim();
    if text.is_empty() {
        tracing::debug!(stage = "x.normalize.drop", reason = "empty_text");
        return None;
    }
    if raw.created_at.is_empty() {
        tracing::debug!(stage = "x.normalize.drop", reason = "missing_ts");
        return None;
    }
    if raw.author.is_empty() {
        tracing::debug!(stage = "x.normalize.drop", reason = "missing_author");
        return None;
    }

    let token_ca = CA_RE.find(text).map(|m| m.as_str().to_lowercase());
    let symbol = SYMBOL_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let is_candidate = token_ca.is_some() || symbol.is_some();

    tracing::debug!(
        stage = "x.normalize.ok",
        has_ca = token_ca.is_some(),
        has_symbol = symbol.is_some(),
    );

    Some(NormalizedPost {
        source: "x".to_string(),
        author: raw.author.clone(),
        text: text.to_string(),
        ts: raw.created_at.clone(),
        urls: raw.urls.clone(),
        token_ca,
        symbol,
        is_candidate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tweet(text: &str) -> RawTweet {
        RawTweet {
            id: "1".to_string(),
            author: "tester".to_string(),
            text: text.to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            urls: Vec::new(),
        }
    }

    #[test]
    fn extracts_ca_and_symbol() {
        let post =
            normalize_tweet(&tweet("$PEPE at 0x6982508145454Ce325dDbE47a25d4ec3d2311933")).unwrap();
        assert_eq!(
            post.token_ca.as_deref(),
            Some("0x6982508145454ce325ddbe47a25d4ec3d2311933")
        );
        assert_eq!(post.symbol.as_deref(), Some("$PEPE"));
        assert!(post.is_candidate);
    }

    #[test]
    fn embedded_dollar_is_not_a_symbol() {
        let post = normalize_tweet(&tweet("price is US$5 today")).unwrap();
        assert!(post.symbol.is_none());
        assert!(!post.is_candidate);
    }

    #[test]
    fn drops_empty_text() {
        assert!(normalize_tweet(&tweet("   ")).is_none());
    }

    #[test]
    fn drops_missing_ts() {
        let mut t = tweet("hello");
        t.created_at = String::new();
        assert!(normalize_tweet(&t).is_none());
    }
}
