//! Post refinement: pure, deterministic extraction of assets, type, score
//! and a stable event key from raw text. No I/O; same input, same output.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::store::models::EventType;

static SYMBOL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$[A-Z]{2,10}\b").unwrap());
static CA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[a-fA-F0-9]{40}\b").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").unwrap());

/// Summary cap applied during refinement.
pub const SUMMARY_MAX_CHARS: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct Assets {
    pub symbols: Vec<String>,
    pub contracts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Refined {
    pub event_key: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub score: f64,
    pub summary: String,
    pub assets: Assets,
}

/// Uppercase `$SYMBOL` tickers, `$` stripped, de-duplicated and sorted.
pub fn extract_symbols(text: &str) -> Vec<String> {
    let mut symbols: Vec<String> = SYMBOL_RE
        .find_iter(text)
        .map(|m| m.as_str()[1..].to_string())
        .collect();
    symbols.sort();
    symbols.dedup();
    symbols
}

/// EVM addresses, lowercased, de-duplicated and sorted.
pub fn extract_contracts(text: &str) -> Vec<String> {
    let mut contracts: Vec<String> = CA_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect();
    contracts.sort();
    contracts.dedup();
    contracts
}

/// First-match classification ladder.
pub fn classify_type(text: &str) -> EventType {
    let lower = text.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if any(&["airdrop", "drop", "claim"]) {
        EventType::Airdrop
    } else if any(&["token", "coin", "launch", "mint"]) {
        EventType::Token
    } else if any(&["deploy", "deployed", "contract"]) {
        EventType::Deploy
    } else {
        EventType::Misc
    }
}

/// Base 0.3, +0.2 for symbols, +0.3 for contracts, +0.2 for a boost word,
/// capped at 1.0.
pub fn calculate_score(text: &str, symbols: &[String], contracts: &[String]) -> f64 {
    let mut score: f64 = 0.3;
    if !symbols.is_empty() {
        score += 0.2;
    }
    if !contracts.is_empty() {
        score += 0.3;
    }
    let lower = text.to_lowercase();
    if ["bullish", "moon", "gem", "pump", "launch"]
        .iter()
        .any(|w| lower.contains(w))
    {
        score += 0.2;
    }
    score.min(1.0)
}

/// Collapse whitespace and truncate at a character boundary, appending `…`
/// only when something was cut.
pub fn generate_summary(text: &str, max_chars: usize) -> String {
    let squeezed = WS_RE.replace_all(text.trim(), " ").to_string();
    truncate_ellipsis(&squeezed, max_chars)
}

/// UTF-safe truncation: at most `max_chars` characters, ending in `…` when
/// the input was longer.
pub fn truncate_ellipsis(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// First 16 hex of SHA1 over `type|symbols|contracts|summary[:50]`,
/// uppercased to satisfy the event-key alphabet.
pub fn generate_event_key(
    event_type: EventType,
    symbols: &[String],
    contracts: &[String],
    summary: &str,
) -> String {
    let summary_prefix: String = summary.chars().take(50).collect();
    let canonical = format!(
        "{}|{}|{}|{}",
        event_type.as_str(),
        symbols.join("|"),
        contracts.join("|"),
        summary_prefix
    );

    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_uppercase()
}

const STOPWORDS: [&str; 18] = [
    "this", "that", "with", "from", "have", "will", "just", "your", "about", "more", "they",
    "them", "what", "when", "then", "than", "been", "were",
];

/// Lightweight keyphrase fallback: frequent non-stopword tokens in first
/// appearance order, capped at five.
pub fn extract_keyphrases(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for token in TOKEN_RE.find_iter(text) {
        let word = token.as_str().to_lowercase();
        if word.len() < 4 || STOPWORDS.contains(&word.as_str()) {
            continue;
        }
        if !seen.contains(&word) {
            seen.push(word);
        }
        if seen.len() == 5 {
            break;
        }
    }
    seen
}

/// Refine raw post text into a structured event skeleton.
pub fn refine_post(text: &str) -> Refined {
    let symbols = extract_symbols(text);
    let contracts = extract_contracts(text);
    let event_type = classify_type(text);
    let summary = generate_summary(text, SUMMARY_MAX_CHARS);
    let score = calculate_score(text, &symbols, &contracts);
    let event_key = generate_event_key(event_type, &symbols, &contracts, &summary);

    Refined {
        event_key,
        event_type,
        score,
        summary,
        assets: Assets { symbols, contracts },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refine_is_deterministic() {
        let text = "$PEPE launching, contract 0x6982508145454Ce325dDbE47a25d4ec3d2311933";
        let a = refine_post(text);
        let b = refine_post(text);
        assert_eq!(a.event_key, b.event_key);
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }

    #[test]
    fn symbols_uppercase_only_sorted() {
        let text = "$PEPE and $eth and $BTC and $PEPE";
        assert_eq!(extract_symbols(text), vec!["BTC", "PEPE"]);
    }

    #[test]
    fn contracts_lowercased() {
        let text = "ca 0x6982508145454Ce325dDbE47a25d4ec3d2311933 again \
                    0x6982508145454CE325DDBE47A25D4EC3D2311933";
        assert_eq!(
            extract_contracts(text),
            vec!["0x6982508145454ce325ddbe47a25d4ec3d2311933"]
        );
    }

    #[test]
    fn type_ladder_first_match_wins() {
        assert_eq!(classify_type("big airdrop, claim now"), EventType::Airdrop);
        assert_eq!(classify_type("contract deployed"), EventType::Deploy);
        assert_eq!(classify_type("new token launch"), EventType::Token);
        assert_eq!(classify_type("gm"), EventType::Misc);
        // airdrop words outrank token words
        assert_eq!(classify_type("token airdrop"), EventType::Airdrop);
        // a launch mentioning its contract is still a token event
        assert_eq!(
            classify_type("$PEPE launching, contract 0xabc"),
            EventType::Token
        );
    }

    #[test]
    fn score_components() {
        assert_eq!(calculate_score("hello", &[], &[]), 0.3);
        let syms = vec!["PEPE".to_string()];
        let cas = vec!["0xabc".to_string()];
        assert_eq!(calculate_score("hello", &syms, &[]), 0.5);
        let s = calculate_score("bullish launch", &syms, &cas);
        assert_eq!(s, 1.0);
    }

    #[test]
    fn summary_boundaries() {
        let exact: String = "a".repeat(SUMMARY_MAX_CHARS);
        assert_eq!(generate_summary(&exact, SUMMARY_MAX_CHARS), exact);

        let over: String = "a".repeat(SUMMARY_MAX_CHARS + 1);
        let out = generate_summary(&over, SUMMARY_MAX_CHARS);
        assert_eq!(out.chars().count(), SUMMARY_MAX_CHARS);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn summary_collapses_whitespace() {
        assert_eq!(generate_summary("a  b\n\tc", 100), "a b c");
    }

    #[test]
    fn keyphrases_skip_stopwords_and_short_tokens() {
        let phrases = extract_keyphrases("This token launch will moon, launch is near");
        assert_eq!(phrases, vec!["token", "launch", "moon", "near"]);
    }

    #[test]
    fn event_key_matches_reference_construction() {
        let text = "$PEPE launching, contract 0x6982508145454ce325ddbe47a25d4ec3d2311933";
        let refined = refine_post(text);
        assert_eq!(refined.event_type, EventType::Token);
        assert_eq!(refined.assets.symbols, vec!["PEPE"]);
        assert_eq!(
            refined.assets.contracts,
            vec!["0x6982508145454ce325ddbe47a25d4ec3d2311933"]
        );

        let summary_prefix: String = refined.summary.chars().take(50).collect();
        let canonical = format!(
            "token|PEPE|0x6982508145454ce325ddbe47a25d4ec3d2311933|{summary_prefix}"
        );
        let mut hasher = Sha1::new();
        hasher.update(canonical.as_bytes());
        let expected = format!("{:x}", hasher.finalize())[..16].to_uppercase();
        assert_eq!(refined.event_key, expected);

        // The key satisfies the shared event-key alphabet and length.
        assert!(crate::cards::schema::EVENT_KEY_RE.is_match(&refined.event_key));
    }
}
