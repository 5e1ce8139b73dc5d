//! Constrained summary / risk-note generation.
//!
//! The template backend is always available; an optional LLM refiner runs
//! under a hard per-call budget with a strict `{summary, risk_note}` JSON
//! contract and falls back to the template on any failure.

use std::time::Duration;

use serde_json::Value;

use crate::envcfg;
use crate::refine::truncate_ellipsis;

#[derive(Debug, Clone)]
pub struct SummaryConfig {
    pub timeout_ms: u64,
    pub max_summary: usize,
    pub max_note: usize,
}

impl SummaryConfig {
    pub fn from_env() -> SummaryConfig {
        SummaryConfig {
            timeout_ms: envcfg::env_u64("CARDS_SUMMARY_TIMEOUT_MS", 1200),
            max_summary: envcfg::env_usize("CARDS_SUMMARY_MAX_CHARS", 280),
            max_note: envcfg::env_usize("CARDS_RISKNOTE_MAX_CHARS", 160),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SummaryMeta {
    pub backend: String,
    pub used_refiner: String,
    pub degrade: bool,
}

/// External summarizer with a strict JSON contract. `None` on any failure,
/// including non-conforming payloads.
pub trait CardRefiner: Send + Sync {
    fn name(&self) -> &str;
    fn refine(&self, payload: &Value, budget: Duration) -> Option<(String, String)>;
}

pub enum SummaryBackend {
    Template,
    Llm(Box<dyn CardRefiner>),
}

impl SummaryBackend {
    /// `CARDS_SUMMARY_BACKEND=llm` needs a refiner wired in by the caller;
    /// without one the template backend is used.
    pub fn from_env() -> SummaryBackend {
        SummaryBackend::Template
    }
}

// ── Field extraction ────────────────────────────────────────────────

fn extract_symbol(payload: &Value) -> String {
    if let Some(symbol) = payload.get("symbol").and_then(|v| v.as_str()) {
        if !symbol.is_empty() {
            return symbol.to_string();
        }
    }
    if let Some(event_key) = payload.get("event_key").and_then(|v| v.as_str()) {
        if let Some(prefix) = event_key.split(':').next() {
            let upper = prefix.to_uppercase();
            if ["ETH", "SOL", "BSC", "MATIC", "ARB"].contains(&upper.as_str()) {
                return upper;
            }
        }
    }
    "Token".to_string()
}

fn extract_f64(payload: &Value, path: [&str; 3]) -> Option<f64> {
    payload.get(path[0])?.get(path[1])?.get(path[2])?.as_f64()
}

fn extract_str(payload: &Value, path: [&str; 3]) -> String {
    payload
        .get(path[0])
        .and_then(|v| v.get(path[1]))
        .and_then(|v| v.get(path[2]))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Six significant digits, the shortest spelling.
fn format_number(num: f64) -> String {
    if num == 0.0 {
        return "0".to_string();
    }
    let magnitude = num.abs().log10().floor() as i32;
    let factor = 10f64.powi(5 - magnitude);
    let rounded = (num * factor).round() / factor;
    format!("{rounded}")
}

fn strip_trailing_punct(s: &str) -> String {
    s.trim_end_matches([' ', ',', ';', '，', '；']).to_string()
}

// ── Rendering ───────────────────────────────────────────────────────

fn render_template(
    symbol: &str,
    price: Option<f64>,
    liq: Option<f64>,
    level: &str,
    risk: &str,
) -> (String, String) {
    let mut parts = vec![symbol.to_string()];
    if let Some(price) = price {
        parts.push(format!("价格≈${}", format_number(price)));
    }
    if let Some(liq) = liq {
        parts.push(format!("流动性≈${}", format_number(liq)));
    }
    parts.push(format!("规则判定{level}"));

    let summary = strip_trailing_punct(&parts.join(" | "));
    let risk_note = format!("合约体检{risk}；关注税率/LP/交易限制");
    (summary, risk_note)
}

/// Generate `(summary, risk_note, meta)` for a card payload.
pub fn summarize_card(
    payload: &Value,
    backend: &SummaryBackend,
    cfg: &SummaryConfig,
) -> (String, String, SummaryMeta) {
    let symbol = extract_symbol(payload);
    let price = extract_f64(payload, ["data", "dex", "price_usd"]);
    let liq = extract_f64(payload, ["data", "dex", "liquidity_usd"]);
    let level = extract_str(payload, ["data", "rules", "level"]);
    let risk = extract_str(payload, ["data", "goplus", "risk"]);

    // With neither price nor a rules verdict there is nothing for an LLM to
    // compress; go straight to the template.
    let has_minimum = price.is_some() || level != "unknown";

    let mut meta = SummaryMeta {
        backend: "template".to_string(),
        used_refiner: String::new(),
        degrade: false,
    };

    let (mut summary, mut risk_note) = match backend {
        SummaryBackend::Llm(refiner) if has_minimum && cfg.timeout_ms > 1 => {
            match refiner.refine(payload, Duration::from_millis(cfg.timeout_ms)) {
                Some((s, n)) if !s.is_empty() && !n.is_empty() => {
                    meta.backend = "llm".to_string();
                    meta.used_refiner = refiner.name().to_string();
                    (s, n)
                }
                _ => {
                    meta.degrade = true;
                    render_template(&symbol, price, liq, &level, &risk)
                }
            }
        }
        _ => render_template(&symbol, price, liq, &level, &risk),
    };

    summary = truncate_ellipsis(&squeeze(&summary), cfg.max_summary);
    risk_note = truncate_ellipsis(&squeeze(&risk_note), cfg.max_note);

    if summary.is_empty() {
        summary = format!("{symbol} 信息不足");
    }
    if risk_note.is_empty() {
        risk_note = "风险信息待补充".to_string();
    }

    tracing::debug!(
        stage = "cards.summarize",
        backend = %meta.backend,
        degrade = meta.degrade,
        had_price = price.is_some(),
        had_liq = liq.is_some(),
    );

    (summary, risk_note, meta)
}

fn squeeze(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "event_key": "ETH:TOKEN:0XAAAABBBB",
            "data": {
                "goplus": {"risk": "green"},
                "dex": {"price_usd": 0.0000012, "liquidity_usd": 600000.0},
                "rules": {"level": "watch"}
            }
        })
    }

    #[test]
    fn template_renders_all_parts() {
        let cfg = SummaryConfig {
            timeout_ms: 1200,
            max_summary: 280,
            max_note: 160,
        };
        let (summary, note, meta) = summarize_card(&payload(), &SummaryBackend::Template, &cfg);
        assert!(summary.starts_with("ETH | "));
        assert!(summary.contains("价格≈$"));
        assert!(summary.contains("流动性≈$"));
        assert!(summary.contains("规则判定watch"));
        assert!(note.contains("合约体检green"));
        assert_eq!(meta.backend, "template");
        assert!(!meta.degrade);
    }

    #[test]
    fn missing_pieces_are_dropped() {
        let cfg = SummaryConfig {
            timeout_ms: 1200,
            max_summary: 280,
            max_note: 160,
        };
        let p = json!({"event_key": "ABCD1234", "data": {"rules": {"level": "none"}}});
        let (summary, _, _) = summarize_card(&p, &SummaryBackend::Template, &cfg);
        assert!(!summary.contains("价格"));
        assert!(!summary.contains("流动性"));
        assert!(summary.contains("规则判定none"));
    }

    #[test]
    fn truncation_appends_ellipsis_only_when_cut() {
        let cfg = SummaryConfig {
            timeout_ms: 1200,
            max_summary: 10,
            max_note: 160,
        };
        let (summary, _, _) = summarize_card(&payload(), &SummaryBackend::Template, &cfg);
        assert_eq!(summary.chars().count(), 10);
        assert!(summary.ends_with('…'));
    }

    struct BadRefiner;
    impl CardRefiner for BadRefiner {
        fn name(&self) -> &str {
            "bad"
        }
        fn refine(&self, _payload: &Value, _budget: Duration) -> Option<(String, String)> {
            None
        }
    }

    #[test]
    fn failed_refiner_falls_back_and_degrades() {
        let cfg = SummaryConfig {
            timeout_ms: 1200,
            max_summary: 280,
            max_note: 160,
        };
        let backend = SummaryBackend::Llm(Box::new(BadRefiner));
        let (_, _, meta) = summarize_card(&payload(), &backend, &cfg);
        assert_eq!(meta.backend, "template");
        assert!(meta.degrade);
    }

    #[test]
    fn six_significant_digits() {
        assert_eq!(format_number(600000.0), "600000");
        assert_eq!(format_number(0.0000012), "0.0000012");
        assert_eq!(format_number(1234.5678), "1234.57");
    }
}
