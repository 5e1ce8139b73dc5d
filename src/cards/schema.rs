//! Card payload types. The closed property set is enforced by
//! `deny_unknown_fields` and enum fields; `validate` applies the pattern
//! and length caps. `schemars` derives the published JSON schema.

use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static EVENT_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9:_\-\.]{8,128}$").unwrap());

pub const SUMMARY_MAX: usize = 280;
pub const RISK_NOTE_MAX: usize = 160;
pub const EVIDENCE_TYPE_MAX: usize = 32;
pub const EVIDENCE_DESC_MAX: usize = 240;

pub const CARD_VERSION: &str = "cards@1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CardRisk {
    Green,
    Yellow,
    Red,
    Gray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CardLevel {
    None,
    Watch,
    Caution,
    Risk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    Primary,
    Secondary,
    Topic,
    MarketRisk,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Diagnostic {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degrade: Option<bool>,
}

impl Diagnostic {
    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.cache.is_none() && self.stale.is_none() && self.degrade.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GoplusSection {
    pub risk: CardRisk,
    pub risk_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_buy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_sell: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lp_locked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub honeypot: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DexSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liquidity_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fdv: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ohlc: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OnchainSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features_snapshot: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RulesSection {
    pub level: CardLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_reasons: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CardData {
    pub goplus: GoplusSection,
    pub dex: DexSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onchain: Option<OnchainSection>,
    pub rules: RulesSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EvidenceItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub desc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Rendered {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CardMeta {
    pub version: String,
    pub data_as_of: String,
    pub summary_backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_refiner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degrade: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Card {
    pub event_key: String,
    pub card_type: CardType,
    pub data: CardData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Vec<EvidenceItem>>,
    pub summary: String,
    pub risk_note: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered: Option<Rendered>,
    pub meta: CardMeta,
}

impl Card {
    /// Pattern and length caps the type system cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if !EVENT_KEY_RE.is_match(&self.event_key) {
            return Err(format!("event_key does not match pattern: {}", self.event_key));
        }
        if self.summary.is_empty() || self.summary.chars().count() > SUMMARY_MAX {
            return Err("summary empty or over limit".to_string());
        }
        if self.risk_note.is_empty() || self.risk_note.chars().count() > RISK_NOTE_MAX {
            return Err("risk_note empty or over limit".to_string());
        }
        if let Some(items) = &self.evidence {
            for item in items {
                if item.kind.chars().count() > EVIDENCE_TYPE_MAX {
                    return Err("evidence type over limit".to_string());
                }
                if item.desc.chars().count() > EVIDENCE_DESC_MAX {
                    return Err("evidence desc over limit".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Published JSON schema for the card payload.
pub fn card_json_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(Card)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_key_boundaries() {
        assert!(EVENT_KEY_RE.is_match("ABCD1234"));
        assert!(!EVENT_KEY_RE.is_match("ABCD123"));
        assert!(!EVENT_KEY_RE.is_match(&"A".repeat(129)));
        assert!(EVENT_KEY_RE.is_match(&"A".repeat(128)));
        assert!(!EVENT_KEY_RE.is_match("abcd1234"));
        assert!(EVENT_KEY_RE.is_match("ETH:TOKEN:0XAAAABBBB"));
    }

    #[test]
    fn unknown_fields_rejected() {
        let raw = serde_json::json!({
            "event_key": "ABCD1234",
            "card_type": "topic",
            "data": {
                "goplus": {"risk": "gray", "risk_source": "unavailable"},
                "dex": {},
                "rules": {"level": "none"}
            },
            "summary": "s",
            "risk_note": "r",
            "meta": {"version": "cards@1", "data_as_of": "now", "summary_backend": "template"},
            "surprise": true
        });
        assert!(serde_json::from_value::<Card>(raw).is_err());
    }

    #[test]
    fn enum_constraints() {
        assert!(serde_json::from_str::<CardRisk>("\"purple\"").is_err());
        assert!(serde_json::from_str::<CardLevel>("\"opportunity\"").is_err());
        assert_eq!(
            serde_json::to_string(&CardType::MarketRisk).unwrap(),
            "\"market_risk\""
        );
    }
}
