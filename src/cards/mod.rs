//! Card assembly: gather the security, market, on-chain, rules and
//! evidence sections for an event, compute degradation flags, generate the
//! summary, and validate the final payload.

pub mod push;
pub mod schema;
pub mod summary;

use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;

use crate::metrics;
use crate::providers::dex::{DexProvider, DexSnapshot};
use crate::rules::hotreload::HotConfigRegistry;
use crate::rules::{Evaluation, Level, RuleEngine};
use crate::store::models::{EventRow, EventType, RiskLabel, SignalRow};
use crate::store::{Db, events, signals};
use schema::{
    Card, CardData, CardLevel, CardMeta, CardRisk, CardType, DexSection, Diagnostic, EvidenceItem,
    GoplusSection, OnchainSection, Rendered, RulesSection,
};
use summary::{SummaryBackend, SummaryConfig, summarize_card};

#[derive(Debug, Error)]
pub enum CardError {
    #[error("invalid_event_key")]
    InvalidEventKey,
    #[error("event not found")]
    NotFound,
    #[error("no_usable_sources")]
    NoUsableSources,
    #[error("schema validation failed: {0}")]
    Schema(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct CardBuilder {
    db: Db,
    dex: Arc<DexProvider>,
    engine: RuleEngine,
    summary_backend: SummaryBackend,
    summary_cfg: SummaryConfig,
}

impl CardBuilder {
    pub fn new(db: Db, dex: Arc<DexProvider>, registry: Arc<HotConfigRegistry>) -> CardBuilder {
        CardBuilder {
            db,
            dex,
            engine: RuleEngine::new(registry),
            summary_backend: SummaryBackend::from_env(),
            summary_cfg: SummaryConfig::from_env(),
        }
    }

    pub fn with_summary_backend(mut self, backend: SummaryBackend) -> CardBuilder {
        self.summary_backend = backend;
        self
    }

    /// Build a schema-validated card for an event.
    pub async fn build_card(&self, event_key: &str, render: bool) -> Result<Card, CardError> {
        if !schema::EVENT_KEY_RE.is_match(event_key) {
            return Err(CardError::InvalidEventKey);
        }

        let (event, signal) = {
            let conn = self.db.lock().await;
            let event = events::get_event(&conn, event_key).map_err(CardError::Other)?;
            let signal = signals::get_by_event(&conn, event_key).map_err(CardError::Other)?;
            (event, signal)
        };
        let Some(event) = event else {
            return Err(CardError::NotFound);
        };

        let mut degrade = false;
        let mut degrade_reasons: Vec<String> = Vec::new();

        // Security section comes from the enriched signal row.
        let security_present = signal.as_ref().is_some_and(|s| s.goplus_risk.is_some());
        let goplus = match &signal {
            Some(s) if s.goplus_risk.is_some() => build_goplus_section(s),
            _ => {
                degrade = true;
                degrade_reasons.push("missing goplus".to_string());
                GoplusSection {
                    risk: CardRisk::Gray,
                    risk_source: "unavailable".to_string(),
                    tax_buy: None,
                    tax_sell: None,
                    lp_locked: None,
                    honeypot: None,
                    diagnostic: None,
                }
            }
        };

        // Market section comes from the DEX provider (cached or live).
        let dex_snapshot = match &event.token_ca {
            Some(ca) => Some(self.dex.get_snapshot("eth", ca).await),
            None => None,
        };
        let dex_present = dex_snapshot
            .as_ref()
            .is_some_and(|s| s.price_usd.is_some() || s.liquidity_usd.is_some());
        let dex = if dex_present {
            build_dex_section(dex_snapshot.as_ref().unwrap())
        } else {
            degrade = true;
            degrade_reasons.push("missing dex".to_string());
            DexSection::default()
        };

        if !security_present && !dex_present {
            return Err(CardError::NoUsableSources);
        }

        // On-chain section when the verifier has stamped the signal.
        let onchain = signal.as_ref().and_then(|s| {
            s.onchain_asof_ts.as_ref().map(|asof| OnchainSection {
                features_snapshot: Some(json!({
                    "asof_ts": asof,
                    "confidence": s.onchain_confidence,
                })),
                source_level: Some("warehouse".to_string()),
            })
        });

        // Rules evaluation over the combined signals ∪ events row.
        let ctx = eval_context(&event, signal.as_ref(), dex_snapshot.as_ref());
        let evaluation = self.engine.evaluate(&ctx);
        let rules_missing = evaluation.rules_version == "error";
        if rules_missing {
            degrade = true;
            degrade_reasons.push("missing rules".to_string());
        }
        let rules = build_rules_section(&evaluation, rules_missing, &degrade_reasons);

        let evidence = build_evidence(&event);

        // data_as_of: oldest timestamp among the sources.
        let mut timestamps: Vec<String> = Vec::new();
        if security_present {
            if let Some(s) = &signal {
                timestamps.push(s.updated_at.clone());
            }
        }
        if let Some(snap) = &dex_snapshot {
            if dex_present {
                timestamps.push(snap.timestamp.clone());
            }
        }
        if let Some(s) = &signal {
            if let Some(asof) = &s.onchain_asof_ts {
                timestamps.push(asof.clone());
            }
        }
        let data_as_of = match timestamps.iter().min() {
            Some(ts) => ts.clone(),
            None => {
                degrade = true;
                degrade_reasons.push("missing data_as_of".to_string());
                crate::store::now_ts()
            }
        };

        let card_type = classify_card_type(&event, onchain.is_some(), rules.level);

        let mut card = Card {
            event_key: event_key.to_string(),
            card_type,
            data: CardData {
                goplus,
                dex,
                onchain,
                rules,
            },
            evidence,
            summary: String::new(),
            risk_note: String::new(),
            rendered: None,
            meta: CardMeta {
                version: schema::CARD_VERSION.to_string(),
                data_as_of,
                summary_backend: "template".to_string(),
                used_refiner: None,
                degrade: None,
            },
        };

        // Summary generation over the pre-summary payload.
        let mut payload = serde_json::to_value(&card).unwrap_or(Value::Null);
        if let Some(symbol) = &event.symbol {
            payload["symbol"] = json!(symbol);
        }
        let (summary, risk_note, summary_meta) =
            summarize_card(&payload, &self.summary_backend, &self.summary_cfg);
        card.summary = summary;
        card.risk_note = risk_note;
        card.meta.summary_backend = summary_meta.backend;
        if !summary_meta.used_refiner.is_empty() {
            card.meta.used_refiner = Some(summary_meta.used_refiner);
        }
        if degrade || summary_meta.degrade {
            card.meta.degrade = Some(true);
            metrics::CARDS_DEGRADE_COUNT.inc();
        }

        if render {
            card.rendered = render_card(&card);
        }

        card.validate().map_err(CardError::Schema)?;

        tracing::info!(
            stage = "cards.build",
            event_key = %event_key,
            card_type = ?card.card_type,
            degrade = degrade,
            reasons_len = degrade_reasons.len(),
        );

        Ok(card)
    }
}

fn build_goplus_section(signal: &SignalRow) -> GoplusSection {
    let risk = match signal.goplus_risk.unwrap_or(RiskLabel::Unknown) {
        RiskLabel::Green => CardRisk::Green,
        RiskLabel::Yellow => CardRisk::Yellow,
        RiskLabel::Red => CardRisk::Red,
        RiskLabel::Gray | RiskLabel::Unknown => CardRisk::Gray,
    };
    GoplusSection {
        risk,
        risk_source: "GoPlus@v1".to_string(),
        tax_buy: signal.buy_tax,
        tax_sell: signal.sell_tax,
        lp_locked: signal.lp_lock_days.map(|d| d > 0),
        honeypot: signal.honeypot,
        diagnostic: None,
    }
}

fn build_dex_section(snap: &DexSnapshot) -> DexSection {
    let diagnostic = Diagnostic {
        source: (!snap.source.is_empty()).then(|| snap.source.clone()),
        cache: snap.cache.then_some(true),
        stale: snap.stale.then_some(true),
        degrade: snap.degrade.then_some(true),
    };
    DexSection {
        price_usd: snap.price_usd,
        liquidity_usd: snap.liquidity_usd,
        fdv: snap.fdv,
        ohlc: serde_json::to_value(&snap.ohlc).ok(),
        diagnostic: (!diagnostic.is_empty()).then_some(diagnostic),
    }
}

fn build_rules_section(
    evaluation: &Evaluation,
    rules_missing: bool,
    degrade_reasons: &[String],
) -> RulesSection {
    if rules_missing {
        return RulesSection {
            level: CardLevel::None,
            score: None,
            reasons: degrade_reasons.iter().take(3).cloned().collect(),
            all_reasons: None,
        };
    }

    // Engine levels map onto the card vocabulary: caution stays caution,
    // everything else is surveillance.
    let level = match evaluation.level {
        Level::Caution => CardLevel::Caution,
        Level::Opportunity | Level::Observe => CardLevel::Watch,
    };

    let mut reasons = evaluation.reasons.clone();
    for reason in degrade_reasons {
        if reasons.len() >= 3 {
            break;
        }
        if !reasons.contains(reason) {
            reasons.push(reason.clone());
        }
    }

    RulesSection {
        level,
        score: Some(evaluation.score),
        reasons,
        all_reasons: Some(evaluation.all_reasons.iter().take(20).cloned().collect()),
    }
}

fn build_evidence(event: &EventRow) -> Option<Vec<EvidenceItem>> {
    let items = event.evidence.as_array()?;
    let mut out = Vec::new();
    for item in items {
        let Value::Object(map) = item else { continue };
        let kind = map
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("post")
            .chars()
            .take(schema::EVIDENCE_TYPE_MAX)
            .collect::<String>();

        let author = map.get("author").and_then(|v| v.as_str()).unwrap_or("unknown");
        let ts = map.get("ts").and_then(|v| v.as_str()).unwrap_or("");
        let desc: String = format!("@{author} {ts}")
            .chars()
            .take(schema::EVIDENCE_DESC_MAX)
            .collect();

        let url = map
            .get("tweet_id")
            .and_then(|v| v.as_str())
            .map(|id| format!("https://x.com/{author}/status/{id}"));

        out.push(EvidenceItem { kind, desc, url });
    }
    (!out.is_empty()).then_some(out)
}

fn classify_card_type(event: &EventRow, onchain_present: bool, level: CardLevel) -> CardType {
    // Market-wide risk events override the regular ladder.
    if event.event_type == EventType::MarketUpdate && level == CardLevel::Caution {
        return CardType::MarketRisk;
    }
    if onchain_present && matches!(level, CardLevel::Caution | CardLevel::Risk) {
        return CardType::Primary;
    }
    if level == CardLevel::Watch {
        return CardType::Secondary;
    }
    CardType::Topic
}

/// Combined evaluation context: signal columns plus the most recent
/// sentiment observed in the event's evidence refs.
fn eval_context(
    event: &EventRow,
    signal: Option<&SignalRow>,
    dex: Option<&DexSnapshot>,
) -> serde_json::Map<String, Value> {
    let mut ctx = serde_json::Map::new();
    if let Some(s) = signal {
        if let Some(risk) = s.goplus_risk {
            ctx.insert("goplus_risk".to_string(), json!(risk.as_str()));
        }
        insert_opt(&mut ctx, "buy_tax", s.buy_tax);
        insert_opt(&mut ctx, "sell_tax", s.sell_tax);
        if let Some(days) = s.lp_lock_days {
            ctx.insert("lp_lock_days".to_string(), json!(days));
        }
        insert_opt(&mut ctx, "dex_liquidity", s.dex_liquidity);
        insert_opt(&mut ctx, "dex_volume_1h", s.dex_volume_1h);
        insert_opt(&mut ctx, "heat_slope", s.heat_slope);
    }

    // A live market snapshot backfills columns the scanner has not written
    // yet, so the engine does not report dex as missing while data exists.
    if let Some(snap) = dex {
        if !ctx.contains_key("dex_liquidity") {
            insert_opt(&mut ctx, "dex_liquidity", snap.liquidity_usd);
        }
        if !ctx.contains_key("dex_volume_1h") {
            insert_opt(&mut ctx, "dex_volume_1h", snap.volume_1h);
        }
    }

    if let Some(refs) = event.evidence.as_array() {
        let last_sentiment = refs
            .iter()
            .rev()
            .find_map(|r| r.get("sentiment_score").and_then(|v| v.as_f64()));
        insert_opt(&mut ctx, "last_sentiment_score", last_sentiment);
    }
    ctx
}

fn insert_opt(ctx: &mut serde_json::Map<String, Value>, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        ctx.insert(key.to_string(), json!(v));
    }
}

/// Optional renderers; failures just omit the section.
fn render_card(card: &Card) -> Option<Rendered> {
    let tg = render_tg(card);
    let ui = render_ui(card);
    if tg.is_none() && ui.is_none() {
        return None;
    }
    Some(Rendered { tg, ui })
}

fn render_tg(card: &Card) -> Option<String> {
    let mut text = format!("<b>{}</b>\n{}\n{}", card.event_key, card.summary, card.risk_note);
    if let Some(items) = &card.evidence {
        for item in items.iter().take(3) {
            text.push_str(&format!("\n· {}", item.desc));
        }
    }
    Some(text.chars().take(4096).collect())
}

fn render_ui(card: &Card) -> Option<String> {
    let html = format!(
        "<div class=\"card {:?}\"><h3>{}</h3><p>{}</p><p class=\"risk\">{}</p></div>",
        card.card_type, card.event_key, card.summary, card.risk_note
    );
    Some(html.chars().take(8192).collect())
}
