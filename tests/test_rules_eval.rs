use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use signal_flow::rules::hotreload::HotConfigRegistry;
use signal_flow::rules::{Level, RuleEngine};

// ── Helpers ─────────────────────────────────────────────────────────

const RULES: &str = r#"version: eval-test
groups:
  - name: security
    priority: 90
    rules:
      - id: goplus_red
        when: "goplus_risk == 'red'"
        score: -12
        reason: "安全体检红色风险"
      - id: high_tax
        when: "buy_tax >= 10 or sell_tax >= 10"
        score: -6
        reason: "税率过高"
  - name: liquidity
    priority: 80
    rules:
      - id: deep_liquidity
        when: "dex_liquidity >= 500000"
        score: 8
        reason: "流动性充足"
      - id: active_volume
        when: "dex_volume_1h >= 100000"
        score: 6
        reason: "近一小时成交活跃"
  - name: momentum
    priority: 70
    rules:
      - id: heat
        when: "heat_slope > 1.0"
        score: 4
        reason: "热度快速上升"
scoring:
  thresholds:
    opportunity: 15
    caution: -5
missing_map:
  dex: "DEX 数据缺失"
  hf: "情绪数据缺失"
  goplus:
    condition: "goplus_risk is null"
    reason: "安全体检数据缺失"
"#;

fn engine() -> (RuleEngine, Arc<HotConfigRegistry>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("rules.yml"), RULES).unwrap();
    let registry =
        HotConfigRegistry::new(vec!["rules.yml".to_string()], PathBuf::from(tmp.path())).unwrap();
    (RuleEngine::new(registry.clone()), registry, tmp)
}

fn full_ctx() -> serde_json::Map<String, serde_json::Value> {
    json!({
        "goplus_risk": "green",
        "buy_tax": 2.0,
        "sell_tax": 2.0,
        "lp_lock_days": 200,
        "dex_liquidity": 600000.0,
        "dex_volume_1h": 150000.0,
        "heat_slope": 1.5,
        "last_sentiment_score": 0.8,
    })
    .as_object()
    .unwrap()
    .clone()
}

// ── Evaluation ──────────────────────────────────────────────────────

#[tokio::test]
async fn complete_data_scores_opportunity() {
    let (engine, _reg, _tmp) = engine();
    let result = engine.evaluate(&full_ctx());

    // liquidity 8 + volume 6 + heat 4
    assert_eq!(result.score, 18.0);
    assert_eq!(result.level, Level::Opportunity);
    assert!(result.missing.is_empty());
    assert_eq!(result.rules_version, "eval-test");
    assert!(!result.refine_used);
}

#[tokio::test]
async fn risky_signal_scores_caution() {
    let (engine, _reg, _tmp) = engine();
    let ctx = json!({
        "goplus_risk": "red",
        "buy_tax": 15.0,
        "sell_tax": 15.0,
        "dex_liquidity": 30000.0,
        "dex_volume_1h": 5000.0,
        "heat_slope": -0.5,
        "last_sentiment_score": -0.2,
    })
    .as_object()
    .unwrap()
    .clone();

    let result = engine.evaluate(&ctx);
    assert_eq!(result.score, -18.0);
    assert_eq!(result.level, Level::Caution);
    // Highest-priority reasons first.
    assert_eq!(result.reasons[0], "安全体检红色风险");
}

#[tokio::test]
async fn missing_sources_surface_in_top_reasons() {
    let (engine, _reg, _tmp) = engine();
    let ctx = json!({
        "goplus_risk": "yellow",
        "heat_slope": 0.5,
        "last_sentiment_score": 0.5,
    })
    .as_object()
    .unwrap()
    .clone();

    let result = engine.evaluate(&ctx);
    assert_eq!(result.missing, vec!["dex".to_string()]);
    // Priority 100 puts the missing-source reason at the front.
    assert_eq!(result.reasons[0], "DEX 数据缺失");
}

#[tokio::test]
async fn null_fields_never_error_and_never_fire() {
    let (engine, _reg, _tmp) = engine();
    let result = engine.evaluate(&serde_json::Map::new());

    assert_eq!(result.score, 0.0);
    assert_eq!(result.level, Level::Observe);
    // All three configured sources are missing.
    assert_eq!(result.missing.len(), 3);
}

#[tokio::test]
async fn evaluation_is_pure_given_fixed_snapshot() {
    let (engine, _reg, _tmp) = engine();
    let ctx = full_ctx();
    let first = engine.evaluate(&ctx);
    let second = engine.evaluate(&ctx);

    // Identical apart from the hot_reloaded flag, which reflects the first
    // load rather than the inputs.
    assert_eq!(first.score, second.score);
    assert_eq!(first.level, second.level);
    assert_eq!(first.reasons, second.reasons);
    assert_eq!(first.all_reasons, second.all_reasons);
    assert_eq!(first.missing, second.missing);
    assert_eq!(first.rules_version, second.rules_version);
}

#[tokio::test]
async fn reasons_are_deduplicated_and_capped_at_three() {
    let (engine, _reg, _tmp) = engine();
    let ctx = json!({
        "goplus_risk": "red",
        "buy_tax": 20.0,
        "dex_liquidity": 600000.0,
        "dex_volume_1h": 150000.0,
        "heat_slope": 2.0,
        "last_sentiment_score": 0.1,
    })
    .as_object()
    .unwrap()
    .clone();

    let result = engine.evaluate(&ctx);
    assert!(result.reasons.len() <= 3);
    assert!(result.all_reasons.len() >= result.reasons.len());
    let mut deduped = result.all_reasons.clone();
    deduped.dedup();
    assert_eq!(deduped, result.all_reasons);
}
