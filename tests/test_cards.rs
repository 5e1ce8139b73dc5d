use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use signal_flow::cards::schema::{CardRisk, CardType};
use signal_flow::cards::{CardBuilder, CardError};
use signal_flow::kv::Kv;
use signal_flow::providers::dex::{DexProvider, DexSnapshot, Ohlc};
use signal_flow::rules::hotreload::HotConfigRegistry;
use signal_flow::store;
use signal_flow::store::events::{NewEvent, upsert_event};
use signal_flow::store::models::EventType;
use signal_flow::store::signals;

// ── Helpers ─────────────────────────────────────────────────────────

const RULES: &str = r#"version: cards-test
groups:
  - name: liquidity
    priority: 80
    rules:
      - id: deep_liquidity
        when: "dex_liquidity >= 500000"
        score: 8
        reason: "流动性充足"
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

const CA: &str = "0xaaaabbbbccccddddeeeeffff0000111122223333";

fn registry() -> (Arc<HotConfigRegistry>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("rules.yml"), RULES).unwrap();
    let reg =
        HotConfigRegistry::new(vec!["rules.yml".to_string()], PathBuf::from(tmp.path())).unwrap();
    (reg, tmp)
}

async fn seed_event(db: &store::Db, event_key: &str, with_ca: bool) {
    let conn = db.lock().await;
    let ts = store::now_ts();
    let ev = NewEvent {
        event_key: event_key.to_string(),
        event_type: EventType::Token,
        summary: "$PEPE launching".to_string(),
        score: 0.8,
        impacted_assets: vec!["PEPE".to_string()],
        token_ca: with_ca.then(|| CA.to_string()),
        symbol: Some("PEPE".to_string()),
        topic_hash: None,
        topic_entities: None,
        candidate_score: None,
        ts: ts.clone(),
    };
    upsert_event(
        &conn,
        &ev,
        serde_json::json!({
            "post_id": 1,
            "tweet_id": "123",
            "author": "alice",
            "ts": ts,
            "sentiment_score": 0.4,
        }),
    )
    .unwrap();
    signals::ensure_candidate(&conn, event_key, "token", "token", &ts).unwrap();
}

/// Pre-seed the KV snapshot cache the way a previous fetch would have.
async fn seed_dex_cache(kv: &Kv, chain: &str, ca: &str) {
    let bucket = Utc::now().timestamp() / 300;
    let key = format!("dex:snapshot:{chain}:{ca}:{bucket}");
    let snap = DexSnapshot {
        price_usd: Some(0.0000012),
        liquidity_usd: Some(600000.0),
        fdv: Some(1_000_000.0),
        market_cap: None,
        volume_1h: Some(150000.0),
        volume_24h: Some(2_000_000.0),
        ohlc: Ohlc::default(),
        source: "dexscreener".to_string(),
        cache: false,
        stale: false,
        degrade: false,
        reason: String::new(),
        notes: Vec::new(),
        timestamp: store::now_ts(),
    };
    kv.set_ex(&key, &serde_json::to_string(&snap).unwrap(), 60)
        .await
        .unwrap();
}

fn builder(db: &store::Db, kv: &Kv, reg: Arc<HotConfigRegistry>) -> CardBuilder {
    let dex = Arc::new(DexProvider::from_env(kv.clone()));
    CardBuilder::new(db.clone(), dex, reg)
}

// ── Degraded card (S3) ──────────────────────────────────────────────

#[tokio::test]
async fn degraded_card_when_security_is_missing_but_market_is_cached() {
    let (reg, _tmp) = registry();
    let db = store::open_in_memory().unwrap();
    let kv = Kv::memory();

    seed_event(&db, "ETH:TOKEN:0XAAAABBBB", true).await;
    seed_dex_cache(&kv, "eth", CA).await;

    let card = builder(&db, &kv, reg)
        .build_card("ETH:TOKEN:0XAAAABBBB", false)
        .await
        .unwrap();

    assert_eq!(card.card_type, CardType::Secondary);
    assert_eq!(card.data.goplus.risk, CardRisk::Gray);
    assert_eq!(card.data.goplus.risk_source, "unavailable");
    assert_eq!(card.data.dex.price_usd, Some(0.0000012));
    assert!(
        card.data
            .rules
            .reasons
            .iter()
            .any(|r| r == "missing goplus"),
        "reasons were {:?}",
        card.data.rules.reasons
    );
    assert_eq!(card.meta.degrade, Some(true));
    assert_eq!(card.meta.summary_backend, "template");
    assert!(!card.summary.is_empty());
    card.validate().unwrap();
}

// ── Failure modes ───────────────────────────────────────────────────

#[tokio::test]
async fn invalid_event_keys_are_rejected() {
    let (reg, _tmp) = registry();
    let db = store::open_in_memory().unwrap();
    let kv = Kv::memory();
    let builder = builder(&db, &kv, reg);

    for bad in ["short", "lowercase_key_1234", &"A".repeat(129)] {
        match builder.build_card(bad, false).await {
            Err(CardError::InvalidEventKey) => {}
            other => panic!("expected InvalidEventKey for {bad:?}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn no_usable_sources_fails_the_build() {
    let (reg, _tmp) = registry();
    let db = store::open_in_memory().unwrap();
    let kv = Kv::memory();

    // No contract address (no market data) and no security enrichment.
    seed_event(&db, "ETH:TOPIC:NOSOURCES", false).await;

    match builder(&db, &kv, reg)
        .build_card("ETH:TOPIC:NOSOURCES", false)
        .await
    {
        Err(CardError::NoUsableSources) => {}
        other => panic!("expected NoUsableSources, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_event_is_not_found() {
    let (reg, _tmp) = registry();
    let db = store::open_in_memory().unwrap();
    let kv = Kv::memory();

    match builder(&db, &kv, reg).build_card("ETH:TOKEN:0XMISSING", false).await {
        Err(CardError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

// ── Assembly details ────────────────────────────────────────────────

#[tokio::test]
async fn security_enriched_signal_produces_green_section() {
    let (reg, _tmp) = registry();
    let db = store::open_in_memory().unwrap();
    let kv = Kv::memory();

    seed_event(&db, "ETH:TOKEN:0XAAAABBBB", true).await;
    seed_dex_cache(&kv, "eth", CA).await;
    {
        let conn = db.lock().await;
        let signal = signals::get_by_event(&conn, "ETH:TOKEN:0XAAAABBBB").unwrap().unwrap();
        signals::update_security(
            &conn,
            signal.id,
            signal_flow::store::models::RiskLabel::Green,
            Some(2.0),
            Some(2.0),
            Some(200),
            Some(false),
            &store::now_ts(),
        )
        .unwrap();
    }

    let card = builder(&db, &kv, reg)
        .build_card("ETH:TOKEN:0XAAAABBBB", true)
        .await
        .unwrap();

    assert_eq!(card.data.goplus.risk, CardRisk::Green);
    assert_eq!(card.data.goplus.tax_buy, Some(2.0));
    assert_eq!(card.data.goplus.lp_locked, Some(true));
    // Evidence rides along from the event refs.
    let evidence = card.evidence.as_ref().unwrap();
    assert!(evidence[0].desc.contains("@alice"));
    // Rendering was requested and is bounded.
    let rendered = card.rendered.as_ref().unwrap();
    assert!(rendered.tg.as_ref().unwrap().chars().count() <= 4096);
    card.validate().unwrap();
}

#[tokio::test]
async fn summary_respects_length_caps() {
    let (reg, _tmp) = registry();
    let db = store::open_in_memory().unwrap();
    let kv = Kv::memory();

    seed_event(&db, "ETH:TOKEN:0XAAAABBBB", true).await;
    seed_dex_cache(&kv, "eth", CA).await;

    let card = builder(&db, &kv, reg)
        .build_card("ETH:TOKEN:0XAAAABBBB", false)
        .await
        .unwrap();

    assert!(card.summary.chars().count() <= 280);
    assert!(card.risk_note.chars().count() <= 160);
}
