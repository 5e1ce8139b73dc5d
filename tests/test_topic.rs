use std::path::PathBuf;
use std::sync::Arc;

use signal_flow::ingest::Ingestor;
use signal_flow::kv::Kv;
use signal_flow::providers::sentiment::SentimentClient;
use signal_flow::providers::social::{MultiSource, XBackend};
use signal_flow::rules::hotreload::HotConfigRegistry;
use signal_flow::store;
use signal_flow::store::events::{NewEvent, upsert_event};
use signal_flow::store::models::EventType;
use signal_flow::store::{outbox as outbox_repo, signals};
use signal_flow::topic::{self, TopicAggregator, topic_id};

// ── Helpers ─────────────────────────────────────────────────────────

const TOPIC_MERGE: &str = r#"sim_threshold: 0.83
jaccard_fallback: 0.5
whitelist_boost: 0.05
window_hours: 24
slope_window_10m: 10
slope_window_30m: 30
whitelist: [doge]
"#;

fn registry() -> (Arc<HotConfigRegistry>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("topic_merge.yml"), TOPIC_MERGE).unwrap();
    let reg = HotConfigRegistry::new(
        vec!["topic_merge.yml".to_string()],
        PathBuf::from(tmp.path()),
    )
    .unwrap();
    (reg, tmp)
}

async fn seed_topic_event(
    db: &store::Db,
    event_key: &str,
    hash: &str,
    entities: &[&str],
    score: f64,
) {
    let conn = db.lock().await;
    let ts = store::now_ts();
    let ev = NewEvent {
        event_key: event_key.to_string(),
        event_type: EventType::Topic,
        summary: entities.join(" "),
        score: 0.5,
        impacted_assets: Vec::new(),
        token_ca: None,
        symbol: None,
        topic_hash: Some(hash.to_string()),
        topic_entities: Some(entities.iter().map(|s| s.to_string()).collect()),
        candidate_score: Some(score),
        ts,
    };
    upsert_event(&conn, &ev, serde_json::json!({"post_id": event_key})).unwrap();
}

// ── Ingest-time tagging ─────────────────────────────────────────────

#[tokio::test]
async fn ingest_tags_memeable_posts_and_records_mentions() {
    let kv = Kv::memory();
    let db = store::open_in_memory().unwrap();
    let ing = Ingestor::new(
        MultiSource::with_backends(vec![XBackend::Mock]),
        kv.clone(),
        db.clone(),
        SentimentClient::mock(),
        vec!["alice".to_string()],
    );
    ing.run_once().await;

    // "Just bought more $BTC and $ETH" carries two entities; the single
    // $PEPE mention and the stop-term $MEME post do not make topics.
    let tagged_id = topic_id(&["btc".to_string(), "eth".to_string()]);
    let conn = db.lock().await;
    let tagged: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM events WHERE topic_hash IS NOT NULL",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(tagged, 1);

    let (hash, entities, score): (String, String, f64) = conn
        .query_row(
            "SELECT topic_hash, topic_entities, candidate_score FROM events
             WHERE topic_hash IS NOT NULL",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
    assert_eq!(hash, tagged_id);
    assert_eq!(
        serde_json::from_str::<Vec<String>>(&entities).unwrap(),
        vec!["btc", "eth"]
    );
    assert_eq!(score, 0.6);
    drop(conn);

    // The mention landed in the time series.
    let now = chrono::Utc::now().timestamp() as f64;
    let count = kv
        .zcount(&format!("topic:mentions:{tagged_id}"), now - 600.0, now)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

// ── Aggregation ─────────────────────────────────────────────────────

#[tokio::test]
async fn aggregation_merges_computes_heat_and_pushes_once() {
    let (reg, _tmp) = registry();
    let kv = Kv::memory();
    let db = store::open_in_memory().unwrap();

    // Two groups: ["doge","shibainu"] with two events and ["doge"] with
    // one. Jaccard 0.5 merges them into a three-mention topic.
    let big = topic_id(&["doge".to_string(), "shibainu".to_string()]);
    let small = topic_id(&["doge".to_string()]);
    seed_topic_event(&db, "TOPIC:SEED0001", &big, &["doge", "shibainu"], 0.6).await;
    seed_topic_event(&db, "TOPIC:SEED0002", &big, &["doge", "shibainu"], 0.6).await;
    seed_topic_event(&db, "TOPIC:SEED0003", &small, &["doge"], 0.3).await;

    topic::record_mention(&kv, &big, "m1").await;
    topic::record_mention(&kv, &big, "m2").await;
    topic::record_mention(&kv, &small, "m3").await;

    let aggregator = TopicAggregator::new(db.clone(), kv.clone(), reg);
    let stats = aggregator.run_once().await;

    assert_eq!(stats.tagged_events, 3);
    assert_eq!(stats.groups, 2);
    assert_eq!(stats.merged, 1);
    assert_eq!(stats.signals_created, 3);
    assert_eq!(stats.candidates, 1);
    assert_eq!(stats.pushed, 1);

    // Heat and candidate score written back to every member hash; the
    // whitelisted entity adds its boost to mentions/100.
    let conn = db.lock().await;
    for key in ["TOPIC:SEED0001", "TOPIC:SEED0003"] {
        let event = store::events::get_event(&conn, key).unwrap().unwrap();
        assert_eq!(event.heat_10m, 3);
        assert_eq!(event.heat_30m, 3);
        assert_eq!(event.candidate_score, Some(0.08));
    }

    // Topic signals exist with a rising slope.
    let signal = signals::get_by_event(&conn, "TOPIC:SEED0001").unwrap().unwrap();
    assert_eq!(signal.market_type.as_deref(), Some("topic"));
    assert!(signal.heat_slope.unwrap() > 0.0);

    // One outbox candidate with the formatted alert text.
    let backlog = outbox_repo::count_backlog(&conn).unwrap();
    assert_eq!(backlog, 1);
    drop(conn);

    // A second pass inside the cooldown updates heat but does not re-push.
    let again = aggregator.run_once().await;
    assert_eq!(again.candidates, 1);
    assert_eq!(again.pushed, 0);
    assert_eq!(again.signals_updated, 3);

    let conn = db.lock().await;
    assert_eq!(outbox_repo::count_backlog(&conn).unwrap(), 1);
}

#[tokio::test]
async fn below_threshold_topics_are_not_pushed() {
    let (reg, _tmp) = registry();
    let kv = Kv::memory();
    let db = store::open_in_memory().unwrap();

    let hash = topic_id(&["bonk".to_string(), "wifcat".to_string()]);
    seed_topic_event(&db, "TOPIC:QUIET001", &hash, &["bonk", "wifcat"], 0.6).await;
    topic::record_mention(&kv, &hash, "m1").await;

    let aggregator = TopicAggregator::new(db.clone(), kv.clone(), reg);
    let stats = aggregator.run_once().await;

    assert_eq!(stats.groups, 1);
    assert_eq!(stats.candidates, 0);
    assert_eq!(stats.pushed, 0);

    // Heat still lands even without a push.
    let conn = db.lock().await;
    let event = store::events::get_event(&conn, "TOPIC:QUIET001").unwrap().unwrap();
    assert_eq!(event.heat_10m, 1);
    assert_eq!(outbox_repo::count_backlog(&conn).unwrap(), 0);
}

#[tokio::test]
async fn existing_token_signal_is_not_overwritten_by_topic_scan() {
    let (reg, _tmp) = registry();
    let kv = Kv::memory();
    let db = store::open_in_memory().unwrap();

    let hash = topic_id(&["doge".to_string(), "shibainu".to_string()]);
    seed_topic_event(&db, "TOPIC:TOKEN001", &hash, &["doge", "shibainu"], 0.6).await;
    {
        let conn = db.lock().await;
        signals::ensure_candidate(&conn, "TOPIC:TOKEN001", "token", "token", &store::now_ts())
            .unwrap();
    }
    topic::record_mention(&kv, &hash, "m1").await;

    let aggregator =
        TopicAggregator::new(db.clone(), kv.clone(), reg).with_push_policy(false, 3, 3600);
    let stats = aggregator.run_once().await;
    assert_eq!(stats.signals_created, 0);
    assert_eq!(stats.signals_updated, 0);

    let conn = db.lock().await;
    let signal = signals::get_by_event(&conn, "TOPIC:TOKEN001").unwrap().unwrap();
    assert_eq!(signal.market_type.as_deref(), Some("token"));
    assert!(signal.heat_slope.is_none());
}
