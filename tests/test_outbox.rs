use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;
use signal_flow::kv::Kv;
use signal_flow::messaging::{ConnectionStatus, Messenger, SendOutcome};
use signal_flow::outbox::{Dispatcher, DispatcherConfig, enqueue_card, idempotency_key};
use signal_flow::store;
use signal_flow::store::models::OutboxStatus;
use signal_flow::store::outbox as repo;

// ── Scripted messenger ──────────────────────────────────────────────

/// Plays back a fixed sequence of outcomes and counts calls.
struct ScriptedMessenger {
    outcomes: Mutex<VecDeque<SendOutcome>>,
    calls: AtomicUsize,
}

impl ScriptedMessenger {
    fn new(outcomes: Vec<SendOutcome>) -> ScriptedMessenger {
        ScriptedMessenger {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn http_error(status: u16) -> SendOutcome {
        SendOutcome::failure(Some(status), format!("HTTP {status}"))
    }
}

#[async_trait]
impl Messenger for ScriptedMessenger {
    async fn send_message(
        &self,
        _chat_id: &str,
        _text: &str,
        _parse_mode: &str,
        _disable_notification: bool,
    ) -> SendOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| SendOutcome::success("scripted".to_string()))
    }

    async fn test_connection(&self) -> ConnectionStatus {
        ConnectionStatus {
            ok: true,
            bot_username: Some("scripted".to_string()),
            error: None,
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn config(tmp: &tempfile::TempDir) -> DispatcherConfig {
    DispatcherConfig {
        template_v: "v1".to_string(),
        batch_limit: 50,
        rate_limit_per_sec: 1000,
        max_wait_ms: 100,
        dedup_ttl_secs: 5400,
        snapshot_dir: tmp.path().to_path_buf(),
        claim_secs: 60,
        parse_mode: "HTML".to_string(),
    }
}

async fn force_due(db: &store::Db, id: i64) {
    let conn = db.lock().await;
    conn.execute(
        "UPDATE push_outbox SET next_try_at = NULL WHERE id = ?1",
        rusqlite::params![id],
    )
    .unwrap();
}

async fn row(db: &store::Db, id: i64) -> signal_flow::store::models::OutboxRow {
    let conn = db.lock().await;
    repo::get(&conn, id).unwrap().unwrap()
}

// ── Retry then DLQ (S5) ─────────────────────────────────────────────

#[tokio::test]
async fn three_retries_then_permanent_error_lands_in_dlq() {
    let tmp = tempfile::tempdir().unwrap();
    let db = store::open_in_memory().unwrap();
    let kv = Kv::memory();

    let payload = json!({"event_key": "ABCD1234EFGH", "text": "card body"});
    let id = enqueue_card(&db, -100, None, "ABCD1234EFGH", &payload)
        .await
        .unwrap();

    let messenger = ScriptedMessenger::new(vec![
        ScriptedMessenger::http_error(500),
        ScriptedMessenger::http_error(500),
        ScriptedMessenger::http_error(500),
        ScriptedMessenger::http_error(400),
    ]);
    let dispatcher = Dispatcher::new(db.clone(), kv.clone(), Box::new(messenger), config(&tmp));

    for expected_attempt in 1..=3i64 {
        force_due(&db, id).await;

        let stats = dispatcher.dispatch_once().await;
        assert_eq!(stats.retried, 1, "attempt {expected_attempt} retried");

        let r = row(&db, id).await;
        assert_eq!(r.status, OutboxStatus::Retry);
        assert_eq!(r.attempt, expected_attempt);
        assert!(r.next_try_at.is_some());
    }

    // Fourth attempt: HTTP 400 routes to DLQ with a snapshot.
    force_due(&db, id).await;
    let stats = dispatcher.dispatch_once().await;
    assert_eq!(stats.dlq, 1);

    let r = row(&db, id).await;
    assert_eq!(r.status, OutboxStatus::Dlq);

    let conn = db.lock().await;
    let dlq = repo::list_dlq(&conn, 10).unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].ref_id, id);
    assert_eq!(dlq[0].snapshot, payload);

    // Error snapshots were written for every failed attempt.
    let snapshots = std::fs::read_dir(tmp.path()).unwrap().count();
    assert_eq!(snapshots, 4);
}

// ── Idempotency ─────────────────────────────────────────────────────

#[tokio::test]
async fn idempotency_key_suppresses_second_send() {
    let tmp = tempfile::tempdir().unwrap();
    let db = store::open_in_memory().unwrap();
    let kv = Kv::memory();

    let payload = json!({"text": "card"});
    enqueue_card(&db, -100, None, "ABCD1234EFGH", &payload).await.unwrap();
    enqueue_card(&db, -100, None, "ABCD1234EFGH", &payload).await.unwrap();

    let messenger = ScriptedMessenger::new(Vec::new());
    let dispatcher = Dispatcher::new(db.clone(), kv, Box::new(messenger), config(&tmp));

    let stats = dispatcher.dispatch_once().await;
    // Both rows complete but only one send crosses the wire.
    assert_eq!(stats.sent + stats.deduped, 2);
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.deduped, 1);
}

#[tokio::test]
async fn done_entry_never_sends_again_within_ttl() {
    let tmp = tempfile::tempdir().unwrap();
    let db = store::open_in_memory().unwrap();
    let kv = Kv::memory();

    let payload = json!({"text": "card"});
    enqueue_card(&db, -100, None, "ABCD1234EFGH", &payload).await.unwrap();

    let dispatcher = Dispatcher::new(
        db.clone(),
        kv.clone(),
        Box::new(ScriptedMessenger::new(Vec::new())),
        config(&tmp),
    );
    let stats = dispatcher.dispatch_once().await;
    assert_eq!(stats.sent, 1);

    // The idempotency claim persists for the window, so a re-enqueued copy
    // completes without another send.
    let key = idempotency_key("ABCD1234EFGH", -100, "v1");
    assert!(kv.get(&key).await.unwrap().is_some());

    enqueue_card(&db, -100, None, "ABCD1234EFGH", &payload).await.unwrap();
    let stats = dispatcher.dispatch_once().await;
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.deduped, 1);
}

#[tokio::test]
async fn retry_after_from_rate_limit_is_honored() {
    let tmp = tempfile::tempdir().unwrap();
    let db = store::open_in_memory().unwrap();
    let kv = Kv::memory();

    let id = enqueue_card(&db, -100, None, "ABCD1234EFGH", &json!({"text": "x"}))
        .await
        .unwrap();

    let outcome = SendOutcome {
        ok: false,
        message_id: None,
        error: Some("Too Many Requests".to_string()),
        error_code: Some(429),
        status_code: Some(429),
        retry_after: Some(30),
    };
    let dispatcher = Dispatcher::new(
        db.clone(),
        kv,
        Box::new(ScriptedMessenger::new(vec![outcome])),
        config(&tmp),
    );

    dispatcher.dispatch_once().await;
    let r = row(&db, id).await;
    assert_eq!(r.status, OutboxStatus::Retry);

    // next_try_at lands ~30 s out.
    let next = store::parse_ts(r.next_try_at.as_deref().unwrap()).unwrap();
    let delta = (next - chrono::Utc::now()).num_seconds();
    assert!((25..=35).contains(&delta), "delta was {delta}");
}

// ── DLQ recovery ────────────────────────────────────────────────────

#[tokio::test]
async fn dlq_recovery_restores_fresh_rows_and_discards_old() {
    let tmp = tempfile::tempdir().unwrap();
    let db = store::open_in_memory().unwrap();
    let kv = Kv::memory();

    let fresh_payload = json!({"text": "fresh"});
    let fresh = enqueue_card(&db, -100, None, "FRESHKEY1234", &fresh_payload)
        .await
        .unwrap();
    let old = enqueue_card(&db, -100, None, "OLDKEY123456", &json!({"text": "old"}))
        .await
        .unwrap();

    {
        let mut conn = db.lock().await;
        repo::move_to_dlq(&mut conn, fresh, Some("HTTP 400"), &fresh_payload).unwrap();
        repo::move_to_dlq(&mut conn, old, Some("HTTP 400"), &json!({"text": "old"})).unwrap();
        // Age the second DLQ row past the retention window.
        conn.execute(
            "UPDATE push_outbox_dlq SET failed_at = ?1 WHERE ref_id = ?2",
            rusqlite::params![
                store::to_ts(chrono::Utc::now() - chrono::Duration::hours(2)),
                old
            ],
        )
        .unwrap();
    }

    let dispatcher = Dispatcher::new(
        db.clone(),
        kv,
        Box::new(ScriptedMessenger::new(Vec::new())),
        config(&tmp),
    );
    let stats = dispatcher.recover_dlq_once(50, 3600).await;
    assert_eq!(stats.recovered, 1);
    assert_eq!(stats.discarded, 1);

    let recovered = row(&db, fresh).await;
    assert_eq!(recovered.status, OutboxStatus::Retry);
    assert_eq!(recovered.attempt, 0);
    assert!(recovered.last_error.is_none());
    assert_eq!(recovered.payload, fresh_payload);

    let stale = row(&db, old).await;
    assert_eq!(stale.status, OutboxStatus::Dlq);

    let conn = db.lock().await;
    assert!(repo::list_dlq(&conn, 10).unwrap().is_empty());
}

#[tokio::test]
async fn recovery_drops_snapshot_when_row_already_left_dlq() {
    let tmp = tempfile::tempdir().unwrap();
    let db = store::open_in_memory().unwrap();
    let kv = Kv::memory();

    let payload = json!({"text": "x"});
    let id = enqueue_card(&db, -100, None, "MOVEDKEY1234", &payload).await.unwrap();
    {
        let mut conn = db.lock().await;
        repo::move_to_dlq(&mut conn, id, Some("HTTP 400"), &payload).unwrap();
        // Simulates a manual requeue racing the recovery job.
        repo::mark_retry(&conn, id, &store::now_ts(), None).unwrap();
    }

    let dispatcher = Dispatcher::new(
        db.clone(),
        kv,
        Box::new(ScriptedMessenger::new(Vec::new())),
        config(&tmp),
    );
    let stats = dispatcher.recover_dlq_once(50, 3600).await;
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.recovered, 0);

    let conn = db.lock().await;
    assert!(repo::list_dlq(&conn, 10).unwrap().is_empty());
}
