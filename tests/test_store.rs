use std::time::Duration;

use serde_json::json;
use signal_flow::kv::{Kv, ReleaseStatus};
use signal_flow::store;
use signal_flow::store::outbox as repo;
use signal_flow::store::provider_cache;

// ── Outbox ordering & claiming ──────────────────────────────────────

#[tokio::test]
async fn dequeue_orders_null_next_try_first_then_created_at() {
    let db = store::open_in_memory().unwrap();
    let mut conn = db.lock().await;

    let a = repo::enqueue(&conn, -1, None, "AAAA1111BBBB", &json!({"text": "a"})).unwrap();
    let b = repo::enqueue(&conn, -1, None, "CCCC2222DDDD", &json!({"text": "b"})).unwrap();
    let c = repo::enqueue(&conn, -1, None, "EEEE3333FFFF", &json!({"text": "c"})).unwrap();

    // Row b got a due retry time in the past; a and c stay NULL.
    let past = store::to_ts(chrono::Utc::now() - chrono::Duration::seconds(30));
    conn.execute(
        "UPDATE push_outbox SET next_try_at = ?1, status = 'retry' WHERE id = ?2",
        rusqlite::params![past, b],
    )
    .unwrap();

    let batch = repo::dequeue_batch(&mut conn, 10, 60).unwrap();
    let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
    // NULLs first in creation order, then the timed row.
    assert_eq!(ids, vec![a, c, b]);
}

#[tokio::test]
async fn claimed_rows_are_invisible_to_a_second_dequeue() {
    let db = store::open_in_memory().unwrap();
    let mut conn = db.lock().await;

    repo::enqueue(&conn, -1, None, "AAAA1111BBBB", &json!({"text": "a"})).unwrap();

    let first = repo::dequeue_batch(&mut conn, 10, 60).unwrap();
    assert_eq!(first.len(), 1);

    // The claim pushed next_try_at forward, so a concurrent dispatcher
    // sees nothing.
    let second = repo::dequeue_batch(&mut conn, 10, 60).unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn future_retries_are_not_dispatchable() {
    let db = store::open_in_memory().unwrap();
    let mut conn = db.lock().await;

    let id = repo::enqueue(&conn, -1, None, "AAAA1111BBBB", &json!({"text": "a"})).unwrap();
    let future = store::to_ts(chrono::Utc::now() + chrono::Duration::seconds(300));
    repo::mark_retry(&conn, id, &future, Some("err")).unwrap();

    assert!(repo::dequeue_batch(&mut conn, 10, 60).unwrap().is_empty());
    assert_eq!(repo::count_backlog(&conn).unwrap(), 1);
}

#[tokio::test]
async fn done_and_dlq_rows_never_dispatch() {
    let db = store::open_in_memory().unwrap();
    let mut conn = db.lock().await;

    let done = repo::enqueue(&conn, -1, None, "AAAA1111BBBB", &json!({"text": "a"})).unwrap();
    let dead = repo::enqueue(&conn, -1, None, "CCCC2222DDDD", &json!({"text": "b"})).unwrap();
    repo::mark_done(&conn, done).unwrap();
    repo::move_to_dlq(&mut conn, dead, Some("HTTP 400"), &json!({"text": "b"})).unwrap();

    assert!(repo::dequeue_batch(&mut conn, 10, 60).unwrap().is_empty());
    assert_eq!(repo::count_backlog(&conn).unwrap(), 0);
}

// ── Provider cache ──────────────────────────────────────────────────

#[tokio::test]
async fn provider_cache_keeps_most_recent_fetch() {
    let db = store::open_in_memory().unwrap();
    let conn = db.lock().await;

    let expires = store::to_ts(chrono::Utc::now() + chrono::Duration::seconds(600));
    provider_cache::put(&conn, "token_security", Some("1"), "0xabc", "{\"v\":1}", "success", &expires)
        .unwrap();
    provider_cache::put(&conn, "token_security", Some("1"), "0xabc", "{\"v\":2}", "success", &expires)
        .unwrap();

    let hit = provider_cache::get(&conn, "token_security", Some("1"), "0xabc")
        .unwrap()
        .unwrap();
    assert_eq!(hit.payload, "{\"v\":2}");

    // Chainless endpoints key under the placeholder chain.
    assert!(
        provider_cache::get(&conn, "token_security", None, "0xabc")
            .unwrap()
            .is_none()
    );
}

// ── Distributed lock TTL boundary ───────────────────────────────────

#[tokio::test]
async fn expired_lock_can_be_reacquired_and_release_reports_expired() {
    let kv = Kv::memory();

    assert!(kv.set_nx_ex("lock:ttl", "holder-a", 1).await.unwrap());
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // TTL elapsed: a second worker acquires.
    assert!(kv.set_nx_ex("lock:ttl", "holder-b", 60).await.unwrap());

    // The original holder's release sees a mismatched token, not its own.
    assert_eq!(
        kv.compare_and_delete("lock:ttl", "holder-a").await,
        ReleaseStatus::Mismatch
    );

    // And after B cleans up, A's late release reports expired.
    assert_eq!(
        kv.compare_and_delete("lock:ttl", "holder-b").await,
        ReleaseStatus::Ok
    );
    assert_eq!(
        kv.compare_and_delete("lock:ttl", "holder-a").await,
        ReleaseStatus::Expired
    );
}
