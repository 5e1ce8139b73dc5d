//! Card push job: build cards for enriched signals and hand them to the
//! outbox, at most once per event per send window.

use crate::kv::Kv;
use crate::messaging;
use crate::outbox::enqueue_card;
use crate::store::{Db, signals};

use super::{CardBuilder, CardError};

/// Send-window dedup key, bucketed hourly like the card send path.
pub fn sent_key(event_key: &str) -> String {
    let bucket = chrono::Utc::now().format("%Y%m%d%H");
    format!("cards:sent:{event_key}:{bucket}")
}

const SENT_TTL_SECS: u64 = 5400;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PushStats {
    pub scanned: usize,
    pub enqueued: usize,
    pub deduped: usize,
    pub skipped: usize,
}

/// Build and enqueue cards for signals the scanners have enriched.
///
/// The KV sent-marker keeps one card per event per window; the outbox
/// idempotency key below this layer keeps the delivery itself exactly-once.
pub async fn push_ready_cards(
    db: &Db,
    kv: &Kv,
    builder: &CardBuilder,
    limit: usize,
) -> PushStats {
    let mut stats = PushStats::default();

    let keys = {
        let conn = db.lock().await;
        match signals::list_pushable(&conn, limit) {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(stage = "cards.push.scan_error", error = %e);
                return stats;
            }
        }
    };
    stats.scanned = keys.len();

    let channel_id = messaging::effective_channel_id();
    let thread_id = messaging::effective_thread_id();

    for event_key in keys {
        match kv.set_nx_ex(&sent_key(&event_key), "1", SENT_TTL_SECS).await {
            Ok(true) => {}
            Ok(false) => {
                stats.deduped += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!(stage = "cards.push.dedup_error", error = %e);
                stats.skipped += 1;
                continue;
            }
        }

        match builder.build_card(&event_key, true).await {
            Ok(card) => {
                let payload = match serde_json::to_value(&card) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(stage = "cards.push.encode_error", error = %e);
                        stats.skipped += 1;
                        continue;
                    }
                };
                match enqueue_card(db, channel_id, thread_id, &event_key, &payload).await {
                    Ok(row_id) => {
                        stats.enqueued += 1;
                        tracing::info!(
                            stage = "cards.push.enqueued",
                            event_key = %event_key,
                            outbox_id = row_id,
                            card_type = ?card.card_type,
                        );
                    }
                    Err(e) => {
                        tracing::warn!(stage = "cards.push.enqueue_error", event_key = %event_key, error = %e);
                        stats.skipped += 1;
                    }
                }
            }
            Err(CardError::NoUsableSources) | Err(CardError::NotFound) => {
                // Not card-worthy yet; release the window so a later pass
                // can try again once enrichment lands.
                let _ = kv.del(&sent_key(&event_key)).await;
                stats.skipped += 1;
            }
            Err(e) => {
                tracing::warn!(stage = "cards.push.build_error", event_key = %event_key, error = %e);
                stats.skipped += 1;
            }
        }
    }

    tracing::info!(
        stage = "cards.push.complete",
        scanned = stats.scanned,
        enqueued = stats.enqueued,
        deduped = stats.deduped,
        skipped = stats.skipped,
    );
    stats
}
