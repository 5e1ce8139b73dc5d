//! Outbox dispatcher: persist-then-send with retry, DLQ routing and
//! recovery. Exactly-once delivery comes from the idempotency key; ordering
//! within a row comes from the claim made at dequeue time.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::envcfg;
use crate::kv::Kv;
use crate::messaging::{self, Messenger};
use crate::metrics;
use crate::store::models::{OutboxRow, OutboxStatus};
use crate::store::{Db, outbox as repo};

/// Idempotency window.
pub const DEDUP_TTL_SECS: u64 = 5400;

const RATE_WINDOW_SECS: u64 = 1;
const RATE_RECHECK_MS: u64 = 50;

/// `cards:idemp:sha1("{event_key}|{channel_id}|{template_v}")`.
pub fn idempotency_key(event_key: &str, channel_id: i64, template_v: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{event_key}|{channel_id}|{template_v}").as_bytes());
    format!("cards:idemp:{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub template_v: String,
    pub batch_limit: usize,
    pub rate_limit_per_sec: i64,
    pub max_wait_ms: u64,
    pub dedup_ttl_secs: u64,
    pub snapshot_dir: PathBuf,
    pub claim_secs: i64,
    pub parse_mode: String,
}

impl DispatcherConfig {
    pub fn from_env() -> DispatcherConfig {
        DispatcherConfig {
            template_v: envcfg::env_str("CARDS_TEMPLATE_V", "v1"),
            batch_limit: envcfg::env_usize("OUTBOX_BATCH_LIMIT", 50),
            rate_limit_per_sec: envcfg::env_i64("TG_RATE_LIMIT", 20),
            max_wait_ms: envcfg::env_u64("TG_RATE_MAX_WAIT_MS", 1000),
            dedup_ttl_secs: envcfg::env_u64("CARDS_DEDUP_TTL_S", DEDUP_TTL_SECS),
            snapshot_dir: PathBuf::from(envcfg::env_str("CARD_SNAPSHOT_DIR", "/tmp/cards")),
            claim_secs: 60,
            parse_mode: "HTML".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct DispatchStats {
    pub processed: usize,
    pub sent: usize,
    pub retried: usize,
    pub dlq: usize,
    pub deduped: usize,
    pub rate_limited: usize,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RecoverStats {
    pub scanned: usize,
    pub recovered: usize,
    pub discarded: usize,
    pub skipped: usize,
}

/// Insert a card payload into the outbox; returns the row id.
pub async fn enqueue_card(
    db: &Db,
    channel_id: i64,
    thread_id: Option<i64>,
    event_key: &str,
    payload: &Value,
) -> Result<i64> {
    let conn = db.lock().await;
    repo::enqueue(&conn, channel_id, thread_id, event_key, payload)
}

pub struct Dispatcher {
    db: Db,
    kv: Kv,
    messenger: Box<dyn Messenger>,
    cfg: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(db: Db, kv: Kv, messenger: Box<dyn Messenger>, cfg: DispatcherConfig) -> Dispatcher {
        Dispatcher {
            db,
            kv,
            messenger,
            cfg,
        }
    }

    /// One dispatch pass over the due batch.
    pub async fn dispatch_once(&self) -> DispatchStats {
        let mut stats = DispatchStats::default();

        self.update_backlog_gauge().await;

        let rows = {
            let mut conn = self.db.lock().await;
            match repo::dequeue_batch(&mut conn, self.cfg.batch_limit, self.cfg.claim_secs) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(stage = "outbox.dequeue_error", error = %e);
                    return stats;
                }
            }
        };

        for row in rows {
            stats.processed += 1;
            if let Err(e) = self.process_row(&row, &mut stats).await {
                tracing::warn!(stage = "outbox.process_error", outbox_id = row.id, error = %e);
                let attempt = row.attempt + 1;
                let next = backoff_time(attempt);
                let conn = self.db.lock().await;
                let _ = repo::mark_retry(&conn, row.id, &next, Some(&format!("processing error: {e}")));
            }
        }

        self.update_backlog_gauge().await;
        stats
    }

    async fn process_row(&self, row: &OutboxRow, stats: &mut DispatchStats) -> Result<()> {
        // Rate limits first: spin-wait a bounded time, then leave the row
        // for a later pass.
        if !self.acquire_send_slot(row.channel_id).await {
            stats.rate_limited += 1;
            let conn = self.db.lock().await;
            repo::release_claim(&conn, row.id)?;
            return Ok(());
        }

        // Idempotency: a key already present means this card went out.
        let idem_key = idempotency_key(&row.event_key, row.channel_id, &self.cfg.template_v);
        match self
            .kv
            .set_nx_ex(&idem_key, "1", self.cfg.dedup_ttl_secs)
            .await
        {
            Ok(false) => {
                tracing::info!(stage = "outbox.idempotent_hit", event_key = %row.event_key);
                let conn = self.db.lock().await;
                repo::mark_done(&conn, row.id)?;
                stats.deduped += 1;
                return Ok(());
            }
            Ok(true) => {}
            Err(e) => {
                tracing::warn!(stage = "outbox.idempotency_error", error = %e);
            }
        }

        let text = extract_text(&row.payload);
        let started = Instant::now();
        let outcome = self
            .messenger
            .send_message(
                &row.channel_id.to_string(),
                &text,
                &self.cfg.parse_mode,
                false,
            )
            .await;
        metrics::TELEGRAM_SEND_LATENCY_MS.observe(started.elapsed().as_millis() as f64);

        if outcome.ok {
            metrics::TELEGRAM_SEND_TOTAL
                .with_label_values(&["ok", "ok"])
                .inc();
            let conn = self.db.lock().await;
            repo::mark_done(&conn, row.id)?;
            stats.sent += 1;
            return Ok(());
        }

        // Failure classification.
        let status = outcome
            .status_code
            .or_else(|| outcome.error_code.and_then(|c| u16::try_from(c).ok()));
        let attempt = row.attempt + 1;

        // The send did not land; release the idempotency claim so the
        // retry is not mistaken for an already-delivered card.
        let _ = self.kv.del(&idem_key).await;

        let code_label = match status {
            Some(429) => "429",
            Some(s) if (500..600).contains(&s) => "5xx",
            Some(s) if (400..500).contains(&s) => "4xx",
            Some(_) => "unknown",
            None => "net",
        };
        metrics::TELEGRAM_SEND_TOTAL
            .with_label_values(&["err", code_label])
            .inc();

        self.write_snapshot(row, &outcome, code_label);

        match status {
            Some(429) => {
                let delay = outcome
                    .retry_after
                    .map(|s| s as f64)
                    .unwrap_or_else(|| rand::rng().random_range(3.0..5.0));
                let next = crate::store::to_ts(
                    Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64),
                );
                metrics::TELEGRAM_RETRY_TOTAL.inc();
                let conn = self.db.lock().await;
                repo::mark_retry(&conn, row.id, &next, outcome.error.as_deref())?;
                stats.retried += 1;
            }
            Some(s) if (400..500).contains(&s) => {
                // Permanent client error: snapshot + DLQ.
                metrics::CARDS_PUSH_FAIL_TOTAL
                    .with_label_values(&["4xx"])
                    .inc();
                let mut conn = self.db.lock().await;
                repo::move_to_dlq(&mut conn, row.id, outcome.error.as_deref(), &row.payload)?;
                stats.dlq += 1;
            }
            _ => {
                // 5xx, network, timeout or unknown: exponential backoff.
                metrics::TELEGRAM_RETRY_TOTAL.inc();
                let next = backoff_time(attempt);
                let conn = self.db.lock().await;
                repo::mark_retry(&conn, row.id, &next, outcome.error.as_deref())?;
                stats.retried += 1;
            }
        }

        Ok(())
    }

    /// Per-channel and global fixed windows; spin-wait up to `max_wait_ms`.
    async fn acquire_send_slot(&self, channel_id: i64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(self.cfg.max_wait_ms);
        loop {
            match self.try_send_slot(channel_id).await {
                Ok(true) => return true,
                Ok(false) => {}
                // Best-effort: a broken KV must not halt delivery.
                Err(e) => {
                    tracing::warn!(stage = "outbox.rate_error", error = %e);
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(RATE_RECHECK_MS)).await;
        }
    }

    async fn try_send_slot(&self, channel_id: i64) -> Result<bool> {
        let bucket = Utc::now().timestamp();
        let global_key = format!("rate:tg:global:{bucket}");
        let channel_key = format!("rate:tg:channel:{channel_id}:{bucket}");

        let global = self.kv.incr_window(&global_key, RATE_WINDOW_SECS * 2).await?;
        if global > self.cfg.rate_limit_per_sec {
            return Ok(false);
        }
        let channel = self.kv.incr_window(&channel_key, RATE_WINDOW_SECS * 2).await?;
        Ok(channel <= self.cfg.rate_limit_per_sec)
    }

    fn write_snapshot(&self, row: &OutboxRow, outcome: &crate::messaging::SendOutcome, code: &str) {
        let ts = Utc::now().timestamp_millis();
        let event_short: String = row
            .event_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .take(16)
            .collect();
        let trace = crate::logs::new_trace_id();
        let name = format!("{ts}_{event_short}_{}_{}.json", row.attempt + 1, &trace[..8]);

        let snapshot = serde_json::json!({
            "event_key": row.event_key,
            "channel_id": row.channel_id,
            "payload": row.payload,
            "attempt": row.attempt + 1,
            "error_code": code,
            "error_msg": outcome.error,
            "trace_id": trace,
            "ts": ts,
        });

        if std::fs::create_dir_all(&self.cfg.snapshot_dir).is_ok() {
            let path = self.cfg.snapshot_dir.join(name);
            if let Err(e) = std::fs::write(&path, snapshot.to_string()) {
                tracing::warn!(stage = "outbox.snapshot_error", error = %e);
            }
        }
    }

    async fn update_backlog_gauge(&self) {
        let conn = self.db.lock().await;
        if let Ok(count) = repo::count_backlog(&conn) {
            metrics::OUTBOX_BACKLOG.set(count as f64);
            metrics::QUEUE_BACKLOG
                .with_label_values(&["outbox"])
                .set(count as f64);
        }
    }

    /// DLQ recovery: rows within the retention window are reset to retry
    /// with their archived payload; older rows are discarded.
    pub async fn recover_dlq_once(&self, limit: usize, max_age_secs: i64) -> RecoverStats {
        let mut stats = RecoverStats::default();
        let cutoff = crate::store::to_ts(Utc::now() - chrono::Duration::seconds(max_age_secs));

        let conn = self.db.lock().await;
        let rows = match repo::list_dlq(&conn, limit) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(stage = "dlq.recover_error", error = %e);
                return stats;
            }
        };
        stats.scanned = rows.len();

        for dlq in rows {
            if dlq.failed_at < cutoff {
                let _ = repo::delete_dlq(&conn, dlq.id);
                stats.discarded += 1;
                continue;
            }

            let outbox_row = match repo::get(&conn, dlq.ref_id) {
                Ok(Some(row)) => row,
                _ => {
                    let _ = repo::delete_dlq(&conn, dlq.id);
                    stats.discarded += 1;
                    continue;
                }
            };

            if outbox_row.status != OutboxStatus::Dlq {
                // Already recovered by another path; drop only the snapshot.
                let _ = repo::delete_dlq(&conn, dlq.id);
                stats.skipped += 1;
                continue;
            }

            if repo::restore_from_dlq(&conn, dlq.ref_id, &dlq.snapshot).is_ok() {
                let _ = repo::delete_dlq(&conn, dlq.id);
                stats.recovered += 1;
            }
        }

        if stats.recovered > 0 {
            metrics::DLQ_RECOVERED_COUNT.inc_by(stats.recovered as u64);
        }
        if stats.discarded > 0 {
            metrics::DLQ_DISCARDED_COUNT.inc_by(stats.discarded as u64);
        }

        tracing::info!(
            stage = "dlq.recover",
            scanned = stats.scanned,
            recovered = stats.recovered,
            discarded = stats.discarded,
            skipped = stats.skipped,
        );
        stats
    }
}

/// Retry time `min(2^attempt · 2 s, 600 s)` with ±30 % jitter.
fn backoff_time(attempt: i64) -> String {
    let base = (2f64.powi(attempt.min(30) as i32) * 2.0).min(600.0);
    let jitter = rand::rng().random_range(0.7..1.3);
    let delay = base * jitter;
    crate::store::to_ts(Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64))
}

/// The dispatchable text: a rendered card, a plain text field, or the raw
/// payload.
fn extract_text(payload: &Value) -> String {
    let text = payload
        .pointer("/rendered/tg")
        .and_then(|v| v.as_str())
        .map(String::from)
        .or_else(|| payload.get("text").and_then(|v| v.as_str()).map(String::from))
        .or_else(|| {
            payload
                .get("summary")
                .and_then(|v| v.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| payload.to_string());
    text.chars().take(messaging::MAX_TEXT_LEN).collect()
}
