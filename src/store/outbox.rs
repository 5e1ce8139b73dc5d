//! Push outbox: persist-then-send queue plus its dead-letter table.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;

use super::models::{DlqRow, OutboxRow, OutboxStatus};
use super::now_ts;

fn outbox_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxRow> {
    Ok(OutboxRow {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        thread_id: row.get(2)?,
        event_key: row.get(3)?,
        payload: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or(Value::Null),
        status: OutboxStatus::parse(&row.get::<_, String>(5)?),
        attempt: row.get(6)?,
        next_try_at: row.get(7)?,
        last_error: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

const OUTBOX_COLS: &str =
    "id, channel_id, thread_id, event_key, payload, status, attempt, next_try_at, \
     last_error, created_at, updated_at";

/// Insert a pending entry; returns its row id.
pub fn enqueue(
    conn: &Connection,
    channel_id: i64,
    thread_id: Option<i64>,
    event_key: &str,
    payload: &Value,
) -> Result<i64> {
    let now = now_ts();
    conn.execute(
        "INSERT INTO push_outbox (channel_id, thread_id, event_key, payload, status,
                                  attempt, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
        params![channel_id, thread_id, event_key, serde_json::to_string(payload)?, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Claim a batch of dispatchable rows.
///
/// Rows with `status IN (pending, retry)` and a due (or NULL) `next_try_at`,
/// ordered NULLS FIRST then `created_at`. Claimed rows have `next_try_at`
/// pushed `claim_secs` into the future inside the same transaction so a
/// concurrent dispatcher cannot pick them up; a crashed worker's claim
/// simply expires.
pub fn dequeue_batch(conn: &mut Connection, limit: usize, claim_secs: i64) -> Result<Vec<OutboxRow>> {
    let now = now_ts();
    let tx = conn.transaction()?;

    let rows = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {OUTBOX_COLS} FROM push_outbox
             WHERE status IN ('pending', 'retry')
               AND (next_try_at IS NULL OR next_try_at <= ?1)
             ORDER BY next_try_at ASC, created_at ASC
             LIMIT ?2"
        ))?;
        let mapped = stmt.query_map(params![now, limit as i64], outbox_from_row)?;
        mapped.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let claim_until = super::to_ts(chrono::Utc::now() + chrono::Duration::seconds(claim_secs));
    for row in &rows {
        tx.execute(
            "UPDATE push_outbox SET next_try_at = ?2 WHERE id = ?1",
            params![row.id, claim_until],
        )?;
    }
    tx.commit()?;
    Ok(rows)
}

pub fn mark_done(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE push_outbox SET status = 'done', updated_at = ?2 WHERE id = ?1",
        params![id, now_ts()],
    )?;
    Ok(())
}

/// Undo a dispatch claim without consuming an attempt (e.g. when rate
/// limited before the send).
pub fn release_claim(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE push_outbox SET next_try_at = ?2 WHERE id = ?1",
        params![id, now_ts()],
    )?;
    Ok(())
}

pub fn mark_retry(
    conn: &Connection,
    id: i64,
    next_try_at: &str,
    last_error: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE push_outbox
         SET status = 'retry', next_try_at = ?2, last_error = ?3,
             attempt = attempt + 1, updated_at = ?4
         WHERE id = ?1",
        params![id, next_try_at, last_error, now_ts()],
    )?;
    Ok(())
}

/// Move a row to DLQ, archiving the payload snapshot. Terminal until
/// recovery.
pub fn move_to_dlq(
    conn: &mut Connection,
    id: i64,
    last_error: Option<&str>,
    snapshot: &Value,
) -> Result<()> {
    let now = now_ts();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO push_outbox_dlq (ref_id, snapshot, failed_at) VALUES (?1, ?2, ?3)",
        params![id, serde_json::to_string(snapshot)?, now],
    )?;
    tx.execute(
        "UPDATE push_outbox SET status = 'dlq', last_error = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, last_error, now],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn count_backlog(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM push_outbox WHERE status IN ('pending', 'retry')",
        [],
        |row| row.get(0),
    )?)
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<OutboxRow>> {
    conn.query_row(
        &format!("SELECT {OUTBOX_COLS} FROM push_outbox WHERE id = ?1"),
        params![id],
        outbox_from_row,
    )
    .optional()
    .map_err(Into::into)
}

// ── DLQ ─────────────────────────────────────────────────────────────

pub fn list_dlq(conn: &Connection, limit: usize) -> Result<Vec<DlqRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, ref_id, snapshot, failed_at FROM push_outbox_dlq
         ORDER BY failed_at ASC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(DlqRow {
            id: row.get(0)?,
            ref_id: row.get(1)?,
            snapshot: serde_json::from_str(&row.get::<_, String>(2)?).unwrap_or(Value::Null),
            failed_at: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn delete_dlq(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM push_outbox_dlq WHERE id = ?1", params![id])?;
    Ok(())
}

/// Reset an outbox row from DLQ back to retryable, restoring the snapshot.
pub fn restore_from_dlq(conn: &Connection, ref_id: i64, snapshot: &Value) -> Result<()> {
    let now = now_ts();
    conn.execute(
        "UPDATE push_outbox
         SET status = 'retry', next_try_at = ?2, last_error = NULL,
             attempt = 0, payload = ?3, updated_at = ?2
         WHERE id = ?1",
        params![ref_id, now, serde_json::to_string(snapshot)?],
    )?;
    Ok(())
}
