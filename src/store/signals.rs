//! Signal rows: per-event enrichment snapshots feeding the rule engine and
//! the on-chain verifier.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::{RiskLabel, SignalRow, SignalState};

fn signal_from_row(row: &Row<'_>) -> rusqlite::Result<SignalRow> {
    Ok(SignalRow {
        id: row.get(0)?,
        event_key: row.get(1)?,
        signal_type: row.get(2)?,
        market_type: row.get(3)?,
        state: SignalState::parse(&row.get::<_, String>(4)?),
        goplus_risk: row
            .get::<_, Option<String>>(5)?
            .map(|s| RiskLabel::parse(&s)),
        buy_tax: row.get(6)?,
        sell_tax: row.get(7)?,
        lp_lock_days: row.get(8)?,
        honeypot: row.get::<_, Option<i64>>(9)?.map(|v| v != 0),
        dex_liquidity: row.get(10)?,
        dex_volume_1h: row.get(11)?,
        heat_slope: row.get(12)?,
        onchain_asof_ts: row.get(13)?,
        onchain_confidence: row.get(14)?,
        updated_at: row.get(15)?,
        ts: row.get(16)?,
    })
}

const SIGNAL_COLS: &str = "id, event_key, type, market_type, state, goplus_risk, buy_tax, \
                           sell_tax, lp_lock_days, honeypot, dex_liquidity, dex_volume_1h, \
                           heat_slope, onchain_asof_ts, onchain_confidence, updated_at, ts";

/// Create the candidate signal for an event if none exists yet.
pub fn ensure_candidate(
    conn: &Connection,
    event_key: &str,
    signal_type: &str,
    market_type: &str,
    ts: &str,
) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT id FROM signals WHERE event_key = ?1 LIMIT 1",
            params![event_key],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Ok(());
    }

    conn.execute(
        "INSERT INTO signals (event_key, type, market_type, state, updated_at, ts)
         VALUES (?1, ?2, ?3, 'candidate', ?4, ?4)",
        params![event_key, signal_type, market_type, ts],
    )?;
    Ok(())
}

pub fn get_by_event(conn: &Connection, event_key: &str) -> Result<Option<SignalRow>> {
    conn.query_row(
        &format!("SELECT {SIGNAL_COLS} FROM signals WHERE event_key = ?1 ORDER BY id DESC LIMIT 1"),
        params![event_key],
        signal_from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Candidates awaiting verification: state = candidate, created between
/// `oldest_ts` and `newest_ts` (both stored-format strings), newest first.
pub fn list_candidates(
    conn: &Connection,
    oldest_ts: &str,
    newest_ts: &str,
    limit: usize,
) -> Result<Vec<SignalRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SIGNAL_COLS} FROM signals
         WHERE state = 'candidate' AND ts >= ?1 AND ts <= ?2
         ORDER BY ts DESC LIMIT ?3"
    ))?;
    let rows = stmt.query_map(params![oldest_ts, newest_ts, limit as i64], signal_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// A scanner work item: signal id/key plus the owning event's asset fields.
#[derive(Debug, Clone)]
pub struct ScanItem {
    pub signal_id: i64,
    pub event_key: String,
    pub symbol: Option<String>,
    pub token_ca: Option<String>,
    pub evidence: serde_json::Value,
}

fn scan_item(row: &Row<'_>) -> rusqlite::Result<ScanItem> {
    Ok(ScanItem {
        signal_id: row.get(0)?,
        event_key: row.get(1)?,
        symbol: row.get(2)?,
        token_ca: row.get(3)?,
        evidence: serde_json::from_str(&row.get::<_, String>(4)?)
            .unwrap_or(serde_json::Value::Array(Vec::new())),
    })
}

/// Signals the security scanner has not touched yet.
pub fn list_security_pending(conn: &Connection, limit: usize) -> Result<Vec<ScanItem>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.event_key, e.symbol, e.token_ca, e.evidence
         FROM signals s JOIN events e ON e.event_key = s.event_key
         WHERE s.goplus_risk IS NULL
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], scan_item)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Signals the market scanner has not touched yet.
pub fn list_dex_pending(conn: &Connection, limit: usize) -> Result<Vec<ScanItem>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.event_key, e.symbol, e.token_ca, e.evidence
         FROM signals s JOIN events e ON e.event_key = s.event_key
         WHERE s.dex_liquidity IS NULL AND e.token_ca IS NOT NULL
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], scan_item)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Outcome of a topic-signal upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicSignalOutcome {
    Created,
    Updated,
    SkippedNonTopic,
}

/// Create or refresh the topic signal for a topic-tagged event. An existing
/// non-topic signal is left alone.
pub fn upsert_topic_signal(
    conn: &Connection,
    event_key: &str,
    heat_slope: f64,
    ts: &str,
) -> Result<TopicSignalOutcome> {
    let existing: Option<(i64, Option<String>)> = conn
        .query_row(
            "SELECT id, market_type FROM signals WHERE event_key = ?1 LIMIT 1",
            params![event_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match existing {
        Some((id, market_type)) => {
            if market_type.as_deref() != Some("topic") {
                return Ok(TopicSignalOutcome::SkippedNonTopic);
            }
            conn.execute(
                "UPDATE signals SET heat_slope = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, heat_slope, ts],
            )?;
            Ok(TopicSignalOutcome::Updated)
        }
        None => {
            conn.execute(
                "INSERT INTO signals (event_key, type, market_type, state, heat_slope,
                                      updated_at, ts)
                 VALUES (?1, 'topic', 'topic', 'candidate', ?2, ?3, ?3)",
                params![event_key, heat_slope, ts],
            )?;
            Ok(TopicSignalOutcome::Created)
        }
    }
}

/// Event keys whose signals are enriched enough to attempt a card build:
/// security or market columns filled, and not rejected.
pub fn list_pushable(conn: &Connection, limit: usize) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT event_key FROM signals
         WHERE state != 'rejected'
           AND (goplus_risk IS NOT NULL OR dex_liquidity IS NOT NULL)
         ORDER BY updated_at DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn update_security(
    conn: &Connection,
    signal_id: i64,
    risk: RiskLabel,
    buy_tax: Option<f64>,
    sell_tax: Option<f64>,
    lp_lock_days: Option<i64>,
    honeypot: Option<bool>,
    now: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE signals
         SET goplus_risk = ?2, buy_tax = ?3, sell_tax = ?4, lp_lock_days = ?5,
             honeypot = ?6, updated_at = ?7
         WHERE id = ?1",
        params![
            signal_id,
            risk.as_str(),
            buy_tax,
            sell_tax,
            lp_lock_days,
            honeypot.map(|b| b as i64),
            now
        ],
    )?;
    Ok(())
}

pub fn update_dex(
    conn: &Connection,
    signal_id: i64,
    liquidity: Option<f64>,
    volume_1h: Option<f64>,
    now: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE signals SET dex_liquidity = ?2, dex_volume_1h = ?3, updated_at = ?4 WHERE id = ?1",
        params![signal_id, liquidity, volume_1h, now],
    )?;
    Ok(())
}

/// Compare-and-set state update. The row changes only when its state still
/// matches `prev_state` (unless CAS is disabled); returns affected rows.
#[allow(clippy::too_many_arguments)]
pub fn cas_update_state(
    conn: &Connection,
    event_key: &str,
    prev_state: SignalState,
    new_state: SignalState,
    onchain_asof_ts: Option<&str>,
    onchain_confidence: f64,
    cas_enabled: bool,
    now: &str,
) -> Result<usize> {
    let affected = if cas_enabled {
        conn.execute(
            "UPDATE signals
             SET onchain_asof_ts = ?3, onchain_confidence = ?4, state = ?5, updated_at = ?6
             WHERE event_key = ?1 AND state = ?2",
            params![
                event_key,
                prev_state.as_str(),
                onchain_asof_ts,
                onchain_confidence,
                new_state.as_str(),
                now
            ],
        )?
    } else {
        conn.execute(
            "UPDATE signals
             SET onchain_asof_ts = ?2, onchain_confidence = ?3, state = ?4, updated_at = ?5
             WHERE event_key = ?1",
            params![
                event_key,
                onchain_asof_ts,
                onchain_confidence,
                new_state.as_str(),
                now
            ],
        )?
    };
    Ok(affected)
}

/// Append a verifier audit row.
pub fn insert_signal_event(
    conn: &Connection,
    event_key: &str,
    event_type: &str,
    metadata: &serde_json::Value,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO signal_events (event_key, type, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![event_key, event_type, serde_json::to_string(metadata)?, now],
    )?;
    Ok(())
}

pub fn count_signal_events(conn: &Connection, event_key: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM signal_events WHERE event_key = ?1",
        params![event_key],
        |row| row.get(0),
    )?)
}
