//! Event rows: de-duplicated happenings keyed by `event_key`.
//!
//! Upserts never touch `type`, `event_key` or `start_ts`; evidence merges
//! preserve existing entries and never delete keys.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use super::models::{EventRow, EventType};

/// Fields for a fresh upsert produced by refinement.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_key: String,
    pub event_type: EventType,
    pub summary: String,
    pub score: f64,
    pub impacted_assets: Vec<String>,
    pub token_ca: Option<String>,
    pub symbol: Option<String>,
    pub topic_hash: Option<String>,
    pub topic_entities: Option<Vec<String>>,
    pub candidate_score: Option<f64>,
    pub ts: String,
}

/// Insert or refresh an event. On conflict only `score`, `summary`,
/// `evidence` and `last_ts` change; the evidence ref list is appended,
/// de-duplicated by `post_id`.
pub fn upsert_event(conn: &Connection, ev: &NewEvent, evidence_ref: Value) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT evidence FROM events WHERE event_key = ?1",
            params![ev.event_key],
            |row| row.get(0),
        )
        .optional()?;

    let evidence = match existing {
        Some(raw) => append_ref(serde_json::from_str(&raw).unwrap_or(Value::Null), evidence_ref),
        None => Value::Array(vec![evidence_ref]),
    };

    let topic_entities = ev
        .topic_entities
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO events (event_key, type, summary, score, evidence, impacted_assets,
                             start_ts, last_ts, token_ca, symbol,
                             topic_hash, topic_entities, candidate_score)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(event_key) DO UPDATE SET
             score    = excluded.score,
             summary  = excluded.summary,
             evidence = excluded.evidence,
             last_ts  = excluded.last_ts",
        params![
            ev.event_key,
            ev.event_type.as_str(),
            ev.summary,
            ev.score,
            serde_json::to_string(&evidence)?,
            serde_json::to_string(&ev.impacted_assets)?,
            ev.ts,
            ev.token_ca,
            ev.symbol,
            ev.topic_hash,
            topic_entities,
            ev.candidate_score,
        ],
    )?;
    Ok(())
}

fn append_ref(existing: Value, addition: Value) -> Value {
    let added_id = addition.get("post_id").cloned();
    match existing {
        Value::Array(mut items) => {
            let dup = added_id.is_some()
                && items.iter().any(|it| it.get("post_id") == added_id.as_ref());
            if !dup {
                items.push(addition);
            }
            Value::Array(items)
        }
        Value::Null => Value::Array(vec![addition]),
        other => Value::Array(vec![other, addition]),
    }
}

/// Merge a provider's raw response into an event's evidence.
///
/// Dict evidence gains (or replaces) the reserved key; list evidence appends
/// a `{source, <key>}` record. Existing entries are never removed.
pub fn merge_provider_evidence(
    conn: &Connection,
    event_key: &str,
    source: &str,
    reserved_key: &str,
    summary: Value,
) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT evidence FROM events WHERE event_key = ?1",
            params![event_key],
            |row| row.get(0),
        )
        .optional()?;
    let Some(raw) = existing else {
        return Ok(());
    };

    let merged = match serde_json::from_str::<Value>(&raw).unwrap_or(Value::Null) {
        Value::Object(mut map) => {
            map.insert(reserved_key.to_string(), summary);
            Value::Object(map)
        }
        Value::Array(mut items) => {
            let mut record = serde_json::Map::new();
            record.insert("source".to_string(), Value::String(source.to_string()));
            record.insert(reserved_key.to_string(), summary);
            items.push(Value::Object(record));
            Value::Array(items)
        }
        _ => {
            let mut record = serde_json::Map::new();
            record.insert("source".to_string(), Value::String(source.to_string()));
            record.insert(reserved_key.to_string(), summary);
            Value::Array(vec![Value::Object(record)])
        }
    };

    conn.execute(
        "UPDATE events SET evidence = ?1 WHERE event_key = ?2",
        params![serde_json::to_string(&merged)?, event_key],
    )?;
    Ok(())
}

pub fn get_event(conn: &Connection, event_key: &str) -> Result<Option<EventRow>> {
    conn.query_row(
        "SELECT event_key, type, summary, score, evidence, impacted_assets,
                start_ts, last_ts, heat_10m, heat_30m, topic_hash, topic_entities,
                candidate_score, token_ca, symbol
         FROM events WHERE event_key = ?1",
        params![event_key],
        |row| {
            Ok(EventRow {
                event_key: row.get(0)?,
                event_type: EventType::parse(&row.get::<_, String>(1)?),
                summary: row.get(2)?,
                score: row.get(3)?,
                evidence: serde_json::from_str(&row.get::<_, String>(4)?)
                    .unwrap_or(Value::Array(Vec::new())),
                impacted_assets: serde_json::from_str(&row.get::<_, String>(5)?)
                    .unwrap_or_default(),
                start_ts: row.get(6)?,
                last_ts: row.get(7)?,
                heat_10m: row.get(8)?,
                heat_30m: row.get(9)?,
                topic_hash: row.get(10)?,
                topic_entities: row
                    .get::<_, Option<String>>(11)?
                    .and_then(|raw| serde_json::from_str(&raw).ok()),
                candidate_score: row.get(12)?,
                token_ca: row.get(13)?,
                symbol: row.get(14)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// One topic-tagged event inside the aggregation window.
#[derive(Debug, Clone)]
pub struct TopicTaggedEvent {
    pub event_key: String,
    pub topic_hash: String,
    pub entities: Vec<String>,
    pub last_ts: String,
}

/// Events carrying a topic tag with `last_ts` inside the window, newest
/// first. Grouping by hash happens in code rather than GROUP_CONCAT so the
/// entity JSON arrays survive intact.
pub fn list_topic_tagged(conn: &Connection, since_ts: &str) -> Result<Vec<TopicTaggedEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_key, topic_hash, topic_entities, last_ts
         FROM events
         WHERE topic_hash IS NOT NULL AND last_ts >= ?1
         ORDER BY last_ts DESC",
    )?;
    let rows = stmt.query_map(params![since_ts], |row| {
        Ok(TopicTaggedEvent {
            event_key: row.get(0)?,
            topic_hash: row.get(1)?,
            entities: row
                .get::<_, Option<String>>(2)?
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default(),
            last_ts: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Write aggregated heat back onto every event sharing a topic hash.
pub fn update_topic_heat(
    conn: &Connection,
    topic_hash: &str,
    heat_10m: i64,
    heat_30m: i64,
    candidate_score: f64,
) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE events
         SET heat_10m = ?2, heat_30m = ?3, candidate_score = ?4
         WHERE topic_hash = ?1",
        params![topic_hash, heat_10m, heat_30m, candidate_score],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;

    fn event(key: &str, ty: EventType) -> NewEvent {
        NewEvent {
            event_key: key.to_string(),
            event_type: ty,
            summary: "first".to_string(),
            score: 0.5,
            impacted_assets: vec!["PEPE".to_string()],
            token_ca: None,
            symbol: Some("PEPE".to_string()),
            topic_hash: None,
            topic_entities: None,
            candidate_score: None,
            ts: store::now_ts(),
        }
    }

    #[test]
    fn upsert_preserves_type_and_start_ts() {
        let db = store::open_in_memory().unwrap();
        let conn = db.try_lock().unwrap();

        let first = event("ABCD1234", EventType::Token);
        upsert_event(&conn, &first, serde_json::json!({"post_id": 1})).unwrap();

        let mut second = event("ABCD1234", EventType::Airdrop);
        second.summary = "second".to_string();
        second.score = 0.9;
        upsert_event(&conn, &second, serde_json::json!({"post_id": 2})).unwrap();

        let row = get_event(&conn, "ABCD1234").unwrap().unwrap();
        assert_eq!(row.event_type, EventType::Token);
        assert_eq!(row.start_ts, first.ts);
        assert_eq!(row.summary.as_deref(), Some("second"));
        assert_eq!(row.score, 0.9);
        assert_eq!(row.evidence.as_array().unwrap().len(), 2);
    }

    #[test]
    fn evidence_refs_dedup_by_post_id() {
        let db = store::open_in_memory().unwrap();
        let conn = db.try_lock().unwrap();

        let ev = event("ABCD1234", EventType::Token);
        upsert_event(&conn, &ev, serde_json::json!({"post_id": 1})).unwrap();
        upsert_event(&conn, &ev, serde_json::json!({"post_id": 1})).unwrap();

        let row = get_event(&conn, "ABCD1234").unwrap().unwrap();
        assert_eq!(row.evidence.as_array().unwrap().len(), 1);
    }

    #[test]
    fn provider_merge_appends_to_list_evidence() {
        let db = store::open_in_memory().unwrap();
        let conn = db.try_lock().unwrap();

        let ev = event("ABCD1234", EventType::Token);
        upsert_event(&conn, &ev, serde_json::json!({"post_id": 1})).unwrap();
        merge_provider_evidence(
            &conn,
            "ABCD1234",
            "goplus",
            "goplus_raw",
            serde_json::json!({"risk_label": "green"}),
        )
        .unwrap();

        let row = get_event(&conn, "ABCD1234").unwrap().unwrap();
        let items = row.evidence.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["source"], "goplus");
        assert_eq!(items[1]["goplus_raw"]["risk_label"], "green");
    }
}
