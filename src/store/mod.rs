//! Relational store: durable rows for posts, events, signals, provider
//! cache, outbox and DLQ. SQLite in WAL mode behind an async mutex; all
//! mutation happens inside explicit transactions.

pub mod events;
pub mod models;
pub mod outbox;
pub mod provider_cache;
pub mod signals;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

pub type Db = Arc<Mutex<Connection>>;

/// Open (or create) the database file named by `DATABASE_URL` /
/// `SIGNAL_FLOW_DB`, defaulting to `signal-flow.db`.
pub fn open_from_env() -> Result<Db> {
    let path = crate::envcfg::env_opt("DATABASE_URL")
        .or_else(|| crate::envcfg::env_opt("SIGNAL_FLOW_DB"))
        .unwrap_or_else(|| "signal-flow.db".to_string());
    if path == ":memory:" {
        return open_in_memory();
    }
    open(Path::new(&path))
}

pub fn open(path: &Path) -> Result<Db> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("creating db directory")?;
        }
    }

    let conn = Connection::open(path)
        .with_context(|| format!("opening sqlite at {}", path.display()))?;

    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database for tests.
pub fn open_in_memory() -> Result<Db> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS raw_posts (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            source           TEXT NOT NULL,
            author           TEXT,
            text             TEXT NOT NULL,
            ts               TEXT NOT NULL,
            urls             TEXT NOT NULL DEFAULT '[]',
            token_ca         TEXT,
            symbol           TEXT,
            is_candidate     INTEGER NOT NULL DEFAULT 0,
            sentiment_label  TEXT,
            sentiment_score  REAL,
            keyphrases       TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_raw_posts_source_ts ON raw_posts(source, ts);

        CREATE TABLE IF NOT EXISTS events (
            event_key        TEXT PRIMARY KEY,
            type             TEXT NOT NULL,
            summary          TEXT,
            score            REAL NOT NULL DEFAULT 0,
            evidence         TEXT NOT NULL DEFAULT '[]',
            impacted_assets  TEXT NOT NULL DEFAULT '[]',
            start_ts         TEXT NOT NULL,
            last_ts          TEXT NOT NULL,
            heat_10m         INTEGER NOT NULL DEFAULT 0,
            heat_30m         INTEGER NOT NULL DEFAULT 0,
            topic_hash       TEXT,
            topic_entities   TEXT,
            candidate_score  REAL,
            token_ca         TEXT,
            symbol           TEXT
        );

        CREATE TABLE IF NOT EXISTS signals (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            event_key          TEXT NOT NULL REFERENCES events(event_key) ON DELETE CASCADE,
            type               TEXT NOT NULL,
            market_type        TEXT,
            state              TEXT NOT NULL DEFAULT 'candidate',
            goplus_risk        TEXT,
            buy_tax            REAL,
            sell_tax           REAL,
            lp_lock_days       INTEGER,
            honeypot           INTEGER,
            dex_liquidity      REAL,
            dex_volume_1h      REAL,
            heat_slope         REAL,
            onchain_asof_ts    TEXT,
            onchain_confidence REAL,
            updated_at         TEXT NOT NULL,
            ts                 TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_signals_event_key ON signals(event_key);
        CREATE INDEX IF NOT EXISTS idx_signals_state ON signals(state);

        CREATE TABLE IF NOT EXISTS signal_events (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            event_key  TEXT NOT NULL,
            type       TEXT NOT NULL,
            metadata   TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS provider_cache (
            endpoint     TEXT NOT NULL,
            chain        TEXT NOT NULL DEFAULT '-',
            key          TEXT NOT NULL,
            payload      TEXT NOT NULL,
            payload_hash TEXT NOT NULL,
            status       TEXT NOT NULL DEFAULT 'success',
            fetched_at   TEXT NOT NULL,
            expires_at   TEXT NOT NULL,
            PRIMARY KEY (endpoint, chain, key)
        );

        CREATE TABLE IF NOT EXISTS push_outbox (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id  INTEGER NOT NULL,
            thread_id   INTEGER,
            event_key   TEXT NOT NULL,
            payload     TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'pending',
            attempt     INTEGER NOT NULL DEFAULT 0,
            next_try_at TEXT,
            last_error  TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_outbox_status_next ON push_outbox(status, next_try_at);

        CREATE TABLE IF NOT EXISTS push_outbox_dlq (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            ref_id    INTEGER NOT NULL,
            snapshot  TEXT NOT NULL,
            failed_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Current UTC time as a sortable RFC 3339 string (microsecond precision).
pub fn now_ts() -> String {
    to_ts(Utc::now())
}

/// Format a UTC datetime the way the store does.
pub fn to_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, tolerating plain RFC 3339 variants.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
