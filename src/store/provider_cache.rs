//! Durable tier of the provider cache, keyed by `(endpoint, chain, key)`
//! with the most recent fetch winning.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use sha1::{Digest, Sha1};

use super::now_ts;

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub payload: String,
    pub status: String,
    pub fetched_at: String,
    pub expires_at: String,
}

pub fn get(
    conn: &Connection,
    endpoint: &str,
    chain: Option<&str>,
    key: &str,
) -> Result<Option<CacheHit>> {
    conn.query_row(
        "SELECT payload, status, fetched_at, expires_at
         FROM provider_cache
         WHERE endpoint = ?1 AND chain = ?2 AND key = ?3",
        params![endpoint, chain.unwrap_or("-"), key],
        |row| {
            Ok(CacheHit {
                payload: row.get(0)?,
                status: row.get(1)?,
                fetched_at: row.get(2)?,
                expires_at: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn put(
    conn: &Connection,
    endpoint: &str,
    chain: Option<&str>,
    key: &str,
    payload: &str,
    status: &str,
    expires_at: &str,
) -> Result<()> {
    let mut hasher = Sha1::new();
    hasher.update(payload.as_bytes());
    let payload_hash = format!("{:x}", hasher.finalize());

    conn.execute(
        "INSERT INTO provider_cache (endpoint, chain, key, payload, payload_hash, status,
                                     fetched_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(endpoint, chain, key) DO UPDATE SET
             payload      = excluded.payload,
             payload_hash = excluded.payload_hash,
             status       = excluded.status,
             fetched_at   = excluded.fetched_at,
             expires_at   = excluded.expires_at",
        params![
            endpoint,
            chain.unwrap_or("-"),
            key,
            payload,
            payload_hash,
            status,
            now_ts(),
            expires_at
        ],
    )?;
    Ok(())
}
