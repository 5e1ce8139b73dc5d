//! Shared key-value service.
//!
//! Two backends behind one closed enum: a Redis connection manager for real
//! deployments and an in-process map used when Redis is absent and in tests.
//! Dedup and rate-limit callers treat errors as best-effort; distributed-lock
//! callers must treat an error as "do not proceed".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

use crate::envcfg;

const RELEASE_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

/// Outcome of a compare-and-delete lock release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    Ok,
    Mismatch,
    Expired,
    Error,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Ok => "ok",
            ReleaseStatus::Mismatch => "mismatch",
            ReleaseStatus::Expired => "expired",
            ReleaseStatus::Error => "error",
        }
    }
}

#[derive(Default)]
pub struct MemoryState {
    strings: HashMap<String, (String, Option<Instant>)>,
    zsets: HashMap<String, Vec<(f64, String)>>,
}

impl MemoryState {
    fn live(&mut self, key: &str) -> Option<String> {
        match self.strings.get(key) {
            Some((_, Some(exp))) if *exp <= Instant::now() => {
                self.strings.remove(key);
                None
            }
            Some((v, _)) => Some(v.clone()),
            None => None,
        }
    }
}

/// Shared KV handle. Cloning is cheap for both backends.
#[derive(Clone)]
pub enum Kv {
    Redis(ConnectionManager),
    Memory(Arc<Mutex<MemoryState>>),
}

impl Kv {
    /// Connect to `REDIS_URL`, falling back to the in-process backend when
    /// the URL is unset or the server is unreachable.
    pub async fn connect() -> Kv {
        let Some(url) = envcfg::env_opt("REDIS_URL") else {
            tracing::info!(stage = "kv.connect", backend = "memory", reason = "no_url");
            return Kv::memory();
        };

        match Self::connect_redis(&url).await {
            Ok(kv) => {
                tracing::info!(stage = "kv.connect", backend = "redis");
                kv
            }
            Err(e) => {
                tracing::warn!(stage = "kv.connect", backend = "memory", error = %e);
                Kv::memory()
            }
        }
    }

    async fn connect_redis(url: &str) -> Result<Kv> {
        let connect_ms = envcfg::env_u64("REDIS_CONNECT_TIMEOUT_MS", 1000);
        let socket_ms = envcfg::env_u64("REDIS_SOCKET_TIMEOUT_MS", 2000);

        let client = redis::Client::open(url).context("parsing redis url")?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_millis(connect_ms))
            .set_response_timeout(Duration::from_millis(socket_ms))
            .set_number_of_retries(1);

        let mut manager = tokio::time::timeout(
            Duration::from_millis(connect_ms.max(socket_ms)),
            ConnectionManager::new_with_config(client, config),
        )
        .await
        .context("redis connect timed out")??;

        redis::cmd("PING")
            .query_async::<String>(&mut manager)
            .await
            .context("redis ping failed")?;

        Ok(Kv::Redis(manager))
    }

    /// A fresh in-process backend (used in tests and degraded mode).
    pub fn memory() -> Kv {
        Kv::Memory(Arc::new(Mutex::new(MemoryState::default())))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            Kv::Redis(m) => Ok(m.clone().get(key).await?),
            Kv::Memory(s) => Ok(s.lock().unwrap().live(key)),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        match self {
            Kv::Redis(m) => Ok(m.clone().set(key, value).await?),
            Kv::Memory(s) => {
                s.lock()
                    .unwrap()
                    .strings
                    .insert(key.to_string(), (value.to_string(), None));
                Ok(())
            }
        }
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        match self {
            Kv::Redis(m) => Ok(m.clone().set_ex(key, value, ttl_secs).await?),
            Kv::Memory(s) => {
                let exp = Instant::now() + Duration::from_secs(ttl_secs);
                s.lock()
                    .unwrap()
                    .strings
                    .insert(key.to_string(), (value.to_string(), Some(exp)));
                Ok(())
            }
        }
    }

    /// `SET key value NX EX ttl`; returns true when the key was set.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        match self {
            Kv::Redis(m) => {
                let mut con = m.clone();
                let res: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async(&mut con)
                    .await?;
                Ok(res.is_some())
            }
            Kv::Memory(s) => {
                let mut state = s.lock().unwrap();
                if state.live(key).is_some() {
                    return Ok(false);
                }
                let exp = Instant::now() + Duration::from_secs(ttl_secs);
                state
                    .strings
                    .insert(key.to_string(), (value.to_string(), Some(exp)));
                Ok(true)
            }
        }
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        match self {
            Kv::Redis(m) => Ok(m.clone().del(key).await?),
            Kv::Memory(s) => {
                s.lock().unwrap().strings.remove(key);
                Ok(())
            }
        }
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        match self {
            Kv::Redis(m) => Ok(m.clone().incr(key, 1i64).await?),
            Kv::Memory(s) => {
                let mut state = s.lock().unwrap();
                let current = state.live(key).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
                let next = current + 1;
                let exp = state.strings.get(key).and_then(|(_, e)| *e);
                state.strings.insert(key.to_string(), (next.to_string(), exp));
                Ok(next)
            }
        }
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        match self {
            Kv::Redis(m) => Ok(m.clone().expire(key, ttl_secs as i64).await?),
            Kv::Memory(s) => {
                let mut state = s.lock().unwrap();
                if let Some((v, _)) = state.strings.get(key).cloned() {
                    let exp = Instant::now() + Duration::from_secs(ttl_secs);
                    state.strings.insert(key.to_string(), (v, Some(exp)));
                }
                Ok(())
            }
        }
    }

    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Kv::Redis(m) => {
                let mut con = m.clone();
                let mut cmd = redis::cmd("MGET");
                for k in keys {
                    cmd.arg(k);
                }
                Ok(cmd.query_async(&mut con).await?)
            }
            Kv::Memory(s) => {
                let mut state = s.lock().unwrap();
                Ok(keys.iter().map(|k| state.live(k)).collect())
            }
        }
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        match self {
            Kv::Redis(m) => Ok(m.clone().zadd(key, member, score).await?),
            Kv::Memory(s) => {
                let mut state = s.lock().unwrap();
                let set = state.zsets.entry(key.to_string()).or_default();
                set.retain(|(_, m2)| m2 != member);
                set.push((score, member.to_string()));
                Ok(())
            }
        }
    }

    pub async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        match self {
            Kv::Redis(m) => Ok(m.clone().zcount(key, min, max).await?),
            Kv::Memory(s) => {
                let state = s.lock().unwrap();
                Ok(state
                    .zsets
                    .get(key)
                    .map(|set| set.iter().filter(|(sc, _)| *sc >= min && *sc <= max).count() as u64)
                    .unwrap_or(0))
            }
        }
    }

    pub async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        match self {
            Kv::Redis(m) => Ok(m.clone().zrembyscore(key, min, max).await?),
            Kv::Memory(s) => {
                let mut state = s.lock().unwrap();
                if let Some(set) = state.zsets.get_mut(key) {
                    let before = set.len();
                    set.retain(|(sc, _)| *sc < min || *sc > max);
                    return Ok((before - set.len()) as u64);
                }
                Ok(0)
            }
        }
    }

    /// Release a token lock: delete the key only if it still holds `token`.
    pub async fn compare_and_delete(&self, key: &str, token: &str) -> ReleaseStatus {
        match self {
            Kv::Redis(m) => {
                let mut con = m.clone();
                let script = redis::Script::new(RELEASE_SCRIPT);
                let res: Result<i64, _> =
                    script.key(key).arg(token).invoke_async(&mut con).await;
                match res {
                    Ok(1) => ReleaseStatus::Ok,
                    Ok(_) => match self.get(key).await {
                        Ok(None) => ReleaseStatus::Expired,
                        Ok(Some(_)) => ReleaseStatus::Mismatch,
                        Err(_) => ReleaseStatus::Error,
                    },
                    Err(_) => ReleaseStatus::Error,
                }
            }
            Kv::Memory(s) => {
                let mut state = s.lock().unwrap();
                match state.live(key) {
                    Some(v) if v == token => {
                        state.strings.remove(key);
                        ReleaseStatus::Ok
                    }
                    Some(_) => ReleaseStatus::Mismatch,
                    None => ReleaseStatus::Expired,
                }
            }
        }
    }

    /// Fixed-window counter: INCR the key and arm its TTL on first hit.
    /// Returns the count within the current window.
    pub async fn incr_window(&self, key: &str, window_secs: u64) -> Result<i64> {
        let count = self.incr(key).await?;
        if count == 1 {
            self.expire(key, window_secs).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_respects_existing_keys() {
        let kv = Kv::memory();
        assert!(kv.set_nx_ex("k", "a", 60).await.unwrap());
        assert!(!kv.set_nx_ex("k", "b", 60).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn compare_and_delete_distinguishes_outcomes() {
        let kv = Kv::memory();
        kv.set_ex("lock", "tok", 60).await.unwrap();
        assert_eq!(kv.compare_and_delete("lock", "other").await, ReleaseStatus::Mismatch);
        assert_eq!(kv.compare_and_delete("lock", "tok").await, ReleaseStatus::Ok);
        assert_eq!(kv.compare_and_delete("lock", "tok").await, ReleaseStatus::Expired);
    }

    #[tokio::test]
    async fn zset_roundtrip() {
        let kv = Kv::memory();
        kv.zadd("z", "a", 1.0).await.unwrap();
        kv.zadd("z", "b", 5.0).await.unwrap();
        assert_eq!(kv.zcount("z", 0.0, 2.0).await.unwrap(), 1);
        assert_eq!(kv.zremrangebyscore("z", 0.0, 10.0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn incr_counts_within_window() {
        let kv = Kv::memory();
        assert_eq!(kv.incr_window("w", 60).await.unwrap(), 1);
        assert_eq!(kv.incr_window("w", 60).await.unwrap(), 2);
    }
}
