//! DEX market snapshots with dual-source fall-through.
//!
//! Primary DexScreener, secondary GeckoTerminal, a 5-minute-bucket snapshot
//! cache and a 24 h `last_ok` cache that serves as the final degradation
//! step when both upstreams fail.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProviderError;
use crate::envcfg;
use crate::kv::Kv;

const DEXSCREENER_BASE: &str = "https://api.dexscreener.com/latest/dex";
const GECKO_BASE: &str = "https://api.geckoterminal.com/api/v2";

const LAST_OK_TTL_S: u64 = 86_400;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OhlcFrame {
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ohlc {
    pub m5: Option<OhlcFrame>,
    pub h1: Option<OhlcFrame>,
    pub h24: Option<OhlcFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexSnapshot {
    pub price_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub fdv: Option<f64>,
    pub market_cap: Option<f64>,
    pub volume_1h: Option<f64>,
    pub volume_24h: Option<f64>,
    #[serde(default)]
    pub ohlc: Ohlc,
    pub source: String,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub degrade: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub notes: Vec<String>,
    pub timestamp: String,
}

impl DexSnapshot {
    fn empty(reason: &str) -> DexSnapshot {
        DexSnapshot {
            price_usd: None,
            liquidity_usd: None,
            fdv: None,
            market_cap: None,
            volume_1h: None,
            volume_24h: None,
            ohlc: Ohlc::default(),
            source: String::new(),
            cache: false,
            stale: true,
            degrade: true,
            reason: reason.to_string(),
            notes: Vec::new(),
            timestamp: crate::store::now_ts(),
        }
    }
}

pub struct DexProvider {
    http: reqwest::Client,
    cache_ttl_s: u64,
    kv: Kv,
    memo: Mutex<HashMap<String, (Instant, DexSnapshot)>>,
    dexscreener_base: String,
    gecko_base: String,
}

impl DexProvider {
    pub fn from_env(kv: Kv) -> DexProvider {
        let timeout_s = envcfg::env_f64("DEX_TIMEOUT_S", 1.5);
        DexProvider {
            http: super::http_client(Duration::from_secs_f64(timeout_s)),
            cache_ttl_s: envcfg::env_u64("DEX_CACHE_TTL_S", 60),
            kv,
            memo: Mutex::new(HashMap::new()),
            dexscreener_base: envcfg::env_str("DEXSCREENER_BASE_URL", DEXSCREENER_BASE),
            gecko_base: envcfg::env_str("GECKOTERMINAL_BASE_URL", GECKO_BASE),
        }
    }

    fn time_bucket() -> i64 {
        chrono::Utc::now().timestamp() / 300
    }

    fn cache_key(chain: &str, contract: &str) -> String {
        format!("dex:snapshot:{chain}:{}:{}", contract.to_lowercase(), Self::time_bucket())
    }

    fn last_ok_key(chain: &str, contract: &str) -> String {
        format!("dex:last_ok:{chain}:{}", contract.to_lowercase())
    }

    async fn get_cached(&self, key: &str) -> Option<DexSnapshot> {
        if let Ok(Some(raw)) = self.kv.get(key).await {
            if let Ok(snap) = serde_json::from_str::<DexSnapshot>(&raw) {
                return Some(snap);
            }
        }
        let memo = self.memo.lock().unwrap();
        memo.get(key).and_then(|(at, snap)| {
            (at.elapsed().as_secs() <= self.cache_ttl_s).then(|| snap.clone())
        })
    }

    async fn set_cached(&self, key: &str, snap: &DexSnapshot, ttl: u64) {
        self.memo
            .lock()
            .unwrap()
            .insert(key.to_string(), (Instant::now(), snap.clone()));
        if let Ok(raw) = serde_json::to_string(snap) {
            if let Err(e) = self.kv.set_ex(key, &raw, ttl).await {
                tracing::warn!(stage = "dex.cache.kv_write_error", error = %e, key = %key);
            }
        }
    }

    /// Snapshot ladder: fresh cache → primary → secondary → last_ok → empty.
    pub async fn get_snapshot(&self, chain: &str, contract: &str) -> DexSnapshot {
        let ca = contract.to_lowercase();
        let cache_key = Self::cache_key(chain, &ca);

        if let Some(mut snap) = self.get_cached(&cache_key).await {
            tracing::debug!(stage = "dex.cache.hit", chain = %chain, contract = %ca);
            snap.cache = true;
            snap.stale = false;
            snap.degrade = false;
            return snap;
        }
        tracing::debug!(stage = "dex.cache.miss", chain = %chain, contract = %ca);

        let mut primary_reason = String::new();
        let mut result = match self.fetch_dexscreener(chain, &ca).await {
            Ok(snap) => snap,
            Err(e) => {
                primary_reason = e.reason().to_string();
                tracing::warn!(
                    stage = "dex.fallback",
                    from_source = "dexscreener",
                    to_source = "geckoterminal",
                    reason = %primary_reason,
                );
                None
            }
        };

        if result.is_none() {
            result = match self.fetch_geckoterminal(chain, &ca).await {
                Ok(snap) => snap,
                Err(e) => {
                    tracing::warn!(
                        stage = "dex.both_failed",
                        chain = %chain,
                        contract = %ca,
                        primary_reason = %primary_reason,
                        secondary_reason = e.reason(),
                    );
                    None
                }
            };
        }

        if let Some(mut snap) = result {
            // The surviving failure reason from the primary rides along.
            snap.reason = primary_reason;
            self.set_cached(&cache_key, &snap, self.cache_ttl_s).await;
            self.set_cached(&Self::last_ok_key(chain, &ca), &snap, LAST_OK_TTL_S)
                .await;
            return snap;
        }

        if let Some(mut last_ok) = self.get_cached(&Self::last_ok_key(chain, &ca)).await {
            tracing::warn!(stage = "dex.degrade", mode = "last_ok", chain = %chain, contract = %ca);
            let prev_source = std::mem::take(&mut last_ok.source);
            last_ok.cache = false;
            last_ok.stale = true;
            last_ok.degrade = true;
            last_ok.reason = "both_failed_last_ok".to_string();
            last_ok.notes.push(format!("last_ok_from:{prev_source}"));
            return last_ok;
        }

        tracing::warn!(stage = "dex.degrade", mode = "no_data", chain = %chain, contract = %ca);
        DexSnapshot::empty("both_failed_no_cache")
    }

    async fn fetch_json(&self, url: &str) -> Result<Value, ProviderError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_status(status));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| ProviderError::Unknown(e.to_string()))
    }

    async fn fetch_dexscreener(
        &self,
        chain: &str,
        ca: &str,
    ) -> Result<Option<DexSnapshot>, ProviderError> {
        let chain_id = match chain.to_lowercase().as_str() {
            "eth" | "ethereum" => "ethereum".to_string(),
            other => other.to_string(),
        };

        tracing::debug!(stage = "dex.request", source = "dexscreener", chain = %chain, contract = %ca);
        let data = self
            .fetch_json(&format!("{}/tokens/{ca}", self.dexscreener_base))
            .await?;

        let Some(pairs) = data.get("pairs").and_then(|v| v.as_array()).filter(|p| !p.is_empty())
        else {
            return Ok(None);
        };

        let pair = pairs
            .iter()
            .find(|p| {
                p.get("chainId")
                    .and_then(|c| c.as_str())
                    .is_some_and(|c| c.to_lowercase() == chain_id)
            })
            .unwrap_or(&pairs[0]);

        let price_change = |frame: &str| -> OhlcFrame {
            OhlcFrame {
                o: pair
                    .get("priceChange")
                    .and_then(|pc| pc.get(frame))
                    .and_then(to_f64)
                    .unwrap_or(0.0),
                ..OhlcFrame::default()
            }
        };

        let snap = DexSnapshot {
            price_usd: pair.get("priceUsd").and_then(to_f64),
            liquidity_usd: pair.get("liquidity").and_then(|l| l.get("usd")).and_then(to_f64),
            fdv: pair.get("fdv").and_then(to_f64),
            market_cap: pair.get("marketCap").and_then(to_f64),
            volume_1h: pair.get("volume").and_then(|v| v.get("h1")).and_then(to_f64),
            volume_24h: pair.get("volume").and_then(|v| v.get("h24")).and_then(to_f64),
            ohlc: Ohlc {
                m5: Some(price_change("m5")),
                h1: Some(price_change("h1")),
                h24: Some(price_change("h24")),
            },
            source: "dexscreener".to_string(),
            cache: false,
            stale: false,
            degrade: false,
            reason: String::new(),
            notes: Vec::new(),
            timestamp: crate::store::now_ts(),
        };

        tracing::debug!(
            stage = "dex.success",
            source = "dexscreener",
            price = snap.price_usd,
            liquidity = snap.liquidity_usd,
        );
        Ok(Some(snap))
    }

    async fn fetch_geckoterminal(
        &self,
        chain: &str,
        ca: &str,
    ) -> Result<Option<DexSnapshot>, ProviderError> {
        let network = match chain.to_lowercase().as_str() {
            "ethereum" | "eth" => "eth".to_string(),
            "avalanche" => "avax".to_string(),
            other => other.to_string(),
        };

        tracing::debug!(stage = "dex.request", source = "geckoterminal", chain = %chain, contract = %ca);
        let data = self
            .fetch_json(&format!("{}/networks/{network}/tokens/{ca}", self.gecko_base))
            .await?;

        let Some(attrs) = data.get("data").and_then(|d| d.get("attributes")) else {
            return Ok(None);
        };

        let pc = |frame: &str| -> Option<OhlcFrame> {
            attrs
                .get("price_change_percentage")
                .and_then(|p| p.get(frame))
                .and_then(to_f64)
                .map(|o| OhlcFrame { o, ..OhlcFrame::default() })
        };

        let snap = DexSnapshot {
            price_usd: attrs.get("price_usd").and_then(to_f64),
            liquidity_usd: attrs.get("total_reserve_in_usd").and_then(to_f64),
            fdv: attrs.get("fdv_usd").and_then(to_f64),
            market_cap: attrs.get("market_cap_usd").and_then(to_f64),
            volume_1h: attrs.get("volume_usd").and_then(|v| v.get("h1")).and_then(to_f64),
            volume_24h: attrs.get("volume_usd").and_then(|v| v.get("h24")).and_then(to_f64),
            ohlc: Ohlc {
                m5: None,
                h1: pc("h1"),
                h24: pc("h24"),
            },
            source: "geckoterminal".to_string(),
            cache: false,
            stale: false,
            degrade: false,
            reason: String::new(),
            notes: Vec::new(),
            timestamp: crate::store::now_ts(),
        };

        tracing::debug!(
            stage = "dex.success",
            source = "geckoterminal",
            price = snap.price_usd,
            liquidity = snap.liquidity_usd,
        );
        Ok(Some(snap))
    }
}

/// Upstreams return numbers as strings as often as not.
fn to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
