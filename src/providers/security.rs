//! On-chain token security provider.
//!
//! A GoPlus-shaped HTTP client under token-bucket rate limiting, wrapped by
//! a provider that layers a three-tier cache (in-process memo, KV,
//! relational) and degrades to a local blacklist/whitelist rules backend
//! when the upstream is unavailable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use serde_json::{Value, json};

use super::{ProviderError, TokenBucket, http_client, retry_request};
use crate::envcfg;
use crate::kv::Kv;
use crate::rules::hotreload::HotConfigRegistry;
use crate::store::models::RiskLabel;
use crate::store::{Db, provider_cache};

const DEFAULT_BASE_URL: &str = "https://api.gopluslabs.io";

// ── Client ──────────────────────────────────────────────────────────

enum Auth {
    Bearer(String),
    ApiKey(String),
    Basic { id: String, secret: String },
}

/// Raw API client: auth, rate limiting, bounded retries.
pub struct GoPlusClient {
    http: reqwest::Client,
    base_url: String,
    auth: Auth,
    retry: u32,
    bucket: TokenBucket,
}

impl GoPlusClient {
    /// Credentials come from `GOPLUS_*`; construction fails without any
    /// auth method so the provider can fall back to its rules backend.
    pub fn from_env() -> Result<GoPlusClient, ProviderError> {
        let auth = if let Some(token) = envcfg::env_opt("GOPLUS_ACCESS_TOKEN") {
            Auth::Bearer(token)
        } else if let Some(key) = envcfg::env_opt("GOPLUS_API_KEY") {
            Auth::ApiKey(key)
        } else if let (Some(id), Some(secret)) = (
            envcfg::env_opt("GOPLUS_CLIENT_ID"),
            envcfg::env_opt("GOPLUS_CLIENT_SECRET"),
        ) {
            Auth::Basic { id, secret }
        } else {
            return Err(ProviderError::Provider(
                "no authentication method configured".to_string(),
            ));
        };

        let timeout_ms = envcfg::env_u64("GOPLUS_TIMEOUT_MS", 4000);
        let retry = envcfg::env_u64("GOPLUS_RETRY", 2) as u32;
        let rpm = envcfg::env_u64("GOPLUS_RATELIMIT_RPM", 28) as u32;

        Ok(GoPlusClient {
            http: http_client(Duration::from_millis(timeout_ms)),
            base_url: envcfg::env_str("GOPLUS_BASE_URL", DEFAULT_BASE_URL),
            auth,
            retry,
            bucket: TokenBucket::per_minute(rpm),
        })
    }

    async fn request(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ProviderError> {
        let waited = self.bucket.acquire(1).await;
        if !waited.is_zero() {
            tracing::info!(stage = "goplus.ratelimit", wait_ms = waited.as_millis() as u64);
        }

        let url = format!("{}{}", self.base_url, path);
        retry_request(self.retry, "goplus.retry", || {
            let url = url.clone();
            async move {
                let mut req = self.http.get(&url).query(params);
                req = match &self.auth {
                    Auth::Bearer(token) => req.bearer_auth(token),
                    Auth::ApiKey(key) => req.header("X-API-KEY", key),
                    Auth::Basic { id, secret } => req.basic_auth(id, Some(secret)),
                };

                let resp = req.send().await.map_err(|e| ProviderError::from_reqwest(&e))?;
                let status = resp.status().as_u16();
                if status == 200 {
                    return resp
                        .json::<Value>()
                        .await
                        .map_err(|e| ProviderError::Unknown(e.to_string()));
                }
                Err(ProviderError::from_status(status))
            }
        })
        .await
    }

    pub async fn token_security(&self, chain_id: &str, address: &str) -> Result<Value, ProviderError> {
        self.request(
            &format!("/api/v1/token_security/{chain_id}"),
            &[("contract_addresses", address.to_string())],
        )
        .await
    }

    pub async fn address_security(&self, address: &str) -> Result<Value, ProviderError> {
        self.request("/api/v1/address_security", &[("address", address.to_string())])
            .await
    }

    pub async fn approval_security(
        &self,
        chain_id: &str,
        address: &str,
        kind: &str,
    ) -> Result<Value, ProviderError> {
        self.request(
            &format!("/api/v1/approval_security/{chain_id}"),
            &[
                ("contract_address", address.to_string()),
                ("type", kind.to_string()),
            ],
        )
        .await
    }
}

// ── Result ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SecurityResult {
    pub risk_label: RiskLabel,
    pub buy_tax: Option<f64>,
    pub sell_tax: Option<f64>,
    pub lp_lock_days: Option<i64>,
    pub honeypot: Option<bool>,
    pub blacklist_flags: Vec<String>,
    pub cache: bool,
    pub stale: bool,
    pub degrade: bool,
    pub reason: String,
    pub notes: Vec<String>,
    #[serde(skip)]
    pub raw: Option<Value>,
    pub checked_at: String,
}

impl SecurityResult {
    fn empty(risk_label: RiskLabel) -> SecurityResult {
        SecurityResult {
            risk_label,
            buy_tax: None,
            sell_tax: None,
            lp_lock_days: None,
            honeypot: None,
            blacklist_flags: Vec::new(),
            cache: false,
            stale: false,
            degrade: false,
            reason: String::new(),
            notes: Vec::new(),
            raw: None,
            checked_at: crate::store::now_ts(),
        }
    }
}

// ── Provider ────────────────────────────────────────────────────────

enum Backend {
    Goplus(GoPlusClient),
    Rules,
}

struct MemoEntry {
    data: Value,
    expires_at: f64,
}

/// Risk thresholds applied to parsed payloads.
#[derive(Debug, Clone, Copy)]
pub struct RiskThresholds {
    pub tax_red_pct: f64,
    pub lp_yellow_days: i64,
    pub honeypot_red: bool,
    pub min_confidence: f64,
}

impl RiskThresholds {
    pub fn from_env() -> RiskThresholds {
        RiskThresholds {
            tax_red_pct: envcfg::env_f64("RISK_TAX_RED", 10.0),
            lp_yellow_days: envcfg::env_i64("RISK_LP_YELLOW_DAYS", 30),
            honeypot_red: envcfg::env_bool("HONEYPOT_RED", true),
            min_confidence: envcfg::env_f64("RISK_MIN_CONFIDENCE", 0.6),
        }
    }
}

pub struct SecurityProvider {
    backend: Backend,
    cache_ttl_s: u64,
    db_ttl_s: u64,
    allow_stale: bool,
    stale_max_s: u64,
    thresholds: RiskThresholds,
    memo: Mutex<HashMap<String, MemoEntry>>,
    kv: Kv,
    db: Db,
    registry: Arc<HotConfigRegistry>,
}

impl SecurityProvider {
    /// Backend selection follows `SECURITY_BACKEND` (`goplus` | `rules`);
    /// a goplus backend without credentials silently becomes rules.
    pub fn from_env(kv: Kv, db: Db, registry: Arc<HotConfigRegistry>) -> SecurityProvider {
        let backend = match envcfg::env_str("SECURITY_BACKEND", "goplus").as_str() {
            "rules" => Backend::Rules,
            _ => match GoPlusClient::from_env() {
                Ok(client) => Backend::Goplus(client),
                Err(e) => {
                    tracing::warn!(stage = "goplus.degrade", reason = "no_client", error = %e);
                    Backend::Rules
                }
            },
        };

        SecurityProvider {
            backend,
            cache_ttl_s: envcfg::env_u64("SECURITY_CACHE_TTL_S", 600),
            db_ttl_s: envcfg::env_u64("SECURITY_DB_TTL_S", 86_400),
            allow_stale: envcfg::env_bool("SECURITY_ALLOW_STALE", true),
            stale_max_s: envcfg::env_u64("SECURITY_STALE_MAX_S", 172_800),
            thresholds: RiskThresholds::from_env(),
            memo: Mutex::new(HashMap::new()),
            kv,
            db,
            registry,
        }
    }

    pub async fn check_token(&self, chain_id: &str, address: &str) -> SecurityResult {
        self.check("token_security", Some(chain_id), address, address, "erc20", self.db_ttl_s)
            .await
    }

    pub async fn check_address(&self, address: &str) -> SecurityResult {
        self.check("address_security", None, address, address, "erc20", self.cache_ttl_s)
            .await
    }

    pub async fn check_approval(&self, chain_id: &str, address: &str, kind: &str) -> SecurityResult {
        let cache_key = format!("{address}:{kind}");
        self.check("approval_security", Some(chain_id), &cache_key, address, kind, self.cache_ttl_s)
            .await
    }

    async fn check(
        &self,
        endpoint: &str,
        chain_id: Option<&str>,
        cache_key: &str,
        address: &str,
        kind: &str,
        success_ttl: u64,
    ) -> SecurityResult {
        if matches!(self.backend, Backend::Rules) {
            tracing::info!(stage = "goplus.degrade", reason = "backend_rules", backend = "rules");
            if let Some((data, stale)) = self.get_from_cache(endpoint, chain_id, cache_key).await {
                let mut res = self.result_from_cached(&data);
                res.cache = true;
                res.stale = stale;
                return res;
            }
            let res = self.apply_rules(address);
            let payload = rules_cache_payload(&res);
            self.save_to_cache(endpoint, chain_id, cache_key, &payload, "success", self.cache_ttl_s)
                .await;
            return res;
        }

        if let Some((data, stale)) = self.get_from_cache(endpoint, chain_id, cache_key).await {
            let mut res = self.result_from_cached(&data);
            res.cache = true;
            res.stale = stale;
            return res;
        }

        let Backend::Goplus(client) = &self.backend else {
            unreachable!("rules backend handled above");
        };

        let outcome = match endpoint {
            "token_security" => client.token_security(chain_id.unwrap_or("1"), address).await,
            "address_security" => client.address_security(address).await,
            _ => client.approval_security(chain_id.unwrap_or("1"), address, kind).await,
        };

        match outcome {
            Ok(data) => {
                self.save_to_cache(endpoint, chain_id, cache_key, &data, "success", success_ttl)
                    .await;
                let result = self.evaluate_risk(&data);
                tracing::info!(stage = "goplus.success", cache_hit = false, risk = result.risk_label.as_str());
                result
            }
            Err(e) => {
                tracing::warn!(stage = "goplus.error", error = %e, degrade = true);
                tracing::info!(stage = "goplus.degrade", reason = "api_error", backend = "rules");
                let mut res = self.apply_rules(address);
                res.reason = e.reason().to_string();
                res
            }
        }
    }

    // ── Cache tiers ─────────────────────────────────────────────────

    fn make_cache_key(endpoint: &str, chain_id: Option<&str>, key: &str) -> String {
        format!("goplus:{endpoint}:{}:{key}", chain_id.unwrap_or("-"))
    }

    fn jittered(ttl_s: u64) -> u64 {
        let jitter = rand::rng().random_range(0.0..0.1);
        ttl_s + (ttl_s as f64 * jitter) as u64
    }

    async fn get_from_cache(
        &self,
        endpoint: &str,
        chain_id: Option<&str>,
        key: &str,
    ) -> Option<(Value, bool)> {
        let cache_key = Self::make_cache_key(endpoint, chain_id, key);
        let now = Utc::now().timestamp() as f64;

        // 1. In-process memo.
        {
            let memo = self.memo.lock().unwrap();
            if let Some(entry) = memo.get(&cache_key) {
                if entry.expires_at > now {
                    tracing::debug!(stage = "goplus.cache.hit", source = "memory");
                    return Some((entry.data.clone(), false));
                }
                if self.allow_stale && (now - entry.expires_at) < self.stale_max_s as f64 {
                    tracing::debug!(stage = "goplus.cache.hit", source = "memory", stale = true);
                    return Some((entry.data.clone(), true));
                }
            }
        }

        // 2. Shared KV.
        if let Ok(Some(raw)) = self.kv.get(&cache_key).await {
            if let Ok(entry) = serde_json::from_str::<Value>(&raw) {
                let expires_at = entry.get("expires_at").and_then(|v| v.as_f64()).unwrap_or(0.0);
                if let Some(data) = entry.get("data") {
                    if expires_at > now {
                        tracing::debug!(stage = "goplus.cache.hit", source = "kv");
                        self.memo.lock().unwrap().insert(
                            cache_key.clone(),
                            MemoEntry {
                                data: data.clone(),
                                expires_at,
                            },
                        );
                        return Some((data.clone(), false));
                    }
                    if self.allow_stale && (now - expires_at) < self.stale_max_s as f64 {
                        tracing::debug!(stage = "goplus.cache.hit", source = "kv", stale = true);
                        return Some((data.clone(), true));
                    }
                }
            }
        }

        // 3. Relational tier, written back up the stack on a fresh hit.
        let db_hit = {
            let conn = self.db.lock().await;
            provider_cache::get(&conn, endpoint, chain_id, key).ok().flatten()
        };
        if let Some(hit) = db_hit {
            if let Some(expires) = crate::store::parse_ts(&hit.expires_at) {
                let expires_f = expires.timestamp() as f64;
                if let Ok(data) = serde_json::from_str::<Value>(&hit.payload) {
                    if expires_f > now {
                        tracing::debug!(stage = "goplus.cache.hit", source = "db");
                        self.memo.lock().unwrap().insert(
                            cache_key.clone(),
                            MemoEntry {
                                data: data.clone(),
                                expires_at: expires_f,
                            },
                        );
                        let entry = json!({"data": data, "expires_at": expires_f});
                        let ttl = (expires_f - now) as u64;
                        let _ = self.kv.set_ex(&cache_key, &entry.to_string(), ttl.max(1)).await;
                        return Some((data, false));
                    }
                    if self.allow_stale && (now - expires_f) < self.stale_max_s as f64 {
                        tracing::debug!(stage = "goplus.cache.hit", source = "db", stale = true);
                        return Some((data, true));
                    }
                }
            }
        }

        tracing::debug!(stage = "goplus.cache.miss", next = "api");
        None
    }

    async fn save_to_cache(
        &self,
        endpoint: &str,
        chain_id: Option<&str>,
        key: &str,
        data: &Value,
        status: &str,
        ttl_s: u64,
    ) {
        let ttl_s = Self::jittered(if status == "success" { ttl_s } else { 60 });
        let now = Utc::now().timestamp() as f64;
        let expires_at = now + ttl_s as f64;
        let cache_key = Self::make_cache_key(endpoint, chain_id, key);

        self.memo.lock().unwrap().insert(
            cache_key.clone(),
            MemoEntry {
                data: data.clone(),
                expires_at,
            },
        );

        let entry = json!({"data": data, "expires_at": expires_at});
        if let Err(e) = self.kv.set_ex(&cache_key, &entry.to_string(), ttl_s).await {
            tracing::warn!(stage = "goplus.cache.kv_save_error", error = %e);
        }

        let expires_ts = crate::store::to_ts(
            Utc::now() + chrono::Duration::seconds(ttl_s as i64),
        );
        let conn = self.db.lock().await;
        if let Err(e) = provider_cache::put(
            &conn,
            endpoint,
            chain_id,
            key,
            &data.to_string(),
            status,
            &expires_ts,
        ) {
            tracing::warn!(stage = "goplus.cache.db_save_error", error = %e);
        }
    }

    // ── Risk derivation ─────────────────────────────────────────────

    fn result_from_cached(&self, data: &Value) -> SecurityResult {
        if data.get("from_rules").and_then(|v| v.as_bool()).unwrap_or(false) {
            let mut res = SecurityResult::empty(RiskLabel::parse(
                data.get("risk_label").and_then(|v| v.as_str()).unwrap_or("unknown"),
            ));
            res.buy_tax = data.get("buy_tax").and_then(|v| v.as_f64());
            res.sell_tax = data.get("sell_tax").and_then(|v| v.as_f64());
            res.lp_lock_days = data.get("lp_lock_days").and_then(|v| v.as_i64());
            res.honeypot = data.get("honeypot").and_then(|v| v.as_bool());
            res.degrade = true;
            res.reason = "provider_error".to_string();
            res.notes = data
                .get("notes")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
                .unwrap_or_else(|| vec!["cached rules result".to_string()]);
            return res;
        }
        self.evaluate_risk(data)
    }

    /// Derive a risk label from a raw API payload, tolerating missing or
    /// oddly-shaped fields.
    pub fn evaluate_risk(&self, data: &Value) -> SecurityResult {
        let items: Vec<&Value> = match data.get("result") {
            Some(Value::Object(map)) => map.values().collect(),
            Some(Value::Array(arr)) => arr.iter().collect(),
            _ => Vec::new(),
        };

        let mut buy_tax = None;
        let mut sell_tax = None;
        let mut lp_lock_days = None;
        let mut honeypot = None;
        let mut blacklist_flags = Vec::new();

        for token in items {
            let Value::Object(_) = token else { continue };

            if buy_tax.is_none() {
                buy_tax = pct_or_none(token.get("buy_tax"));
            }
            if sell_tax.is_none() {
                sell_tax = pct_or_none(token.get("sell_tax"));
            }
            if honeypot.is_none() {
                if let Some(hp) = token.get("is_honeypot") {
                    honeypot = Some(flag_is_set(hp));
                }
            }
            // LP lock is not reported directly; holders present with no lock
            // info counts as unlocked.
            if lp_lock_days.is_none() && token.get("lp_holders").is_some() {
                lp_lock_days = Some(0);
            }
            if token.get("is_blacklisted").map(flag_is_set).unwrap_or(false) {
                blacklist_flags.push("blacklisted".to_string());
            }
            if token.get("is_mintable").map(flag_is_set).unwrap_or(false) {
                blacklist_flags.push("mintable".to_string());
            }
            if token.get("is_proxy").map(flag_is_set).unwrap_or(false) {
                blacklist_flags.push("proxy".to_string());
            }
        }

        let t = &self.thresholds;
        let mut notes = Vec::new();
        let risk_label = if honeypot == Some(true) && t.honeypot_red {
            notes.push("honeypot detected".to_string());
            RiskLabel::Red
        } else if buy_tax.is_some_and(|v| v >= t.tax_red_pct) {
            notes.push(format!("high buy tax: {}%", buy_tax.unwrap()));
            RiskLabel::Red
        } else if sell_tax.is_some_and(|v| v >= t.tax_red_pct) {
            notes.push(format!("high sell tax: {}%", sell_tax.unwrap()));
            RiskLabel::Red
        } else if lp_lock_days.is_some_and(|v| v < t.lp_yellow_days) {
            notes.push(format!("low LP lock: {} days", lp_lock_days.unwrap()));
            RiskLabel::Yellow
        } else if buy_tax.is_some() || sell_tax.is_some() || honeypot.is_some() {
            RiskLabel::Green
        } else {
            RiskLabel::Unknown
        };

        tracing::info!(
            stage = "goplus.risk",
            label = risk_label.as_str(),
            honeypot = honeypot,
            buy_tax = buy_tax,
            sell_tax = sell_tax,
            lp_lock_days = lp_lock_days,
        );

        let mut res = SecurityResult::empty(risk_label);
        res.buy_tax = buy_tax;
        res.sell_tax = sell_tax;
        res.lp_lock_days = lp_lock_days;
        res.honeypot = honeypot;
        res.blacklist_flags = blacklist_flags;
        res.notes = notes;
        res.raw = Some(data.clone());
        res
    }

    /// Degraded local evaluation from the `risk_rules` namespace.
    fn apply_rules(&self, address: &str) -> SecurityResult {
        self.registry.reload_if_stale(false);
        let rules = self.registry.get_ns("risk_rules");

        let addr = address.to_lowercase();
        let in_list = |key: &str| -> bool {
            rules
                .get(key)
                .and_then(|v| v.as_sequence())
                .map(|seq| {
                    seq.iter()
                        .filter_map(|v| v.as_str())
                        .any(|a| a.to_lowercase() == addr)
                })
                .unwrap_or(false)
        };

        let mut notes = vec!["evaluated by local rules".to_string()];
        let risk_label = if in_list("whitelist") {
            notes.push("address whitelisted".to_string());
            RiskLabel::Green
        } else if in_list("blacklist") {
            notes.push("address blacklisted".to_string());
            RiskLabel::Red
        } else {
            RiskLabel::Unknown
        };

        tracing::info!(stage = "goplus.risk", label = risk_label.as_str(), source = "rules");

        let mut res = SecurityResult::empty(risk_label);
        res.degrade = true;
        res.reason = "provider_error".to_string();
        res.notes = notes;
        res
    }
}

fn rules_cache_payload(res: &SecurityResult) -> Value {
    json!({
        "from_rules": true,
        "risk_label": res.risk_label.as_str(),
        "buy_tax": res.buy_tax,
        "sell_tax": res.sell_tax,
        "lp_lock_days": res.lp_lock_days,
        "honeypot": res.honeypot,
        "blacklist_flags": res.blacklist_flags,
        "notes": res.notes,
    })
}

/// Taxes arrive as a fraction (`0.05`), percent (`5`), or string of either;
/// values ≤ 1.0 are treated as ratios and scaled to percent.
fn pct_or_none(v: Option<&Value>) -> Option<f64> {
    let f = match v? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    Some(if f <= 1.0 { f * 100.0 } else { f })
}

/// GoPlus booleans appear as `"1"` / `"0"` strings or numbers.
fn flag_is_set(v: &Value) -> bool {
    match v {
        Value::String(s) => s == "1",
        Value::Number(n) => n.as_i64() == Some(1),
        Value::Bool(b) => *b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tax_normalization() {
        assert_eq!(pct_or_none(Some(&json!(0.1))), Some(10.0));
        assert_eq!(pct_or_none(Some(&json!(10))), Some(10.0));
        assert_eq!(pct_or_none(Some(&json!(10.0001))), Some(10.0001));
        assert_eq!(pct_or_none(Some(&json!("0.05"))), Some(5.0));
        assert_eq!(pct_or_none(Some(&json!("garbage"))), None);
        assert_eq!(pct_or_none(None), None);
    }

    #[test]
    fn honeypot_flags() {
        assert!(flag_is_set(&json!("1")));
        assert!(!flag_is_set(&json!("0")));
        assert!(flag_is_set(&json!(1)));
        assert!(!flag_is_set(&json!(null)));
    }
}
