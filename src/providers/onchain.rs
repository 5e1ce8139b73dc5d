//! On-chain feature provider backed by an analytics warehouse view.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::envcfg;

/// Features are discarded when their `asof_ts` is older than this.
const MAX_FEATURE_AGE_MIN: i64 = 90;

const RETRY_DELAYS_S: [u64; 3] = [5, 15, 30];

#[derive(Debug, Clone)]
pub struct OnchainFeature {
    pub active_addr_pctl: f64,
    pub growth_ratio: f64,
    pub top10_share: f64,
    pub self_loop_ratio: f64,
    pub asof_ts: DateTime<Utc>,
    pub window_min: u32,
}

enum Backend {
    /// Warehouse endpoint queried with `(chain, address, window_minutes)`.
    Http {
        http: reqwest::Client,
        url: String,
        view: String,
    },
    /// No warehouse configured; every fetch yields nothing.
    Off,
    /// Fixed response for tests.
    Mock(Option<OnchainFeature>),
}

pub struct OnchainProvider {
    backend: Backend,
}

impl OnchainProvider {
    /// Requires `ONCHAIN_WAREHOUSE_URL` and `ONCHAIN_FEATURES_VIEW`
    /// (`<project>.<dataset>.<view>`); absent either, the provider is off.
    pub fn from_env() -> OnchainProvider {
        let url = envcfg::env_opt("ONCHAIN_WAREHOUSE_URL");
        let view = envcfg::env_opt("ONCHAIN_FEATURES_VIEW");
        let backend = match (url, view) {
            (Some(url), Some(view)) => Backend::Http {
                http: super::http_client(Duration::from_secs(
                    envcfg::env_u64("ONCHAIN_TIMEOUT_S", 30),
                )),
                url,
                view,
            },
            _ => {
                tracing::warn!(stage = "onchain.features", reason = "not_configured");
                Backend::Off
            }
        };
        OnchainProvider { backend }
    }

    pub fn mock(feature: Option<OnchainFeature>) -> OnchainProvider {
        OnchainProvider {
            backend: Backend::Mock(feature),
        }
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self.backend, Backend::Off)
    }

    /// Fetch one feature row, retrying 5/15/30 s on failure. Stale rows
    /// (older than 90 minutes) are discarded.
    pub async fn fetch(&self, chain: &str, address: &str, window_min: u32) -> Option<OnchainFeature> {
        match &self.backend {
            Backend::Off => None,
            Backend::Mock(feature) => feature.clone().filter(|f| f.window_min == window_min),
            Backend::Http { http, url, view } => {
                for (attempt, delay) in RETRY_DELAYS_S.iter().enumerate() {
                    match self.query(http, url, view, chain, address, window_min).await {
                        Ok(row) => return self.check_freshness(chain, address, row),
                        Err(e) => {
                            tracing::warn!(
                                stage = "onchain.features.retry",
                                attempt = attempt + 1,
                                error = %e,
                            );
                            if attempt + 1 < RETRY_DELAYS_S.len() {
                                tokio::time::sleep(Duration::from_secs(*delay)).await;
                            }
                        }
                    }
                }
                None
            }
        }
    }

    async fn query(
        &self,
        http: &reqwest::Client,
        url: &str,
        view: &str,
        chain: &str,
        address: &str,
        window_min: u32,
    ) -> anyhow::Result<Option<OnchainFeature>> {
        let body = serde_json::json!({
            "view": view,
            "chain": chain,
            "address": address,
            "window_minutes": window_min,
        });
        let resp = http.post(url).json(&body).send().await?.error_for_status()?;
        let data: Value = resp.json().await?;

        let row = match data.get("data") {
            Some(Value::Array(rows)) => rows.first().cloned(),
            Some(Value::Object(_)) => data.get("data").cloned(),
            _ => None,
        };
        let Some(row) = row else {
            return Ok(None);
        };

        let num = |key: &str| row.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
        let asof_ts = row
            .get("asof_ts")
            .and_then(|v| v.as_str())
            .and_then(crate::store::parse_ts)
            .ok_or_else(|| anyhow::anyhow!("missing asof_ts"))?;

        Ok(Some(OnchainFeature {
            active_addr_pctl: num("active_addr_pctl"),
            growth_ratio: num("growth_ratio"),
            top10_share: num("top10_share"),
            self_loop_ratio: num("self_loop_ratio"),
            asof_ts,
            window_min,
        }))
    }

    fn check_freshness(
        &self,
        chain: &str,
        address: &str,
        row: Option<OnchainFeature>,
    ) -> Option<OnchainFeature> {
        let feature = row?;
        let age = Utc::now() - feature.asof_ts;
        if age > chrono::Duration::minutes(MAX_FEATURE_AGE_MIN) {
            tracing::warn!(
                stage = "onchain.features.stale",
                chain = %chain,
                address = %address,
                asof_ts = %feature.asof_ts,
            );
            return None;
        }
        Some(feature)
    }
}
