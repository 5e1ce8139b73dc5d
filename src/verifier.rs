//! On-chain verifier: promotes or demotes candidate signals under a
//! distributed lock and a compare-and-set state predicate.
//!
//! Features are fetched outside the lock; the state write happens only
//! while holding the lock, and only when the observed state still matches.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::envcfg;
use crate::kv::{Kv, ReleaseStatus};
use crate::metrics;
use crate::providers::onchain::{OnchainFeature, OnchainProvider};
use crate::rules::hotreload::HotConfigRegistry;
use crate::store::models::{SignalRow, SignalState};
use crate::store::{Db, events, signals};

// ── Verdicts ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Upgrade,
    Downgrade,
    Hold,
    Insufficient,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Upgrade => "upgrade",
            Decision::Downgrade => "downgrade",
            Decision::Hold => "hold",
            Decision::Insufficient => "insufficient",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub decision: Decision,
    pub confidence: f64,
    pub note: Option<String>,
}

/// Thresholds from the `onchain` rules namespace.
#[derive(Debug, Clone, Copy)]
pub struct OnchainRules {
    pub active_addr_high: f64,
    pub growth_fast: f64,
    pub top10_high_risk: f64,
    pub self_loop_suspicious: f64,
}

impl Default for OnchainRules {
    fn default() -> Self {
        OnchainRules {
            active_addr_high: 90.0,
            growth_fast: 2.0,
            top10_high_risk: 0.7,
            self_loop_suspicious: 0.2,
        }
    }
}

impl OnchainRules {
    pub fn from_registry(registry: &HotConfigRegistry) -> OnchainRules {
        let num = |path: &str, default: f64| -> f64 {
            match registry.get_path(path, serde_yaml::Value::Null) {
                serde_yaml::Value::Number(n) => n.as_f64().unwrap_or(default),
                _ => default,
            }
        };
        let d = OnchainRules::default();
        OnchainRules {
            active_addr_high: num("onchain.thresholds.active_addr_pctl.high", d.active_addr_high),
            growth_fast: num("onchain.thresholds.growth_ratio.fast", d.growth_fast),
            top10_high_risk: num("onchain.thresholds.top10_share.high_risk", d.top10_high_risk),
            self_loop_suspicious: num(
                "onchain.thresholds.self_loop_ratio.suspicious",
                d.self_loop_suspicious,
            ),
        }
    }
}

/// Pure feature evaluation. Concentration or wash-trading triggers
/// downgrade; broad, fast-growing activity triggers upgrade; anything else
/// holds.
pub fn evaluate_feature(f: &OnchainFeature, rules: &OnchainRules) -> Verdict {
    let top10_bad = f.top10_share >= rules.top10_high_risk;
    let self_loop_bad = f.self_loop_ratio >= rules.self_loop_suspicious;
    if top10_bad || self_loop_bad {
        let confidence = if top10_bad && self_loop_bad { 0.9 } else { 0.7 };
        let note = if top10_bad {
            "top10_share high"
        } else {
            "self_loop_ratio suspicious"
        };
        return Verdict {
            decision: Decision::Downgrade,
            confidence,
            note: Some(note.to_string()),
        };
    }

    if f.active_addr_pctl >= rules.active_addr_high && f.growth_ratio >= rules.growth_fast {
        let confidence = if f.growth_ratio >= rules.growth_fast * 2.0 { 0.9 } else { 0.8 };
        return Verdict {
            decision: Decision::Upgrade,
            confidence,
            note: None,
        };
    }

    Verdict {
        decision: Decision::Hold,
        confidence: 0.5,
        note: None,
    }
}

// ── Lock keys ───────────────────────────────────────────────────────

/// Strip whitespace/control characters; long keys truncate to 191 chars
/// plus a short hash suffix.
pub fn sanitize_for_key(event_key: &str) -> String {
    let safe: String = event_key
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect();
    if safe.chars().count() <= 200 {
        return safe;
    }
    let mut hasher = Sha1::new();
    hasher.update(safe.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let prefix: String = safe.chars().take(191).collect();
    format!("{}:{}", prefix, &digest[..8])
}

// ── Verifier ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub rules_on: bool,
    pub verification_delay_sec: i64,
    pub scan_window_min: i64,
    pub lock_ttl_sec: u64,
    pub lock_max_retry: u32,
    pub backoff_ms_min: u64,
    pub backoff_ms_max: u64,
    pub lock_enable: bool,
    pub cas_enable: bool,
    pub cooldown_fails: i64,
    pub cooldown_ttl_sec: u64,
    pub deploy_env: String,
    pub downgrade_state: SignalState,
}

impl VerifierConfig {
    pub fn from_env() -> VerifierConfig {
        let downgrade_state = match envcfg::env_str("ONCHAIN_DOWNGRADE_STATE", "rejected").as_str() {
            "downgraded" => SignalState::Downgraded,
            _ => SignalState::Rejected,
        };
        VerifierConfig {
            rules_on: envcfg::env_str("ONCHAIN_RULES", "off") == "on",
            verification_delay_sec: envcfg::env_i64("ONCHAIN_VERIFICATION_DELAY_SEC", 180),
            scan_window_min: envcfg::env_i64("ONCHAIN_SCAN_WINDOW_MIN", 30),
            lock_ttl_sec: envcfg::env_u64("ONCHAIN_LOCK_TTL_SEC", 60),
            lock_max_retry: envcfg::env_u64("ONCHAIN_LOCK_MAX_RETRY", 0) as u32,
            backoff_ms_min: envcfg::env_u64("ONCHAIN_LOCK_BACKOFF_MS_MIN", 20),
            backoff_ms_max: envcfg::env_u64("ONCHAIN_LOCK_BACKOFF_MS_MAX", 40),
            lock_enable: envcfg::env_bool("ONCHAIN_LOCK_ENABLE", true),
            cas_enable: envcfg::env_bool("ONCHAIN_CAS_ENABLE", true),
            cooldown_fails: envcfg::env_i64("ONCHAIN_COOLDOWN_FAILS", 3),
            cooldown_ttl_sec: envcfg::env_u64("ONCHAIN_COOLDOWN_TTL_SEC", 45),
            deploy_env: envcfg::env_str("DEPLOY_ENV", "prod"),
            downgrade_state,
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct VerifyStats {
    pub scanned: usize,
    pub evaluated: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct Verifier {
    db: Db,
    kv: Kv,
    registry: Arc<HotConfigRegistry>,
    provider: OnchainProvider,
    cfg: VerifierConfig,
}

enum Processed {
    Updated,
    Skipped,
    Error,
}

impl Verifier {
    pub fn new(
        db: Db,
        kv: Kv,
        registry: Arc<HotConfigRegistry>,
        provider: OnchainProvider,
        cfg: VerifierConfig,
    ) -> Verifier {
        Verifier {
            db,
            kv,
            registry,
            provider,
            cfg,
        }
    }

    fn lock_key(&self, event_key: &str) -> String {
        format!(
            "lock:{}:onchain:signal:{}",
            self.cfg.deploy_env,
            sanitize_for_key(event_key)
        )
    }

    /// One verification pass over recent candidates.
    pub async fn run_once(&self, limit: usize) -> VerifyStats {
        let mut stats = VerifyStats::default();

        self.registry.reload_if_stale(false);
        let rules = OnchainRules::from_registry(&self.registry);

        let now = Utc::now();
        let oldest = crate::store::to_ts(now - chrono::Duration::minutes(self.cfg.scan_window_min));
        let newest =
            crate::store::to_ts(now - chrono::Duration::seconds(self.cfg.verification_delay_sec));

        let candidates = {
            let conn = self.db.lock().await;
            match signals::list_candidates(&conn, &oldest, &newest, limit) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(stage = "onchain.scan.error", error = %e);
                    stats.errors += 1;
                    return stats;
                }
            }
        };
        stats.scanned = candidates.len();

        for candidate in &candidates {
            stats.evaluated += 1;
            match self.process_candidate(candidate, &rules).await {
                Processed::Updated => stats.updated += 1,
                Processed::Skipped => stats.skipped += 1,
                Processed::Error => stats.errors += 1,
            }
        }

        tracing::info!(
            stage = "onchain.run_complete",
            scanned = stats.scanned,
            updated = stats.updated,
            skipped = stats.skipped,
            errors = stats.errors,
        );
        stats
    }

    async fn process_candidate(&self, signal: &SignalRow, rules: &OnchainRules) -> Processed {
        let event_key = &signal.event_key;

        // Cooldown for hot keys. A KV error here skips conservatively so we
        // never run the state machine without coordination.
        let cooldown_key = format!("cooldown:{}", sanitize_for_key(event_key));
        match self.kv.get(&cooldown_key).await {
            Ok(Some(_)) => {
                tracing::info!(stage = "onchain.cooldown.skip", event_key = %event_key);
                metrics::ONCHAIN_COOLDOWN_HIT_TOTAL.inc();
                return Processed::Skipped;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(stage = "onchain.cooldown.error", error = %e);
                return Processed::Skipped;
            }
        }

        let Some((chain, address)) = self.resolve_target(event_key).await else {
            tracing::warn!(stage = "onchain.target.missing", event_key = %event_key);
            return Processed::Error;
        };

        // Fetch outside the lock to keep hold time short.
        let feature = self.provider.fetch(&chain, &address, 60).await;
        let verdict = feature.as_ref().map(|f| evaluate_feature(f, rules));

        let op_id = Uuid::new_v4().simple().to_string();
        let start_total = Instant::now();

        let wait_start = Instant::now();
        let mut token: Option<String> = None;
        if self.cfg.lock_enable {
            for attempt in 0..=self.cfg.lock_max_retry {
                token = self.acquire_lock(event_key).await;
                if token.is_some() {
                    break;
                }
                if attempt < self.cfg.lock_max_retry {
                    let backoff = rand::rng()
                        .random_range(self.cfg.backoff_ms_min..=self.cfg.backoff_ms_max);
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                }
            }

            if token.is_none() {
                metrics::ONCHAIN_LOCK_WAIT_MS.observe(0.0);
                tracing::info!(stage = "onchain.lock.skip", event_key = %event_key, operation_id = %op_id);
                self.bump_fail_count(event_key).await;
                return Processed::Skipped;
            }
        } else {
            tracing::info!(stage = "onchain.lock.disabled", event_key = %event_key, operation_id = %op_id);
        }
        let lock_wait_ms = if token.is_some() {
            wait_start.elapsed().as_millis() as f64
        } else {
            0.0
        };
        metrics::ONCHAIN_LOCK_WAIT_MS.observe(lock_wait_ms);

        let hold_start = Instant::now();
        let outcome = self
            .apply_verdict(signal, feature.as_ref(), verdict.as_ref(), &op_id)
            .await;

        metrics::ONCHAIN_LOCK_HOLD_MS.observe(hold_start.elapsed().as_millis() as f64);
        if let Some(token) = &token {
            self.release_lock(event_key, token).await;
        }
        metrics::ONCHAIN_PROCESS_MS.observe(start_total.elapsed().as_millis() as f64);

        match outcome {
            Ok(processed) => processed,
            Err(e) => {
                tracing::warn!(stage = "onchain.process.error", event_key = %event_key, error = %e);
                Processed::Error
            }
        }
    }

    /// The state transition itself, executed while the lock is held.
    async fn apply_verdict(
        &self,
        signal: &SignalRow,
        feature: Option<&OnchainFeature>,
        verdict: Option<&Verdict>,
        op_id: &str,
    ) -> Result<Processed> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let now = crate::store::now_ts();

        let (new_state, confidence, asof, metadata) = match (feature, verdict) {
            (Some(feature), Some(verdict)) => {
                // State changes require the rules switch; attribute updates
                // never do.
                let new_state = if self.cfg.rules_on {
                    match verdict.decision {
                        Decision::Upgrade => SignalState::Verified,
                        Decision::Downgrade => self.cfg.downgrade_state,
                        _ => signal.state,
                    }
                } else {
                    signal.state
                };
                let mut metadata = json!({
                    "verdict_decision": verdict.decision.as_str(),
                    "verdict_confidence": verdict.confidence,
                    "asof_ts": crate::store::to_ts(feature.asof_ts),
                });
                if let Some(note) = &verdict.note {
                    metadata["verdict_note"] = json!(note);
                }
                (
                    new_state,
                    verdict.confidence,
                    Some(crate::store::to_ts(feature.asof_ts)),
                    metadata,
                )
            }
            _ => (
                signal.state,
                0.0,
                Some(now.clone()),
                json!({
                    "verdict_decision": "insufficient",
                    "verdict_note": "evidence_delayed",
                }),
            ),
        };

        let affected = signals::cas_update_state(
            &tx,
            &signal.event_key,
            signal.state,
            new_state,
            asof.as_deref(),
            confidence,
            self.cfg.cas_enable,
            &now,
        )?;

        if self.cfg.cas_enable && affected == 0 {
            metrics::ONCHAIN_CAS_CONFLICT_TOTAL.inc();
            tracing::warn!(
                stage = "onchain.state.cas_conflict",
                event_key = %signal.event_key,
                operation_id = %op_id,
                prev_state = signal.state.as_str(),
                next_state = new_state.as_str(),
            );
            tx.rollback()?;
            return Ok(Processed::Skipped);
        }

        signals::insert_signal_event(&tx, &signal.event_key, "onchain_verify", &metadata, &now)?;
        tx.commit()?;

        tracing::info!(
            stage = "onchain.processed",
            event_key = %signal.event_key,
            operation_id = %op_id,
            decision = metadata["verdict_decision"].as_str().unwrap_or(""),
        );
        Ok(Processed::Updated)
    }

    /// Resolve `(chain, address)` from a `CHAIN:ADDRESS:...` event key, or
    /// from the owning event's contract with the default chain.
    async fn resolve_target(&self, event_key: &str) -> Option<(String, String)> {
        let parts: Vec<&str> = event_key.split(':').collect();
        if parts.len() >= 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            return Some((parts[0].to_lowercase(), parts[1].to_lowercase()));
        }

        let conn = self.db.lock().await;
        let event = events::get_event(&conn, event_key).ok().flatten()?;
        event.token_ca.map(|ca| ("eth".to_string(), ca))
    }

    async fn acquire_lock(&self, event_key: &str) -> Option<String> {
        let token = Uuid::new_v4().simple().to_string();
        match self
            .kv
            .set_nx_ex(&self.lock_key(event_key), &token, self.cfg.lock_ttl_sec)
            .await
        {
            Ok(true) => {
                metrics::ONCHAIN_LOCK_ACQUIRE_TOTAL.with_label_values(&["ok"]).inc();
                tracing::debug!(stage = "onchain.lock.acquire", event_key = %event_key, ttl = self.cfg.lock_ttl_sec);
                Some(token)
            }
            Ok(false) => {
                metrics::ONCHAIN_LOCK_ACQUIRE_TOTAL.with_label_values(&["fail"]).inc();
                tracing::debug!(stage = "onchain.lock.acquire", event_key = %event_key, status = "fail");
                None
            }
            Err(e) => {
                metrics::ONCHAIN_LOCK_ACQUIRE_TOTAL.with_label_values(&["error"]).inc();
                tracing::warn!(stage = "onchain.lock.acquire", event_key = %event_key, error = %e);
                None
            }
        }
    }

    async fn release_lock(&self, event_key: &str, token: &str) -> ReleaseStatus {
        let status = self
            .kv
            .compare_and_delete(&self.lock_key(event_key), token)
            .await;
        metrics::ONCHAIN_LOCK_RELEASE_TOTAL
            .with_label_values(&[status.as_str()])
            .inc();
        tracing::debug!(stage = "onchain.lock.release", event_key = %event_key, status = status.as_str());
        status
    }

    /// Repeated acquisition failures arm a per-key cooldown.
    async fn bump_fail_count(&self, event_key: &str) {
        let fail_key = format!("failcnt:{event_key}");
        let result = async {
            let count = self.kv.incr(&fail_key).await?;
            self.kv.expire(&fail_key, 60).await?;
            if count >= self.cfg.cooldown_fails {
                let cooldown_key = format!("cooldown:{}", sanitize_for_key(event_key));
                self.kv
                    .set_ex(&cooldown_key, "1", self.cfg.cooldown_ttl_sec)
                    .await?;
                self.kv.del(&fail_key).await?;
            }
            anyhow::Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(stage = "onchain.cooldown.error", error = %e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn feature(active: f64, growth: f64, top10: f64, self_loop: f64) -> OnchainFeature {
        OnchainFeature {
            active_addr_pctl: active,
            growth_ratio: growth,
            top10_share: top10,
            self_loop_ratio: self_loop,
            asof_ts: Utc::now(),
            window_min: 60,
        }
    }

    #[test]
    fn upgrade_requires_breadth_and_growth() {
        let rules = OnchainRules::default();
        let v = evaluate_feature(&feature(95.0, 3.0, 0.2, 0.01), &rules);
        assert_eq!(v.decision, Decision::Upgrade);

        let v = evaluate_feature(&feature(95.0, 1.0, 0.2, 0.01), &rules);
        assert_eq!(v.decision, Decision::Hold);
    }

    #[test]
    fn concentration_downgrades() {
        let rules = OnchainRules::default();
        let v = evaluate_feature(&feature(95.0, 3.0, 0.9, 0.01), &rules);
        assert_eq!(v.decision, Decision::Downgrade);
        assert!(v.note.is_some());

        let v = evaluate_feature(&feature(10.0, 0.1, 0.1, 0.5), &rules);
        assert_eq!(v.decision, Decision::Downgrade);
    }

    #[test]
    fn sanitize_strips_and_truncates() {
        assert_eq!(sanitize_for_key("AB C\tD"), "ABCD");

        let long = "K".repeat(300);
        let out = sanitize_for_key(&long);
        assert_eq!(out.len(), 191 + 1 + 8);
        assert!(out.starts_with(&"K".repeat(191)));
        assert!(out.contains(':'));
    }

    #[test]
    fn sanitize_keeps_short_keys() {
        let key = "ETH:TOKEN:0XAAAABBBB";
        assert_eq!(sanitize_for_key(key), key);
    }
}
