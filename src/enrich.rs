//! Enrichment scanners: batch jobs that attach provider data to pending
//! signals and merge raw responses into event evidence.

use std::time::Duration;

use serde_json::{Value, json};

use crate::envcfg;
use crate::providers::dex::DexProvider;
use crate::providers::security::SecurityProvider;
use crate::store::{Db, events, signals};

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ScanStats {
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Chain id recovered from event evidence; the mainnet id when absent.
fn evidence_chain_id(evidence: &Value) -> String {
    let from_obj = |o: &Value| {
        o.get("chain_id")
            .and_then(|v| v.as_str().map(String::from).or_else(|| v.as_i64().map(|i| i.to_string())))
    };
    match evidence {
        Value::Object(_) => from_obj(evidence),
        Value::Array(items) => items.iter().find_map(from_obj),
        _ => None,
    }
    .unwrap_or_else(|| "1".to_string())
}

// ── Security scanner ────────────────────────────────────────────────

pub struct SecurityScan {
    pub enabled: bool,
    pub batch_size: usize,
    pub interval_s: u64,
}

impl SecurityScan {
    pub fn from_env() -> SecurityScan {
        SecurityScan {
            enabled: envcfg::env_bool("ENABLE_GOPLUS_SCAN", false),
            batch_size: envcfg::env_usize("GOPLUS_SCAN_BATCH", 50),
            interval_s: envcfg::env_u64("GOPLUS_SCAN_INTERVAL_S", 10),
        }
    }

    /// One batch: fill risk columns on signals and merge a `goplus_raw`
    /// summary into the owning event's evidence.
    pub async fn run_once(&self, db: &Db, provider: &SecurityProvider) -> ScanStats {
        let mut stats = ScanStats::default();
        if !self.enabled {
            tracing::info!(stage = "goplus.scan.disabled", reason = "ENABLE_GOPLUS_SCAN not true");
            return stats;
        }

        let items = {
            let conn = db.lock().await;
            match signals::list_security_pending(&conn, self.batch_size) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(stage = "goplus.scan.error", error = %e);
                    return stats;
                }
            }
        };

        tracing::info!(stage = "goplus.scan.start", batch_size = self.batch_size, pending = items.len());

        for item in &items {
            stats.processed += 1;

            let Some(token_ca) = &item.token_ca else {
                tracing::debug!(stage = "goplus.scan.skip", signal_id = item.signal_id, reason = "no_token_ca");
                stats.skipped += 1;
                continue;
            };
            let chain_id = evidence_chain_id(&item.evidence);

            let result = provider.check_token(&chain_id, token_ca).await;

            let summary_text = result
                .notes
                .first()
                .cloned()
                .unwrap_or_else(|| {
                    if result.degrade {
                        "evaluated by local rules".to_string()
                    } else {
                        "evaluated by security api".to_string()
                    }
                });
            let summary = json!({
                "summary": summary_text,
                "risk_label": result.risk_label.as_str(),
                "buy_tax": result.buy_tax,
                "sell_tax": result.sell_tax,
                "lp_lock_days": result.lp_lock_days,
                "honeypot": result.honeypot,
                "checked_at": result.checked_at,
                "cache": result.cache,
                "degrade": result.degrade,
            });

            let write = {
                let conn = db.lock().await;
                let now = crate::store::now_ts();
                signals::update_security(
                    &conn,
                    item.signal_id,
                    result.risk_label,
                    result.buy_tax,
                    result.sell_tax,
                    result.lp_lock_days,
                    result.honeypot,
                    &now,
                )
                .and_then(|_| {
                    events::merge_provider_evidence(
                        &conn,
                        &item.event_key,
                        "goplus",
                        "goplus_raw",
                        summary,
                    )
                })
            };

            match write {
                Ok(()) => {
                    stats.success += 1;
                    tracing::info!(
                        stage = "goplus.scan.item",
                        signal_id = item.signal_id,
                        symbol = item.symbol.as_deref(),
                        risk = result.risk_label.as_str(),
                        cache = result.cache,
                    );
                }
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(stage = "goplus.scan.item_error", signal_id = item.signal_id, error = %e);
                }
            }
        }

        // Yield rate-limit budget when the batch was not saturated.
        if stats.processed > 0 && stats.processed < self.batch_size {
            tokio::time::sleep(Duration::from_secs(self.interval_s)).await;
        }

        tracing::info!(
            stage = "goplus.scan.complete",
            processed = stats.processed,
            success = stats.success,
            failed = stats.failed,
        );
        stats
    }
}

// ── Market scanner ──────────────────────────────────────────────────

pub struct DexScan {
    pub enabled: bool,
    pub batch_size: usize,
    pub interval_s: u64,
}

impl DexScan {
    pub fn from_env() -> DexScan {
        DexScan {
            enabled: envcfg::env_bool("ENABLE_DEX_SCAN", false),
            batch_size: envcfg::env_usize("DEX_SCAN_BATCH", 50),
            interval_s: envcfg::env_u64("DEX_SCAN_INTERVAL_S", 10),
        }
    }

    /// One batch: fill liquidity/volume columns and merge a `dex_raw`
    /// summary into evidence.
    pub async fn run_once(&self, db: &Db, provider: &DexProvider) -> ScanStats {
        let mut stats = ScanStats::default();
        if !self.enabled {
            tracing::info!(stage = "dex.scan.disabled", reason = "ENABLE_DEX_SCAN not true");
            return stats;
        }

        let items = {
            let conn = db.lock().await;
            match signals::list_dex_pending(&conn, self.batch_size) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(stage = "dex.scan.error", error = %e);
                    return stats;
                }
            }
        };

        for item in &items {
            stats.processed += 1;
            let Some(token_ca) = &item.token_ca else {
                stats.skipped += 1;
                continue;
            };
            let chain = evidence_chain_id(&item.evidence);
            let chain = if chain == "1" { "eth".to_string() } else { chain };

            let snap = provider.get_snapshot(&chain, token_ca).await;

            let summary = json!({
                "price_usd": snap.price_usd,
                "liquidity_usd": snap.liquidity_usd,
                "volume_1h": snap.volume_1h,
                "source": snap.source,
                "cache": snap.cache,
                "stale": snap.stale,
                "degrade": snap.degrade,
                "reason": snap.reason,
                "checked_at": snap.timestamp,
            });

            let write = {
                let conn = db.lock().await;
                let now = crate::store::now_ts();
                signals::update_dex(&conn, item.signal_id, snap.liquidity_usd, snap.volume_1h, &now)
                    .and_then(|_| {
                        events::merge_provider_evidence(
                            &conn,
                            &item.event_key,
                            "dex",
                            "dex_raw",
                            summary,
                        )
                    })
            };

            match write {
                Ok(()) => stats.success += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(stage = "dex.scan.item_error", signal_id = item.signal_id, error = %e);
                }
            }
        }

        if stats.processed > 0 && stats.processed < self.batch_size {
            tokio::time::sleep(Duration::from_secs(self.interval_s)).await;
        }

        stats
    }
}
