//! Orchestrator: a beat scheduler emitting periodic jobs and the worker
//! loop that executes them. Tasks are at-least-once; every job is
//! idempotent via dedup keys, idempotency keys or CAS.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;

use crate::enrich::{DexScan, SecurityScan};
use crate::envcfg;
use crate::ingest::Ingestor;
use crate::kv::Kv;
use crate::messaging::TelegramNotifier;
use crate::metrics;
use crate::outbox::{Dispatcher, DispatcherConfig};
use crate::providers::dex::DexProvider;
use crate::providers::onchain::OnchainProvider;
use crate::providers::security::SecurityProvider;
use crate::rules::hotreload::HotConfigRegistry;
use crate::store::{self, Db};
use crate::verifier::{Verifier, VerifierConfig};

// ── Jobs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    Ingest,
    SecurityScan,
    DexScan,
    TopicAggregate,
    Verify,
    PushCards,
    Dispatch,
    DlqRecover,
    ConfigReload,
    BacklogSample,
    Heartbeat,
}

impl Job {
    pub fn as_str(&self) -> &'static str {
        match self {
            Job::Ingest => "ingest",
            Job::SecurityScan => "security_scan",
            Job::DexScan => "dex_scan",
            Job::TopicAggregate => "topic_aggregate",
            Job::Verify => "verify",
            Job::PushCards => "push_cards",
            Job::Dispatch => "dispatch",
            Job::DlqRecover => "dlq_recover",
            Job::ConfigReload => "config_reload",
            Job::BacklogSample => "backlog_sample",
            Job::Heartbeat => "heartbeat",
        }
    }
}

fn default_schedule() -> Vec<(Job, Duration)> {
    let reload_secs = envcfg::env_u64("CONFIG_HOTRELOAD_TTL_SECONDS", 60).max(1);
    vec![
        (Job::Heartbeat, Duration::from_secs(10)),
        (Job::Dispatch, Duration::from_secs(20)),
        (Job::SecurityScan, Duration::from_secs(30)),
        (Job::DexScan, Duration::from_secs(30)),
        (Job::BacklogSample, Duration::from_secs(30)),
        (Job::PushCards, Duration::from_secs(30)),
        (Job::Ingest, Duration::from_secs(60)),
        (Job::TopicAggregate, Duration::from_secs(60)),
        (Job::Verify, Duration::from_secs(60)),
        (Job::ConfigReload, Duration::from_secs(reload_secs)),
        (Job::DlqRecover, Duration::from_secs(300)),
    ]
}

// ── Beat ────────────────────────────────────────────────────────────

/// Interval trigger bookkeeping for the worker loop.
pub struct BeatScheduler {
    triggers: Vec<(Job, Duration)>,
    last_fired: HashMap<Job, Instant>,
}

impl BeatScheduler {
    pub fn new(triggers: Vec<(Job, Duration)>) -> BeatScheduler {
        BeatScheduler {
            triggers,
            last_fired: HashMap::new(),
        }
    }

    pub fn has_triggers(&self) -> bool {
        !self.triggers.is_empty()
    }

    /// Sleep until the next trigger fires; return the due jobs.
    pub async fn wait_for_next(&mut self) -> Vec<Job> {
        if self.triggers.is_empty() {
            tokio::time::sleep(Duration::from_secs(86400)).await;
            return Vec::new();
        }

        let now = Instant::now();
        let mut min_wait = Duration::from_secs(86400);

        for (job, interval) in &self.triggers {
            // First run: pretend we fired one interval ago so the job is
            // due immediately.
            let last = self
                .last_fired
                .get(job)
                .copied()
                .unwrap_or_else(|| now - *interval);
            let elapsed = now.duration_since(last);
            if elapsed >= *interval {
                min_wait = Duration::ZERO;
                break;
            }
            let remaining = *interval - elapsed;
            if remaining < min_wait {
                min_wait = remaining;
            }
        }

        if !min_wait.is_zero() {
            tokio::time::sleep(min_wait).await;
        }

        let now = Instant::now();
        let mut fired = Vec::new();
        for (job, interval) in &self.triggers {
            let last = self
                .last_fired
                .get(job)
                .copied()
                .unwrap_or_else(|| now - *interval);
            if now.duration_since(last) >= *interval {
                fired.push(*job);
                self.last_fired.insert(*job, now);
            }
        }
        fired
    }

    /// All triggers at once, for `--once` style passes.
    pub fn get_all_due(&mut self) -> Vec<Job> {
        let now = Instant::now();
        self.triggers
            .iter()
            .map(|(job, _)| {
                self.last_fired.insert(*job, now);
                *job
            })
            .collect()
    }
}

// ── Worker ──────────────────────────────────────────────────────────

pub struct Worker {
    pub db: Db,
    pub kv: Kv,
    pub registry: Arc<HotConfigRegistry>,
    ingestor: Ingestor,
    security_scan: SecurityScan,
    dex_scan: DexScan,
    security_provider: SecurityProvider,
    dex_provider: Arc<DexProvider>,
    verifier: Verifier,
    topic_aggregator: crate::topic::TopicAggregator,
    card_builder: crate::cards::CardBuilder,
    dispatcher: Dispatcher,
    verify_limit: usize,
    push_limit: usize,
    dlq_limit: usize,
    dlq_max_age_secs: i64,
    backlog_warn: i64,
}

impl Worker {
    pub async fn from_env() -> Result<Worker> {
        let kv = Kv::connect().await;
        let db = store::open_from_env()?;
        let registry = HotConfigRegistry::from_env()?;
        registry.install_signal_handler();

        let dex_provider = Arc::new(DexProvider::from_env(kv.clone()));
        let security_provider =
            SecurityProvider::from_env(kv.clone(), db.clone(), Arc::clone(&registry));
        let verifier = Verifier::new(
            db.clone(),
            kv.clone(),
            Arc::clone(&registry),
            OnchainProvider::from_env(),
            VerifierConfig::from_env(),
        );
        let dispatcher = Dispatcher::new(
            db.clone(),
            kv.clone(),
            Box::new(TelegramNotifier::from_env()),
            DispatcherConfig::from_env(),
        );
        let card_builder = crate::cards::CardBuilder::new(
            db.clone(),
            Arc::clone(&dex_provider),
            Arc::clone(&registry),
        );
        let topic_aggregator =
            crate::topic::TopicAggregator::from_env(db.clone(), kv.clone(), Arc::clone(&registry));

        Ok(Worker {
            ingestor: Ingestor::from_env(kv.clone(), db.clone()),
            security_scan: SecurityScan::from_env(),
            dex_scan: DexScan::from_env(),
            security_provider,
            dex_provider,
            verifier,
            topic_aggregator,
            card_builder,
            dispatcher,
            verify_limit: envcfg::env_usize("ONCHAIN_VERIFY_LIMIT", 100),
            push_limit: envcfg::env_usize("CARDS_PUSH_LIMIT", 50),
            dlq_limit: envcfg::env_usize("OUTBOX_DLQ_RECOVER_LIMIT", 50),
            dlq_max_age_secs: envcfg::env_i64("OUTBOX_DLQ_MAX_AGE_SEC", 3600),
            backlog_warn: envcfg::env_i64("CELERY_BACKLOG_WARN", 100),
            db,
            kv,
            registry,
        })
    }

    /// Daemon loop: fire due jobs, log failures, never die on one.
    pub async fn run(&self) -> Result<()> {
        metrics::UP.set(1.0);
        let mut beat = BeatScheduler::new(default_schedule());
        tracing::info!(stage = "worker.start", jobs = beat.triggers.len());

        loop {
            let due = beat.wait_for_next().await;
            for job in due {
                let started = Instant::now();
                self.run_job(job).await;
                tracing::debug!(
                    stage = "worker.job",
                    job = job.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                );
            }
        }
    }

    /// One pass of every job, for the single-shot CLI subcommands.
    pub async fn run_all_once(&self) {
        let mut beat = BeatScheduler::new(default_schedule());
        for job in beat.get_all_due() {
            self.run_job(job).await;
        }
    }

    pub async fn run_job(&self, job: Job) {
        match job {
            Job::Ingest => {
                let stats = self.ingestor.run_once().await;
                tracing::info!(stage = "job.ingest", stats = %serde_json::to_string(&stats).unwrap_or_default());
            }
            Job::SecurityScan => {
                let stats = self
                    .security_scan
                    .run_once(&self.db, &self.security_provider)
                    .await;
                tracing::info!(stage = "job.security_scan", stats = %serde_json::to_string(&stats).unwrap_or_default());
            }
            Job::DexScan => {
                let stats = self.dex_scan.run_once(&self.db, &self.dex_provider).await;
                tracing::info!(stage = "job.dex_scan", stats = %serde_json::to_string(&stats).unwrap_or_default());
            }
            Job::TopicAggregate => {
                let stats = self.topic_aggregator.run_once().await;
                tracing::info!(stage = "job.topic_aggregate", stats = %serde_json::to_string(&stats).unwrap_or_default());
            }
            Job::Verify => self.run_verify(self.verify_limit).await,
            Job::PushCards => {
                let stats = crate::cards::push::push_ready_cards(
                    &self.db,
                    &self.kv,
                    &self.card_builder,
                    self.push_limit,
                )
                .await;
                tracing::info!(stage = "job.push_cards", stats = %serde_json::to_string(&stats).unwrap_or_default());
            }
            Job::Dispatch => {
                let stats = self.dispatcher.dispatch_once().await;
                tracing::info!(stage = "job.dispatch", stats = %serde_json::to_string(&stats).unwrap_or_default());
            }
            Job::DlqRecover => {
                let stats = self
                    .dispatcher
                    .recover_dlq_once(self.dlq_limit, self.dlq_max_age_secs)
                    .await;
                tracing::info!(stage = "job.dlq_recover", stats = %serde_json::to_string(&stats).unwrap_or_default());
            }
            Job::ConfigReload => {
                self.registry.reload_if_stale(false);
            }
            Job::BacklogSample => self.sample_backlog().await,
            Job::Heartbeat => heartbeat(&self.kv).await,
        }
    }

    /// One verifier pass with an explicit scan limit (CLI override).
    pub async fn run_verify(&self, limit: usize) {
        let stats = self.verifier.run_once(limit).await;
        tracing::info!(stage = "job.verify", stats = %serde_json::to_string(&stats).unwrap_or_default());
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    async fn sample_backlog(&self) {
        let backlog = {
            let conn = self.db.lock().await;
            crate::store::outbox::count_backlog(&conn).unwrap_or(0)
        };
        metrics::QUEUE_BACKLOG
            .with_label_values(&["outbox"])
            .set(backlog as f64);
        metrics::OUTBOX_BACKLOG.set(backlog as f64);
        if backlog > self.backlog_warn {
            metrics::QUEUE_BACKLOG_WARN.inc();
            tracing::warn!(stage = "queue.backlog.warn", backlog = backlog, threshold = self.backlog_warn);
        }
    }
}

// ── Liveness ────────────────────────────────────────────────────────

fn heartbeat_key() -> String {
    envcfg::env_str("BEAT_HEARTBEAT_KEY", "beat:last_heartbeat")
}

/// Record a beat heartbeat in KV and metrics.
pub async fn heartbeat(kv: &Kv) {
    metrics::BEAT_HEARTBEAT.inc();
    let now = Utc::now().timestamp() as f64;
    metrics::BEAT_HEARTBEAT_TIMESTAMP.set(now);
    metrics::BEAT_HEARTBEAT_AGE_SECONDS.set(0.0);
    if let Err(e) = kv.set(&heartbeat_key(), &now.to_string()).await {
        tracing::warn!(stage = "beat.heartbeat.error", error = %e);
    }
}

/// Health check: fails when the last heartbeat is older than
/// `BEAT_MAX_LAG_SEC`.
pub async fn beat_healthy(kv: &Kv) -> bool {
    let max_lag = envcfg::env_f64("BEAT_MAX_LAG_SEC", 120.0);
    let last = match kv.get(&heartbeat_key()).await {
        Ok(Some(v)) => v.parse::<f64>().ok(),
        _ => None,
    };
    let Some(last) = last else {
        return false;
    };
    let age = Utc::now().timestamp() as f64 - last;
    metrics::BEAT_HEARTBEAT_AGE_SECONDS.set(age.max(0.0));
    age <= max_lag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_pass_fires_every_job() {
        let mut beat = BeatScheduler::new(default_schedule());
        let due = beat.wait_for_next().await;
        assert_eq!(due.len(), default_schedule().len());
    }

    #[tokio::test]
    async fn heartbeat_roundtrip() {
        let kv = Kv::memory();
        assert!(!beat_healthy(&kv).await);
        heartbeat(&kv).await;
        assert!(beat_healthy(&kv).await);
    }
}
