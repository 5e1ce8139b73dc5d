//! Process-global Prometheus metrics.
//!
//! Every metric the pipeline observes is registered once against a single
//! registry so `/metrics` and tests see a consistent surface.

use std::sync::LazyLock;

use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("valid metric name");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric name");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

fn gauge(name: &str, help: &str) -> Gauge {
    let g = Gauge::new(name, help).expect("valid metric name");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("valid metric name");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
}

fn histogram(name: &str, help: &str, buckets: &[f64]) -> Histogram {
    let h = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets.to_vec()))
        .expect("valid metric name");
    REGISTRY.register(Box::new(h.clone())).ok();
    h
}

// ── Liveness ────────────────────────────────────────────────────────

pub static UP: LazyLock<Gauge> = LazyLock::new(|| gauge("up", "Process is up"));

pub static BEAT_HEARTBEAT: LazyLock<IntCounter> =
    LazyLock::new(|| counter("beat_heartbeat", "Scheduler beat heartbeat count"));

pub static BEAT_HEARTBEAT_TIMESTAMP: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "beat_heartbeat_timestamp",
        "Last beat heartbeat unix timestamp",
    )
});

pub static BEAT_HEARTBEAT_AGE_SECONDS: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "beat_heartbeat_age_seconds",
        "Seconds since the last beat heartbeat",
    )
});

pub static QUEUE_BACKLOG: LazyLock<GaugeVec> = LazyLock::new(|| {
    gauge_vec(
        "celery_queue_backlog",
        "Backlog size per work queue",
        &["queue"],
    )
});

pub static QUEUE_BACKLOG_WARN: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "celery_queue_backlog_warn_total",
        "Times a queue backlog exceeded the warn threshold",
    )
});

// ── Pipeline / cards ────────────────────────────────────────────────

pub static PIPELINE_LATENCY_MS: LazyLock<Histogram> = LazyLock::new(|| {
    histogram(
        "pipeline_latency_ms",
        "End-to-end pipeline latency in milliseconds",
        &[50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0],
    )
});

pub static CARDS_DEGRADE_COUNT: LazyLock<IntCounter> =
    LazyLock::new(|| counter("cards_degrade_count", "Degraded card batches"));

pub static CARDS_PUSH_FAIL_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "cards_push_fail_total",
        "Card push failures by code",
        &["code"],
    )
});

// ── Delivery ────────────────────────────────────────────────────────

pub static TELEGRAM_SEND_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "telegram_send_total",
        "Telegram send attempts by status and code",
        &["status", "code"],
    )
});

pub static TELEGRAM_RETRY_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| counter("telegram_retry_total", "Telegram send retries"));

pub static TELEGRAM_SEND_LATENCY_MS: LazyLock<Histogram> = LazyLock::new(|| {
    histogram(
        "telegram_send_latency_ms",
        "Telegram send latency in milliseconds",
        &[50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0],
    )
});

pub static OUTBOX_BACKLOG: LazyLock<Gauge> =
    LazyLock::new(|| gauge("outbox_backlog", "Pending + retry outbox rows"));

pub static DLQ_RECOVERED_COUNT: LazyLock<IntCounter> =
    LazyLock::new(|| counter("dlq_recovered_count", "DLQ entries recovered"));

pub static DLQ_DISCARDED_COUNT: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "dlq_discarded_count",
        "DLQ entries discarded for staleness or missing source",
    )
});

// ── Config hot reload ───────────────────────────────────────────────

pub static CONFIG_RELOAD_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| counter("config_reload_total", "Successful config reloads"));

pub static CONFIG_RELOAD_ERRORS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| counter("config_reload_errors_total", "Config reload errors"));

pub static CONFIG_VERSION: LazyLock<GaugeVec> = LazyLock::new(|| {
    gauge_vec(
        "config_version",
        "Currently-loaded config version (by sha label)",
        &["sha"],
    )
});

pub static CONFIG_LAST_SUCCESS_UNIXTIME: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "config_last_success_unixtime",
        "Unix time of the last successful config load",
    )
});

// ── On-chain verifier ───────────────────────────────────────────────

pub static ONCHAIN_LOCK_ACQUIRE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "onchain_lock_acquire_total",
        "On-chain lock acquire attempts by status",
        &["status"],
    )
});

pub static ONCHAIN_LOCK_RELEASE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "onchain_lock_release_total",
        "On-chain lock release results by status",
        &["status"],
    )
});

pub static ONCHAIN_CAS_CONFLICT_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "onchain_state_cas_conflict_total",
        "CAS conflicts while updating signal state",
    )
});

pub static ONCHAIN_COOLDOWN_HIT_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "onchain_cooldown_hit_total",
        "Cooldown hits causing verification skips",
    )
});

pub static ONCHAIN_PROCESS_MS: LazyLock<Histogram> = LazyLock::new(|| {
    histogram(
        "onchain_process_ms",
        "Verification processing time per signal (ms)",
        &[10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0],
    )
});

pub static ONCHAIN_LOCK_HOLD_MS: LazyLock<Histogram> = LazyLock::new(|| {
    histogram(
        "onchain_lock_hold_ms",
        "Lock hold time per signal (ms)",
        &[1.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0],
    )
});

pub static ONCHAIN_LOCK_WAIT_MS: LazyLock<Histogram> = LazyLock::new(|| {
    histogram(
        "onchain_lock_wait_ms",
        "Lock wait time before acquisition (ms)",
        &[0.0, 1.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0],
    )
});

/// Export all registered metrics in Prometheus text format.
pub fn export_text() -> String {
    UP.set(1.0);
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
