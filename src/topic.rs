//! Topic aggregation.
//!
//! Ingestion tags memeable posts with a stable topic hash and records each
//! mention in a KV time series. The aggregation job groups tagged events
//! inside the configured window, merges near-duplicate entity sets,
//! computes 10/30-minute heat and slope from the time series, writes the
//! results back onto events and topic signals, and surfaces hot topics as
//! push candidates under a cooldown.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use serde_json::json;
use sha1::{Digest, Sha1};

use crate::envcfg;
use crate::kv::Kv;
use crate::messaging;
use crate::rules::hotreload::HotConfigRegistry;
use crate::store::{Db, events, outbox, signals};

const STOP_TERMS: [&str; 3] = ["meme", "gm", "wagmi"];
const SYNONYMS: [(&str, &str); 1] = [("frog", "pepe")];
const ENTITY_STOPWORDS: [&str; 9] = [
    "the", "and", "or", "but", "with", "for", "new", "best", "top",
];

/// Mention time series retention; heat windows are always far shorter.
const MENTION_RETENTION_SECS: i64 = 86_400;

static SYMBOL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$([A-Z]{2,10})\b").unwrap());
static NAMED_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([A-Za-z]{2,10})\s+(?:token|coin|meme)\b").unwrap());
static ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:buy|moon|pump|launch)\s+([A-Za-z]{2,10})\b").unwrap());
static MEME_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([a-z]+(?:inu|dog|cat|pepe|elon|moon))\b").unwrap());

// ── Config ──────────────────────────────────────────────────────────

/// The `topic_merge` namespace. `whitelist` is an optional extra list of
/// boosted entities.
#[derive(Debug, Clone)]
pub struct TopicMergeConfig {
    pub sim_threshold: f64,
    pub jaccard_fallback: f64,
    pub whitelist_boost: f64,
    pub window_hours: i64,
    pub slope_window_10m: i64,
    pub slope_window_30m: i64,
    pub whitelist: Vec<String>,
}

impl Default for TopicMergeConfig {
    fn default() -> Self {
        TopicMergeConfig {
            sim_threshold: 0.83,
            jaccard_fallback: 0.5,
            whitelist_boost: 0.05,
            window_hours: 24,
            slope_window_10m: 10,
            slope_window_30m: 30,
            whitelist: Vec::new(),
        }
    }
}

impl TopicMergeConfig {
    pub fn from_registry(registry: &HotConfigRegistry) -> TopicMergeConfig {
        let ns = registry.get_ns("topic_merge");
        let d = TopicMergeConfig::default();
        let num = |key: &str, default: f64| ns.get(key).and_then(|v| v.as_f64()).unwrap_or(default);
        let int = |key: &str, default: i64| ns.get(key).and_then(|v| v.as_i64()).unwrap_or(default);
        let whitelist = ns
            .get("whitelist")
            .and_then(|v| v.as_sequence())
            .map(|seq| {
                seq.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        TopicMergeConfig {
            sim_threshold: num("sim_threshold", d.sim_threshold),
            jaccard_fallback: num("jaccard_fallback", d.jaccard_fallback),
            whitelist_boost: num("whitelist_boost", d.whitelist_boost),
            window_hours: int("window_hours", d.window_hours),
            slope_window_10m: int("slope_window_10m", d.slope_window_10m),
            slope_window_30m: int("slope_window_30m", d.slope_window_30m),
            whitelist,
        }
    }
}

// ── Entity extraction ───────────────────────────────────────────────

fn is_potential_entity(word: &str) -> bool {
    let len = word.chars().count();
    if !(2..=20).contains(&len) {
        return false;
    }
    !ENTITY_STOPWORDS.contains(&word.to_lowercase().as_str())
}

fn map_synonym(word: &str) -> String {
    let lower = word.to_lowercase();
    SYNONYMS
        .iter()
        .find(|(from, _)| *from == lower)
        .map(|(_, to)| to.to_string())
        .unwrap_or(lower)
}

/// Rule-based memeable entity extraction: ticker symbols, "X token/coin"
/// phrases, action targets and common meme-name shapes, normalized through
/// the synonym and stop-term tables. Confidence scales with match count.
pub fn extract_entities(text: &str) -> (Vec<String>, f64) {
    let mut raw: Vec<String> = Vec::new();
    for re in [&*SYMBOL_RE, &*NAMED_TOKEN_RE, &*ACTION_RE, &*MEME_NAME_RE] {
        for caps in re.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                let word = m.as_str().trim();
                if is_potential_entity(word) {
                    raw.push(word.to_lowercase());
                }
            }
        }
    }

    // Synonyms + stop terms, de-duplicated preserving first appearance.
    let mut entities: Vec<String> = Vec::new();
    for word in raw {
        let mapped = map_synonym(&word);
        if mapped.is_empty() || STOP_TERMS.contains(&mapped.as_str()) {
            continue;
        }
        if !entities.contains(&mapped) {
            entities.push(mapped);
        }
    }
    entities.truncate(3);

    let confidence = (entities.len() as f64 * 0.3).min(1.0);
    (entities, confidence)
}

/// The rules backend's memeable heuristic: entities found with enough
/// corroboration.
pub fn detect_topic(text: &str) -> Option<(String, Vec<String>, f64)> {
    let (entities, confidence) = extract_entities(text);
    if entities.is_empty() || confidence <= 0.5 {
        return None;
    }
    Some((topic_id(&entities), entities, confidence))
}

/// Deterministic topic id: `t.` plus 12 hex of SHA1 over the sorted,
/// lowercased entity list.
pub fn topic_id(entities: &[String]) -> String {
    let mut sorted: Vec<String> = entities.iter().map(|e| e.to_lowercase()).collect();
    sorted.sort();
    let mut hasher = Sha1::new();
    hasher.update(sorted.join("|").as_bytes());
    format!("t.{}", &format!("{:x}", hasher.finalize())[..12])
}

// ── Similarity / merging ────────────────────────────────────────────

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn trigrams(text: &str) -> BTreeSet<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = BTreeSet::new();
    for window in chars.windows(3) {
        out.insert(window.iter().collect());
    }
    out
}

/// Cosine similarity over character trigrams of the joined entity lists.
/// Stands in for the embedding similarity of the primary merge path.
fn trigram_cosine(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let ta = trigrams(&a.iter().cloned().collect::<Vec<_>>().join(" "));
    let tb = trigrams(&b.iter().cloned().collect::<Vec<_>>().join(" "));
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count() as f64;
    shared / ((ta.len() as f64).sqrt() * (tb.len() as f64).sqrt())
}

/// Merge ladder: exact entity match, trigram similarity at
/// `sim_threshold`, then Jaccard at `jaccard_fallback`.
pub fn should_merge(
    a: &BTreeSet<String>,
    b: &BTreeSet<String>,
    cfg: &TopicMergeConfig,
) -> Option<&'static str> {
    if a == b {
        return Some("exact");
    }
    if trigram_cosine(a, b) >= cfg.sim_threshold {
        return Some("similarity");
    }
    if jaccard(a, b) >= cfg.jaccard_fallback {
        return Some("jaccard");
    }
    None
}

// ── Mention time series ─────────────────────────────────────────────

fn mentions_key(topic_id: &str) -> String {
    format!("topic:mentions:{topic_id}")
}

/// Record one mention (scored by time) and prune beyond retention.
pub async fn record_mention(kv: &Kv, topic_id: &str, member: &str) {
    let now = Utc::now().timestamp();
    let key = mentions_key(topic_id);
    let result = async {
        kv.zadd(&key, member, now as f64).await?;
        kv.zremrangebyscore(&key, 0.0, (now - MENTION_RETENTION_SECS) as f64)
            .await?;
        anyhow::Ok(())
    }
    .await;
    if let Err(e) = result {
        tracing::warn!(stage = "topic.mention.error", topic_id = %topic_id, error = %e);
    }
}

/// Mentions inside the two heat windows, summed over all member hashes of
/// a merged topic.
async fn heat_counts(kv: &Kv, hashes: &BTreeSet<String>, cfg: &TopicMergeConfig) -> (i64, i64) {
    let now = Utc::now().timestamp() as f64;
    let mut h10 = 0i64;
    let mut h30 = 0i64;
    for hash in hashes {
        let key = mentions_key(hash);
        h10 += kv
            .zcount(&key, now - (cfg.slope_window_10m * 60) as f64, now)
            .await
            .unwrap_or(0) as i64;
        h30 += kv
            .zcount(&key, now - (cfg.slope_window_30m * 60) as f64, now)
            .await
            .unwrap_or(0) as i64;
    }
    (h10, h30)
}

/// Mention-rate change per minute: the recent window's rate against the
/// rate of the window that preceded it.
pub fn heat_slope(heat_10m: i64, heat_30m: i64, cfg: &TopicMergeConfig) -> f64 {
    let w10 = cfg.slope_window_10m.max(1) as f64;
    let prior_minutes = (cfg.slope_window_30m - cfg.slope_window_10m).max(1) as f64;
    let recent_rate = heat_10m as f64 / w10;
    let prior_rate = (heat_30m - heat_10m).max(0) as f64 / prior_minutes;
    ((recent_rate - prior_rate) * 100.0).round() / 100.0
}

// ── Aggregation job ─────────────────────────────────────────────────

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct TopicStats {
    pub tagged_events: usize,
    pub groups: usize,
    pub merged: usize,
    pub heat_updates: usize,
    pub signals_created: usize,
    pub signals_updated: usize,
    pub candidates: usize,
    pub pushed: usize,
}

struct Group {
    entities: BTreeSet<String>,
    mentions: usize,
    latest_ts: String,
    member_hashes: BTreeSet<String>,
    event_keys: Vec<(String, String)>,
}

pub struct TopicAggregator {
    db: Db,
    kv: Kv,
    registry: Arc<HotConfigRegistry>,
    push_enabled: bool,
    min_mentions: usize,
    cooldown_secs: u64,
}

impl TopicAggregator {
    pub fn from_env(db: Db, kv: Kv, registry: Arc<HotConfigRegistry>) -> TopicAggregator {
        TopicAggregator::new(db, kv, registry)
            .with_push_policy(
                envcfg::env_bool("TOPIC_PUSH_ENABLED", true),
                envcfg::env_usize("TOPIC_PUSH_MIN_MENTIONS", 3),
                envcfg::env_u64("TOPIC_PUSH_COOLDOWN_SEC", 3600),
            )
    }

    pub fn new(db: Db, kv: Kv, registry: Arc<HotConfigRegistry>) -> TopicAggregator {
        TopicAggregator {
            db,
            kv,
            registry,
            push_enabled: true,
            min_mentions: 3,
            cooldown_secs: 3600,
        }
    }

    pub fn with_push_policy(
        mut self,
        enabled: bool,
        min_mentions: usize,
        cooldown_secs: u64,
    ) -> TopicAggregator {
        self.push_enabled = enabled;
        self.min_mentions = min_mentions;
        self.cooldown_secs = cooldown_secs;
        self
    }

    /// One aggregation pass over the window.
    pub async fn run_once(&self) -> TopicStats {
        let mut stats = TopicStats::default();

        self.registry.reload_if_stale(false);
        let cfg = TopicMergeConfig::from_registry(&self.registry);

        let since =
            crate::store::to_ts(Utc::now() - chrono::Duration::hours(cfg.window_hours));
        let tagged = {
            let conn = self.db.lock().await;
            match events::list_topic_tagged(&conn, &since) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(stage = "topic.aggregate.error", error = %e);
                    return stats;
                }
            }
        };
        stats.tagged_events = tagged.len();

        // Group by hash, keeping entity unions and the event list.
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        for row in tagged {
            let group = groups.entry(row.topic_hash.clone()).or_insert_with(|| Group {
                entities: BTreeSet::new(),
                mentions: 0,
                latest_ts: row.last_ts.clone(),
                member_hashes: BTreeSet::from([row.topic_hash.clone()]),
                event_keys: Vec::new(),
            });
            group.mentions += 1;
            for e in &row.entities {
                let v = e.trim().to_lowercase();
                if !v.is_empty() {
                    group.entities.insert(v);
                }
            }
            if row.last_ts > group.latest_ts {
                group.latest_ts = row.last_ts.clone();
            }
            group.event_keys.push((row.event_key, row.last_ts));
        }
        groups.retain(|_, g| !g.entities.is_empty());
        stats.groups = groups.len();

        // Merge near-duplicate topics, largest groups first.
        let mut ordered: Vec<(String, Group)> = groups.into_iter().collect();
        ordered.sort_by(|a, b| b.1.mentions.cmp(&a.1.mentions).then(a.0.cmp(&b.0)));

        let mut merged: Vec<Group> = Vec::new();
        for (_, group) in ordered {
            match merged
                .iter_mut()
                .find(|rep| should_merge(&rep.entities, &group.entities, &cfg).is_some())
            {
                Some(rep) => {
                    stats.merged += 1;
                    rep.mentions += group.mentions;
                    rep.entities.extend(group.entities);
                    rep.member_hashes.extend(group.member_hashes);
                    rep.event_keys.extend(group.event_keys);
                    if group.latest_ts > rep.latest_ts {
                        rep.latest_ts = group.latest_ts;
                    }
                }
                None => merged.push(group),
            }
        }

        for topic in &merged {
            let (h10, h30) = heat_counts(&self.kv, &topic.member_hashes, &cfg).await;
            let slope = heat_slope(h10, h30, &cfg);
            let score = self.candidate_score(topic, &cfg);

            {
                let conn = self.db.lock().await;
                for hash in &topic.member_hashes {
                    match events::update_topic_heat(&conn, hash, h10, h30, score) {
                        Ok(n) => stats.heat_updates += n,
                        Err(e) => {
                            tracing::warn!(stage = "topic.heat.error", topic_id = %hash, error = %e);
                        }
                    }
                }

                for (event_key, last_ts) in &topic.event_keys {
                    match signals::upsert_topic_signal(&conn, event_key, slope, last_ts) {
                        Ok(signals::TopicSignalOutcome::Created) => stats.signals_created += 1,
                        Ok(signals::TopicSignalOutcome::Updated) => stats.signals_updated += 1,
                        Ok(signals::TopicSignalOutcome::SkippedNonTopic) => {}
                        Err(e) => {
                            tracing::warn!(
                                stage = "topic.signal.scan.error",
                                event_key = %event_key,
                                error = %e,
                            );
                        }
                    }
                }
            }

            self.consider_push(topic, h10, h30, score, &mut stats).await;
        }

        tracing::info!(
            stage = "topic.aggregate.done",
            window_hours = cfg.window_hours,
            groups = stats.groups,
            merged = stats.merged,
            candidates = stats.candidates,
            pushed = stats.pushed,
        );
        stats
    }

    fn candidate_score(&self, topic: &Group, cfg: &TopicMergeConfig) -> f64 {
        let base = (topic.mentions as f64 / 100.0).min(1.0);
        let boosted = if topic.entities.iter().any(|e| cfg.whitelist.contains(e)) {
            (base + cfg.whitelist_boost).min(1.0)
        } else {
            base
        };
        (boosted * 100.0).round() / 100.0
    }

    /// Hot topics become outbox candidates, once per cooldown window.
    async fn consider_push(
        &self,
        topic: &Group,
        h10: i64,
        h30: i64,
        score: f64,
        stats: &mut TopicStats,
    ) {
        let topic_hash = topic
            .member_hashes
            .first()
            .cloned()
            .unwrap_or_default();

        tracing::debug!(
            stage = "topic.push.consider",
            topic_id = %topic_hash,
            mention_count = topic.mentions,
        );

        if !self.push_enabled || topic.mentions < self.min_mentions {
            tracing::debug!(
                stage = "topic.push.skipped_threshold",
                topic_id = %topic_hash,
                min_mentions = self.min_mentions,
            );
            return;
        }
        stats.candidates += 1;

        let dedup_key = format!("topic:dedup:{topic_hash}");
        match self.kv.set_nx_ex(&dedup_key, "1", self.cooldown_secs).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(stage = "topic.push.skipped_dedup", topic_id = %topic_hash);
                return;
            }
            Err(e) => {
                tracing::warn!(stage = "topic.push.redis.error", topic_id = %topic_hash, error = %e);
                return;
            }
        }

        let text = format_topic_message(topic, h10, h30);
        let event_key = format!(
            "TOPIC:{}",
            topic_hash.trim_start_matches("t.").to_uppercase()
        );
        let payload = json!({
            "type": "topic_candidate",
            "topic_id": topic_hash,
            "entities": topic.entities,
            "mention_count": topic.mentions,
            "candidate_score": score,
            "latest_ts": topic.latest_ts,
            "text": text,
        });

        let enqueued = {
            let conn = self.db.lock().await;
            outbox::enqueue(
                &conn,
                messaging::effective_channel_id(),
                messaging::effective_thread_id(),
                &event_key,
                &payload,
            )
        };
        match enqueued {
            Ok(row_id) => {
                stats.pushed += 1;
                tracing::info!(
                    stage = "topic.push.sent",
                    topic_id = %topic_hash,
                    outbox_id = row_id,
                    mention_count = topic.mentions,
                );
            }
            Err(e) => {
                tracing::warn!(stage = "topic.push.error", topic_id = %topic_hash, error = %e);
                // Release the cooldown so the next pass can retry.
                let _ = self.kv.del(&dedup_key).await;
            }
        }
    }
}

fn format_topic_message(topic: &Group, h10: i64, h30: i64) -> String {
    let entities: Vec<String> = topic.entities.iter().cloned().collect();
    let mut lines = vec![
        "🔥 *Trending Topic Alert*".to_string(),
        String::new(),
        format!("📊 Topic: {}", entities.join(", ")),
        format!("📈 Mentions (24h): {}", topic.mentions),
        format!("♨️ Heat: {h10} / 10m · {h30} / 30m"),
        String::new(),
        "⚠️ *Disclaimer:*".to_string(),
        "_This is a trending topic alert. Not financial advice._".to_string(),
        "_未落地为币，谨防仿冒_".to_string(),
    ];
    lines.push(String::new());
    lines.push(format!("⏰ {}", Utc::now().format("%Y-%m-%d %H:%M UTC")));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_finds_symbols_and_meme_names() {
        let (entities, confidence) = extract_entities("$DOGE and shibainu pumping hard");
        assert_eq!(entities, vec!["doge", "shibainu"]);
        assert_eq!(confidence, 0.6);
    }

    #[test]
    fn extraction_applies_synonyms_and_stop_terms() {
        // "frog" maps to pepe; "meme" is a stop term even when matched.
        let (entities, _) = extract_entities("buy frog now, pepe token incoming");
        assert_eq!(entities, vec!["pepe"]);
    }

    #[test]
    fn single_weak_entity_is_not_a_topic() {
        assert!(detect_topic("$PEPE is pumping").is_none());
        assert!(detect_topic("gm everyone").is_none());
        let (id, entities, confidence) =
            detect_topic("$DOGE and shibainu pumping").expect("two entities make a topic");
        assert!(id.starts_with("t."));
        assert_eq!(id.len(), 14);
        assert_eq!(entities.len(), 2);
        assert!(confidence > 0.5);
    }

    #[test]
    fn topic_id_is_order_insensitive() {
        let a = topic_id(&["doge".to_string(), "shibainu".to_string()]);
        let b = topic_id(&["shibainu".to_string(), "DOGE".to_string()]);
        assert_eq!(a, b);
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merge_ladder_exact_similarity_jaccard() {
        let cfg = TopicMergeConfig::default();

        assert_eq!(
            should_merge(&set(&["pepe", "doge"]), &set(&["doge", "pepe"]), &cfg),
            Some("exact")
        );
        // Shared-entity overlap merges through the Jaccard fallback.
        assert_eq!(
            should_merge(&set(&["pepe", "doge"]), &set(&["pepe"]), &cfg),
            Some("jaccard")
        );
        // Near-identical strings merge through trigram similarity.
        assert_eq!(
            should_merge(&set(&["dogwifhat"]), &set(&["dogwifhats"]), &cfg),
            Some("similarity")
        );
        assert_eq!(should_merge(&set(&["pepe"]), &set(&["bonk"]), &cfg), None);
    }

    #[test]
    fn slope_reflects_rate_change() {
        let cfg = TopicMergeConfig::default();
        // 20 mentions in the last 10 minutes, none before: rising.
        assert!(heat_slope(20, 20, &cfg) > 0.0);
        // All 20 mentions in the prior 20 minutes: falling.
        assert!(heat_slope(0, 20, &cfg) < 0.0);
        assert_eq!(heat_slope(0, 0, &cfg), 0.0);
    }
}
