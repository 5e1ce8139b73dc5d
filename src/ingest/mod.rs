//! Ingestion pollers: per-handle tweet fetch, dedup, normalization,
//! persistence and refinement into events + candidate signals.

pub mod normalize;

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::params;
use serde_json::json;
use sha1::{Digest, Sha1};

use crate::envcfg;
use crate::kv::Kv;
use crate::providers::sentiment::SentimentClient;
use crate::providers::social::MultiSource;
use crate::refine;
use crate::store::events::{NewEvent, upsert_event};
use crate::store::{Db, signals};
use normalize::NormalizedPost;

const DEDUP_TTL_SECS: u64 = 14 * 24 * 3600;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IngestStats {
    pub fetched: usize,
    pub normalized: usize,
    pub dedup_hit: usize,
    pub inserted: usize,
    pub events: usize,
}

pub struct Ingestor {
    source: MultiSource,
    kv: Kv,
    db: Db,
    sentiment: SentimentClient,
    handles: Vec<String>,
    fetch_limit: usize,
    enabled: bool,
    /// Degraded dedup when the KV is unreachable; per-process only.
    mem_dedup: Mutex<HashSet<String>>,
}

impl Ingestor {
    pub fn from_env(kv: Kv, db: Db) -> Ingestor {
        let handles = envcfg::env_str("X_KOL_HANDLES", "")
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        Ingestor {
            source: MultiSource::from_env(),
            kv,
            db,
            sentiment: SentimentClient::from_env(),
            handles,
            fetch_limit: envcfg::env_usize("X_FETCH_LIMIT", 20),
            enabled: envcfg::env_bool("ENABLE_X_INGESTOR", false),
            mem_dedup: Mutex::new(HashSet::new()),
        }
    }

    pub fn new(
        source: MultiSource,
        kv: Kv,
        db: Db,
        sentiment: SentimentClient,
        handles: Vec<String>,
    ) -> Ingestor {
        Ingestor {
            source,
            kv,
            db,
            sentiment,
            handles,
            fetch_limit: 20,
            enabled: true,
            mem_dedup: Mutex::new(HashSet::new()),
        }
    }

    /// One polling pass over every configured handle. A failure on one
    /// handle rolls back only that handle's transaction.
    pub async fn run_once(&self) -> IngestStats {
        let mut stats = IngestStats::default();
        if !self.enabled {
            tracing::info!(stage = "x.poll.disabled", reason = "ENABLE_X_INGESTOR not set");
            return stats;
        }
        if self.handles.is_empty() {
            tracing::warn!(stage = "x.config.error", error = "no handles configured");
            return stats;
        }

        for handle in &self.handles {
            if let Err(e) = self.poll_handle(handle, &mut stats).await {
                tracing::warn!(stage = "x.poll.error", handle = %handle, error = %e);
            }
        }

        tracing::info!(stage = "x.persist.inserted", count = stats.inserted);
        stats
    }

    async fn poll_handle(&self, handle: &str, stats: &mut IngestStats) -> Result<()> {
        let cursor_key = format!("cursor:x:{handle}");
        let cursor = self.kv.get(&cursor_key).await.unwrap_or(None);

        let tweets = self
            .source
            .fetch_user_tweets(handle, cursor.as_deref(), self.fetch_limit)
            .await;
        stats.fetched += tweets.len();
        if tweets.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = tweets.iter().map(|t| t.text.clone()).collect();
        let sentiments = self.sentiment.classify(&texts).await;

        let mut latest_id: Option<u128> = None;
        let mut prepared = Vec::new();

        for (i, tweet) in tweets.iter().enumerate() {
            if let Ok(id) = tweet.id.parse::<u128>() {
                latest_id = Some(latest_id.map_or(id, |m| m.max(id)));
            }

            let Some(post) = normalize::normalize_tweet(tweet) else {
                continue;
            };
            stats.normalized += 1;

            let fingerprint = compute_fingerprint(&post.source, &post.author, &post.ts, &post.text);
            if self.is_duplicate(&tweet.id, &fingerprint).await {
                stats.dedup_hit += 1;
                continue;
            }

            let sentiment = sentiments.items.get(i).cloned();
            prepared.push((tweet.id.clone(), post, sentiment));
        }

        // One transaction per handle; failure isolates this handle only.
        let mut topic_mentions: Vec<(String, String)> = Vec::new();
        if !prepared.is_empty() {
            let mut conn = self.db.lock().await;
            let tx = conn.transaction()?;
            for (tweet_id, post, sentiment) in &prepared {
                let post_id = insert_raw_post(&tx, tweet_id, post, sentiment.as_ref())?;
                stats.inserted += 1;
                stats.events += 1;
                if let Some(topic_id) =
                    refine_and_record(&tx, post_id, tweet_id, post, sentiment.as_ref())?
                {
                    topic_mentions.push((topic_id, tweet_id.clone()));
                }
            }
            tx.commit()?;
        }

        // Mention time series feeds topic heat; recorded only after the
        // rows are durable.
        for (topic_id, member) in &topic_mentions {
            crate::topic::record_mention(&self.kv, topic_id, member).await;
        }

        // Cursor advances to the numerically-largest observed id.
        if let Some(latest) = latest_id {
            let advance = match cursor.as_deref().and_then(|c| c.parse::<u128>().ok()) {
                Some(prev) => latest > prev,
                None => true,
            };
            if advance {
                if let Err(e) = self.kv.set(&cursor_key, &latest.to_string()).await {
                    tracing::warn!(stage = "x.cursor.error", handle = %handle, error = %e);
                }
            }
        }

        Ok(())
    }

    /// Check both dedup keys with one batched read; a miss marks them with
    /// the 14-day TTL. KV trouble degrades to the per-process set rather
    /// than dropping posts.
    async fn is_duplicate(&self, tweet_id: &str, fingerprint: &str) -> bool {
        let id_key = format!("dedup:x:{tweet_id}");
        let fp_key = format!("dedup:fp:{fingerprint}");

        let checked = async {
            let hits = self.kv.mget(&[id_key.clone(), fp_key.clone()]).await?;
            if hits.first().is_some_and(|v| v.is_some()) {
                tracing::debug!(stage = "x.dedup.hit", tweet_id = %tweet_id, method = "id");
                return anyhow::Ok(true);
            }
            if hits.get(1).is_some_and(|v| v.is_some()) {
                tracing::debug!(stage = "x.dedup.hit", fp = %fingerprint, method = "fingerprint");
                return anyhow::Ok(true);
            }
            self.kv.set_ex(&id_key, "1", DEDUP_TTL_SECS).await?;
            self.kv.set_ex(&fp_key, "1", DEDUP_TTL_SECS).await?;
            anyhow::Ok(false)
        }
        .await;

        match checked {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(stage = "x.dedup.error", error = %e);
                let mut seen = self.mem_dedup.lock().unwrap();
                !(seen.insert(id_key) && seen.insert(fp_key))
            }
        }
    }
}

/// `sha1("{source}|{author}|{iso_ts}|{text[:30]}")`.
pub fn compute_fingerprint(source: &str, author: &str, ts: &str, text: &str) -> String {
    let prefix: String = text.chars().take(30).collect();
    let mut hasher = Sha1::new();
    hasher.update(format!("{source}|{author}|{ts}|{prefix}").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn insert_raw_post(
    conn: &rusqlite::Connection,
    tweet_id: &str,
    post: &NormalizedPost,
    sentiment: Option<&crate::providers::sentiment::Sentiment>,
) -> Result<i64> {
    // Native post id and extracted assets ride in the urls JSON.
    let urls_meta = json!({
        "tweet_id": tweet_id,
        "urls": post.urls,
        "extracted_ca": post.token_ca,
        "extracted_symbol": post.symbol,
    });

    let keyphrases = crate::refine::extract_keyphrases(&post.text);

    conn.execute(
        "INSERT INTO raw_posts (source, author, text, ts, urls, token_ca, symbol,
                                is_candidate, sentiment_label, sentiment_score, keyphrases)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            post.source,
            post.author,
            post.text,
            post.ts,
            urls_meta.to_string(),
            post.token_ca,
            post.symbol,
            post.is_candidate,
            sentiment.map(|s| s.label.clone()),
            sentiment.map(|s| s.score),
            serde_json::to_string(&keyphrases)?,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Refine the post and upsert its event; candidate posts also gain a
/// `candidate` signal. Returns the topic id when the post tagged one.
fn refine_and_record(
    conn: &rusqlite::Connection,
    post_id: i64,
    tweet_id: &str,
    post: &NormalizedPost,
    sentiment: Option<&crate::providers::sentiment::Sentiment>,
) -> Result<Option<String>> {
    let refined = refine::refine_post(&post.text);

    let token_ca = refined
        .assets
        .contracts
        .first()
        .cloned()
        .or_else(|| post.token_ca.clone());
    let symbol = refined
        .assets
        .symbols
        .first()
        .cloned()
        .or_else(|| post.symbol.as_ref().map(|s| s.trim_start_matches('$').to_string()));

    let topic = crate::topic::detect_topic(&post.text);

    let now = crate::store::now_ts();
    let ev = NewEvent {
        event_key: refined.event_key.clone(),
        event_type: refined.event_type,
        summary: refined.summary.clone(),
        score: refined.score,
        impacted_assets: refined.assets.symbols.clone(),
        token_ca: token_ca.clone(),
        symbol,
        topic_hash: topic.as_ref().map(|(id, _, _)| id.clone()),
        topic_entities: topic.as_ref().map(|(_, entities, _)| entities.clone()),
        candidate_score: topic.as_ref().map(|(_, _, confidence)| *confidence),
        ts: now.clone(),
    };

    let evidence_ref = json!({
        "source": post.source,
        "post_id": post_id,
        "tweet_id": tweet_id,
        "author": post.author,
        "ts": post.ts,
        "symbols": refined.assets.symbols,
        "contracts": refined.assets.contracts,
        "sentiment_label": sentiment.map(|s| s.label.clone()),
        "sentiment_score": sentiment.map(|s| s.score),
    });

    upsert_event(conn, &ev, evidence_ref)?;

    if post.is_candidate {
        let market_type = if token_ca.is_some() { "token" } else { "topic" };
        signals::ensure_candidate(
            conn,
            &refined.event_key,
            refined.event_type.as_str(),
            market_type,
            &now,
        )?;
    }

    Ok(topic.map(|(id, _, _)| id))
}
