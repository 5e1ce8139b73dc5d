//! Social post sources.
//!
//! Closed backend set (`graphql | api | apify | off | mock`) behind one
//! trait, plus a `MultiSource` wrapper that walks an ordered backend list
//! and falls through on error.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProviderError;
use crate::envcfg;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTweet {
    pub id: String,
    pub author: String,
    pub text: String,
    pub created_at: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub handle: String,
    pub avatar_url: String,
    pub ts: String,
}

#[async_trait]
pub trait SocialSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_user_tweets(
        &self,
        handle: &str,
        since_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawTweet>, ProviderError>;

    async fn fetch_user_profile(&self, handle: &str) -> Result<Option<Profile>, ProviderError>;
}

// ── Backend selection ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XBackend {
    Graphql,
    Api,
    Apify,
    Off,
    Mock,
}

impl XBackend {
    pub fn parse(s: &str) -> Option<XBackend> {
        match s.trim().to_lowercase().as_str() {
            "graphql" => Some(XBackend::Graphql),
            "api" => Some(XBackend::Api),
            "apify" => Some(XBackend::Apify),
            "off" => Some(XBackend::Off),
            "mock" => Some(XBackend::Mock),
            _ => None,
        }
    }

    pub fn build(self) -> Box<dyn SocialSource> {
        match self {
            XBackend::Graphql => Box::new(GraphqlSource::from_env()),
            XBackend::Api => Box::new(StubSource { name: "api" }),
            XBackend::Apify => Box::new(StubSource { name: "apify" }),
            XBackend::Off => Box::new(OffSource),
            XBackend::Mock => Box::new(MockSource),
        }
    }
}

// ── GraphQL backend ─────────────────────────────────────────────────

pub struct GraphqlSource {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    ct0: Option<String>,
    q_user: String,
    q_tweets: String,
}

impl GraphqlSource {
    pub fn from_env() -> GraphqlSource {
        let timeout = envcfg::env_u64("X_REQUEST_TIMEOUT", 10);
        GraphqlSource {
            http: super::http_client(Duration::from_secs(timeout)),
            base_url: envcfg::env_str("X_GRAPHQL_BASE_URL", "https://api.twitter.com/graphql"),
            auth_token: envcfg::env_opt("X_GRAPHQL_AUTH_TOKEN"),
            ct0: envcfg::env_opt("X_GRAPHQL_CT0"),
            q_user: envcfg::env_str("X_GRAPHQL_USER_QUERY_ID", "UserByScreenName"),
            q_tweets: envcfg::env_str("X_GRAPHQL_TWEETS_QUERY_ID", "UserTweets"),
        }
    }

    async fn post(&self, op: &str, variables: Value) -> Result<Value, ProviderError> {
        let (Some(token), Some(ct0)) = (&self.auth_token, &self.ct0) else {
            return Err(ProviderError::Provider("missing credentials".to_string()));
        };
        let resp = self
            .http
            .post(format!("{}/{op}", self.base_url))
            .bearer_auth(token)
            .header("x-csrf-token", ct0)
            .header("Cookie", format!("ct0={ct0}"))
            .json(&serde_json::json!({ "variables": variables }))
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
}

#[async_trait]
impl SocialSource for GraphqlSource {
    fn name(&self) -> &'static str {
        "graphql"
    }

    async fn fetch_user_tweets(
        &self,
        handle: &str,
        since_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawTweet>, ProviderError> {
        if self.auth_token.is_none() || self.ct0.is_none() {
            tracing::warn!(stage = "x.fetch.degrade", backend = "graphql", reason = "missing_credentials");
            return Ok(Vec::new());
        }

        tracing::debug!(stage = "x.fetch.request", backend = "graphql", handle = %handle, since_id = since_id);

        let user = self
            .post(&self.q_user, serde_json::json!({ "screen_name": handle }))
            .await?;
        let Some(user_id) = user
            .pointer("/data/user/result/rest_id")
            .and_then(|v| v.as_str())
        else {
            tracing::warn!(stage = "x.fetch.error", backend = "graphql", error = "user_id_not_found", handle = %handle);
            return Ok(Vec::new());
        };

        let timeline = self
            .post(
                &self.q_tweets,
                serde_json::json!({
                    "userId": user_id,
                    "count": limit,
                    "withVoice": false,
                    "withV2Timeline": true,
                }),
            )
            .await?;

        let instructions = timeline
            .pointer("/data/user/result/timeline_v2/timeline/instructions")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for ins in &instructions {
            for entry in ins.get("entries").and_then(|v| v.as_array()).into_iter().flatten() {
                let content = entry.get("content");
                let item = content
                    .and_then(|c| c.get("itemContent").or_else(|| c.get("content")));
                let result = item
                    .and_then(|i| i.pointer("/tweet_results/result"));
                let Some(legacy) = result.and_then(|r| r.get("legacy")) else {
                    continue;
                };

                let tid = result
                    .and_then(|r| r.get("rest_id"))
                    .or_else(|| legacy.get("id_str"))
                    .and_then(|v| v.as_str());
                let text = legacy
                    .get("full_text")
                    .or_else(|| legacy.get("text"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if tid.is_none() || text.is_empty() {
                    continue;
                }

                let urls = legacy
                    .pointer("/entities/urls")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|u| {
                                u.get("expanded_url")
                                    .or_else(|| u.get("url"))
                                    .and_then(|v| v.as_str())
                                    .map(String::from)
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                out.push(RawTweet {
                    id: tid.unwrap().to_string(),
                    author: handle.to_string(),
                    text: text.to_string(),
                    created_at: legacy
                        .get("created_at")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    urls,
                });
            }
        }

        tracing::info!(stage = "x.fetch.success", backend = "graphql", count = out.len(), handle = %handle);
        Ok(out)
    }

    async fn fetch_user_profile(&self, handle: &str) -> Result<Option<Profile>, ProviderError> {
        if self.auth_token.is_none() || self.ct0.is_none() {
            tracing::warn!(stage = "x.avatar.error", error = "missing credentials", handle = %handle);
            return Ok(None);
        }
        let user = self
            .post(&self.q_user, serde_json::json!({ "screen_name": handle }))
            .await?;
        let avatar = user
            .pointer("/data/user/result/legacy/profile_image_url_https")
            .and_then(|v| v.as_str());
        Ok(avatar.map(|url| Profile {
            handle: handle.to_string(),
            avatar_url: url.to_string(),
            ts: crate::store::now_ts(),
        }))
    }
}

// ── Stub / off / mock backends ──────────────────────────────────────

/// Declared-but-unimplemented backends error so MultiSource falls through.
struct StubSource {
    name: &'static str,
}

#[async_trait]
impl SocialSource for StubSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch_user_tweets(
        &self,
        _handle: &str,
        _since_id: Option<&str>,
        _limit: usize,
    ) -> Result<Vec<RawTweet>, ProviderError> {
        Err(ProviderError::Provider(format!(
            "{} backend not implemented",
            self.name
        )))
    }

    async fn fetch_user_profile(&self, _handle: &str) -> Result<Option<Profile>, ProviderError> {
        Err(ProviderError::Provider(format!(
            "{} backend not implemented",
            self.name
        )))
    }
}

struct OffSource;

#[async_trait]
impl SocialSource for OffSource {
    fn name(&self) -> &'static str {
        "off"
    }

    async fn fetch_user_tweets(
        &self,
        _handle: &str,
        _since_id: Option<&str>,
        _limit: usize,
    ) -> Result<Vec<RawTweet>, ProviderError> {
        tracing::debug!(stage = "x.fetch.degrade", backend = "off", reason = "backend_disabled");
        Ok(Vec::new())
    }

    async fn fetch_user_profile(&self, _handle: &str) -> Result<Option<Profile>, ProviderError> {
        Ok(None)
    }
}

/// Deterministic fixtures keyed per handle so cross-handle dedup never
/// collides in tests.
pub struct MockSource;

fn handle_suffix(handle: &str) -> u32 {
    handle.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32)) % 10_000
}

#[async_trait]
impl SocialSource for MockSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn fetch_user_tweets(
        &self,
        handle: &str,
        since_id: Option<&str>,
        _limit: usize,
    ) -> Result<Vec<RawTweet>, ProviderError> {
        let suffix = handle_suffix(handle);
        let now = chrono::Utc::now();
        let iso = |mins: i64| {
            crate::store::to_ts(now - chrono::Duration::minutes(mins))
        };

        let tweets = vec![
            RawTweet {
                id: format!("1234567890123456789{suffix}"),
                author: handle.to_string(),
                text: "$PEPE is pumping! Contract: 0x6982508145454ce325ddbe47a25d4ec3d2311933"
                    .to_string(),
                created_at: iso(1),
                urls: vec!["https://x.com/status/1234567890123456789".to_string()],
            },
            RawTweet {
                id: format!("1234567890123456788{suffix}"),
                author: handle.to_string(),
                text: "Just bought more $BTC and $ETH".to_string(),
                created_at: iso(3),
                urls: Vec::new(),
            },
            RawTweet {
                id: format!("1234567890123456787{suffix}"),
                author: handle.to_string(),
                text: "Check out this new token $MEME".to_string(),
                created_at: iso(5),
                urls: vec!["https://t.co/abc123".to_string()],
            },
        ];

        // Incremental fetches only return tweets past the cursor.
        let filtered = match since_id.and_then(|s| s.parse::<u128>().ok()) {
            Some(cursor) => tweets
                .into_iter()
                .filter(|t| t.id.parse::<u128>().map(|id| id > cursor).unwrap_or(true))
                .collect(),
            None => tweets,
        };
        Ok(filtered)
    }

    async fn fetch_user_profile(&self, handle: &str) -> Result<Option<Profile>, ProviderError> {
        Ok(Some(Profile {
            handle: handle.to_string(),
            avatar_url: format!("https://img.x.local/{handle}.png"),
            ts: crate::store::now_ts(),
        }))
    }
}

// ── MultiSource ─────────────────────────────────────────────────────

/// Ordered fall-through over backends: an error moves to the next backend,
/// exhaustion returns empty and logs the degrade.
pub struct MultiSource {
    tweets_chain: Vec<Box<dyn SocialSource>>,
    profile_chain: Vec<Box<dyn SocialSource>>,
}

fn parse_chain(spec: &str) -> Vec<Box<dyn SocialSource>> {
    spec.split(',')
        .filter_map(XBackend::parse)
        .map(XBackend::build)
        .collect()
}

impl MultiSource {
    /// Backend lists come from `X_BACKENDS` with per-operation overrides
    /// `X_BACKENDS_TWEETS` / `X_BACKENDS_PROFILE`.
    pub fn from_env() -> MultiSource {
        let base = envcfg::env_str("X_BACKENDS", "graphql");
        let tweets = envcfg::env_opt("X_BACKENDS_TWEETS").unwrap_or_else(|| base.clone());
        let profile = envcfg::env_opt("X_BACKENDS_PROFILE").unwrap_or_else(|| base.clone());
        MultiSource {
            tweets_chain: parse_chain(&tweets),
            profile_chain: parse_chain(&profile),
        }
    }

    pub fn with_backends(backends: Vec<XBackend>) -> MultiSource {
        MultiSource {
            tweets_chain: backends.iter().map(|b| b.build()).collect(),
            profile_chain: backends.iter().map(|b| b.build()).collect(),
        }
    }

    pub async fn fetch_user_tweets(
        &self,
        handle: &str,
        since_id: Option<&str>,
        limit: usize,
    ) -> Vec<RawTweet> {
        for source in &self.tweets_chain {
            match source.fetch_user_tweets(handle, since_id, limit).await {
                Ok(tweets) => return tweets,
                Err(e) => {
                    tracing::warn!(
                        stage = "x.fetch.fallback",
                        backend = source.name(),
                        error = %e,
                    );
                }
            }
        }
        tracing::warn!(stage = "x.fetch.degrade", reason = "all_backends_failed", handle = %handle);
        Vec::new()
    }

    pub async fn fetch_user_profile(&self, handle: &str) -> Option<Profile> {
        for source in &self.profile_chain {
            match source.fetch_user_profile(handle).await {
                Ok(profile) => return profile,
                Err(e) => {
                    tracing::warn!(
                        stage = "x.avatar.fallback",
                        backend = source.name(),
                        error = %e,
                    );
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multisource_falls_through_to_mock() {
        let ms = MultiSource::with_backends(vec![XBackend::Api, XBackend::Mock]);
        let tweets = ms.fetch_user_tweets("tester", None, 20).await;
        assert_eq!(tweets.len(), 3);
        assert!(tweets[0].text.contains("$PEPE"));
    }

    #[tokio::test]
    async fn mock_cursor_filters_old_tweets() {
        let ms = MultiSource::with_backends(vec![XBackend::Mock]);
        let all = ms.fetch_user_tweets("tester", None, 20).await;
        let max_id = all.iter().map(|t| t.id.parse::<u128>().unwrap()).max().unwrap();
        let newer = ms
            .fetch_user_tweets("tester", Some(&max_id.to_string()), 20)
            .await;
        assert!(newer.is_empty());
    }

    #[tokio::test]
    async fn exhausted_chain_returns_empty() {
        let ms = MultiSource::with_backends(vec![XBackend::Api, XBackend::Apify]);
        let tweets = ms.fetch_user_tweets("tester", None, 20).await;
        assert!(tweets.is_empty());
    }
}
