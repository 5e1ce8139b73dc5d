//! Sentiment classification over a black-box model service.
//!
//! The contract is `classify(texts) → [{label, score}]` with the final
//! score `p(pos) − p(neg)` clamped to [-1, 1]. When the per-batch failure
//! rate crosses the threshold the whole batch degrades to `model_off` and
//! every item reads neutral.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::envcfg;

#[derive(Debug, Clone, Serialize)]
pub struct Sentiment {
    pub label: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct BatchSentiment {
    pub items: Vec<Sentiment>,
    /// `Some("model_off")` when consumers must treat sentiment as neutral.
    pub degrade: Option<String>,
}

enum Backend {
    Api { http: reqwest::Client, url: String },
    Off,
    Mock,
}

pub struct SentimentClient {
    backend: Backend,
    pos_thresh: f64,
    neg_thresh: f64,
    max_fail_rate: f64,
}

impl SentimentClient {
    pub fn from_env() -> SentimentClient {
        let backend = match envcfg::env_str("SENTIMENT_BACKEND", "off").as_str() {
            "api" => match envcfg::env_opt("SENTIMENT_API_URL") {
                Some(url) => Backend::Api {
                    http: super::http_client(Duration::from_secs(
                        envcfg::env_u64("SENTIMENT_TIMEOUT_S", 5),
                    )),
                    url,
                },
                None => {
                    tracing::warn!(stage = "sentiment.degrade", reason = "no_url");
                    Backend::Off
                }
            },
            "mock" => Backend::Mock,
            _ => Backend::Off,
        };

        SentimentClient {
            backend,
            pos_thresh: envcfg::env_f64("SENTIMENT_POS_THRESH", 0.25),
            neg_thresh: envcfg::env_f64("SENTIMENT_NEG_THRESH", -0.25),
            max_fail_rate: envcfg::env_f64("SENTIMENT_FAIL_RATE", 0.3),
        }
    }

    pub fn mock() -> SentimentClient {
        SentimentClient {
            backend: Backend::Mock,
            pos_thresh: 0.25,
            neg_thresh: -0.25,
            max_fail_rate: 0.3,
        }
    }

    fn label_for(&self, score: f64) -> &'static str {
        if score >= self.pos_thresh {
            "positive"
        } else if score <= self.neg_thresh {
            "negative"
        } else {
            "neutral"
        }
    }

    fn neutral_batch(&self, len: usize) -> BatchSentiment {
        BatchSentiment {
            items: vec![
                Sentiment {
                    label: "neutral".to_string(),
                    score: 0.0,
                };
                len
            ],
            degrade: Some("model_off".to_string()),
        }
    }

    pub async fn classify(&self, texts: &[String]) -> BatchSentiment {
        match &self.backend {
            Backend::Off => self.neutral_batch(texts.len()),
            Backend::Mock => {
                let items = texts
                    .iter()
                    .map(|t| {
                        let lower = t.to_lowercase();
                        let score = if ["rug", "scam", "dump", "honeypot"]
                            .iter()
                            .any(|w| lower.contains(w))
                        {
                            -0.8
                        } else if ["bullish", "moon", "gem", "pump", "launch"]
                            .iter()
                            .any(|w| lower.contains(w))
                        {
                            0.8
                        } else {
                            0.0
                        };
                        Sentiment {
                            label: self.label_for(score).to_string(),
                            score,
                        }
                    })
                    .collect();
                BatchSentiment {
                    items,
                    degrade: None,
                }
            }
            Backend::Api { http, url } => {
                let resp = http
                    .post(url)
                    .json(&serde_json::json!({ "inputs": texts }))
                    .send()
                    .await;

                let rows: Vec<Value> = match resp {
                    Ok(r) if r.status().is_success() => {
                        r.json().await.unwrap_or_default()
                    }
                    Ok(r) => {
                        tracing::warn!(stage = "sentiment.error", status = r.status().as_u16());
                        return self.neutral_batch(texts.len());
                    }
                    Err(e) => {
                        tracing::warn!(stage = "sentiment.error", error = %e);
                        return self.neutral_batch(texts.len());
                    }
                };

                let mut failures = 0usize;
                let mut items = Vec::with_capacity(texts.len());
                for i in 0..texts.len() {
                    match rows.get(i).and_then(parse_probs) {
                        Some((pos, neg)) => {
                            let score = (pos - neg).clamp(-1.0, 1.0);
                            items.push(Sentiment {
                                label: self.label_for(score).to_string(),
                                score,
                            });
                        }
                        None => {
                            failures += 1;
                            items.push(Sentiment {
                                label: "neutral".to_string(),
                                score: 0.0,
                            });
                        }
                    }
                }

                if !texts.is_empty() && failures as f64 / texts.len() as f64 > self.max_fail_rate {
                    tracing::warn!(
                        stage = "sentiment.degrade",
                        reason = "model_off",
                        failures = failures,
                        total = texts.len(),
                    );
                    return self.neutral_batch(texts.len());
                }

                BatchSentiment {
                    items,
                    degrade: None,
                }
            }
        }
    }
}

/// The model returns per-item label/probability lists; pull p(pos) and
/// p(neg) out of whatever casing it used.
fn parse_probs(row: &Value) -> Option<(f64, f64)> {
    let entries = row.as_array()?;
    let mut pos = 0.0;
    let mut neg = 0.0;
    for entry in entries {
        let label = entry.get("label")?.as_str()?.to_lowercase();
        let score = entry.get("score")?.as_f64()?;
        if label.starts_with("pos") {
            pos = score;
        } else if label.starts_with("neg") {
            neg = score;
        }
    }
    Some((pos, neg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_backend_scores_keywords() {
        let client = SentimentClient::mock();
        let batch = client
            .classify(&[
                "this gem is going to moon".to_string(),
                "total rug, stay away".to_string(),
                "gm".to_string(),
            ])
            .await;
        assert_eq!(batch.items[0].label, "positive");
        assert_eq!(batch.items[1].label, "negative");
        assert_eq!(batch.items[2].label, "neutral");
        assert!(batch.degrade.is_none());
    }

    #[test]
    fn prob_parsing() {
        let row = serde_json::json!([
            {"label": "POSITIVE", "score": 0.9},
            {"label": "NEGATIVE", "score": 0.05},
        ]);
        assert_eq!(parse_probs(&row), Some((0.9, 0.05)));
    }
}
