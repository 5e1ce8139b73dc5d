//! Upstream provider clients.
//!
//! Every client shares the same contract: environment-driven construction,
//! token-bucket rate limiting, a bounded retry table, and a result envelope
//! whose `cache`/`stale`/`degrade`/`reason` flags downstream code treats as
//! authoritative.

pub mod dex;
pub mod onchain;
pub mod security;
pub mod sentiment;
pub mod social;

use std::time::{Duration, Instant};

use thiserror::Error;

// ── Error taxonomy ──────────────────────────────────────────────────

/// Closed upstream failure taxonomy. `reason()` values form the closed set
/// used in result envelopes.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("connection refused")]
    ConnRefused,
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("authentication rejected (HTTP {0})")]
    Auth(u16),
    #[error("client error (HTTP {0})")]
    Http4xx(u16),
    #[error("server error (HTTP {0})")]
    Http5xx(u16),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("{0}")]
    Unknown(String),
}

impl ProviderError {
    /// Map an HTTP status to the taxonomy.
    pub fn from_status(status: u16) -> ProviderError {
        match status {
            401 | 403 => ProviderError::Auth(status),
            429 => ProviderError::RateLimited,
            400..=499 => ProviderError::Http4xx(status),
            500..=599 => ProviderError::Http5xx(status),
            other => ProviderError::Unknown(format!("HTTP {other}")),
        }
    }

    /// Map a transport error to the taxonomy.
    pub fn from_reqwest(e: &reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_connect() {
            ProviderError::ConnRefused
        } else if let Some(status) = e.status() {
            ProviderError::from_status(status.as_u16())
        } else {
            ProviderError::Unknown(e.to_string())
        }
    }

    /// Envelope reason string (closed set).
    pub fn reason(&self) -> &'static str {
        match self {
            ProviderError::Timeout => "timeout",
            ProviderError::ConnRefused => "conn_refused",
            ProviderError::RateLimited | ProviderError::Auth(_) | ProviderError::Http4xx(_) => {
                "http_4xx"
            }
            ProviderError::Http5xx(_) => "http_5xx",
            ProviderError::Provider(_) => "provider_error",
            ProviderError::Unknown(_) => "unknown",
        }
    }

    /// Whether the retry policy applies: 429, 5xx, timeout and network
    /// errors retry; auth and other 4xx never do.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout
                | ProviderError::ConnRefused
                | ProviderError::RateLimited
                | ProviderError::Http5xx(_)
        )
    }
}

// ── Token bucket ────────────────────────────────────────────────────

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Per-process token bucket: capacity = rpm, refill = rpm/60 per second.
/// The mutex is never held while sleeping.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: tokio::sync::Mutex<BucketState>,
}

impl TokenBucket {
    pub fn per_minute(rpm: u32) -> TokenBucket {
        let capacity = rpm.max(1) as f64;
        TokenBucket {
            capacity,
            refill_rate: capacity / 60.0,
            state: tokio::sync::Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Take `n` tokens, sleeping outside the lock when the bucket is short.
    /// Returns the total time waited.
    pub async fn acquire(&self, n: u32) -> Duration {
        let need = n as f64;

        let wait = {
            let mut state = self.state.lock().await;
            self.refill(&mut state);
            if state.tokens >= need {
                state.tokens -= need;
                return Duration::ZERO;
            }
            let deficit = need - state.tokens;
            Duration::from_secs_f64(deficit / self.refill_rate)
        };

        tokio::time::sleep(wait).await;

        // Re-check and decrement under the lock after waking.
        let extra = {
            let mut state = self.state.lock().await;
            self.refill(&mut state);
            if state.tokens >= need {
                state.tokens -= need;
                return wait;
            }
            let still_short = need - state.tokens;
            Duration::from_secs_f64(still_short / self.refill_rate)
        };

        // Rare under contention: wait out the remainder and force the take.
        tokio::time::sleep(extra).await;
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens = (state.tokens - need).max(0.0);
        wait + extra
    }
}

// ── Retry ───────────────────────────────────────────────────────────

/// Predefined backoff table for upstream retries.
pub const BACKOFF_S: [f64; 2] = [0.5, 1.0];

/// Run `f` with the shared retry policy. Only retryable errors consume
/// attempts; the final error is returned untouched.
pub async fn retry_request<T, F, Fut>(
    max_retries: u32,
    stage: &'static str,
    f: F,
) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.retryable() && attempt < max_retries => {
                let backoff = BACKOFF_S[(attempt as usize).min(BACKOFF_S.len() - 1)];
                tracing::warn!(
                    stage = stage,
                    attempt = attempt + 1,
                    reason = e.reason(),
                    backoff_s = backoff,
                );
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shared HTTP client: connect timeout capped at 2 s, read timeout supplied
/// by the provider.
pub fn http_client(read_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .timeout(read_timeout)
        .build()
        .expect("reqwest client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(ProviderError::from_status(401), ProviderError::Auth(401)));
        assert!(matches!(ProviderError::from_status(429), ProviderError::RateLimited));
        assert!(matches!(ProviderError::from_status(404), ProviderError::Http4xx(404)));
        assert!(matches!(ProviderError::from_status(503), ProviderError::Http5xx(503)));
    }

    #[test]
    fn auth_never_retries() {
        assert!(!ProviderError::Auth(401).retryable());
        assert!(!ProviderError::Http4xx(400).retryable());
        assert!(ProviderError::RateLimited.retryable());
        assert!(ProviderError::Http5xx(500).retryable());
        assert!(ProviderError::Timeout.retryable());
    }

    #[tokio::test]
    async fn bucket_grants_up_to_capacity_without_waiting() {
        let bucket = TokenBucket::per_minute(60);
        for _ in 0..60 {
            assert_eq!(bucket.acquire(1).await, Duration::ZERO);
        }
        // 61st must wait about a second; just confirm it reports a wait.
        let start = Instant::now();
        let waited = bucket.acquire(1).await;
        assert!(waited > Duration::ZERO);
        assert!(start.elapsed() >= waited / 2);
    }
}
